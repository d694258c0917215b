//! Download sessions: identity, registry and progress streaming.

/// Deduplicated progress streams.
pub mod progress;
/// Registry of live sessions.
pub mod registry;
/// Session identifiers, snapshots and errors.
pub mod session;

pub use progress::{ProgressEmitter, ProgressEvent, ProgressOutcome, ProgressUpdate};
pub use registry::{validate_url, SessionRegistry};
pub use session::{DownloadSession, OwnerId, SessionError, SessionId, SessionState};
