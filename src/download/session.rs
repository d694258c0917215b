use crate::transfer::{TransferHandle, TransferState};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Telegram user that owns a session
pub type OwnerId = i64;

/// Opaque identifier of a download session. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random identifier
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_simple())
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle of a download session, mirrors [`TransferState`].
pub type SessionState = TransferState;

/// Snapshot of one registry entry.
#[derive(Clone)]
pub struct DownloadSession {
    /// Session identifier
    pub id: SessionId,
    /// Requesting user
    pub owner_id: OwnerId,
    /// File name resolved by the engine
    pub file_name: Option<String>,
    /// Lifecycle state at snapshot time
    pub state: SessionState,
    pub(crate) handle: Arc<dyn TransferHandle>,
}

impl DownloadSession {
    /// Transfer handle owned by this session
    #[must_use]
    pub fn handle(&self) -> Arc<dyn TransferHandle> {
        Arc::clone(&self.handle)
    }
}

impl fmt::Debug for DownloadSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadSession")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("file_name", &self.file_name)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Errors raised while creating or driving a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Not an absolute http(s) address
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    /// Transfer handle could not be constructed
    #[error("Transfer engine unavailable: {0}")]
    EngineUnavailable(String),
    /// Engine did not resolve a file name in time
    #[error("File name not resolved within {0} seconds")]
    FilenameUnresolved(u64),
    /// Engine failed after the transfer began
    #[error("Transfer failed: {0}")]
    TransferFailed(String),
    /// No live session with this id
    #[error("Session {0} not found")]
    NotFound(SessionId),
}
