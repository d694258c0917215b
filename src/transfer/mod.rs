//! Transfer engine seam
//!
//! The session registry never talks to the network directly: it opens a
//! [`TransferHandle`] through a [`TransferEngine`] and only observes status
//! snapshots. [`http::HttpTransferEngine`] is the production engine.

/// HTTP engine with parallel range streams.
pub mod http;

pub use http::HttpTransferEngine;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Lifecycle of a single transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    /// Opened, file name resolved, no bytes requested yet
    #[default]
    Pending,
    /// Bytes are flowing
    Active,
    /// All bytes written
    Finished,
    /// Stopped on request, partial file removed
    Cancelled,
    /// Stopped by an error
    Failed,
}

impl TransferState {
    /// Terminal states never transition again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled | Self::Failed)
    }

    /// Short label for logs and progress rendering
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Active => "Active",
            Self::Finished => "Finished",
            Self::Cancelled => "Cancelled",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Point-in-time view of a transfer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferStatus {
    /// Resolved target file name
    pub file_name: Option<String>,
    /// Verb describing the current phase ("Downloading", "Waiting", ...)
    pub action: String,
    /// Lifecycle state
    pub state: TransferState,
    /// Bytes written so far
    pub transferred_bytes: u64,
    /// Total size when the server announced one
    pub total_bytes: Option<u64>,
    /// Average throughput since start
    pub bytes_per_second: f64,
    /// Estimated remaining time
    pub time_left: Option<Duration>,
    /// Failure description for [`TransferState::Failed`]
    pub error: Option<String>,
}

impl TransferStatus {
    /// Completion in percent, `0.0` while the size is unknown.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percentage(&self) -> f64 {
        match self.total_bytes {
            Some(total) if total > 0 => {
                (self.transferred_bytes as f64 / total as f64 * 100.0).min(100.0)
            }
            _ if self.state == TransferState::Finished => 100.0,
            _ => 0.0,
        }
    }
}

/// One in-progress byte transfer.
///
/// Handles are shared behind `Arc` so the registry and the progress emitter
/// can both observe them; the registry entry is the owner that decides when
/// to cancel.
#[async_trait]
pub trait TransferHandle: Send + Sync + 'static {
    /// Name of the file being written, once known.
    fn file_name(&self) -> Option<String>;

    /// Current status snapshot.
    fn status(&self) -> TransferStatus;

    /// Begin transferring. Returns once the transfer has been scheduled.
    async fn start(&self) -> Result<()>;

    /// Stop the transfer and delete whatever was written.
    async fn cancel_and_delete(&self) -> Result<()>;
}

/// Factory for transfer handles.
#[async_trait]
pub trait TransferEngine: Send + Sync + 'static {
    /// Open a transfer of `url` into `directory`, resolving the target file
    /// name. No bytes are written before [`TransferHandle::start`].
    async fn open(
        &self,
        url: &Url,
        directory: &Path,
        parallelism: usize,
    ) -> Result<Arc<dyn TransferHandle>>;
}
