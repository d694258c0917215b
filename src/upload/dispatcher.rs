//! Upload dispatcher
//!
//! Delivers the files of an [`UploadTask`] through a [`MediaSink`]. In the
//! sequential discipline each item runs a small retry state machine that
//! honours the server's rate-limit hints, and consecutive items are paced.

use super::media::{classify, mime_type, DeliveryMode, MediaKind, VideoProber};
use crate::config::{UPLOAD_MAX_ATTEMPTS, UPLOAD_PACING_SECS};
use crate::download::OwnerId;
use crate::utils::truncate_str;
use async_trait::async_trait;
use futures_util::future::join_all;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Telegram caption limit
const MAX_CAPTION_CHARS: usize = 1024;

/// One file ready to be handed to the sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryItem {
    /// Absolute path on disk
    pub path: PathBuf,
    /// Caption shown under the message
    pub caption: String,
    /// Presentation
    pub kind: MediaKind,
    /// MIME type hint for documents
    pub mime_type: Option<&'static str>,
}

/// Failure reported by a [`MediaSink`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// The chat platform asked us to slow down
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited {
        /// Server hint, if one was given
        retry_after: Option<Duration>,
    },
    /// Anything else; never retried
    #[error("{0}")]
    Other(String),
}

/// Chat-side delivery of a single item.
#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Send `item` once.
    async fn send_media(&self, item: &DeliveryItem) -> Result<(), SendError>;
}

/// Gate consulted for every item before it is sent.
pub trait ContentPolicy: Send + Sync {
    /// Whether `path` may be delivered.
    fn permit(&self, path: &Path) -> bool;
}

/// Default policy, everything is permitted.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ContentPolicy for AllowAll {
    fn permit(&self, _path: &Path) -> bool {
        true
    }
}

/// Why a single item was not delivered
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Video dimensions could not be read
    #[error("probe failed: {0}")]
    Probe(String),
    /// Sink rejected the item
    #[error("send failed: {0}")]
    Send(String),
    /// Rate limited with no retry budget
    #[error("rate limited")]
    RateLimited,
}

/// Final state of one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Sent after `attempts` tries
    Delivered {
        /// Number of attempts used
        attempts: u32,
    },
    /// Not retried
    Failed {
        /// Cause
        reason: DeliveryError,
    },
    /// Every attempt was rate limited
    Exhausted {
        /// Number of attempts used
        attempts: u32,
    },
    /// Refused by the content policy
    Rejected,
}

/// Outcome of one item, with the item it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReport {
    /// File that was processed
    pub path: PathBuf,
    /// Caption used for it
    pub caption: String,
    /// What happened
    pub outcome: ItemOutcome,
}

/// Per-item outcomes in input order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Item reports
    pub items: Vec<ItemReport>,
}

impl DeliveryReport {
    /// Number of items that reached the chat
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item.outcome, ItemOutcome::Delivered { .. }))
            .count()
    }

    /// Number of items that did not
    #[must_use]
    pub fn undelivered(&self) -> usize {
        self.items.len() - self.delivered()
    }
}

/// Ordering of item deliveries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Discipline {
    /// One at a time, paced, with rate-limit retries
    #[default]
    Sequential,
    /// All at once, single attempt each
    Concurrent,
}

/// Ordered files plus how to present them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    files: Vec<PathBuf>,
    base: PathBuf,
    mode: DeliveryMode,
}

impl UploadTask {
    /// Task delivering a single file, captioned with its name.
    #[must_use]
    pub fn single(path: impl Into<PathBuf>, mode: DeliveryMode) -> Self {
        let path = path.into();
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self {
            files: vec![path],
            base,
            mode,
        }
    }

    /// Task delivering every file below `dir`, sorted by path. Captions are
    /// paths relative to `dir`.
    ///
    /// # Errors
    ///
    /// Returns I/O errors from walking the directory.
    pub async fn from_directory(dir: impl Into<PathBuf>, mode: DeliveryMode) -> io::Result<Self> {
        let base = dir.into();
        let mut files = Vec::new();
        let mut pending = vec![base.clone()];

        while let Some(current) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if file_type.is_file() {
                    files.push(entry.path());
                }
            }
        }
        files.sort();

        Ok(Self { files, base, mode })
    }

    /// Files in delivery order
    #[must_use]
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Presentation mode
    #[must_use]
    pub const fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Whether there is nothing to deliver
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Caption for `path`: its path relative to the task base.
    #[must_use]
    pub fn caption(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.base).unwrap_or(path);
        truncate_str(relative.to_string_lossy(), MAX_CAPTION_CHARS)
    }
}

enum Attempt {
    Attempting(u32),
    RateLimited { attempt: u32, wait: Duration },
    Done(ItemOutcome),
}

/// Delivers upload tasks through a sink.
pub struct UploadDispatcher {
    prober: Arc<dyn VideoProber>,
    policy: Arc<dyn ContentPolicy>,
    pacing: Duration,
    max_attempts: u32,
}

impl UploadDispatcher {
    /// Dispatcher with the default pacing, retry bound and [`AllowAll`].
    #[must_use]
    pub fn new(prober: Arc<dyn VideoProber>) -> Self {
        Self {
            prober,
            policy: Arc::new(AllowAll),
            pacing: Duration::from_secs(UPLOAD_PACING_SECS),
            max_attempts: UPLOAD_MAX_ATTEMPTS,
        }
    }

    /// Replace the content policy.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn ContentPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Deliver every item of `task`.
    pub async fn deliver(
        &self,
        owner_id: OwnerId,
        task: &UploadTask,
        discipline: Discipline,
        sink: &dyn MediaSink,
    ) -> DeliveryReport {
        info!(
            owner_id,
            items = task.files().len(),
            ?discipline,
            "Starting upload"
        );
        let report = match discipline {
            Discipline::Sequential => self.deliver_sequential(owner_id, task, sink).await,
            Discipline::Concurrent => self.deliver_concurrent(owner_id, task, sink).await,
        };
        info!(
            owner_id,
            delivered = report.delivered(),
            undelivered = report.undelivered(),
            "Upload finished"
        );
        report
    }

    async fn deliver_sequential(
        &self,
        owner_id: OwnerId,
        task: &UploadTask,
        sink: &dyn MediaSink,
    ) -> DeliveryReport {
        let mut items = Vec::with_capacity(task.files().len());
        for (index, path) in task.files().iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.pacing).await;
            }
            let outcome = self
                .deliver_item(owner_id, task, path, sink, self.max_attempts)
                .await;
            items.push(ItemReport {
                path: path.clone(),
                caption: task.caption(path),
                outcome,
            });
        }
        DeliveryReport { items }
    }

    async fn deliver_concurrent(
        &self,
        owner_id: OwnerId,
        task: &UploadTask,
        sink: &dyn MediaSink,
    ) -> DeliveryReport {
        let outcomes = join_all(
            task.files()
                .iter()
                .map(|path| self.deliver_item(owner_id, task, path, sink, 1)),
        )
        .await;

        let items = task
            .files()
            .iter()
            .zip(outcomes)
            .map(|(path, outcome)| ItemReport {
                path: path.clone(),
                caption: task.caption(path),
                outcome: match outcome {
                    ItemOutcome::Exhausted { .. } => ItemOutcome::Failed {
                        reason: DeliveryError::RateLimited,
                    },
                    other => other,
                },
            })
            .collect();
        DeliveryReport { items }
    }

    async fn deliver_item(
        &self,
        owner_id: OwnerId,
        task: &UploadTask,
        path: &Path,
        sink: &dyn MediaSink,
        max_attempts: u32,
    ) -> ItemOutcome {
        if !self.policy.permit(path) {
            warn!(owner_id, path = %path.display(), "Item rejected by content policy");
            return ItemOutcome::Rejected;
        }

        let kind = match classify(path, task.mode(), self.prober.as_ref()).await {
            Ok(kind) => kind,
            Err(e) => {
                warn!(owner_id, path = %path.display(), error = %e, "Media classification failed");
                return ItemOutcome::Failed {
                    reason: DeliveryError::Probe(format!("{e:#}")),
                };
            }
        };
        let item = DeliveryItem {
            path: path.to_path_buf(),
            caption: task.caption(path),
            kind,
            mime_type: mime_type(path),
        };

        let mut state = Attempt::Attempting(1);
        loop {
            state = match state {
                Attempt::Attempting(n) => match sink.send_media(&item).await {
                    Ok(()) => Attempt::Done(ItemOutcome::Delivered { attempts: n }),
                    Err(SendError::RateLimited { .. }) if n >= max_attempts => {
                        Attempt::Done(ItemOutcome::Exhausted { attempts: n })
                    }
                    Err(SendError::RateLimited { retry_after }) => Attempt::RateLimited {
                        attempt: n,
                        wait: retry_after.unwrap_or_else(|| backoff_for(n)),
                    },
                    Err(SendError::Other(reason)) => Attempt::Done(ItemOutcome::Failed {
                        reason: DeliveryError::Send(reason),
                    }),
                },
                Attempt::RateLimited { attempt, wait } => {
                    warn!(
                        owner_id,
                        caption = %item.caption,
                        attempt,
                        wait_secs = wait.as_secs_f64(),
                        "Rate limited, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    Attempt::Attempting(attempt + 1)
                }
                Attempt::Done(outcome) => {
                    match &outcome {
                        ItemOutcome::Delivered { attempts } => {
                            info!(owner_id, caption = %item.caption, attempts, "Item delivered");
                        }
                        ItemOutcome::Exhausted { attempts } => {
                            error!(owner_id, caption = %item.caption, attempts, "Giving up on item");
                        }
                        ItemOutcome::Failed { reason } => {
                            warn!(owner_id, caption = %item.caption, %reason, "Item not delivered");
                        }
                        ItemOutcome::Rejected => {}
                    }
                    return outcome;
                }
            };
        }
    }
}

/// `2^attempt` seconds
fn backoff_for(attempt: u32) -> Duration {
    Duration::from_secs(1_u64 << attempt.min(16))
}
