//! Progress emitter
//!
//! Polls a session's transfer handle on a fixed cadence and publishes a
//! finite stream of [`ProgressUpdate`]s that always ends with exactly one
//! [`ProgressUpdate::Done`].

use super::registry::SessionRegistry;
use super::session::SessionId;
use crate::config::PROGRESS_POLL_INTERVAL_MS;
use crate::transfer::{TransferState, TransferStatus};
use crate::utils::{format_bytes, format_speed, format_time_left};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

const CHANNEL_CAPACITY: usize = 32;

/// Normalized, pre-formatted progress snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    /// Target file name
    pub file_name: String,
    /// Current phase verb
    pub action: String,
    /// Lifecycle state
    pub status: TransferState,
    /// `transferred / total`
    pub transferred_of_total: String,
    /// Average speed
    pub speed: String,
    /// Estimated remaining time
    pub time_left: String,
    /// Completion, e.g. `42.10%`
    pub percentage: String,
}

impl ProgressEvent {
    /// Build an event from a raw status snapshot.
    #[must_use]
    pub fn from_status(status: &TransferStatus, fallback_name: &str) -> Self {
        let total = status
            .total_bytes
            .map_or_else(|| "unknown".to_string(), format_bytes);
        Self {
            file_name: status
                .file_name
                .clone()
                .unwrap_or_else(|| fallback_name.to_string()),
            action: status.action.clone(),
            status: status.state,
            transferred_of_total: format!("{} / {total}", format_bytes(status.transferred_bytes)),
            speed: format_speed(status.bytes_per_second),
            time_left: format_time_left(status.time_left),
            percentage: format!("{:.2}%", status.percentage()),
        }
    }

    /// Canonical text of the event; two events that render the same are
    /// duplicates.
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "File: {}\nAction: {}\nStatus: {}\nProgress: {} ({})\nSpeed: {}\nTime left: {}",
            self.file_name,
            self.action,
            self.status,
            self.transferred_of_total,
            self.percentage,
            self.speed,
            self.time_left,
        )
    }
}

/// How a watched session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressOutcome {
    /// All bytes written
    Finished {
        /// Downloaded file name
        file_name: String,
    },
    /// Removed from the registry or stopped on request
    Cancelled,
    /// Engine reported an error
    Failed {
        /// Error description
        reason: String,
    },
}

/// Item of the progress stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressUpdate {
    /// Non-terminal, deduplicated snapshot
    Progress(ProgressEvent),
    /// Terminal marker, always last
    Done(ProgressOutcome),
}

/// Spawns pollers that turn transfer status into progress streams.
#[derive(Debug, Clone, Copy)]
pub struct ProgressEmitter {
    interval: Duration,
}

impl Default for ProgressEmitter {
    fn default() -> Self {
        Self::new(Duration::from_millis(PROGRESS_POLL_INTERVAL_MS))
    }
}

impl ProgressEmitter {
    /// Create an emitter polling every `interval`.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Watch session `id` until it reaches a terminal state.
    ///
    /// The returned receiver yields deduplicated progress events followed by
    /// one [`ProgressUpdate::Done`]. Dropping the receiver cancels the session.
    #[must_use]
    pub fn watch(
        &self,
        registry: Arc<SessionRegistry>,
        id: SessionId,
    ) -> mpsc::Receiver<ProgressUpdate> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let interval = self.interval;
        tokio::spawn(async move {
            let outcome = poll_session(&registry, id, interval, &tx).await;
            match outcome {
                Some(outcome) => {
                    debug!(session_id = %id, ?outcome, "Progress stream finished");
                    let _ = tx.send(ProgressUpdate::Done(outcome)).await;
                }
                None => {
                    info!(session_id = %id, "Progress consumer went away, cancelling session");
                    registry.cancel(id).await;
                }
            }
        });
        rx
    }
}

/// Returns `None` when the receiver was dropped.
async fn poll_session(
    registry: &SessionRegistry,
    id: SessionId,
    interval: Duration,
    tx: &mpsc::Sender<ProgressUpdate>,
) -> Option<ProgressOutcome> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_rendered: Option<String> = None;

    loop {
        tokio::select! {
            () = tx.closed() => return None,
            _ = ticker.tick() => {}
        }

        let Some(session) = registry.get(id).await else {
            return Some(ProgressOutcome::Cancelled);
        };
        let status = session.handle().status();
        let fallback = session.file_name.as_deref().unwrap_or("download");

        if status.state == TransferState::Failed {
            let reason = status
                .error
                .clone()
                .unwrap_or_else(|| "transfer failed".to_string());
            registry.fail(id, &reason).await;
            return Some(ProgressOutcome::Failed { reason });
        }

        let event = ProgressEvent::from_status(&status, fallback);
        let rendered = event.render();
        if last_rendered.as_deref() != Some(rendered.as_str()) {
            last_rendered = Some(rendered);
            if tx.send(ProgressUpdate::Progress(event)).await.is_err() {
                return None;
            }
        }

        match status.state {
            TransferState::Finished => {
                let file_name = status.file_name.unwrap_or_else(|| fallback.to_string());
                return Some(settle_finished(registry, id, file_name).await);
            }
            TransferState::Cancelled => {
                registry.complete(id, TransferState::Cancelled).await;
                return Some(ProgressOutcome::Cancelled);
            }
            _ => {}
        }
    }
}

/// Close a finished session. A session cancelled between the status read
/// and the close stays cancelled.
async fn settle_finished(
    registry: &SessionRegistry,
    id: SessionId,
    file_name: String,
) -> ProgressOutcome {
    if registry.complete(id, TransferState::Finished).await {
        ProgressOutcome::Finished { file_name }
    } else {
        debug!(session_id = %id, "Session cancelled before it could be closed as finished");
        ProgressOutcome::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;
    use crate::workspace::Workspace;

    async fn collect(mut rx: mpsc::Receiver<ProgressUpdate>) -> Vec<ProgressUpdate> {
        let mut updates = Vec::new();
        while let Some(update) = rx.recv().await {
            updates.push(update);
        }
        updates
    }

    fn setup(root: &std::path::Path) -> (Arc<FakeEngine>, Arc<SessionRegistry>) {
        let engine = Arc::new(FakeEngine::new("movie.mp4"));
        let registry = Arc::new(SessionRegistry::new(
            engine.clone(),
            Workspace::new(root.join("d"), root.join("e")),
        ));
        (engine, registry)
    }

    #[test]
    fn render_contains_all_fields() {
        let status = TransferStatus {
            file_name: Some("a.zip".to_string()),
            action: "Downloading".to_string(),
            state: TransferState::Active,
            transferred_bytes: 512,
            total_bytes: Some(1024),
            bytes_per_second: 256.0,
            time_left: Some(Duration::from_secs(2)),
            error: None,
        };
        let text = ProgressEvent::from_status(&status, "x").render();
        assert!(text.contains("File: a.zip"));
        assert!(text.contains("512 B / 1.00 KB"));
        assert!(text.contains("50.00%"));
        assert!(text.contains("256 B/s"));
        assert!(text.contains("00:00:02"));
    }

    #[tokio::test]
    async fn identical_snapshots_are_emitted_once() -> anyhow::Result<()> {
        tokio::time::pause();
        let dir = tempfile::tempdir()?;
        let (engine, registry) = setup(dir.path());
        let id = registry.create(1, "https://example.com/movie.mp4").await?;
        registry.start(id).await?;
        let handle = engine.last_handle().ok_or_else(|| anyhow::anyhow!("no handle"))?;

        let rx = ProgressEmitter::new(Duration::from_secs(1)).watch(registry.clone(), id);

        handle.set_progress(10, Some(100));
        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.set_progress(50, Some(100));
        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.finish();

        let updates = collect(rx).await;
        let rendered: Vec<String> = updates
            .iter()
            .filter_map(|u| match u {
                ProgressUpdate::Progress(e) => Some(e.render()),
                ProgressUpdate::Done(_) => None,
            })
            .collect();

        for pair in rendered.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
        assert_eq!(rendered.len(), 3);
        assert_eq!(
            updates.last(),
            Some(&ProgressUpdate::Done(ProgressOutcome::Finished {
                file_name: "movie.mp4".to_string()
            }))
        );
        assert!(!registry.contains(id).await);
        Ok(())
    }

    #[tokio::test]
    async fn removal_from_registry_ends_as_cancelled() -> anyhow::Result<()> {
        tokio::time::pause();
        let dir = tempfile::tempdir()?;
        let (_engine, registry) = setup(dir.path());
        let id = registry.create(1, "https://example.com/movie.mp4").await?;
        registry.start(id).await?;

        let rx = ProgressEmitter::default().watch(registry.clone(), id);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(registry.cancel(id).await);

        let updates = collect(rx).await;
        assert_eq!(
            updates.last(),
            Some(&ProgressUpdate::Done(ProgressOutcome::Cancelled))
        );
        assert_eq!(
            updates
                .iter()
                .filter(|u| matches!(u, ProgressUpdate::Done(_)))
                .count(),
            1
        );
        Ok(())
    }

    #[tokio::test]
    async fn failure_tears_down_session() -> anyhow::Result<()> {
        tokio::time::pause();
        let dir = tempfile::tempdir()?;
        let (engine, registry) = setup(dir.path());
        let id = registry.create(1, "https://example.com/movie.mp4").await?;
        registry.start(id).await?;
        let handle = engine.last_handle().ok_or_else(|| anyhow::anyhow!("no handle"))?;
        handle.fail("connection reset");

        let updates = collect(ProgressEmitter::default().watch(registry.clone(), id)).await;
        assert_eq!(
            updates,
            vec![ProgressUpdate::Done(ProgressOutcome::Failed {
                reason: "connection reset".to_string()
            })]
        );
        assert!(registry.is_empty().await);
        assert!(handle.was_cancelled());
        Ok(())
    }

    #[tokio::test]
    async fn cancel_racing_completion_wins() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (engine, registry) = setup(dir.path());
        let id = registry.create(1, "https://example.com/movie.mp4").await?;
        registry.start(id).await?;
        let handle = engine.last_handle().ok_or_else(|| anyhow::anyhow!("no handle"))?;
        handle.finish();

        // The user cancels after the transfer reported Finished
        assert!(registry.cancel(id).await);
        let outcome = settle_finished(&registry, id, "movie.mp4".to_string()).await;

        assert_eq!(outcome, ProgressOutcome::Cancelled);
        assert!(!handle.path().exists());
        Ok(())
    }

    #[tokio::test]
    async fn settle_closes_live_session_as_finished() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (_engine, registry) = setup(dir.path());
        let id = registry.create(1, "https://example.com/movie.mp4").await?;
        registry.start(id).await?;

        let outcome = settle_finished(&registry, id, "movie.mp4".to_string()).await;
        assert_eq!(
            outcome,
            ProgressOutcome::Finished {
                file_name: "movie.mp4".to_string()
            }
        );
        assert!(!registry.contains(id).await);
        Ok(())
    }

    #[tokio::test]
    async fn dropping_receiver_cancels_session() -> anyhow::Result<()> {
        tokio::time::pause();
        let dir = tempfile::tempdir()?;
        let (_engine, registry) = setup(dir.path());
        let id = registry.create(1, "https://example.com/movie.mp4").await?;
        registry.start(id).await?;

        let rx = ProgressEmitter::default().watch(registry.clone(), id);
        drop(rx);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(!registry.contains(id).await);
        Ok(())
    }
}
