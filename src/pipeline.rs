//! Request pipeline
//!
//! Drives one download request end to end: start the transfer, stream
//! progress, extract when asked to, deliver the result and clear the
//! workspace. Chat specifics stay behind [`PipelineNotifier`] and
//! [`MediaSink`].

use crate::download::{
    OwnerId, ProgressEmitter, ProgressEvent, ProgressOutcome, ProgressUpdate, SessionError,
    SessionId, SessionRegistry,
};
use crate::extract::{ArchiveExtractor, ExtractionError};
use crate::transfer::TransferEngine;
use crate::upload::{
    ContentPolicy, DeliveryMode, DeliveryReport, Discipline, MediaSink, UploadDispatcher,
    UploadTask, VideoProber,
};
use crate::workspace::Workspace;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Session-level failure of a request
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Rejected URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    /// Transfer could not be opened
    #[error("Transfer engine unavailable: {0}")]
    EngineUnavailable(String),
    /// Transfer broke after it started
    #[error("Transfer failed: {0}")]
    TransferFailed(String),
    /// Archive could not be unpacked
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    /// Workspace I/O failed
    #[error("Workspace error: {0}")]
    Workspace(#[from] io::Error),
}

impl From<SessionError> for PipelineError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::InvalidUrl(reason) => Self::InvalidUrl(reason),
            SessionError::EngineUnavailable(_) | SessionError::FilenameUnresolved(_) => {
                Self::EngineUnavailable(err.to_string())
            }
            SessionError::TransferFailed(reason) => Self::TransferFailed(reason),
            SessionError::NotFound(_) => Self::TransferFailed(err.to_string()),
        }
    }
}

/// A registered, not yet started download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedDownload {
    /// Registry identifier
    pub session_id: SessionId,
    /// Resolved file name
    pub file_name: String,
    /// Whether the file can be extracted
    pub is_archive: bool,
}

/// User choices for a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Extract the archive before delivering
    pub extract: bool,
    /// Document or auto-detected media
    pub mode: DeliveryMode,
    /// Sequential or concurrent delivery
    pub discipline: Discipline,
}

/// How a request ended
#[derive(Debug)]
pub enum PipelineOutcome {
    /// Delivery ran; individual items may still have failed
    Delivered {
        /// Per-item results
        report: DeliveryReport,
    },
    /// Cancelled by the user
    Cancelled,
    /// Aborted by an error
    Failed(PipelineError),
}

/// Post-download phases announced to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Unpacking the archive
    Extracting,
    /// Handing files to the chat
    Uploading {
        /// Number of files in the task
        items: usize,
    },
}

/// Receives pipeline notifications. All calls are best-effort.
#[async_trait]
pub trait PipelineNotifier: Send + Sync {
    /// A new, deduplicated progress snapshot
    async fn progress(&self, event: &ProgressEvent);

    /// A post-download phase started
    async fn stage(&self, stage: Stage);

    /// Called exactly once per [`Pipeline::run`]
    async fn finished(&self, outcome: &PipelineOutcome);
}

/// Coordinator owning the registry and the post-download stages.
pub struct Pipeline {
    registry: Arc<SessionRegistry>,
    emitter: ProgressEmitter,
    extractor: ArchiveExtractor,
    dispatcher: UploadDispatcher,
    workspace: Workspace,
}

impl Pipeline {
    /// Build a pipeline over `engine`, storing files in `workspace`.
    #[must_use]
    pub fn new(
        engine: Arc<dyn TransferEngine>,
        workspace: Workspace,
        prober: Arc<dyn VideoProber>,
    ) -> Self {
        Self::from_parts(
            Arc::new(SessionRegistry::new(engine, workspace.clone())),
            UploadDispatcher::new(prober),
        )
    }

    /// Build a pipeline from an existing registry and dispatcher.
    #[must_use]
    pub fn from_parts(registry: Arc<SessionRegistry>, dispatcher: UploadDispatcher) -> Self {
        let workspace = registry.workspace().clone();
        Self {
            registry,
            emitter: ProgressEmitter::default(),
            extractor: ArchiveExtractor::new(workspace.clone()),
            dispatcher,
            workspace,
        }
    }

    /// Replace the content policy consulted before each delivery.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn ContentPolicy>) -> Self {
        self.dispatcher = self.dispatcher.with_policy(policy);
        self
    }

    /// Replace the progress emitter.
    #[must_use]
    pub const fn with_emitter(mut self, emitter: ProgressEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// Session registry shared with the chat layer
    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Register a download for `owner_id` without starting it.
    ///
    /// # Errors
    ///
    /// Returns the mapped [`SessionError`].
    pub async fn prepare(
        &self,
        owner_id: OwnerId,
        url: &str,
    ) -> Result<PreparedDownload, PipelineError> {
        let session_id = self.registry.create(owner_id, url).await?;
        let file_name = self
            .registry
            .get(session_id)
            .await
            .and_then(|session| session.file_name)
            .ok_or(SessionError::NotFound(session_id))?;
        let is_archive = ArchiveExtractor::is_supported(&file_name);

        Ok(PreparedDownload {
            session_id,
            file_name,
            is_archive,
        })
    }

    /// Run a prepared session to completion.
    pub async fn run(
        &self,
        session_id: SessionId,
        options: RunOptions,
        notifier: &dyn PipelineNotifier,
        sink: &dyn MediaSink,
    ) -> PipelineOutcome {
        let outcome = match self.registry.get(session_id).await {
            Some(session) => {
                let owner = session.owner_id;
                let scope = self.workspace.scope(owner, session_id);
                let outcome = self
                    .drive(session_id, owner, options, notifier, sink)
                    .await;
                if let Err(e) = scope.release().await {
                    warn!(session_id = %session_id, owner_id = owner, error = %e, "Failed to clear workspace");
                }
                outcome
            }
            None => PipelineOutcome::Failed(SessionError::NotFound(session_id).into()),
        };

        match &outcome {
            PipelineOutcome::Delivered { report } => info!(
                session_id = %session_id,
                delivered = report.delivered(),
                undelivered = report.undelivered(),
                "Request delivered"
            ),
            PipelineOutcome::Cancelled => info!(session_id = %session_id, "Request cancelled"),
            PipelineOutcome::Failed(e) => warn!(session_id = %session_id, error = %e, "Request failed"),
        }
        notifier.finished(&outcome).await;
        outcome
    }

    async fn drive(
        &self,
        session_id: SessionId,
        owner: OwnerId,
        options: RunOptions,
        notifier: &dyn PipelineNotifier,
        sink: &dyn MediaSink,
    ) -> PipelineOutcome {
        if let Err(e) = self.registry.start(session_id).await {
            return PipelineOutcome::Failed(e.into());
        }

        let mut updates = self.emitter.watch(Arc::clone(&self.registry), session_id);
        let mut terminal = None;
        while let Some(update) = updates.recv().await {
            match update {
                ProgressUpdate::Progress(event) => notifier.progress(&event).await,
                ProgressUpdate::Done(outcome) => {
                    terminal = Some(outcome);
                    break;
                }
            }
        }

        let file_name = match terminal {
            Some(ProgressOutcome::Finished { file_name }) => file_name,
            Some(ProgressOutcome::Cancelled) => return PipelineOutcome::Cancelled,
            Some(ProgressOutcome::Failed { reason }) => {
                return PipelineOutcome::Failed(PipelineError::TransferFailed(reason))
            }
            None => {
                return PipelineOutcome::Failed(PipelineError::TransferFailed(
                    "progress stream ended without an outcome".to_string(),
                ))
            }
        };

        let task = match self
            .build_task(session_id, owner, &file_name, options, notifier)
            .await
        {
            Ok(task) => task,
            Err(e) => return PipelineOutcome::Failed(e),
        };

        notifier
            .stage(Stage::Uploading {
                items: task.files().len(),
            })
            .await;
        let report = self
            .dispatcher
            .deliver(owner, &task, options.discipline, sink)
            .await;
        PipelineOutcome::Delivered { report }
    }

    async fn build_task(
        &self,
        session_id: SessionId,
        owner: OwnerId,
        file_name: &str,
        options: RunOptions,
        notifier: &dyn PipelineNotifier,
    ) -> Result<UploadTask, PipelineError> {
        if options.extract && ArchiveExtractor::is_supported(file_name) {
            notifier.stage(Stage::Extracting).await;
            let extracted = self
                .extractor
                .extract(file_name, owner, session_id)
                .await?;
            return Ok(UploadTask::from_directory(&extracted.path, options.mode).await?);
        }
        if options.extract {
            debug!(owner_id = owner, file_name, "Not an archive, delivering as is");
        }
        Ok(UploadTask::single(
            self.workspace.download_dir(owner, session_id).join(file_name),
            options.mode,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEngine, FakeProber, OpenBehavior, RecordingNotifier, RecordingSink};
    use crate::upload::ItemOutcome;
    use std::time::Duration;

    fn pipeline(engine: Arc<FakeEngine>, root: &std::path::Path) -> Pipeline {
        Pipeline::new(
            engine,
            Workspace::new(root.join("d"), root.join("e")),
            Arc::new(FakeProber::new(1, 1)),
        )
    }

    #[tokio::test]
    async fn prepare_reports_archive() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pipeline = pipeline(Arc::new(FakeEngine::new("Bundle.ZIP")), dir.path());

        let prepared = pipeline.prepare(1, "https://example.com/Bundle.ZIP").await?;
        assert_eq!(prepared.file_name, "Bundle.ZIP");
        assert!(prepared.is_archive);
        assert!(pipeline.registry().contains(prepared.session_id).await);
        Ok(())
    }

    #[tokio::test]
    async fn prepare_maps_errors() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pipeline = pipeline(
            Arc::new(FakeEngine::new("a").with_behavior(OpenBehavior::Fail)),
            dir.path(),
        );

        assert!(matches!(
            pipeline.prepare(1, "mailto:me@example.com").await,
            Err(PipelineError::InvalidUrl(_))
        ));
        assert!(matches!(
            pipeline.prepare(1, "https://example.com/a").await,
            Err(PipelineError::EngineUnavailable(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn single_file_is_delivered_and_workspace_cleared() -> anyhow::Result<()> {
        tokio::time::pause();
        let dir = tempfile::tempdir()?;
        let engine = Arc::new(FakeEngine::new("song.mp3").with_content(b"ID3".to_vec()));
        let pipeline = pipeline(engine.clone(), dir.path());
        let notifier = RecordingNotifier::new();
        let sink = RecordingSink::new();

        let prepared = pipeline.prepare(4, "https://example.com/song.mp3").await?;
        let handle = engine.last_handle().ok_or_else(|| anyhow::anyhow!("no handle"))?;
        let finisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            handle.finish();
        });

        let options = RunOptions {
            mode: DeliveryMode::Auto,
            ..RunOptions::default()
        };
        let outcome = pipeline
            .run(prepared.session_id, options, &notifier, &sink)
            .await;
        finisher.await?;

        let PipelineOutcome::Delivered { report } = outcome else {
            anyhow::bail!("unexpected outcome {outcome:?}");
        };
        assert_eq!(report.items[0].outcome, ItemOutcome::Delivered { attempts: 1 });
        assert_eq!(sink.delivered()[0].caption, "song.mp3");
        assert_eq!(notifier.finished_count(), 1);
        assert!(!notifier.progress_texts().is_empty());
        let workspace = pipeline.registry().workspace();
        assert!(!workspace.download_dir(4, prepared.session_id).exists());
        assert!(!workspace.extract_dir(4, prepared.session_id).exists());
        assert!(pipeline.registry().is_empty().await);
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_is_an_outcome() -> anyhow::Result<()> {
        tokio::time::pause();
        let dir = tempfile::tempdir()?;
        let engine = Arc::new(FakeEngine::new("big.iso"));
        let pipeline = Arc::new(pipeline(engine, dir.path()));
        let notifier = RecordingNotifier::new();
        let sink = RecordingSink::new();

        let prepared = pipeline.prepare(4, "https://example.com/big.iso").await?;
        let canceller = {
            let pipeline = Arc::clone(&pipeline);
            let id = prepared.session_id;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                pipeline.registry().cancel_owned(id, 4).await
            })
        };

        let outcome = pipeline
            .run(prepared.session_id, RunOptions::default(), &notifier, &sink)
            .await;

        assert!(canceller.await?);
        assert!(matches!(outcome, PipelineOutcome::Cancelled));
        assert!(sink.delivered().is_empty());
        assert_eq!(notifier.finished_count(), 1);
        let workspace = pipeline.registry().workspace();
        assert!(!workspace.download_dir(4, prepared.session_id).exists());
        assert!(!workspace.extract_dir(4, prepared.session_id).exists());
        Ok(())
    }

    #[tokio::test]
    async fn transfer_failure_is_reported_once() -> anyhow::Result<()> {
        tokio::time::pause();
        let dir = tempfile::tempdir()?;
        let engine = Arc::new(FakeEngine::new("a.bin"));
        let pipeline = pipeline(engine.clone(), dir.path());
        let notifier = RecordingNotifier::new();
        let sink = RecordingSink::new();

        let prepared = pipeline.prepare(4, "https://example.com/a.bin").await?;
        let handle = engine.last_handle().ok_or_else(|| anyhow::anyhow!("no handle"))?;
        handle.fail("HTTP 404");

        let outcome = pipeline
            .run(prepared.session_id, RunOptions::default(), &notifier, &sink)
            .await;

        assert!(matches!(
            outcome,
            PipelineOutcome::Failed(PipelineError::TransferFailed(ref reason)) if reason == "HTTP 404"
        ));
        assert_eq!(notifier.finished_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_session_fails() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pipeline = pipeline(Arc::new(FakeEngine::new("a")), dir.path());
        let notifier = RecordingNotifier::new();

        let outcome = pipeline
            .run(SessionId::new(), RunOptions::default(), &notifier, &RecordingSink::new())
            .await;
        assert!(matches!(outcome, PipelineOutcome::Failed(_)));
        assert_eq!(notifier.finished_count(), 1);
        Ok(())
    }
}
