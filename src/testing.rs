//! Testing helpers and fakes.
//!
//! Hand-written doubles for the trait seams of the crate: a scripted
//! transfer engine, a recording media sink, a fixed video prober and a
//! recording pipeline notifier. Used by the unit tests and the integration
//! tests under `tests/`.

use crate::download::ProgressEvent;
use crate::pipeline::{PipelineNotifier, PipelineOutcome, Stage};
use crate::transfer::{TransferEngine, TransferHandle, TransferState, TransferStatus};
use crate::upload::{DeliveryItem, MediaSink, SendError, VideoProber};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use url::Url;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How [`FakeEngine::open`] behaves
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OpenBehavior {
    /// Return a fresh named handle
    #[default]
    Succeed,
    /// Return an error
    Fail,
    /// Never return
    Hang,
    /// Return a handle without a file name
    Unnamed,
    /// Return the previously opened handle again
    ReuseLast,
}

/// Transfer engine whose handles are driven by the test.
#[derive(Debug)]
pub struct FakeEngine {
    file_name: String,
    behavior: OpenBehavior,
    content: Vec<u8>,
    routes: HashMap<String, (String, Vec<u8>)>,
    opened: Mutex<Vec<PathBuf>>,
    handles: Mutex<Vec<Arc<FakeTransfer>>>,
}

impl FakeEngine {
    /// Engine resolving every URL to `file_name`
    #[must_use]
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            behavior: OpenBehavior::Succeed,
            content: Vec::new(),
            routes: HashMap::new(),
            opened: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Change the open behavior
    #[must_use]
    pub fn with_behavior(mut self, behavior: OpenBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Bytes written to disk when a handle finishes
    #[must_use]
    pub fn with_content(mut self, content: Vec<u8>) -> Self {
        self.content = content;
        self
    }

    /// Resolve `url` to its own file name and content
    #[must_use]
    pub fn with_route(
        mut self,
        url: impl Into<String>,
        file_name: impl Into<String>,
        content: Vec<u8>,
    ) -> Self {
        self.routes.insert(url.into(), (file_name.into(), content));
        self
    }

    /// Directories passed to `open`, in call order
    #[must_use]
    pub fn opened_dirs(&self) -> Vec<PathBuf> {
        lock(&self.opened).clone()
    }

    /// Most recently opened handle
    #[must_use]
    pub fn last_handle(&self) -> Option<Arc<FakeTransfer>> {
        lock(&self.handles).last().cloned()
    }

    fn new_handle(&self, url: &Url, directory: &Path, named: bool) -> Arc<FakeTransfer> {
        let (file_name, content) = self
            .routes
            .get(url.as_str())
            .cloned()
            .unwrap_or_else(|| (self.file_name.clone(), self.content.clone()));
        let handle = Arc::new(FakeTransfer {
            file_name: named.then(|| file_name.clone()),
            path: directory.join(&file_name),
            content,
            status: Mutex::new(TransferStatus {
                file_name: named.then(|| file_name.clone()),
                action: "Waiting".to_string(),
                ..TransferStatus::default()
            }),
            cancelled: AtomicBool::new(false),
        });
        lock(&self.handles).push(Arc::clone(&handle));
        handle
    }
}

#[async_trait]
impl TransferEngine for FakeEngine {
    async fn open(
        &self,
        url: &Url,
        directory: &Path,
        _parallelism: usize,
    ) -> Result<Arc<dyn TransferHandle>> {
        lock(&self.opened).push(directory.to_path_buf());
        let handle = match self.behavior {
            OpenBehavior::Succeed => self.new_handle(url, directory, true),
            OpenBehavior::Unnamed => self.new_handle(url, directory, false),
            OpenBehavior::Fail => return Err(anyhow!("connection refused")),
            OpenBehavior::Hang => std::future::pending().await,
            OpenBehavior::ReuseLast => match self.last_handle() {
                Some(handle) => handle,
                None => self.new_handle(url, directory, true),
            },
        };
        Ok(handle)
    }
}

/// Transfer handle whose progress is set by the test.
#[derive(Debug)]
pub struct FakeTransfer {
    file_name: Option<String>,
    path: PathBuf,
    content: Vec<u8>,
    status: Mutex<TransferStatus>,
    cancelled: AtomicBool,
}

impl FakeTransfer {
    /// Target path on disk
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Report `transferred` of `total` bytes as active.
    pub fn set_progress(&self, transferred: u64, total: Option<u64>) {
        let mut status = lock(&self.status);
        if status.state.is_terminal() {
            return;
        }
        status.state = TransferState::Active;
        status.action = "Downloading".to_string();
        status.transferred_bytes = transferred;
        status.total_bytes = total;
    }

    /// Write the content to disk and report completion.
    pub fn finish(&self) {
        if let Err(e) = std::fs::write(&self.path, &self.content) {
            self.fail(&e.to_string());
            return;
        }
        let mut status = lock(&self.status);
        let size = status
            .total_bytes
            .unwrap_or(self.content.len() as u64);
        status.state = TransferState::Finished;
        status.action = "Downloaded".to_string();
        status.transferred_bytes = size;
        status.total_bytes = Some(size);
    }

    /// Report a failure.
    pub fn fail(&self, reason: &str) {
        let mut status = lock(&self.status);
        status.state = TransferState::Failed;
        status.action = "Failed".to_string();
        status.error = Some(reason.to_string());
    }

    /// Whether `cancel_and_delete` ran
    #[must_use]
    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferHandle for FakeTransfer {
    fn file_name(&self) -> Option<String> {
        self.file_name.clone()
    }

    fn status(&self) -> TransferStatus {
        lock(&self.status).clone()
    }

    async fn start(&self) -> Result<()> {
        tokio::fs::write(&self.path, b"").await?;
        let mut status = lock(&self.status);
        if status.state == TransferState::Pending {
            status.state = TransferState::Active;
            status.action = "Downloading".to_string();
        }
        Ok(())
    }

    async fn cancel_and_delete(&self) -> Result<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        {
            let mut status = lock(&self.status);
            if status.state != TransferState::Failed {
                status.state = TransferState::Cancelled;
                status.action = "Cancelled".to_string();
            }
        }
        match tokio::fs::remove_file(&self.path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Sink that records every attempt and fails according to a script.
#[derive(Debug, Default)]
pub struct RecordingSink {
    scripts: Mutex<HashMap<String, VecDeque<SendError>>>,
    attempts: Mutex<Vec<(String, Instant)>>,
    on_disk: Mutex<Vec<(String, bool)>>,
    delivered: Mutex<Vec<DeliveryItem>>,
}

impl RecordingSink {
    /// Sink that accepts everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next attempts for `caption` with `errors`, in order.
    pub fn script(&self, caption: &str, errors: Vec<SendError>) {
        lock(&self.scripts).insert(caption.to_string(), errors.into());
    }

    /// Number of attempts made for `caption`
    #[must_use]
    pub fn attempts_for(&self, caption: &str) -> usize {
        self.attempt_times(caption).len()
    }

    /// Instants of the attempts made for `caption`
    #[must_use]
    pub fn attempt_times(&self, caption: &str) -> Vec<Instant> {
        lock(&self.attempts)
            .iter()
            .filter(|(c, _)| c == caption)
            .map(|(_, at)| *at)
            .collect()
    }

    /// Captions of all attempts, in order
    #[must_use]
    pub fn attempted_captions(&self) -> Vec<String> {
        lock(&self.attempts).iter().map(|(c, _)| c.clone()).collect()
    }

    /// Caption of each attempt and whether its file existed at that moment
    #[must_use]
    pub fn presence_at_send(&self) -> Vec<(String, bool)> {
        lock(&self.on_disk).clone()
    }

    /// Items that were accepted, in order
    #[must_use]
    pub fn delivered(&self) -> Vec<DeliveryItem> {
        lock(&self.delivered).clone()
    }
}

#[async_trait]
impl MediaSink for RecordingSink {
    async fn send_media(&self, item: &DeliveryItem) -> Result<(), SendError> {
        lock(&self.attempts).push((item.caption.clone(), Instant::now()));
        lock(&self.on_disk).push((item.caption.clone(), item.path.exists()));
        let scripted = lock(&self.scripts)
            .get_mut(&item.caption)
            .and_then(VecDeque::pop_front);
        if let Some(error) = scripted {
            return Err(error);
        }
        lock(&self.delivered).push(item.clone());
        Ok(())
    }
}

/// Prober returning fixed dimensions, or always failing.
#[derive(Debug, Clone)]
pub struct FakeProber {
    dimensions: Option<(u32, u32)>,
}

impl FakeProber {
    /// Every video is `width` x `height`
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            dimensions: Some((width, height)),
        }
    }

    /// Every probe fails
    #[must_use]
    pub const fn failing() -> Self {
        Self { dimensions: None }
    }
}

#[async_trait]
impl VideoProber for FakeProber {
    async fn dimensions(&self, path: &Path) -> Result<(u32, u32)> {
        self.dimensions
            .ok_or_else(|| anyhow!("cannot probe {}", path.display()))
    }
}

/// Notifier that keeps everything it is told.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    progress: Mutex<Vec<String>>,
    stages: Mutex<Vec<Stage>>,
    finished: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    /// Empty notifier
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rendered progress events
    #[must_use]
    pub fn progress_texts(&self) -> Vec<String> {
        lock(&self.progress).clone()
    }

    /// Announced stages
    #[must_use]
    pub fn stages(&self) -> Vec<Stage> {
        lock(&self.stages).clone()
    }

    /// How many times `finished` ran
    #[must_use]
    pub fn finished_count(&self) -> usize {
        lock(&self.finished).len()
    }

    /// Debug rendering of each final outcome
    #[must_use]
    pub fn finished_outcomes(&self) -> Vec<String> {
        lock(&self.finished).clone()
    }
}

#[async_trait]
impl PipelineNotifier for RecordingNotifier {
    async fn progress(&self, event: &ProgressEvent) {
        lock(&self.progress).push(event.render());
    }

    async fn stage(&self, stage: Stage) {
        lock(&self.stages).push(stage);
    }

    async fn finished(&self, outcome: &PipelineOutcome) {
        lock(&self.finished).push(format!("{outcome:?}"));
    }
}

/// Write a stored (uncompressed) zip archive with the given text entries.
///
/// # Errors
///
/// Returns I/O and zip errors.
pub fn write_zip(path: &Path, entries: &[(&str, &str)]) -> Result<()> {
    let file = std::fs::File::create(path)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    for (name, content) in entries {
        writer.start_file(*name, options)?;
        writer.write_all(content.as_bytes())?;
    }
    writer.finish()?;
    Ok(())
}
