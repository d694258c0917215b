use super::{TransferEngine, TransferHandle, TransferState, TransferStatus};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use lazy_regex::lazy_regex;
use percent_encoding::percent_decode_str;
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, RANGE};
use reqwest::{Client, StatusCode};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Files smaller than this are fetched with a single stream.
const MIN_PARALLEL_SIZE: u64 = 4 * 1024 * 1024;

/// Fallback when neither headers nor URL carry a usable name.
const DEFAULT_FILE_NAME: &str = "download";

/// `filename*=UTF-8''name` or `filename="name"` in Content-Disposition
#[allow(clippy::non_std_lazy_statics)]
static RE_DISPOSITION_NAME: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r#"(?i)filename(\*)?\s*=\s*(?:UTF-8'')?"?([^";]+)"?"#);

/// Transfer engine downloading over HTTP(S) with `reqwest`.
///
/// When the server announces a size and byte-range support, the body is
/// split into `parallelism` ranges fetched concurrently into a preallocated
/// file. Otherwise a single stream is used.
#[derive(Clone)]
pub struct HttpTransferEngine {
    client: Client,
}

impl HttpTransferEngine {
    /// Create an engine with a default client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("oxide-fetch/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    /// Create an engine on top of an existing client.
    #[must_use]
    pub const fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TransferEngine for HttpTransferEngine {
    async fn open(
        &self,
        url: &Url,
        directory: &Path,
        parallelism: usize,
    ) -> Result<Arc<dyn TransferHandle>> {
        let probe = probe(&self.client, url).await?;
        info!(
            url = %url,
            file_name = %probe.file_name,
            total_bytes = ?probe.total_bytes,
            accepts_ranges = probe.accepts_ranges,
            "Transfer opened"
        );

        let shared = Shared {
            client: self.client.clone(),
            url: probe.final_url,
            path: directory.join(&probe.file_name),
            file_name: probe.file_name,
            total_bytes: probe.total_bytes,
            accepts_ranges: probe.accepts_ranges,
            parallelism: parallelism.max(1),
            transferred: AtomicU64::new(0),
            progress: Mutex::new(Progress::default()),
            cancel: CancellationToken::new(),
            worker: tokio::sync::Mutex::new(None),
        };
        Ok(Arc::new(HttpTransfer {
            shared: Arc::new(shared),
        }))
    }
}

struct Probe {
    file_name: String,
    total_bytes: Option<u64>,
    accepts_ranges: bool,
    final_url: Url,
}

async fn probe(client: &Client, url: &Url) -> Result<Probe> {
    let response = client
        .head(url.clone())
        .send()
        .await
        .with_context(|| format!("HEAD request to {url} failed"))?;

    let final_url = response.url().clone();
    let headers = if response.status().is_success() {
        response.headers().clone()
    } else {
        // Some servers reject HEAD; fall back to what the URL tells us.
        debug!(status = %response.status(), "HEAD not supported, probing from URL only");
        HeaderMap::new()
    };

    let total_bytes = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let accepts_ranges = headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
    let file_name = headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(file_name_from_disposition)
        .or_else(|| file_name_from_url(&final_url))
        .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());

    Ok(Probe {
        file_name,
        total_bytes,
        accepts_ranges,
        final_url,
    })
}

fn file_name_from_disposition(value: &str) -> Option<String> {
    let caps = RE_DISPOSITION_NAME.captures(value)?;
    let raw = caps.get(2)?.as_str();
    // Only the extended `filename*` form is percent-encoded
    if caps.get(1).is_some() {
        sanitize_file_name(&percent_decode_str(raw).decode_utf8_lossy())
    } else {
        sanitize_file_name(raw)
    }
}

fn file_name_from_url(url: &Url) -> Option<String> {
    let segment = url
        .path_segments()?
        .rev()
        .find(|segment| !segment.is_empty())?;
    sanitize_file_name(&percent_decode_str(segment).decode_utf8_lossy())
}

/// Keeps only the final path component and rejects names that would escape
/// the user's directory.
fn sanitize_file_name(raw: &str) -> Option<String> {
    let name = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .trim_matches('"');
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_control() || c == ':' { '_' } else { c })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => None,
        _ => Some(cleaned),
    }
}

/// Inclusive byte ranges covering `total` split into at most `parts` pieces.
fn split_ranges(total: u64, parts: usize) -> Vec<(u64, u64)> {
    if total == 0 {
        return Vec::new();
    }
    let parts = u64::try_from(parts.max(1)).unwrap_or(1);
    let chunk = total.div_ceil(parts);
    (0..parts)
        .map(|i| i * chunk)
        .take_while(|start| *start < total)
        .map(|start| (start, (start + chunk).min(total) - 1))
        .collect()
}

#[derive(Default)]
struct Progress {
    state: TransferState,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    error: Option<String>,
}

struct Shared {
    client: Client,
    url: Url,
    path: PathBuf,
    file_name: String,
    total_bytes: Option<u64>,
    accepts_ranges: bool,
    parallelism: usize,
    transferred: AtomicU64,
    progress: Mutex<Progress>,
    cancel: CancellationToken,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self: Arc<Self>) {
        let result = tokio::select! {
            () = self.cancel.cancelled() => return,
            result = self.download() => result,
        };

        match result {
            Ok(()) => {
                let mut progress = self.progress();
                progress.state = TransferState::Finished;
                progress.finished_at = Some(Instant::now());
                info!(file_name = %self.file_name, "Transfer finished");
            }
            Err(e) => {
                warn!(file_name = %self.file_name, error = %e, "Transfer failed");
                {
                    let mut progress = self.progress();
                    progress.state = TransferState::Failed;
                    progress.finished_at = Some(Instant::now());
                    progress.error = Some(e.to_string());
                }
                remove_partial(&self.path).await;
            }
        }
    }

    async fn download(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match self.total_bytes {
            Some(total)
                if self.accepts_ranges && self.parallelism > 1 && total >= MIN_PARALLEL_SIZE =>
            {
                self.download_ranges(total).await
            }
            _ => self.download_single().await,
        }
    }

    async fn download_single(&self) -> Result<()> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await?
            .error_for_status()?;

        let mut file = File::create(&self.path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            self.transferred
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        file.flush().await?;
        Ok(())
    }

    async fn download_ranges(&self, total: u64) -> Result<()> {
        let file = File::create(&self.path).await?;
        file.set_len(total).await?;
        drop(file);

        let ranges = split_ranges(total, self.parallelism);
        debug!(file_name = %self.file_name, parts = ranges.len(), "Parallel range download");
        futures_util::future::try_join_all(
            ranges
                .into_iter()
                .map(|(start, end)| self.fetch_range(start, end)),
        )
        .await?;
        Ok(())
    }

    async fn fetch_range(&self, start: u64, end: u64) -> Result<()> {
        let response = self
            .client
            .get(self.url.clone())
            .header(RANGE, format!("bytes={start}-{end}"))
            .send()
            .await?
            .error_for_status()?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            bail!("server ignored range request ({})", response.status());
        }

        let mut file = OpenOptions::new().write(true).open(&self.path).await?;
        file.seek(SeekFrom::Start(start)).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            self.transferred
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        file.flush().await?;
        Ok(())
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial file"),
    }
}

/// Handle for one HTTP transfer.
pub struct HttpTransfer {
    shared: Arc<Shared>,
}

#[async_trait]
impl TransferHandle for HttpTransfer {
    fn file_name(&self) -> Option<String> {
        Some(self.shared.file_name.clone())
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn status(&self) -> TransferStatus {
        let progress = self.shared.progress();
        let transferred = self.shared.transferred.load(Ordering::Relaxed);

        let elapsed = match (progress.started_at, progress.finished_at) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        };
        let secs = elapsed.as_secs_f64();
        let bytes_per_second = if secs > 0.0 {
            transferred as f64 / secs
        } else {
            0.0
        };

        let time_left = match (progress.state, self.shared.total_bytes) {
            (TransferState::Finished, _) => Some(Duration::ZERO),
            (TransferState::Active, Some(total)) if bytes_per_second > 0.0 => {
                let remaining = total.saturating_sub(transferred) as f64;
                Some(Duration::from_secs((remaining / bytes_per_second).ceil() as u64))
            }
            _ => None,
        };

        let action = match progress.state {
            TransferState::Pending => "Waiting",
            TransferState::Active => "Downloading",
            TransferState::Finished => "Downloaded",
            TransferState::Cancelled => "Cancelled",
            TransferState::Failed => "Failed",
        };

        TransferStatus {
            file_name: Some(self.shared.file_name.clone()),
            action: action.to_string(),
            state: progress.state,
            transferred_bytes: transferred,
            total_bytes: self.shared.total_bytes,
            bytes_per_second,
            time_left,
            error: progress.error.clone(),
        }
    }

    async fn start(&self) -> Result<()> {
        {
            let mut progress = self.shared.progress();
            if progress.state != TransferState::Pending {
                bail!("transfer already {}", progress.state);
            }
            progress.state = TransferState::Active;
            progress.started_at = Some(Instant::now());
        }

        let shared = Arc::clone(&self.shared);
        let worker = tokio::spawn(shared.run());
        *self.shared.worker.lock().await = Some(worker);
        Ok(())
    }

    async fn cancel_and_delete(&self) -> Result<()> {
        self.shared.cancel.cancel();

        // Wait until no range writer can touch the file anymore.
        let worker = self.shared.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Transfer worker ended abnormally");
            }
        }

        {
            let mut progress = self.shared.progress();
            if progress.state != TransferState::Failed {
                progress.state = TransferState::Cancelled;
                progress.finished_at = Some(Instant::now());
            }
        }

        match tokio::fs::remove_file(&self.shared.path).await {
            Ok(()) => {
                info!(file_name = %self.shared.file_name, "Transfer cancelled, file deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to delete cancelled download"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_names() {
        assert_eq!(
            file_name_from_disposition(r#"attachment; filename="report.pdf""#).as_deref(),
            Some("report.pdf")
        );
        assert_eq!(
            file_name_from_disposition("attachment; filename*=UTF-8''data.zip").as_deref(),
            Some("data.zip")
        );
        assert_eq!(
            file_name_from_disposition(r#"attachment; filename="../../etc/passwd""#).as_deref(),
            Some("passwd")
        );
        assert_eq!(file_name_from_disposition("inline"), None);
    }

    #[test]
    fn url_names() -> Result<()> {
        let url = Url::parse("https://example.com/files/archive.zip?token=1")?;
        assert_eq!(file_name_from_url(&url).as_deref(), Some("archive.zip"));

        let url = Url::parse("https://example.com/files/")?;
        assert_eq!(file_name_from_url(&url).as_deref(), Some("files"));

        let url = Url::parse("https://example.com/")?;
        assert_eq!(file_name_from_url(&url), None);
        Ok(())
    }

    #[test]
    fn encoded_names_are_decoded() -> Result<()> {
        let url = Url::parse("https://example.com/files/my%20file.zip")?;
        assert_eq!(file_name_from_url(&url).as_deref(), Some("my file.zip"));

        let url = Url::parse("https://example.com/d/%D0%BE%D1%82%D1%87%D1%91%D1%82.pdf")?;
        assert_eq!(file_name_from_url(&url).as_deref(), Some("отчёт.pdf"));

        // An encoded separator cannot smuggle a directory in
        let url = Url::parse("https://example.com/x/..%2F..%2Fsecret.txt")?;
        assert_eq!(file_name_from_url(&url).as_deref(), Some("secret.txt"));
        let url = Url::parse("https://example.com/x/%2E%2E")?;
        assert_eq!(file_name_from_url(&url), None);

        assert_eq!(
            file_name_from_disposition("attachment; filename*=UTF-8''annual%20report.pdf")
                .as_deref(),
            Some("annual report.pdf")
        );
        assert_eq!(
            file_name_from_disposition(r#"attachment; filename="100%25 done.txt""#).as_deref(),
            Some("100%25 done.txt")
        );
        Ok(())
    }

    #[test]
    fn sanitize_rejects_dot_names() {
        assert_eq!(sanitize_file_name(".."), None);
        assert_eq!(sanitize_file_name("  "), None);
        assert_eq!(sanitize_file_name("a:b.txt").as_deref(), Some("a_b.txt"));
    }

    #[test]
    fn ranges_cover_whole_body() {
        assert_eq!(split_ranges(10, 3), vec![(0, 3), (4, 7), (8, 9)]);
        assert_eq!(split_ranges(2, 3), vec![(0, 0), (1, 1)]);
        assert_eq!(split_ranges(0, 3), Vec::<(u64, u64)>::new());
        assert_eq!(split_ranges(7, 1), vec![(0, 6)]);
    }
}
