//! Download session registry
//!
//! Single source of truth for the downloads that currently exist. Owned by
//! the pipeline coordinator and shared by `Arc`; all mutations go through
//! one async mutex so that creating and registering a session is atomic.

use super::session::{DownloadSession, OwnerId, SessionError, SessionId, SessionState};
use crate::config::{FILENAME_RESOLVE_TIMEOUT_SECS, MAX_URL_LENGTH, PARALLEL_STREAMS};
use crate::transfer::{TransferEngine, TransferHandle};
use crate::workspace::Workspace;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

struct SessionEntry {
    owner_id: OwnerId,
    handle: Arc<dyn TransferHandle>,
    file_name: Option<String>,
    state: SessionState,
    created_at: Instant,
}

impl SessionEntry {
    fn snapshot(&self, id: SessionId) -> DownloadSession {
        DownloadSession {
            id,
            owner_id: self.owner_id,
            file_name: self.file_name.clone(),
            state: self.state,
            handle: Arc::clone(&self.handle),
        }
    }
}

/// Registry of live download sessions
pub struct SessionRegistry {
    engine: Arc<dyn TransferEngine>,
    workspace: Workspace,
    parallelism: usize,
    resolve_timeout: Duration,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl SessionRegistry {
    /// Create an empty registry opening transfers through `engine`.
    #[must_use]
    pub fn new(engine: Arc<dyn TransferEngine>, workspace: Workspace) -> Self {
        Self {
            engine,
            workspace,
            parallelism: PARALLEL_STREAMS,
            resolve_timeout: Duration::from_secs(FILENAME_RESOLVE_TIMEOUT_SECS),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Override the file name resolution window.
    #[must_use]
    pub const fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    /// Workspace the registry places downloads into
    #[must_use]
    pub const fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Validate `url`, open a transfer into a fresh session directory under
    /// the owner's download root and register it as `Pending`.
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidUrl`] for anything but an absolute http(s) URL
    /// - [`SessionError::EngineUnavailable`] when the engine cannot open the transfer
    /// - [`SessionError::FilenameUnresolved`] when no file name is known in time
    pub async fn create(&self, owner_id: OwnerId, url: &str) -> Result<SessionId, SessionError> {
        let url = validate_url(url)?;
        let id = SessionId::new();
        let directory = self.workspace.download_dir(owner_id, id);
        tokio::fs::create_dir_all(&directory).await.map_err(|e| {
            SessionError::EngineUnavailable(format!(
                "cannot create {}: {e}",
                directory.display()
            ))
        })?;

        let opened = tokio::time::timeout(
            self.resolve_timeout,
            self.engine.open(&url, &directory, self.parallelism),
        )
        .await;

        let handle = match opened {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                warn!(owner_id, url = %url, error = %e, "Transfer engine could not open URL");
                self.clear_workspace(owner_id, id).await;
                return Err(SessionError::EngineUnavailable(format!("{e:#}")));
            }
            Err(_) => {
                warn!(owner_id, url = %url, "File name resolution timed out");
                self.clear_workspace(owner_id, id).await;
                return Err(SessionError::FilenameUnresolved(
                    self.resolve_timeout.as_secs(),
                ));
            }
        };

        let Some(file_name) = handle.file_name() else {
            discard(handle.as_ref()).await;
            self.clear_workspace(owner_id, id).await;
            return Err(SessionError::FilenameUnresolved(
                self.resolve_timeout.as_secs(),
            ));
        };

        {
            let mut sessions = self.sessions.lock().await;
            if sessions
                .values()
                .any(|entry| same_handle(&entry.handle, &handle))
            {
                drop(sessions);
                // The handle belongs to a live session, leave it running
                self.clear_workspace(owner_id, id).await;
                return Err(SessionError::EngineUnavailable(
                    "engine returned a handle that is already registered".to_string(),
                ));
            }
            sessions.insert(
                id,
                SessionEntry {
                    owner_id,
                    handle,
                    file_name: Some(file_name.clone()),
                    state: SessionState::Pending,
                    created_at: Instant::now(),
                },
            );
        }

        info!(session_id = %id, owner_id, file_name = %file_name, "Download session created");
        Ok(id)
    }

    /// Begin the transfer of a `Pending` session.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] if the session is not pending anymore,
    /// [`SessionError::TransferFailed`] if the engine refuses to start; the
    /// session is then torn down.
    pub async fn start(&self, id: SessionId) -> Result<(), SessionError> {
        let handle = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(&id)
                .filter(|entry| entry.state == SessionState::Pending)
                .map(|entry| Arc::clone(&entry.handle))
                .ok_or(SessionError::NotFound(id))?
        };

        if let Err(e) = handle.start().await {
            let reason = format!("{e:#}");
            self.fail(id, &reason).await;
            return Err(SessionError::TransferFailed(reason));
        }

        self.mark_active(id).await;
        info!(session_id = %id, "Download session started");
        Ok(())
    }

    /// Move a `Pending` session to `Active`.
    pub async fn mark_active(&self, id: SessionId) {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get_mut(&id) {
            if entry.state == SessionState::Pending {
                entry.state = SessionState::Active;
            }
        }
    }

    /// Cancel a live session.
    ///
    /// Returns `false` when the session does not exist or already reached a
    /// terminal state; calling it twice is harmless.
    pub async fn cancel(&self, id: SessionId) -> bool {
        self.cancel_where(id, |_| true).await
    }

    /// Cancel a live session only if it belongs to `owner_id`.
    pub async fn cancel_owned(&self, id: SessionId, owner_id: OwnerId) -> bool {
        self.cancel_where(id, |entry| entry.owner_id == owner_id)
            .await
    }

    async fn cancel_where<F>(&self, id: SessionId, allowed: F) -> bool
    where
        F: Fn(&SessionEntry) -> bool,
    {
        let entry = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&id) {
                Some(entry) if !entry.state.is_terminal() && allowed(entry) => sessions.remove(&id),
                _ => None,
            }
        };

        let Some(entry) = entry else {
            debug!(session_id = %id, "Nothing to cancel");
            return false;
        };

        if let Err(e) = entry.handle.cancel_and_delete().await {
            warn!(session_id = %id, error = %e, "Cancel-and-delete reported an error");
        }
        self.clear_workspace(entry.owner_id, id).await;
        info!(session_id = %id, owner_id = entry.owner_id, "Download session cancelled");
        true
    }

    /// Record a terminal state and drop the session.
    ///
    /// Returns `false` if the session was already gone.
    pub async fn complete(&self, id: SessionId, state: SessionState) -> bool {
        debug_assert!(state.is_terminal());
        let removed = self.sessions.lock().await.remove(&id);
        match removed {
            Some(entry) => {
                info!(
                    session_id = %id,
                    owner_id = entry.owner_id,
                    state = %state,
                    "Download session closed"
                );
                true
            }
            None => false,
        }
    }

    /// Tear down a session as `Failed`, deleting any partial file.
    pub async fn fail(&self, id: SessionId, reason: &str) -> bool {
        let removed = self.sessions.lock().await.remove(&id);
        let Some(entry) = removed else {
            return false;
        };
        warn!(session_id = %id, owner_id = entry.owner_id, reason, "Download session failed");
        discard(entry.handle.as_ref()).await;
        self.clear_workspace(entry.owner_id, id).await;
        true
    }

    /// Cancel every session still `Pending` after `max_age`.
    ///
    /// Returns how many sessions were dropped.
    pub async fn expire_pending(&self, max_age: Duration) -> usize {
        let stale: Vec<SessionId> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .filter(|(_, entry)| {
                    entry.state == SessionState::Pending && entry.created_at.elapsed() >= max_age
                })
                .map(|(id, _)| *id)
                .collect()
        };

        let mut expired = 0;
        for id in stale {
            let still_pending = self
                .cancel_where(id, |entry| entry.state == SessionState::Pending)
                .await;
            if still_pending {
                expired += 1;
            }
        }
        if expired > 0 {
            info!(expired, "Expired pending download sessions");
        }
        expired
    }

    async fn clear_workspace(&self, owner_id: OwnerId, id: SessionId) {
        if let Err(e) = self.workspace.clear(owner_id, id).await {
            warn!(session_id = %id, owner_id, error = %e, "Failed to clear session workspace");
        }
    }

    /// Snapshot of a session
    pub async fn get(&self, id: SessionId) -> Option<DownloadSession> {
        let sessions = self.sessions.lock().await;
        sessions.get(&id).map(|entry| entry.snapshot(id))
    }

    /// Check if session exists
    pub async fn contains(&self, id: SessionId) -> bool {
        self.sessions.lock().await.contains_key(&id)
    }

    /// Sessions currently owned by `owner_id`
    pub async fn sessions_of(&self, owner_id: OwnerId) -> Vec<SessionId> {
        let sessions = self.sessions.lock().await;
        sessions
            .iter()
            .filter(|(_, entry)| entry.owner_id == owner_id)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Get the number of live sessions
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Check if registry is empty
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

/// Accept only absolute http(s) URLs with a host, at most 2048 characters.
///
/// # Errors
///
/// Returns [`SessionError::InvalidUrl`] describing the rejection.
pub fn validate_url(raw: &str) -> Result<Url, SessionError> {
    let raw = raw.trim();
    if raw.len() > MAX_URL_LENGTH {
        return Err(SessionError::InvalidUrl(format!(
            "longer than {MAX_URL_LENGTH} characters"
        )));
    }
    let url = Url::parse(raw).map_err(|e| SessionError::InvalidUrl(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SessionError::InvalidUrl(format!(
            "unsupported scheme `{}`",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(SessionError::InvalidUrl("missing host".to_string()));
    }
    Ok(url)
}

fn same_handle(a: &Arc<dyn TransferHandle>, b: &Arc<dyn TransferHandle>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

async fn discard(handle: &dyn TransferHandle) {
    if let Err(e) = handle.cancel_and_delete().await {
        warn!(error = %e, "Failed to release transfer handle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEngine, OpenBehavior};
    use crate::transfer::TransferState;

    fn registry(engine: Arc<FakeEngine>, root: &std::path::Path) -> SessionRegistry {
        SessionRegistry::new(
            engine,
            Workspace::new(root.join("downloads"), root.join("extracts")),
        )
    }

    #[test]
    fn validate_url_rejects_bad_input() {
        assert!(validate_url("https://example.com/a.zip").is_ok());
        assert!(validate_url("http://example.com").is_ok());
        assert!(matches!(
            validate_url("ftp://example.com/a.zip"),
            Err(SessionError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_url("example.com/a.zip"),
            Err(SessionError::InvalidUrl(_))
        ));
        let long = format!("https://example.com/{}", "a".repeat(MAX_URL_LENGTH));
        assert!(matches!(validate_url(&long), Err(SessionError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn create_registers_pending_session() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Arc::new(FakeEngine::new("archive.zip"));
        let registry = registry(engine.clone(), dir.path());

        let id = registry.create(7, "https://example.com/archive.zip").await?;
        let session = registry.get(id).await.ok_or_else(|| anyhow::anyhow!("missing"))?;

        assert_eq!(session.owner_id, 7);
        assert_eq!(session.state, TransferState::Pending);
        assert_eq!(session.file_name.as_deref(), Some("archive.zip"));
        assert_eq!(
            engine.opened_dirs(),
            vec![dir.path().join("downloads").join("7").join(id.to_string())]
        );
        Ok(())
    }

    #[tokio::test]
    async fn create_rejects_invalid_url_without_opening() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Arc::new(FakeEngine::new("a.bin"));
        let registry = registry(engine.clone(), dir.path());

        let result = registry.create(1, "notaurl").await;
        assert!(matches!(result, Err(SessionError::InvalidUrl(_))));
        assert!(engine.opened_dirs().is_empty());
        assert!(registry.is_empty().await);
        Ok(())
    }

    #[tokio::test]
    async fn engine_error_is_engine_unavailable() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Arc::new(FakeEngine::new("a.bin").with_behavior(OpenBehavior::Fail));
        let registry = registry(engine, dir.path());

        let result = registry.create(1, "https://example.com/a.bin").await;
        assert!(matches!(result, Err(SessionError::EngineUnavailable(_))));
        assert!(registry.is_empty().await);
        // The session directory made for the attempt is gone again
        let owner_dir = registry.workspace().owner_download_dir(1);
        assert_eq!(std::fs::read_dir(owner_dir)?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn slow_resolution_times_out() -> anyhow::Result<()> {
        tokio::time::pause();
        let dir = tempfile::tempdir()?;
        let engine = Arc::new(FakeEngine::new("a.bin").with_behavior(OpenBehavior::Hang));
        let registry = registry(engine, dir.path());

        let result = registry.create(1, "https://example.com/a.bin").await;
        assert!(matches!(
            result,
            Err(SessionError::FilenameUnresolved(FILENAME_RESOLVE_TIMEOUT_SECS))
        ));
        assert!(registry.is_empty().await);
        Ok(())
    }

    #[tokio::test]
    async fn unnamed_handle_is_discarded() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Arc::new(FakeEngine::new("a.bin").with_behavior(OpenBehavior::Unnamed));
        let registry = registry(engine.clone(), dir.path());

        let result = registry.create(1, "https://example.com/a.bin").await;
        assert!(matches!(result, Err(SessionError::FilenameUnresolved(_))));
        let handle = engine.last_handle().ok_or_else(|| anyhow::anyhow!("no handle"))?;
        assert!(handle.was_cancelled());
        Ok(())
    }

    #[tokio::test]
    async fn start_moves_to_active() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Arc::new(FakeEngine::new("a.bin"));
        let registry = registry(engine, dir.path());

        let id = registry.create(1, "https://example.com/a.bin").await?;
        registry.start(id).await?;

        let state = registry.get(id).await.map(|s| s.state);
        assert_eq!(state, Some(TransferState::Active));
        // A second start is refused
        assert!(matches!(
            registry.start(id).await,
            Err(SessionError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn cancel_is_idempotent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Arc::new(FakeEngine::new("a.bin"));
        let registry = registry(engine, dir.path());

        let id = registry.create(1, "https://example.com/a.bin").await?;
        assert!(registry.cancel(id).await);
        assert!(!registry.cancel(id).await);
        assert!(!registry.cancel(SessionId::new()).await);
        assert!(registry.get(id).await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn cancel_after_completion_returns_false() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Arc::new(FakeEngine::new("a.bin"));
        let registry = registry(engine, dir.path());

        let id = registry.create(1, "https://example.com/a.bin").await?;
        assert!(registry.complete(id, TransferState::Finished).await);
        assert!(!registry.cancel(id).await);
        Ok(())
    }

    #[tokio::test]
    async fn cancel_owned_checks_owner() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Arc::new(FakeEngine::new("a.bin"));
        let registry = registry(engine, dir.path());

        let id = registry.create(1, "https://example.com/a.bin").await?;
        assert!(!registry.cancel_owned(id, 2).await);
        assert!(registry.contains(id).await);
        assert!(registry.cancel_owned(id, 1).await);
        Ok(())
    }

    #[tokio::test]
    async fn sessions_are_never_merged() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Arc::new(FakeEngine::new("same.bin"));
        let registry = registry(engine, dir.path());

        let a = registry.create(1, "https://example.com/same.bin").await?;
        let b = registry.create(1, "https://example.com/same.bin").await?;
        let c = registry.create(2, "https://example.com/same.bin").await?;

        assert_ne!(a, b);
        assert_eq!(registry.len().await, 3);
        assert_eq!(registry.sessions_of(1).await.len(), 2);

        assert!(registry.cancel(a).await);
        assert!(registry.contains(b).await);
        assert!(registry.contains(c).await);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_handle_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Arc::new(FakeEngine::new("a.bin").with_behavior(OpenBehavior::ReuseLast));
        let registry = registry(engine.clone(), dir.path());

        let first = registry.create(1, "https://example.com/a.bin").await?;
        let second = registry.create(1, "https://example.com/a.bin").await;
        assert!(matches!(second, Err(SessionError::EngineUnavailable(_))));
        assert_eq!(registry.len().await, 1);
        // The live session keeps its transfer
        let handle = engine.last_handle().ok_or_else(|| anyhow::anyhow!("no handle"))?;
        assert!(!handle.was_cancelled());
        assert!(registry.contains(first).await);
        Ok(())
    }

    #[tokio::test]
    async fn same_name_sessions_keep_separate_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Arc::new(FakeEngine::new("report.pdf").with_content(b"pdf".to_vec()));
        let registry = registry(engine.clone(), dir.path());

        let kept = registry.create(1, "https://example.com/report.pdf").await?;
        registry.start(kept).await?;
        let kept_handle = engine.last_handle().ok_or_else(|| anyhow::anyhow!("no handle"))?;
        let dropped = registry.create(1, "https://mirror.example.com/report.pdf").await?;
        registry.start(dropped).await?;
        let dropped_handle = engine.last_handle().ok_or_else(|| anyhow::anyhow!("no handle"))?;
        assert_ne!(kept_handle.path(), dropped_handle.path());

        kept_handle.finish();
        assert!(registry.complete(kept, TransferState::Finished).await);
        assert!(registry.cancel(dropped).await);

        assert_eq!(std::fs::read(kept_handle.path())?, b"pdf");
        assert!(!dropped_handle.path().exists());
        assert!(!registry.workspace().download_dir(1, dropped).exists());
        Ok(())
    }

    #[tokio::test]
    async fn stale_pending_sessions_expire() -> anyhow::Result<()> {
        tokio::time::pause();
        let dir = tempfile::tempdir()?;
        let engine = Arc::new(FakeEngine::new("a.bin"));
        let registry = registry(engine, dir.path());

        let stale = registry.create(1, "https://example.com/a.bin").await?;
        let running = registry.create(1, "https://example.com/b.bin").await?;
        registry.start(running).await?;
        tokio::time::advance(Duration::from_secs(600)).await;
        let fresh = registry.create(1, "https://example.com/c.bin").await?;

        assert_eq!(registry.expire_pending(Duration::from_secs(600)).await, 1);
        assert!(!registry.contains(stale).await);
        assert!(!registry.workspace().download_dir(1, stale).exists());
        assert!(registry.contains(running).await);
        assert!(registry.contains(fresh).await);
        assert_eq!(registry.expire_pending(Duration::from_secs(600)).await, 0);
        Ok(())
    }
}
