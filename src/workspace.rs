//! Per-request working directories
//!
//! Every session owns `{download_root}/{owner}/{session}` and
//! `{extract_root}/{owner}/{session}`. A [`WorkspaceScope`] clears both on
//! every exit path of the request; other sessions of the same owner keep
//! their own directories.

use crate::download::{OwnerId, SessionId};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Download and extraction roots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    download_root: PathBuf,
    extract_root: PathBuf,
}

impl Workspace {
    /// Create a workspace over the two roots. Nothing is created on disk.
    #[must_use]
    pub fn new(download_root: impl Into<PathBuf>, extract_root: impl Into<PathBuf>) -> Self {
        Self {
            download_root: download_root.into(),
            extract_root: extract_root.into(),
        }
    }

    /// Root of all downloads
    #[must_use]
    pub fn download_root(&self) -> &Path {
        &self.download_root
    }

    /// Root of all extractions
    #[must_use]
    pub fn extract_root(&self) -> &Path {
        &self.extract_root
    }

    /// `{download_root}/{owner}`, parent of the owner's session directories
    #[must_use]
    pub fn owner_download_dir(&self, owner: OwnerId) -> PathBuf {
        self.download_root.join(owner.to_string())
    }

    /// `{download_root}/{owner}/{session}`
    #[must_use]
    pub fn download_dir(&self, owner: OwnerId, session: SessionId) -> PathBuf {
        self.owner_download_dir(owner).join(session.to_string())
    }

    /// `{extract_root}/{owner}/{session}`
    #[must_use]
    pub fn extract_dir(&self, owner: OwnerId, session: SessionId) -> PathBuf {
        self.extract_root
            .join(owner.to_string())
            .join(session.to_string())
    }

    /// Remove both directories of one session. Missing directories are fine.
    ///
    /// # Errors
    ///
    /// Returns the first I/O error other than `NotFound`.
    pub async fn clear(&self, owner: OwnerId, session: SessionId) -> io::Result<()> {
        let download = remove_dir_if_exists(&self.download_dir(owner, session)).await;
        let extract = remove_dir_if_exists(&self.extract_dir(owner, session)).await;
        debug!(owner_id = owner, session_id = %session, "Workspace cleared");
        download.and(extract)
    }

    /// Guard that clears the session's directories when the request ends.
    #[must_use]
    pub fn scope(&self, owner: OwnerId, session: SessionId) -> WorkspaceScope {
        WorkspaceScope {
            workspace: self.clone(),
            owner,
            session,
            released: false,
        }
    }
}

async fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Clears one session's directories exactly once.
///
/// Call [`WorkspaceScope::release`] on the normal path; if the scope is
/// dropped without it (early return, panic) the directories are removed
/// synchronously in `Drop`.
#[derive(Debug)]
pub struct WorkspaceScope {
    workspace: Workspace,
    owner: OwnerId,
    session: SessionId,
    released: bool,
}

impl WorkspaceScope {
    /// Owner this scope cleans up after
    #[must_use]
    pub const fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Session this scope cleans up after
    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.session
    }

    /// Clear the directories now.
    ///
    /// # Errors
    ///
    /// Propagates [`Workspace::clear`] failures.
    pub async fn release(mut self) -> io::Result<()> {
        self.released = true;
        self.workspace.clear(self.owner, self.session).await
    }
}

impl Drop for WorkspaceScope {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        for dir in [
            self.workspace.download_dir(self.owner, self.session),
            self.workspace.extract_dir(self.owner, self.session),
        ] {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %dir.display(), error = %e, "Failed to clear workspace on drop");
                }
            }
        }
    }
}
