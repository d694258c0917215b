//! Archive extraction
//!
//! Unpacks a finished zip download into `{extract_root}/{owner}/{session}/{stem}` and
//! removes one redundant wrapping directory if the archive had one.

use crate::download::{OwnerId, SessionId};
use crate::workspace::Workspace;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;
use zip::ZipArchive;

/// Errors produced while unpacking an archive
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The downloaded archive is not on disk
    #[error("Archive not found: {}", .0.display())]
    MissingArchive(PathBuf),
    /// Not a supported archive format
    #[error("Unsupported archive: {0}")]
    Unsupported(String),
    /// Malformed zip data
    #[error("Malformed archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    /// Filesystem failure
    #[error("I/O error during extraction: {0}")]
    Io(#[from] io::Error),
}

/// Where an archive ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionResult {
    /// Directory name relative to the session's extraction directory
    pub root_directory_name: String,
    /// Absolute path of that directory
    pub path: PathBuf,
}

/// Extracts zip archives out of the download workspace.
#[derive(Debug, Clone)]
pub struct ArchiveExtractor {
    workspace: Workspace,
}

impl ArchiveExtractor {
    /// Create an extractor reading from and writing into `workspace`.
    #[must_use]
    pub const fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    /// Whether `file_name` looks like an archive this extractor handles.
    #[must_use]
    pub fn is_supported(file_name: &str) -> bool {
        Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
    }

    /// Extract `{download_root}/{owner}/{session}/{file_name}`.
    ///
    /// # Errors
    ///
    /// See [`ExtractionError`].
    pub async fn extract(
        &self,
        file_name: &str,
        owner: OwnerId,
        session: SessionId,
    ) -> Result<ExtractionResult, ExtractionError> {
        if !Self::is_supported(file_name) {
            return Err(ExtractionError::Unsupported(file_name.to_string()));
        }

        let archive_path = self.workspace.download_dir(owner, session).join(file_name);
        if !tokio::fs::try_exists(&archive_path).await? {
            return Err(ExtractionError::MissingArchive(archive_path));
        }

        let root_directory_name = Path::new(file_name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.is_empty())
            .unwrap_or("archive")
            .to_string();
        let destination = self
            .workspace
            .extract_dir(owner, session)
            .join(&root_directory_name);

        let target = destination.clone();
        tokio::task::spawn_blocking(move || -> Result<(), ExtractionError> {
            unpack_zip(&archive_path, &target)?;
            flatten_single_wrapper(&target)?;
            Ok(())
        })
        .await
        .map_err(io::Error::other)??;

        info!(
            owner_id = owner,
            session_id = %session,
            path = %destination.display(),
            "Archive extracted"
        );
        Ok(ExtractionResult {
            root_directory_name,
            path: destination,
        })
    }
}

fn unpack_zip(archive_path: &Path, destination: &Path) -> Result<(), ExtractionError> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;
    fs::create_dir_all(destination)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            debug!(name = entry.name(), "Skipping entry outside of destination");
            continue;
        };
        let outpath = destination.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&outpath)?;
        io::copy(&mut entry, &mut outfile)?;
    }
    Ok(())
}

/// If `dir` holds exactly one entry and it is a directory, move that
/// directory's children up one level and remove it. Runs once.
fn flatten_single_wrapper(dir: &Path) -> io::Result<()> {
    let entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    let [only] = entries.as_slice() else {
        return Ok(());
    };
    if !only.file_type()?.is_dir() {
        return Ok(());
    }

    // Renamed aside first: a child may share the wrapper's name.
    let aside = dir.join(format!(".flatten-{}", Uuid::new_v4().as_simple()));
    fs::rename(only.path(), &aside)?;
    for child in fs::read_dir(&aside)? {
        let child = child?;
        fs::rename(child.path(), dir.join(child.file_name()))?;
    }
    fs::remove_dir(&aside)?;
    debug!(path = %dir.display(), "Flattened single wrapping directory");
    Ok(())
}
