//! Uploads directory: staging, acceptance and listing of stored images.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;
use thiserror::Error;
use walkdir::WalkDir;

/// Hidden subdirectory holding uploads that are still being classified.
pub const STAGING_DIR: &str = ".staging";

const MAX_ID_LEN: usize = 128;

/// Opaque identifier of a stored upload; doubles as its filename.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CatId(String);

#[derive(Debug, Error)]
#[error("invalid upload identifier: {0:?}")]
pub struct InvalidCatId(pub String);

impl CatId {
    /// Fresh random identifier (32 lowercase hex characters).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for CatId {
    type Err = InvalidCatId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if is_valid_id(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidCatId(s.to_string()))
        }
    }
}

impl fmt::Display for CatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Plain filenames only: no separators, no hidden files, no `..`.
fn is_valid_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_ID_LEN
        && !s.starts_with('.')
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Listing row derived from filesystem metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatEntry {
    pub id: CatId,
    pub modified: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Directory of accepted uploads plus its staging area.
#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
    staging: PathBuf,
}

impl UploadStore {
    /// Open the store, creating the uploads and staging directories if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let staging = root.join(STAGING_DIR);
        fs::create_dir_all(&staging)
            .with_context(|| format!("cannot create uploads directory {}", staging.display()))?;
        let store = Self { root, staging };
        store.sweep_staging();
        Ok(store)
    }

    /// Remove staged files left behind by a process that stopped mid-upload.
    fn sweep_staging(&self) {
        for entry in WalkDir::new(&self.staging).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("cannot read staging entry: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    tracing::warn!(
                        path = %entry.path().display(),
                        "removed abandoned staged upload"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        path = %entry.path().display(),
                        "cannot remove abandoned staged upload: {e}"
                    );
                }
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `bytes` to the staging area under a fresh identifier.
    pub fn stage(&self, bytes: &[u8]) -> Result<StagedUpload> {
        let mut file = tempfile::Builder::new()
            .prefix("upload-")
            .tempfile_in(&self.staging)
            .with_context(|| format!("cannot create staging file in {}", self.staging.display()))?;
        file.write_all(bytes).context("cannot write staged upload")?;
        file.flush().context("cannot flush staged upload")?;
        Ok(StagedUpload {
            id: CatId::generate(),
            file,
            target_dir: self.root.clone(),
        })
    }

    /// Accepted uploads sorted by ascending modification time.
    ///
    /// Entries that vanish between the directory read and the stat call are
    /// skipped rather than failing the whole listing.
    pub fn list(&self) -> Result<Vec<CatEntry>> {
        if !self.root.is_dir() {
            anyhow::bail!("uploads directory missing: {}", self.root.display());
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("walkdir error: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<CatId>().ok())
            else {
                tracing::debug!("skipping foreign file {}", entry.path().display());
                continue;
            };
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!("cannot stat {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            let modified = meta
                .modified()
                .with_context(|| format!("no modification time for {}", entry.path().display()))?;
            entries.push(CatEntry {
                id,
                modified: DateTime::<Utc>::from(modified),
                size_bytes: meta.len(),
            });
        }

        entries.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    /// The `limit` most recent entries, still oldest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<CatEntry>> {
        let mut all = self.list()?;
        let skip = all.len().saturating_sub(limit);
        Ok(all.split_off(skip))
    }

    /// Where an accepted upload with this identifier lives, whether or not it
    /// exists.
    pub fn path_of(&self, id: &CatId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Path of an accepted upload, if it exists.
    pub fn locate(&self, id: &CatId) -> Option<PathBuf> {
        let path = self.path_of(id);
        path.is_file().then_some(path)
    }
}

/// An upload waiting for its classification verdict.
///
/// Dropping it without calling [`StagedUpload::commit`] deletes the file.
#[derive(Debug)]
pub struct StagedUpload {
    id: CatId,
    file: NamedTempFile,
    target_dir: PathBuf,
}

impl StagedUpload {
    pub fn id(&self) -> &CatId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Move the file into the uploads directory under its identifier.
    pub fn commit(self) -> Result<CatId> {
        let StagedUpload {
            id,
            file,
            target_dir,
        } = self;
        let target = target_dir.join(id.as_str());
        file.persist_noclobber(&target)
            .map_err(|e| e.error)
            .with_context(|| format!("cannot move upload into {}", target.display()))?;
        Ok(id)
    }

    /// Delete the staged file now.
    pub fn discard(self) -> Result<()> {
        self.file
            .close()
            .with_context(|| format!("cannot delete staged upload {}", self.id))
    }
}
