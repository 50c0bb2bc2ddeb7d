//! Per-identity photo directories and the staging area for in-flight enrollments.
//!
//! Photos for an enrollment attempt are written under
//! `<root>/.staging/<uuid>/` and only moved to `<root>/<id>/` by the
//! registry commit. A [`StagedPhotos`] that is dropped without being
//! committed deletes its directory.

use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{Error, Result};

const STAGING_DIR: &str = ".staging";

/// Root directory holding one sub-directory of photos per identity.
#[derive(Debug, Clone)]
pub struct PhotoArea {
    root: PathBuf,
}

impl PhotoArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by identity `id`. Rejects ids that are not a single
    /// plain path component.
    pub fn identity_dir(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.root.join(id))
    }

    /// Start a new staging directory for one enrollment attempt.
    pub fn stage(&self) -> Result<StagedPhotos> {
        let dir = self
            .root
            .join(STAGING_DIR)
            .join(Uuid::new_v4().simple().to_string());
        fs::create_dir_all(&dir).map_err(|source| Error::storage(&dir, source))?;
        Ok(StagedPhotos {
            dir,
            files: Vec::new(),
            committed: false,
        })
    }

    /// Remove staging directories left behind by an interrupted process.
    pub fn sweep_staging(&self) -> Result<usize> {
        let staging = self.root.join(STAGING_DIR);
        let entries = match fs::read_dir(&staging) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(Error::storage(&staging, source)),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry.map_err(|source| Error::storage(&staging, source))?.path();
            fs::remove_dir_all(&path).map_err(|source| Error::storage(&path, source))?;
            removed += 1;
        }
        if removed > 0 {
            tracing::warn!(removed, "removed stale enrollment staging directories");
        }
        Ok(removed)
    }

    /// Delete the photo directory of `id`; absence is not an error.
    pub(crate) fn remove_identity(&self, id: &str) -> Result<()> {
        let dir = self.identity_dir(id)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::storage(dir, source)),
        }
    }
}

/// Identifiers name a directory, so they must be one ordinary path component.
pub fn validate_id(id: &str) -> Result<()> {
    let bad = id.trim().is_empty()
        || id != id.trim()
        || id == "."
        || id == ".."
        || id.starts_with('.')
        || id.chars().any(|c| c == '/' || c == '\\' || c.is_control());
    if bad {
        return Err(Error::Validation(format!("invalid identity id '{id}'")));
    }
    Ok(())
}

/// Photos written for one enrollment attempt, not yet owned by an identity.
#[derive(Debug)]
pub struct StagedPhotos {
    dir: PathBuf,
    files: Vec<String>,
    committed: bool,
}

impl StagedPhotos {
    /// Save `bytes` as `photo<index>.<extension>` and return its staged path.
    pub fn save(&mut self, index: usize, extension: &str, bytes: &[u8]) -> Result<PathBuf> {
        let name = format!("photo{index}.{extension}");
        let path = self.dir.join(&name);
        fs::write(&path, bytes).map_err(|source| Error::storage(&path, source))?;
        self.files.push(name);
        Ok(path)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Roll back: delete every staged photo and the staging directory.
    pub fn discard(mut self) -> Result<()> {
        self.committed = true;
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::storage(&self.dir, source)),
        }
    }

    /// Move the staged directory to `target`, returning the final photo
    /// paths in save order. On failure the staged photos remain owned by
    /// `self` and are removed when it drops.
    pub(crate) fn promote(&mut self, target: &Path) -> Result<Vec<PathBuf>> {
        if target.exists() {
            tracing::warn!(path = %target.display(), "replacing orphaned photo directory");
            fs::remove_dir_all(target).map_err(|source| Error::storage(target, source))?;
        }
        fs::rename(&self.dir, target).map_err(|source| Error::storage(target, source))?;
        self.committed = true;
        Ok(self.files.iter().map(|name| target.join(name)).collect())
    }
}

impl Drop for StagedPhotos {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = fs::remove_dir_all(&self.dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.dir.display(), error = %err, "failed to remove staged photos");
            }
        } else {
            tracing::debug!(path = %self.dir.display(), "staged photos rolled back");
        }
    }
}
