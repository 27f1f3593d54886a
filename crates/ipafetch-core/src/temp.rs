//! Temporary sibling files that are removed unless committed
//!
//! Every partially written file (chunk downloads, the merged asset, the
//! rewritten archive) lives at `<dest>.tmp` until it is complete. The
//! guard deletes it on every exit path except an explicit [`TempGuard::commit`].

use crate::error::IpaError;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Owns a temporary file path until it is renamed into place
#[derive(Debug)]
pub struct TempGuard {
    path: PathBuf,
    armed: bool,
}

impl TempGuard {
    /// Guard the `.tmp` sibling of `dest`
    pub fn for_destination(dest: &Path) -> Self {
        Self {
            path: sibling_tmp_path(dest),
            armed: true,
        }
    }

    /// Guard the `.tmp` sibling of `dest`, deleting any stale file left there
    pub async fn fresh(dest: &Path) -> Result<Self, IpaError> {
        let guard = Self::for_destination(dest);
        match tokio::fs::remove_file(&guard.path).await {
            Ok(()) => debug!("Removed stale temp file {:?}", guard.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(IpaError::Io(e)),
        }
        Ok(guard)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically move the temporary file to `dest`
    ///
    /// On failure the guard stays armed and the temporary file is removed
    /// when it drops.
    pub async fn commit(mut self, dest: &Path) -> Result<(), IpaError> {
        tokio::fs::rename(&self.path, dest)
            .await
            .map_err(|source| IpaError::RenameFailed {
                from: self.path.clone(),
                to: dest.to_path_buf(),
                source,
            })?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Discarded temp file {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove temp file {:?}: {}", self.path, e),
        }
    }
}

/// `<dest>.tmp`
pub fn sibling_tmp_path(dest: &Path) -> PathBuf {
    let mut name: OsString = dest.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
