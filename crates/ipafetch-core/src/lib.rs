//! ipafetch Core - chunked download and archive signing
//!
//! This crate downloads a large app archive in parallel ranged chunks,
//! resuming from part files left on disk, and then injects a signature
//! bundle into the archive in place.

pub mod engine;
mod error;
pub mod signing;
mod temp;

pub use engine::{cleanup_work_dir, DownloadManager, ProgressHandle, ProgressTracker};
pub use error::*;
pub use signing::SigningPipeline;
pub use temp::{sibling_tmp_path, TempGuard};

use ipafetch_types::{
    CoreEvent, DownloadOutcome, DownloadSpec, ProbeInfo, SignOutcome, SignatureBundle,
};
use std::path::Path;
use tokio::sync::broadcast;

/// The main ipafetch core instance
#[derive(Clone)]
pub struct IpaFetch {
    /// Event broadcaster
    event_tx: broadcast::Sender<CoreEvent>,
    /// Download manager
    download_manager: DownloadManager,
    /// Signing pipeline
    signing: SigningPipeline,
}

impl IpaFetch {
    /// Create a new core instance
    pub fn new() -> Result<Self, IpaError> {
        let (event_tx, _) = broadcast::channel(1000);
        let download_manager = DownloadManager::new(event_tx.clone())?;
        let signing = SigningPipeline::new(event_tx.clone());

        Ok(Self {
            event_tx,
            download_manager,
            signing,
        })
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    /// Probe a URL for size and range support
    pub async fn probe(&self, spec: &DownloadSpec) -> Result<ProbeInfo, IpaError> {
        self.download_manager.probe(spec).await
    }

    /// Download `spec.url` into `out`, keeping part files in `work_dir`
    pub async fn download(
        &self,
        spec: &DownloadSpec,
        out: &Path,
        work_dir: &Path,
    ) -> Result<DownloadOutcome, IpaError> {
        self.download_manager.download(spec, out, work_dir).await
    }

    /// Sign the archive at `path` in place
    pub async fn sign(
        &self,
        path: &Path,
        bundle: &SignatureBundle,
    ) -> Result<SignOutcome, IpaError> {
        self.signing.sign(path, bundle).await
    }

    /// Remove the part files of a finished download
    pub async fn cleanup(&self, work_dir: &Path) -> Result<usize, IpaError> {
        cleanup_work_dir(work_dir).await
    }
}
