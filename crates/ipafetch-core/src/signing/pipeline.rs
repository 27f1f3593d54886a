//! Signing pipeline: checksum → rewrite → commit
//!
//! Each stage runs once. Failures are wrapped with the stage name so a
//! corrupted download, a malformed bundle and an I/O failure read
//! differently. The source file is only replaced by the final rename.

use crate::error::IpaError;
use crate::signing::bundle::metadata_plist;
use crate::signing::checksum::verify_file;
use crate::signing::rewriter::{ArchiveRewriter, RewriteReport};
use crate::temp::TempGuard;
use ipafetch_types::{CoreEvent, SignOutcome, SignatureBundle, SigningStage};
use std::path::Path;
use tokio::sync::broadcast;
use tracing::info;

/// Injects a signature bundle into a downloaded archive, in place
#[derive(Clone)]
pub struct SigningPipeline {
    event_tx: broadcast::Sender<CoreEvent>,
}

impl SigningPipeline {
    pub fn new(event_tx: broadcast::Sender<CoreEvent>) -> Self {
        Self { event_tx }
    }

    /// Sign the archive at `path` with `bundle`
    pub async fn sign(
        &self,
        path: &Path,
        bundle: &SignatureBundle,
    ) -> Result<SignOutcome, IpaError> {
        info!("Signing {:?}", path);

        let checksum_verified = match bundle.expected_checksum.as_deref() {
            Some(expected) => {
                self.enter(SigningStage::Checksum);
                verify_file(path, expected)
                    .await
                    .map_err(|e| e.in_stage(SigningStage::Checksum))?;
                true
            }
            None => false,
        };

        self.enter(SigningStage::Rewrite);
        let (tmp, report) = self
            .rewrite(path, bundle)
            .await
            .map_err(|e| e.in_stage(SigningStage::Rewrite))?;

        self.enter(SigningStage::Commit);
        tmp.commit(path)
            .await
            .map_err(|e| e.in_stage(SigningStage::Commit))?;

        let _ = self.event_tx.send(CoreEvent::SigningCompleted {
            path: path.to_path_buf(),
        });
        info!(
            "Signed {:?}: signature at {}",
            path, report.location.signature_path
        );

        Ok(SignOutcome {
            path: path.to_path_buf(),
            checksum_verified,
            signature_path: report.location.signature_path,
            copied_entries: report.copied_entries,
            replaced_entries: report.replaced_entries,
        })
    }

    async fn rewrite(
        &self,
        path: &Path,
        bundle: &SignatureBundle,
    ) -> Result<(TempGuard, RewriteReport), IpaError> {
        let metadata = metadata_plist(&bundle.metadata)?;
        let signature = bundle.signature.clone();
        let tmp = TempGuard::fresh(path).await?;

        let source = path.to_path_buf();
        let dest = tmp.path().to_path_buf();
        let report = tokio::task::spawn_blocking(move || {
            ArchiveRewriter::new(source).rewrite(&dest, &metadata, &signature)
        })
        .await
        .map_err(|e| IpaError::TaskFailed(e.to_string()))??;

        Ok((tmp, report))
    }

    fn enter(&self, stage: SigningStage) {
        info!("Signing stage: {}", stage);
        let _ = self.event_tx.send(CoreEvent::SigningStageChanged { stage });
    }
}
