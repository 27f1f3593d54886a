//! Whole-file checksum verification

use crate::error::IpaError;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::info;

const READ_BUFFER: usize = 1024 * 1024;

/// Digest algorithm, picked from the length of the expected hex string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Md5,
    Sha256,
}

impl ChecksumKind {
    pub fn detect(expected_hex: &str) -> Result<Self, IpaError> {
        let hex = expected_hex.trim();
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(IpaError::UnsupportedChecksum(expected_hex.to_string()));
        }
        match hex.len() {
            32 => Ok(ChecksumKind::Md5),
            64 => Ok(ChecksumKind::Sha256),
            _ => Err(IpaError::UnsupportedChecksum(expected_hex.to_string())),
        }
    }
}

/// Stream a file through `kind` and return the lowercase hex digest
pub async fn file_digest(path: &Path, kind: ChecksumKind) -> Result<String, IpaError> {
    match kind {
        ChecksumKind::Md5 => digest_file::<Md5>(path).await,
        ChecksumKind::Sha256 => digest_file::<Sha256>(path).await,
    }
}

async fn digest_file<D: Digest>(path: &Path) -> Result<String, IpaError> {
    let mut file = File::open(path).await?;
    let mut hasher = D::new();
    let mut buffer = vec![0u8; READ_BUFFER];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compare a file against an expected hex digest, ignoring case
///
/// Returns the computed digest on success.
pub async fn verify_file(path: &Path, expected_hex: &str) -> Result<String, IpaError> {
    let kind = ChecksumKind::detect(expected_hex)?;
    let expected = expected_hex.trim().to_ascii_lowercase();
    let actual = file_digest(path, kind).await?;

    if actual != expected {
        return Err(IpaError::ChecksumMismatch { expected, actual });
    }

    info!("Checksum verified ({:?}): {}", kind, actual);
    Ok(actual)
}
