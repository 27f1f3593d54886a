//! Error types for ipafetch core

use ipafetch_types::SigningStage;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in ipafetch core
#[derive(Debug, Error)]
pub enum IpaError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("Unable to determine file size: {0}")]
    SizeUnavailable(String),

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("Body length mismatch: expected {expected} bytes, received {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("Chunk {index} failed (start={start} end={end} attempts={attempts}): {reason}")]
    ChunkFetchFailed {
        index: u32,
        start: u64,
        end: u64,
        attempts: u32,
        reason: String,
    },

    #[error("Merge failed at part {index}: {reason}")]
    MergeFailed { index: u32, reason: String },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Unsupported checksum {0:?}: expected 32 (MD5) or 64 (SHA-256) hex characters")]
    UnsupportedChecksum(String),

    #[error("Invalid app bundle: {0}")]
    InvalidAppBundle(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Property list error: {0}")]
    Plist(#[from] plist::Error),

    #[error("Rewrite failed: {0}")]
    RewriteFailed(String),

    #[error("Failed to rename {from:?} to {to:?}: {source}")]
    RenameFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Download was cancelled")]
    Cancelled,

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: SigningStage,
        #[source]
        source: Box<IpaError>,
    },
}

impl IpaError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            IpaError::Network(_) | IpaError::Io(_) | IpaError::LengthMismatch { .. } => true,
            IpaError::ServerError { .. } => true,
            _ => false,
        }
    }

    /// Wrap this error with the signing stage it came from
    pub fn in_stage(self, stage: SigningStage) -> Self {
        match self {
            already @ IpaError::Stage { .. } => already,
            other => IpaError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The signing stage this error was raised in, if any
    pub fn stage(&self) -> Option<SigningStage> {
        match self {
            IpaError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The error underneath any stage wrapping
    pub fn root(&self) -> &IpaError {
        match self {
            IpaError::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}
