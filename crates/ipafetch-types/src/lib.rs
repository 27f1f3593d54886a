//! Shared types for ipafetch
//!
//! This crate contains the data structures shared between the core
//! engine and the CLI: download parameters, chunk ranges, signature
//! bundles, and the events the core emits while it works.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default size of one ranged request (5 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;
/// Default number of chunks fetched in parallel
pub const DEFAULT_CONCURRENCY: usize = 10;
/// Default number of attempts per chunk
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default base delay between attempts, multiplied by the attempt number
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;
/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Upper bound on the number of ranges in one download
pub const MAX_PARTS: u64 = u32::MAX as u64;

/// Root-level archive path that receives the account metadata
pub const METADATA_ENTRY_PATH: &str = "iTunesMetadata.plist";

// ============================================================================
// Download Types
// ============================================================================

/// Parameters of a single chunked download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSpec {
    pub url: String,
    /// Total asset size; `None` means the server is probed for it
    pub total_size: Option<u64>,
    pub chunk_size: u64,
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub auth_headers: BTreeMap<String, String>,
    /// Abort in-flight sibling chunks once one chunk has exhausted its retries
    #[serde(default)]
    pub cancel_on_failure: bool,
}

impl DownloadSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            total_size: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            auth_headers: BTreeMap::new(),
            cancel_on_failure: false,
        }
    }

    pub fn with_total_size(mut self, total_size: u64) -> Self {
        self.total_size = Some(total_size);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.auth_headers.insert(name.into(), value.into());
        self
    }

    pub fn with_cancel_on_failure(mut self, cancel: bool) -> Self {
        self.cancel_on_failure = cancel;
        self
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// A contiguous, inclusive byte interval of the asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    /// Split `total_size` bytes into `ceil(total_size / chunk_size)` ranges
    ///
    /// The chunk size is raised if needed so the range count fits a `u32` index.
    pub fn plan(total_size: u64, chunk_size: u64) -> Vec<ChunkRange> {
        if total_size == 0 {
            return Vec::new();
        }
        let chunk_size = Self::effective_chunk_size(total_size, chunk_size);
        let count = total_size.div_ceil(chunk_size);

        (0..count)
            .map(|i| {
                let start = i * chunk_size;
                let end = start.saturating_add(chunk_size - 1).min(total_size - 1);
                ChunkRange {
                    index: i as u32,
                    start,
                    end,
                }
            })
            .collect()
    }

    /// Smallest chunk size >= `chunk_size` (and >= 1) that yields at most
    /// `MAX_PARTS` ranges for `total_size` bytes
    pub fn effective_chunk_size(total_size: u64, chunk_size: u64) -> u64 {
        chunk_size
            .max(1)
            .max(total_size.div_ceil(MAX_PARTS))
    }

    /// Number of bytes covered by this range
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for the `Range` request header
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }

    /// File name of this range's part file inside the working directory
    pub fn part_file_name(&self) -> String {
        format!("part_{}", self.index)
    }
}

/// Result of a completed download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub final_size: u64,
    pub part_count: u32,
    /// Parts that were already complete on disk and not fetched again
    pub resumed_parts: u32,
}

/// Information about a remote asset (from probing)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeInfo {
    pub url: String,
    pub final_url: Option<String>,
    pub size: u64,
    pub content_type: Option<String>,
    pub resumable: bool,
}

// ============================================================================
// Progress Types
// ============================================================================

/// Point-in-time view of a running download
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub done: u64,
    pub total: u64,
    /// Bytes per second
    pub speed: u64,
    /// Seconds remaining at the current speed
    pub eta: Option<u64>,
    pub elapsed_ms: u64,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.done as f64 / self.total as f64) * 100.0
    }

    pub fn is_finished(&self) -> bool {
        self.done >= self.total
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MB: f64 = 1024.0 * 1024.0;
        write!(
            f,
            "{:.2}MB / {:.2}MB ({:.2}%) - {:.2} MB/s",
            self.done as f64 / MB,
            self.total as f64 / MB,
            self.percent(),
            self.speed as f64 / MB
        )
    }
}

// ============================================================================
// Signing Types
// ============================================================================

/// Authorization data injected into a downloaded archive
#[derive(Debug, Clone)]
pub struct SignatureBundle {
    /// Written as a property list at [`METADATA_ENTRY_PATH`]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Raw signature bytes, written at the path named by the bundle manifest
    pub signature: Vec<u8>,
    /// Lowercase hex MD5 or SHA-256 of the unsigned archive
    pub expected_checksum: Option<String>,
}

/// One signature blob as delivered by the licensing service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinfEntry {
    pub id: u64,
    /// Base64 encoded
    pub sinf: String,
}

/// On-disk JSON form of a signature bundle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleFile {
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub sinfs: Vec<SinfEntry>,
    /// Account identifier merged into the metadata
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default, alias = "checksum")]
    pub md5: Option<String>,
}

/// Stages of the signing pipeline, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningStage {
    Checksum,
    Rewrite,
    Commit,
}

impl fmt::Display for SigningStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SigningStage::Checksum => "checksum",
            SigningStage::Rewrite => "rewrite",
            SigningStage::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// Result of a completed signing run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignOutcome {
    pub path: PathBuf,
    pub checksum_verified: bool,
    pub signature_path: String,
    /// Source entries copied through unchanged
    pub copied_entries: usize,
    /// Source entries dropped because they are replaced
    pub replaced_entries: usize,
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the core to the UI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    SizeResolved {
        total: u64,
        parts: u32,
    },
    Progress(ProgressSnapshot),
    ChunkResumed {
        index: u32,
        bytes: u64,
    },
    ChunkCompleted {
        index: u32,
        bytes: u64,
    },
    ChunkRetry {
        index: u32,
        attempt: u32,
        max_attempts: u32,
        error: String,
    },
    ChunkFailed {
        index: u32,
        error: String,
    },
    MergeCompleted {
        path: PathBuf,
        size: u64,
    },
    SigningStageChanged {
        stage: SigningStage,
    },
    SigningCompleted {
        path: PathBuf,
    },
}
