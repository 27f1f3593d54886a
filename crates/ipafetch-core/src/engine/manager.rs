//! Download Manager - splits an asset into ranges and assembles it
//!
//! This is the top-level coordinator for one download:
//! - Resolves the total size (HEAD, then a 1-byte ranged GET)
//! - Runs chunk fetchers on a bounded pool
//! - Skips ranges whose part file is already complete
//! - Merges part files in index order

use crate::engine::chunk_fetcher::{ChunkFetcher, FetchContext};
use crate::engine::progress::{ProgressHandle, ProgressTracker};
use crate::error::IpaError;
use crate::temp::TempGuard;
use ipafetch_types::{ChunkRange, CoreEvent, DownloadOutcome, DownloadSpec, ProbeInfo};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RANGE};
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a scheduled range was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkStatus {
    Fetched,
    Resumed,
}

/// Download manager that fetches and assembles chunked downloads
#[derive(Clone)]
pub struct DownloadManager {
    /// HTTP client
    client: Client,
    /// Event broadcaster
    event_tx: broadcast::Sender<CoreEvent>,
}

impl DownloadManager {
    /// Create a new download manager
    pub fn new(event_tx: broadcast::Sender<CoreEvent>) -> Result<Self, IpaError> {
        let client = Client::builder()
            .user_agent(concat!("ipafetch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self { client, event_tx })
    }

    /// Probe the asset for its size and range support
    ///
    /// Uses HEAD first, then falls back to a 1-byte ranged GET and reads the
    /// total from `Content-Range`.
    pub async fn probe(&self, spec: &DownloadSpec) -> Result<ProbeInfo, IpaError> {
        let url = parse_url(&spec.url)?;
        let headers = build_headers(spec)?;
        info!("Probing URL: {}", url);

        let mut info = ProbeInfo {
            url: spec.url.clone(),
            final_url: None,
            size: 0,
            content_type: None,
            resumable: false,
        };

        match self
            .client
            .head(url.as_str())
            .headers(headers.clone())
            .timeout(spec.request_timeout())
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                let final_url = response.url().to_string();
                if final_url != spec.url {
                    info.final_url = Some(final_url);
                }
                info.content_type = header_str(response.headers(), reqwest::header::CONTENT_TYPE)
                    .map(str::to_string);
                info.resumable = header_str(response.headers(), reqwest::header::ACCEPT_RANGES)
                    .map(|v| v == "bytes")
                    .unwrap_or(false);
                if let Some(size) = header_str(response.headers(), reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.parse::<u64>().ok())
                    .filter(|size| *size > 0)
                {
                    info!("Got size from HEAD: {} bytes", size);
                    info.size = size;
                    return Ok(info);
                }
                info!("HEAD didn't return Content-Length, trying partial GET");
            }
            Ok(response) => {
                info!("HEAD returned {}, trying partial GET", response.status());
            }
            Err(e) => {
                warn!("HEAD request failed: {} - trying partial GET", e);
            }
        }

        let response = self
            .client
            .get(url.as_str())
            .headers(headers)
            .header(RANGE, "bytes=0-0")
            .timeout(spec.request_timeout())
            .send()
            .await
            .map_err(|e| IpaError::SizeUnavailable(e.to_string()))?;

        let status = response.status();
        debug!("Partial GET status: {}", status);

        let size = if status == StatusCode::PARTIAL_CONTENT {
            info.resumable = true;
            header_str(response.headers(), reqwest::header::CONTENT_RANGE)
                .and_then(parse_content_range_total)
                .or_else(|| {
                    header_str(response.headers(), reqwest::header::CONTENT_LENGTH)
                        .and_then(|v| v.parse().ok())
                        .filter(|len| *len > 1)
                })
        } else if status.is_success() {
            header_str(response.headers(), reqwest::header::CONTENT_LENGTH)
                .and_then(|v| v.parse().ok())
        } else {
            return Err(IpaError::SizeUnavailable(format!(
                "partial GET returned HTTP {}",
                status.as_u16()
            )));
        };

        match size {
            Some(size) if size > 0 => {
                info!("Got size from partial GET: {} bytes", size);
                info.size = size;
                Ok(info)
            }
            _ => Err(IpaError::SizeUnavailable(
                "server reported neither Content-Length nor Content-Range".to_string(),
            )),
        }
    }

    /// Download `spec.url` into `out`, keeping part files in `work_dir`
    ///
    /// Part files are left in `work_dir` after a successful merge; remove
    /// them with [`cleanup_work_dir`] once the output is safe.
    pub async fn download(
        &self,
        spec: &DownloadSpec,
        out: &Path,
        work_dir: &Path,
    ) -> Result<DownloadOutcome, IpaError> {
        let url = parse_url(&spec.url)?;
        let headers = build_headers(spec)?;
        tokio::fs::create_dir_all(work_dir).await?;

        let total = match spec.total_size {
            Some(size) if size > 0 => size,
            Some(_) => {
                return Err(IpaError::SizeUnavailable(
                    "total size must be greater than zero".to_string(),
                ))
            }
            None => self.probe(spec).await?.size,
        };

        let chunk_size = ChunkRange::effective_chunk_size(total, spec.chunk_size);
        if chunk_size != spec.chunk_size {
            warn!(
                "Chunk size {} raised to {} to keep part count in range",
                spec.chunk_size, chunk_size
            );
        }
        let ranges = ChunkRange::plan(total, chunk_size);
        info!(
            "Downloading {} ({} bytes) in {} parts, concurrency {}",
            url,
            total,
            ranges.len(),
            spec.concurrency
        );
        let _ = self.event_tx.send(CoreEvent::SizeResolved {
            total,
            parts: ranges.len() as u32,
        });

        let tracker = ProgressTracker::start(total, self.event_tx.clone());
        let fetched = self
            .fetch_all(spec, url.to_string(), headers, &ranges, work_dir, tracker.handle())
            .await;
        let last = tracker.stop().await;
        debug!("Final progress: {}", last);

        let resumed_parts = fetched?;
        let final_size = merge_parts(work_dir, &ranges, out).await?;

        let _ = self.event_tx.send(CoreEvent::MergeCompleted {
            path: out.to_path_buf(),
            size: final_size,
        });
        info!("Download complete: {:?} ({} bytes)", out, final_size);

        Ok(DownloadOutcome {
            path: out.to_path_buf(),
            final_size,
            part_count: ranges.len() as u32,
            resumed_parts,
        })
    }

    /// Fetch every range on a pool of `spec.concurrency` workers
    ///
    /// Waits for all tasks to settle and returns the first fatal error, or
    /// the number of ranges resumed from disk.
    async fn fetch_all(
        &self,
        spec: &DownloadSpec,
        url: String,
        headers: HeaderMap,
        ranges: &[ChunkRange],
        work_dir: &Path,
        progress: ProgressHandle,
    ) -> Result<u32, IpaError> {
        let cancel = CancellationToken::new();
        let ctx = Arc::new(FetchContext {
            client: self.client.clone(),
            url,
            headers,
            max_retries: spec.max_retries,
            retry_base_delay: spec.retry_base_delay(),
            request_timeout: spec.request_timeout(),
            progress,
            cancel: cancel.clone(),
            event_tx: self.event_tx.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(spec.concurrency.max(1)));
        let mut join_set = JoinSet::new();

        for range in ranges.iter().copied() {
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            let part_path = work_dir.join(range.part_file_name());

            join_set.spawn(async move {
                let result = run_range(ctx, semaphore, range, part_path).await;
                (range.index, result)
            });
        }

        let mut first_error: Option<IpaError> = None;
        let mut resumed = 0;

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(ChunkStatus::Resumed))) => resumed += 1,
                Ok((_, Ok(ChunkStatus::Fetched))) => {}
                Ok((index, Err(IpaError::Cancelled))) if cancel.is_cancelled() => {
                    debug!("Chunk {} cancelled after an earlier failure", index);
                }
                Ok((index, Err(e))) => {
                    error!("Chunk {} failed: {}", index, e);
                    let _ = self.event_tx.send(CoreEvent::ChunkFailed {
                        index,
                        error: e.to_string(),
                    });
                    if first_error.is_none() {
                        if spec.cancel_on_failure {
                            info!("Cancelling remaining chunks");
                            cancel.cancel();
                        }
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    error!("Chunk task panicked: {}", e);
                    if first_error.is_none() {
                        if spec.cancel_on_failure {
                            cancel.cancel();
                        }
                        first_error = Some(IpaError::TaskFailed(e.to_string()));
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(resumed),
        }
    }
}

/// Wait for a pool slot, then resume or fetch one range
async fn run_range(
    ctx: Arc<FetchContext>,
    semaphore: Arc<Semaphore>,
    range: ChunkRange,
    part_path: PathBuf,
) -> Result<ChunkStatus, IpaError> {
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|_| IpaError::Cancelled)?;

    if is_part_complete(&part_path, range.len()).await {
        info!("Chunk {} already complete on disk", range.index);
        ctx.progress.add(range.len());
        let _ = ctx.event_tx.send(CoreEvent::ChunkResumed {
            index: range.index,
            bytes: range.len(),
        });
        return Ok(ChunkStatus::Resumed);
    }

    if ctx.cancel.is_cancelled() {
        return Err(IpaError::Cancelled);
    }

    ChunkFetcher::new(ctx, range, part_path)
        .run()
        .await
        .map(|_| ChunkStatus::Fetched)
}

/// A part file is complete iff its length equals the range length
pub async fn is_part_complete(path: &Path, expected_len: u64) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() == expected_len,
        Err(_) => false,
    }
}

/// Append every part file to `out` in index order
///
/// The output is assembled in `<out>.tmp` and renamed into place once every
/// part has been copied. Returns the final size.
pub async fn merge_parts(
    work_dir: &Path,
    ranges: &[ChunkRange],
    out: &Path,
) -> Result<u64, IpaError> {
    info!("Merging {} parts into {:?}", ranges.len(), out);

    // Verify every part before touching the output
    for range in ranges {
        let part_path = work_dir.join(range.part_file_name());
        let actual = match tokio::fs::metadata(&part_path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                return Err(IpaError::MergeFailed {
                    index: range.index,
                    reason: format!("{:?}: {}", part_path, e),
                })
            }
        };
        if actual != range.len() {
            return Err(IpaError::MergeFailed {
                index: range.index,
                reason: format!("expected {} bytes, found {}", range.len(), actual),
            });
        }
    }

    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = TempGuard::fresh(out).await?;
    let mut output = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(tmp.path())
        .await?;

    let mut total: u64 = 0;
    for range in ranges {
        let part_path = work_dir.join(range.part_file_name());
        let mut input = File::open(&part_path)
            .await
            .map_err(|e| IpaError::MergeFailed {
                index: range.index,
                reason: e.to_string(),
            })?;

        let copied = tokio::io::copy(&mut input, &mut output)
            .await
            .map_err(|e| IpaError::MergeFailed {
                index: range.index,
                reason: e.to_string(),
            })?;
        if copied != range.len() {
            return Err(IpaError::MergeFailed {
                index: range.index,
                reason: format!("copied {} of {} bytes", copied, range.len()),
            });
        }
        total += copied;
        debug!("Part {} appended ({} bytes)", range.index, copied);
    }

    output.flush().await?;
    output.sync_all().await?;
    drop(output);

    tmp.commit(out).await?;
    info!("Merge complete: {:?} ({} bytes)", out, total);
    Ok(total)
}

/// Remove the part files of a finished download and, if empty, the directory
///
/// Returns the number of files removed.
pub async fn cleanup_work_dir(work_dir: &Path) -> Result<usize, IpaError> {
    let mut entries = match tokio::fs::read_dir(work_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(IpaError::Io(e)),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let is_part = name
            .to_str()
            .map(|n| n.starts_with("part_"))
            .unwrap_or(false);
        if is_part && entry.file_type().await?.is_file() {
            tokio::fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }

    if let Err(e) = tokio::fs::remove_dir(work_dir).await {
        debug!("Keeping work directory {:?}: {}", work_dir, e);
    }

    info!("Removed {} part files from {:?}", removed, work_dir);
    Ok(removed)
}

/// Parse the total from a `Content-Range` value such as `bytes 0-0/12345`
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let total = value.rsplit('/').next()?.trim();
    if total == "*" {
        return None;
    }
    total.parse().ok()
}

fn parse_url(raw: &str) -> Result<url::Url, IpaError> {
    let url = url::Url::parse(raw).map_err(|e| IpaError::InvalidUrl(format!("{}: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(IpaError::InvalidUrl(format!(
            "unsupported scheme {:?} in {}",
            other, raw
        ))),
    }
}

fn build_headers(spec: &DownloadSpec) -> Result<HeaderMap, IpaError> {
    let mut headers = HeaderMap::with_capacity(spec.auth_headers.len());
    for (name, value) in &spec.auth_headers {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| IpaError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| IpaError::InvalidHeader {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
