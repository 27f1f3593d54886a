//! Chunk fetcher - downloads a single byte range to its part file
//!
//! Each fetcher is independent and writes to its own `part_<index>.tmp`.
//! The rename to `part_<index>` is the commit point, so a part file under
//! its final name is always complete.

use crate::engine::progress::ProgressHandle;
use crate::error::IpaError;
use crate::temp::TempGuard;
use futures::StreamExt;
use ipafetch_types::{ChunkRange, CoreEvent};
use reqwest::header::{HeaderMap, RANGE};
use reqwest::{Client, StatusCode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// State shared by every chunk fetcher of one download
pub struct FetchContext {
    pub client: Client,
    pub url: String,
    pub headers: HeaderMap,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub request_timeout: Duration,
    pub progress: ProgressHandle,
    pub cancel: CancellationToken,
    pub event_tx: broadcast::Sender<CoreEvent>,
}

/// Downloads one [`ChunkRange`] with retries
pub struct ChunkFetcher {
    ctx: Arc<FetchContext>,
    range: ChunkRange,
    part_path: PathBuf,
}

impl ChunkFetcher {
    pub fn new(ctx: Arc<FetchContext>, range: ChunkRange, part_path: PathBuf) -> Self {
        Self {
            ctx,
            range,
            part_path,
        }
    }

    /// Run the fetch until it succeeds or retries are exhausted
    ///
    /// Returns the number of bytes written to the part file.
    pub async fn run(self) -> Result<u64, IpaError> {
        let max_attempts = self.ctx.max_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(
                "Chunk {} attempt {}/{} ({})",
                self.range.index,
                attempt,
                max_attempts,
                self.range.header_value()
            );

            let err = match self.attempt().await {
                Ok(bytes) => {
                    info!("Chunk {} complete ({} bytes)", self.range.index, bytes);
                    let _ = self.ctx.event_tx.send(CoreEvent::ChunkCompleted {
                        index: self.range.index,
                        bytes,
                    });
                    return Ok(bytes);
                }
                Err(IpaError::Cancelled) => return Err(IpaError::Cancelled),
                Err(e) => e,
            };

            if attempt >= max_attempts || !err.is_retryable() {
                return Err(IpaError::ChunkFetchFailed {
                    index: self.range.index,
                    start: self.range.start,
                    end: self.range.end,
                    attempts: attempt,
                    reason: err.to_string(),
                });
            }

            warn!(
                "Chunk {} failed (attempt {}/{}): {}. Will retry.",
                self.range.index, attempt, max_attempts, err
            );
            let _ = self.ctx.event_tx.send(CoreEvent::ChunkRetry {
                index: self.range.index,
                attempt,
                max_attempts,
                error: err.to_string(),
            });

            let delay = self.ctx.retry_base_delay * attempt;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.ctx.cancel.cancelled() => return Err(IpaError::Cancelled),
            }
        }
    }

    /// One request, streamed into the temp file and renamed into place
    async fn attempt(&self) -> Result<u64, IpaError> {
        let tmp = TempGuard::fresh(&self.part_path).await?;
        let expected = self.range.len();

        let request = self
            .ctx
            .client
            .get(&self.ctx.url)
            .headers(self.ctx.headers.clone())
            .header(RANGE, self.range.header_value())
            .timeout(self.ctx.request_timeout);

        let response = tokio::select! {
            response = request.send() => response?,
            _ = self.ctx.cancel.cancelled() => return Err(IpaError::Cancelled),
        };

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(IpaError::ServerError {
                status: status.as_u16(),
                message: format!("unexpected status for chunk {}", self.range.index),
            });
        }

        let mut file = File::create(tmp.path()).await?;
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;

        let streamed: Result<(), IpaError> = async {
            loop {
                let next = tokio::select! {
                    next = stream.next() => next,
                    _ = self.ctx.cancel.cancelled() => return Err(IpaError::Cancelled),
                };
                let Some(chunk) = next else { break };
                let chunk = chunk?;
                let len = chunk.len() as u64;

                if received + len > expected {
                    return Err(IpaError::LengthMismatch {
                        expected,
                        actual: received + len,
                    });
                }

                file.write_all(&chunk).await?;
                received += len;
                self.ctx.progress.add(len);
            }

            if received != expected {
                return Err(IpaError::LengthMismatch {
                    expected,
                    actual: received,
                });
            }

            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(e) = streamed {
            self.ctx.progress.retract(received);
            return Err(e);
        }

        drop(file);
        if let Err(e) = tmp.commit(&self.part_path).await {
            self.ctx.progress.retract(received);
            return Err(e);
        }

        Ok(received)
    }
}
