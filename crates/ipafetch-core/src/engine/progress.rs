//! Progress tracking shared by all chunk fetchers of one download
//!
//! Fetchers report byte increments through a cloned [`ProgressHandle`]
//! (a single atomic add). A separate reporter task samples the counter
//! every 500ms and broadcasts a [`ProgressSnapshot`].

use ipafetch_types::{CoreEvent, ProgressSnapshot};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Interval between progress snapshots
pub const REPORT_INTERVAL: Duration = Duration::from_millis(500);

/// Below this elapsed time the instantaneous rate is shown, above it the average
const INSTANT_RATE_WINDOW: Duration = Duration::from_secs(2);

/// Cheap, cloneable sink for byte-count increments
#[derive(Clone, Debug, Default)]
pub struct ProgressHandle {
    done: Arc<AtomicU64>,
}

impl ProgressHandle {
    pub fn add(&self, bytes: u64) {
        self.done.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Withdraw bytes reported by an attempt that was discarded
    pub fn retract(&self, bytes: u64) {
        let _ = self
            .done
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |done| {
                Some(done.saturating_sub(bytes))
            });
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Acquire)
    }
}

/// Rate sampling state
#[derive(Debug)]
struct Sampler {
    total: u64,
    start: Instant,
    last_time: Instant,
    last_bytes: u64,
}

impl Sampler {
    fn new(total: u64, now: Instant) -> Self {
        Self {
            total,
            start: now,
            last_time: now,
            last_bytes: 0,
        }
    }

    fn sample(&mut self, done: u64, now: Instant) -> ProgressSnapshot {
        let since_start = now.saturating_duration_since(self.start);
        let since_last = now.saturating_duration_since(self.last_time).as_secs_f64();

        let instant_speed = if since_last > 0.0 {
            done.saturating_sub(self.last_bytes) as f64 / since_last
        } else {
            0.0
        };
        let average_speed = if since_start.as_secs_f64() > 0.0 {
            done as f64 / since_start.as_secs_f64()
        } else {
            0.0
        };

        let speed = if since_start < INSTANT_RATE_WINDOW {
            instant_speed
        } else {
            average_speed
        } as u64;

        let eta = if speed > 0 {
            Some(self.total.saturating_sub(done) / speed)
        } else {
            None
        };

        self.last_time = now;
        self.last_bytes = done;

        ProgressSnapshot {
            done: done.min(self.total),
            total: self.total,
            speed,
            eta,
            elapsed_ms: since_start.as_millis() as u64,
        }
    }
}

/// Aggregates progress for one download and reports it periodically
pub struct ProgressTracker {
    handle: ProgressHandle,
    sampler: Arc<Mutex<Sampler>>,
    event_tx: broadcast::Sender<CoreEvent>,
    stop: CancellationToken,
    reporter: Option<JoinHandle<()>>,
}

impl ProgressTracker {
    /// Create a tracker without starting the periodic reporter
    pub fn new(total: u64, event_tx: broadcast::Sender<CoreEvent>) -> Self {
        Self {
            handle: ProgressHandle::default(),
            sampler: Arc::new(Mutex::new(Sampler::new(total, Instant::now()))),
            event_tx,
            stop: CancellationToken::new(),
            reporter: None,
        }
    }

    /// Create a tracker and spawn its reporter task
    pub fn start(total: u64, event_tx: broadcast::Sender<CoreEvent>) -> Self {
        let mut tracker = Self::new(total, event_tx);
        tracker.spawn_reporter();
        tracker
    }

    pub fn handle(&self) -> ProgressHandle {
        self.handle.clone()
    }

    /// Take a snapshot now
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.sampler.lock().sample(self.handle.done(), Instant::now())
    }

    fn spawn_reporter(&mut self) {
        let handle = self.handle.clone();
        let sampler = self.sampler.clone();
        let event_tx = self.event_tx.clone();
        let stop = self.stop.clone();

        self.reporter = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REPORT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = sampler.lock().sample(handle.done(), Instant::now());
                        let _ = event_tx.send(CoreEvent::Progress(snapshot));
                    }
                }
            }
        }));
    }

    /// Stop the reporter and emit one final snapshot
    pub async fn stop(mut self) -> ProgressSnapshot {
        self.stop.cancel();
        if let Some(reporter) = self.reporter.take() {
            if let Err(e) = reporter.await {
                debug!("Progress reporter ended abnormally: {}", e);
            }
        }
        let snapshot = self.snapshot();
        let _ = self.event_tx.send(CoreEvent::Progress(snapshot));
        snapshot
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
