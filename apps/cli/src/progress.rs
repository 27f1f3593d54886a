//! Progress bar driven by core events

use crate::output::{format_bytes, format_duration};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use ipafetch_types::{CoreEvent, ProgressSnapshot};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// One bar for a download or a signing pass
#[derive(Clone)]
pub struct TransferProgress {
    bar: ProgressBar,
    parts: u32,
    parts_done: u32,
    /// Rate and ETA from the latest core snapshot
    rate: Option<String>,
}

impl TransferProgress {
    /// A byte bar; the length is set once the size is resolved
    pub fn for_download(visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new(0)
        } else {
            ProgressBar::hidden()
        };
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░  "),
        );
        bar.set_message("resolving size");
        Self {
            bar,
            parts: 0,
            parts_done: 0,
            rate: None,
        }
    }

    /// A spinner for the signing stages
    pub fn for_signing(visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::hidden()
        };
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_message("signing");
        Self {
            bar,
            parts: 0,
            parts_done: 0,
            rate: None,
        }
    }

    /// Update the bar from an event
    pub fn handle_event(&mut self, event: &CoreEvent) {
        match event {
            CoreEvent::SizeResolved { total, parts } => {
                self.parts = *parts;
                self.bar.set_length(*total);
                self.update_parts();
            }

            CoreEvent::Progress(snapshot) => {
                self.bar.set_length(snapshot.total);
                self.bar.set_position(snapshot.done);
                self.rate = Some(rate_text(snapshot));
                self.update_parts();
            }

            CoreEvent::ChunkResumed { .. } | CoreEvent::ChunkCompleted { .. } => {
                self.parts_done += 1;
                self.update_parts();
            }

            CoreEvent::ChunkRetry {
                index,
                attempt,
                max_attempts,
                error,
            } => {
                self.bar.println(format!(
                    "{} chunk {} attempt {}/{} failed: {}",
                    style("↻").yellow(),
                    index,
                    attempt,
                    max_attempts,
                    style(error).dim()
                ));
            }

            CoreEvent::ChunkFailed { index, error } => {
                self.bar.println(format!(
                    "{} chunk {} failed: {}",
                    style("✗").red().bold(),
                    index,
                    style(error).red()
                ));
            }

            CoreEvent::MergeCompleted { .. } => {
                self.bar.set_message("merged");
            }

            CoreEvent::SigningStageChanged { stage } => {
                self.bar.set_message(format!("{} stage", stage));
            }

            CoreEvent::SigningCompleted { .. } => {}
        }
    }

    fn update_parts(&self) {
        let parts = format!("{}/{} parts", self.parts_done, self.parts);
        match &self.rate {
            Some(rate) => self.bar.set_message(format!("({}) {}", rate, parts)),
            None => self.bar.set_message(parts),
        }
    }

    /// Follow `events` on a background task until aborted
    pub fn listen(mut self, mut events: broadcast::Receiver<CoreEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => self.handle_event(&event),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn finish(&self, message: &str) {
        if let Some(total) = self.bar.length() {
            self.bar.set_position(total);
        }
        self.bar.finish_with_message(format!(
            "{} {}",
            style("✓").green().bold(),
            message
        ));
    }

    pub fn abandon(&self, error: &str) {
        self.bar.abandon_with_message(format!(
            "{} {}",
            style("✗").red().bold(),
            error
        ));
    }
}

/// `speed/s, eta` as reported by the core tracker
fn rate_text(snapshot: &ProgressSnapshot) -> String {
    let speed = format!("{}/s", format_bytes(snapshot.speed));
    match snapshot.eta {
        Some(secs) if !snapshot.is_finished() => {
            format!("{}, {} left", speed, format_duration(Duration::from_secs(secs)))
        }
        _ => speed,
    }
}
