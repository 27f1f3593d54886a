//! Download Engine
//!
//! Parallel ranged downloads with:
//! - Bounded worker pool
//! - Per-chunk retry with linear backoff
//! - Resumption from complete part files on disk
//! - Ordered merge into the final file

mod chunk_fetcher;
mod manager;
mod progress;

pub use chunk_fetcher::*;
pub use manager::*;
pub use progress::*;
