//! Download engine
//!
//! Probe → initial fan-out → per-segment workers with slow-segment
//! splitting → per-segment compile into the output file, with every event
//! mirrored into the durable catalog so an interrupted download resumes
//! from exact byte offsets.

mod download_log;
mod download_task;
mod events;
mod manager;
mod persistence;
mod probe;
mod segment_worker;
mod shared_map;

pub use download_task::*;
pub use events::*;
pub use manager::*;
pub use persistence::*;
pub use shared_map::*;

use std::time::Duration;

pub const KB: i64 = 1024;
pub const MB: i64 = 1024 * KB;

/// Copy-cycle chunk size used by the probe and by segment workers.
pub const DEF_CHUNK_SIZE: usize = MB as usize;

pub const DEF_USER_AGENT: &str = concat!("blitzdl/", env!("CARGO_PKG_VERSION"));

/// Total expected-speed budget divided among the segments of one download.
pub const MAX_ESPEED: i64 = 4 * MB;

/// Sentinel segment id carried by the synthetic end-of-download event.
pub const MAIN_ID: &str = "main";

/// Time it takes to move `n` bytes at a sustained `speed` (bytes/second).
pub(crate) fn download_time(speed: i64, n: i64) -> Duration {
    if speed <= 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(n as f64 / speed as f64)
}
