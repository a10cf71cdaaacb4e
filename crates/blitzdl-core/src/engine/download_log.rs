//! Per-download append-only log file.

use crate::engine::events::EventSubscriber;
use crate::error::BlitzError;
use async_trait::async_trait;
use blitzdl_types::SegmentId;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

pub(crate) const LOG_FILE_NAME: &str = "logs.txt";

/// Append-only `logs.txt` inside a download's working directory. Write
/// failures are swallowed; the log must never take a download down.
pub(crate) struct DownloadLog {
    file: Mutex<File>,
}

impl DownloadLog {
    pub(crate) fn create(work_dir: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(work_dir.join(LOG_FILE_NAME))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub(crate) fn line(&self, msg: &str) {
        let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        let _ = writeln!(self.file.lock(), "[{stamp}] {msg}");
    }
}

/// Default subscriber every download carries: errors and segment lifecycle
/// land in the download's `logs.txt`, mirrored to the process log.
pub(crate) struct LogSubscriber {
    log: Arc<DownloadLog>,
}

impl LogSubscriber {
    pub(crate) fn new(log: Arc<DownloadLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl EventSubscriber for LogSubscriber {
    async fn on_spawn(&self, id: &SegmentId, ioff: i64, foff: i64) {
        self.log.line(&format!("spawned segment {id} for {ioff}-{foff}"));
    }

    async fn on_respawn(&self, id: &SegmentId, _original_ioff: i64, ioff: i64, foff: i64) {
        self.log.line(&format!("respawned segment {id} over {ioff}-{foff}"));
    }

    async fn on_error(&self, id: &SegmentId, error: &BlitzError) {
        tracing::error!(segment = %id, %error, "segment failed");
        self.log.line(&format!("segment {id} failed: {error}"));
    }

    async fn on_compile_complete(&self, id: &SegmentId, total: i64) {
        self.log.line(&format!("compiled segment {id} ({total} bytes)"));
    }
}
