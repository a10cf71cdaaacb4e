//! Event bus - named callback slots driven by the scheduler
//!
//! Subscribers implement [`EventSubscriber`] and override only the slots
//! they care about; every slot defaults to a no-op except `on_error`, which
//! logs. The bus keeps an ordered subscriber list (the catalog registers
//! itself first so persistence happens before user callbacks) and never
//! holds its lock across a callback.

use crate::error::BlitzError;
use async_trait::async_trait;
use blitzdl_types::SegmentId;
use parking_lot::RwLock;
use std::sync::Arc;

/// Callback slots a download emits during its lifetime.
///
/// `on_download_complete` fires once per finished segment with the segment's
/// id, and a final time with the sentinel id [`crate::MAIN_ID`] carrying the
/// total byte count, strictly after every per-segment compile.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// A new segment was launched for `[ioff, foff]`.
    async fn on_spawn(&self, _id: &SegmentId, _ioff: i64, _foff: i64) {}

    /// An existing segment was shrunk by a split and relaunched over
    /// `[ioff, foff]`. `original_ioff` is the offset the segment was first
    /// spawned at and keys its ledger entry.
    async fn on_respawn(&self, _id: &SegmentId, _original_ioff: i64, _ioff: i64, _foff: i64) {}

    /// A segment wrote `chunk` freshly fetched bytes.
    async fn on_download_progress(&self, _id: &SegmentId, _chunk: usize) {}

    /// `chunk` previously fetched bytes were recovered from a scratch file
    /// while resuming.
    async fn on_resume_progress(&self, _chunk: usize) {}

    async fn on_error(&self, id: &SegmentId, error: &BlitzError) {
        tracing::error!(segment = %id, %error, "segment failed");
    }

    async fn on_download_complete(&self, _id: &str, _total: i64) {}

    async fn on_compile_start(&self, _id: &SegmentId) {}

    /// `chunk` bytes were copied from a scratch file into the output.
    async fn on_compile_progress(&self, _chunk: usize) {}

    async fn on_compile_complete(&self, _id: &SegmentId, _total: i64) {}

    /// A resumed segment needed no new connection; `recovered` bytes were
    /// already on disk.
    async fn on_compile_skipped(&self, _id: &SegmentId, _recovered: i64) {}
}

/// Ordered list of [`EventSubscriber`]s attached to one download.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscribers(subscribers: Vec<Arc<dyn EventSubscriber>>) -> Self {
        Self {
            subscribers: RwLock::new(subscribers),
        }
    }

    /// Append a subscriber; it runs after all existing ones.
    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    /// Insert a subscriber ahead of all existing ones. Used by the catalog
    /// so ledger updates are persisted before user callbacks observe them.
    pub fn subscribe_first(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.write().insert(0, subscriber);
    }

    fn snapshot(&self) -> Vec<Arc<dyn EventSubscriber>> {
        self.subscribers.read().clone()
    }

    pub(crate) async fn spawn(&self, id: &SegmentId, ioff: i64, foff: i64) {
        for s in self.snapshot() {
            s.on_spawn(id, ioff, foff).await;
        }
    }

    pub(crate) async fn respawn(&self, id: &SegmentId, original_ioff: i64, ioff: i64, foff: i64) {
        for s in self.snapshot() {
            s.on_respawn(id, original_ioff, ioff, foff).await;
        }
    }

    pub(crate) async fn download_progress(&self, id: &SegmentId, chunk: usize) {
        for s in self.snapshot() {
            s.on_download_progress(id, chunk).await;
        }
    }

    pub(crate) async fn resume_progress(&self, chunk: usize) {
        for s in self.snapshot() {
            s.on_resume_progress(chunk).await;
        }
    }

    pub(crate) async fn error(&self, id: &SegmentId, error: &BlitzError) {
        for s in self.snapshot() {
            s.on_error(id, error).await;
        }
    }

    pub(crate) async fn download_complete(&self, id: &str, total: i64) {
        for s in self.snapshot() {
            s.on_download_complete(id, total).await;
        }
    }

    pub(crate) async fn compile_start(&self, id: &SegmentId) {
        for s in self.snapshot() {
            s.on_compile_start(id).await;
        }
    }

    pub(crate) async fn compile_progress(&self, chunk: usize) {
        for s in self.snapshot() {
            s.on_compile_progress(chunk).await;
        }
    }

    pub(crate) async fn compile_complete(&self, id: &SegmentId, total: i64) {
        for s in self.snapshot() {
            s.on_compile_complete(id, total).await;
        }
    }

    pub(crate) async fn compile_skipped(&self, id: &SegmentId, recovered: i64) {
        for s in self.snapshot() {
            s.on_compile_skipped(id, recovered).await;
        }
    }
}
