//! Downloader - per-download coordinator
//!
//! Owns the initial fan-out, the slow-segment reaction (split, wait for a
//! free slot, or force-finish at the segment ceiling), the admission
//! counters, and the termination barrier. `start` runs a fresh download,
//! `resume` re-seeds segments from a persisted ledger, and both block until
//! every segment has terminated.

use crate::engine::download_log::{DownloadLog, LogSubscriber};
use crate::engine::events::{EventBus, EventSubscriber};
use crate::engine::probe::probe;
use crate::engine::segment_worker::{SegmentEnv, SegmentOutcome, SegmentWorker};
use crate::engine::shared_map::SharedMap;
use crate::engine::{DEF_CHUNK_SIZE, MAIN_ID, MAX_ESPEED};
use crate::error::BlitzError;
use blitzdl_types::{ContentLength, DownloadId, ItemPart, SegmentId};
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use reqwest::Client;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Pause before retrying a slow segment when no connection slot is free.
const WAIT_FOR_SLOT: Duration = Duration::from_millis(100);

/// Options recognized when constructing a [`Downloader`].
#[derive(Default)]
pub struct DownloaderOpts {
    /// Split into segments even when the server does not advertise range
    /// support.
    pub force_parts: bool,
    /// Override the probe's initial fan-out.
    pub base_segments: Option<usize>,
    /// Explicit file name; otherwise taken from `Content-Disposition` or
    /// the final URL.
    pub file_name: Option<String>,
    /// Directory the finished file is saved in. Defaults to the current
    /// directory.
    pub download_dir: Option<PathBuf>,
    /// Root under which per-download working directories are created.
    pub data_dir: Option<PathBuf>,
    /// Ceiling on concurrent connections; 0 means unlimited.
    pub max_connections: usize,
    /// Ceiling on segments ever spawned; 0 means unlimited.
    pub max_segments: usize,
    /// Copy-cycle chunk size; defaults to [`DEF_CHUNK_SIZE`].
    pub chunk_size: Option<usize>,
    /// Custom request headers; they override the built-in defaults.
    pub headers: HeaderMap,
    /// Event subscribers installed at construction.
    pub subscribers: Vec<Arc<dyn EventSubscriber>>,
    /// Skip the sizing probe. Used internally by resume, which already
    /// knows the name and size; requires `id`, `file_name` and
    /// `known_length` to be set.
    pub skip_setup: bool,
    /// Reuse an existing download id (and therefore working directory).
    pub id: Option<DownloadId>,
    /// Total size recorded by a previous run.
    pub known_length: Option<ContentLength>,
}

/// Admission counters. `active_connections` tracks live connections,
/// `total_segments` the number of segments ever spawned; both reserve
/// their slot atomically so the ceilings are never overshot.
pub(crate) struct Counters {
    max_connections: usize,
    max_segments: usize,
    active_connections: AtomicUsize,
    total_segments: AtomicUsize,
}

impl Counters {
    fn new(max_connections: usize, max_segments: usize) -> Self {
        Self {
            max_connections,
            max_segments,
            active_connections: AtomicUsize::new(0),
            total_segments: AtomicUsize::new(0),
        }
    }

    /// Unconditional reservation used by the initial fan-out, whose count
    /// is clamped to the ceilings up front.
    fn reserve(&self) {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
        self.total_segments.fetch_add(1, Ordering::AcqRel);
    }

    /// Count a resumed ledger entry toward the segment total without
    /// claiming a connection; resumed segments queue for their slot.
    fn seed_segment(&self) {
        self.total_segments.fetch_add(1, Ordering::AcqRel);
    }

    fn try_reserve_connection(&self) -> bool {
        self.active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if self.max_connections == 0 || n < self.max_connections {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn release_connection(&self) {
        self.active_connections.fetch_sub(1, Ordering::AcqRel);
    }

    fn try_reserve_segment(&self) -> bool {
        self.total_segments
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if self.max_segments == 0 || n < self.max_segments {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// `total_segments` is monotone, so a plain load is a stable answer.
    fn segments_exhausted(&self) -> bool {
        self.max_segments > 0 && self.total_segments.load(Ordering::Acquire) >= self.max_segments
    }

    fn total_segments(&self) -> usize {
        self.total_segments.load(Ordering::Acquire)
    }
}

struct DownloadCtx {
    id: DownloadId,
    url: String,
    file_name: String,
    content_length: ContentLength,
    download_dir: PathBuf,
    work_dir: PathBuf,
    chunk_size: usize,
    base_segments: usize,
    /// When the server cannot serve ranges, segments run forced: a split
    /// would refetch the whole body.
    range_supported: bool,
    headers: HeaderMap,
    client: Client,
    counters: Counters,
    ohmap: SharedMap<i64, SegmentId>,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
    log: Arc<DownloadLog>,
}

impl DownloadCtx {
    fn save_path(&self) -> PathBuf {
        self.download_dir.join(&self.file_name)
    }

    /// A rename-over is only safe when this was the run's only segment and
    /// its scratch file is the entire output.
    fn solo(&self, part: &SegmentWorker) -> bool {
        self.counters.total_segments() == 1
            && part.offset() == 0
            && part.read() == self.content_length.get()
    }
}

/// State of one `start`/`resume` invocation.
struct RunState {
    tracker: TaskTracker,
    env: Arc<SegmentEnv>,
    first_error: Mutex<Option<BlitzError>>,
}

impl RunState {
    fn new(ctx: &DownloadCtx) -> Arc<Self> {
        Arc::new(Self {
            tracker: TaskTracker::new(),
            env: Arc::new(SegmentEnv {
                client: ctx.client.clone(),
                url: ctx.url.clone(),
                chunk_size: ctx.chunk_size,
                headers: ctx.headers.clone(),
                bus: ctx.bus.clone(),
                cancel: ctx.cancel.clone(),
                bytes_read: Arc::new(AtomicI64::new(0)),
            }),
            first_error: Mutex::new(None),
        })
    }
}

/// A single parallel, resumable download.
pub struct Downloader {
    ctx: Arc<DownloadCtx>,
}

impl Downloader {
    /// Probe `url` and prepare a download. Precondition failures
    /// (unsupported media type, invalid or unknown size) surface here,
    /// before any file is created.
    pub async fn new(client: Client, url: &str, opts: DownloaderOpts) -> Result<Self, BlitzError> {
        let chunk_size = opts.chunk_size.unwrap_or(DEF_CHUNK_SIZE);

        let (file_name, content_length, probed_base, range_supported) = if opts.skip_setup {
            (
                opts.file_name.clone().unwrap_or_else(|| "download".into()),
                opts.known_length.unwrap_or(ContentLength::UNKNOWN),
                1,
                true,
            )
        } else {
            let report = probe(
                &client,
                url,
                &opts.headers,
                chunk_size,
                opts.force_parts,
                opts.file_name.as_deref(),
            )
            .await?;
            (
                report.file_name,
                report.content_length,
                report.base_segments,
                report.range_supported,
            )
        };

        let mut base_segments = opts.base_segments.unwrap_or(probed_base).max(1);
        if (!range_supported && !opts.force_parts)
            || content_length.get() < chunk_size as i64
        {
            base_segments = 1;
        }
        if opts.max_connections > 0 {
            base_segments = base_segments.min(opts.max_connections);
        }
        if opts.max_segments > 0 {
            base_segments = base_segments.min(opts.max_segments);
        }

        let id = opts.id.clone().unwrap_or_default();
        let data_dir = opts.data_dir.clone().unwrap_or_else(default_data_dir);
        let work_dir = data_dir.join(id.as_str());
        tokio::fs::create_dir_all(&work_dir).await?;

        let log = Arc::new(DownloadLog::create(&work_dir)?);
        let bus = Arc::new(EventBus::with_subscribers(opts.subscribers));
        bus.subscribe(Arc::new(LogSubscriber::new(log.clone())));

        Ok(Self {
            ctx: Arc::new(DownloadCtx {
                id,
                url: url.to_string(),
                file_name,
                content_length,
                download_dir: opts.download_dir.unwrap_or_else(|| PathBuf::from(".")),
                work_dir,
                chunk_size,
                base_segments,
                range_supported,
                headers: opts.headers,
                client,
                counters: Counters::new(opts.max_connections, opts.max_segments),
                ohmap: SharedMap::new(),
                bus,
                cancel: CancellationToken::new(),
                log,
            }),
        })
    }

    pub fn id(&self) -> &DownloadId {
        &self.ctx.id
    }

    pub fn url(&self) -> &str {
        &self.ctx.url
    }

    pub fn file_name(&self) -> &str {
        &self.ctx.file_name
    }

    pub fn content_length(&self) -> ContentLength {
        self.ctx.content_length
    }

    pub fn download_dir(&self) -> &PathBuf {
        &self.ctx.download_dir
    }

    /// Path the finished file is written to.
    pub fn save_path(&self) -> PathBuf {
        self.ctx.save_path()
    }

    pub fn max_connections(&self) -> usize {
        self.ctx.counters.max_connections
    }

    pub fn max_segments(&self) -> usize {
        self.ctx.counters.max_segments
    }

    /// Original initial offsets of all segments spawned so far, ascending.
    pub fn segment_offsets(&self) -> Vec<i64> {
        self.ctx.ohmap.keys()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.ctx.bus.subscribe(subscriber);
    }

    /// Install a subscriber that runs before all existing ones. The catalog
    /// uses this so persistence precedes user callbacks.
    pub fn subscribe_first(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.ctx.bus.subscribe_first(subscriber);
    }

    /// Abort the download. In-flight segments terminate at their next chunk
    /// boundary and `start`/`resume` returns [`BlitzError::Cancelled`].
    pub fn stop(&self) {
        self.ctx.cancel.cancel();
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    /// Download the file, blocking until every segment has terminated.
    /// Returns the first fatal error, if any.
    pub async fn start(&self) -> Result<(), BlitzError> {
        let ctx = &self.ctx;
        self.check_length()?;
        tokio::fs::create_dir_all(&ctx.download_dir).await?;

        let run = RunState::new(ctx);
        let length = ctx.content_length.get();
        let base = ctx.base_segments as i64;
        let (part_size, remainder) = partition(length, base);
        let espeed = MAX_ESPEED / base;

        ctx.log.line(&format!(
            "starting {} ({length} bytes, {base} segments)",
            ctx.file_name
        ));
        tracing::info!(id = %ctx.id, file = %ctx.file_name, length, base, "starting download");

        for i in 0..base {
            let ioff = i * part_size;
            let mut foff = ioff + part_size - 1;
            if i == base - 1 {
                foff += remainder;
            }
            ctx.counters.reserve();
            if let Err(err) = spawn_fresh(ctx, &run, ioff, foff, espeed).await {
                ctx.counters.release_connection();
                fail(ctx, &run, &SegmentId::new(), err).await;
                break;
            }
        }

        self.wait(run).await
    }

    /// Resume a download from a persisted segment ledger, blocking until
    /// every segment has terminated.
    pub async fn resume(&self, ledger: &BTreeMap<i64, ItemPart>) -> Result<(), BlitzError> {
        if ledger.is_empty() {
            // The prior run was killed before any segment spawned.
            return self.start().await;
        }
        let ctx = &self.ctx;
        self.check_length()?;
        tokio::fs::create_dir_all(&ctx.download_dir).await?;

        let entries = normalize_ledger(ledger);
        let unfinished = entries.iter().filter(|(_, p)| !p.compiled).count().max(1);
        let espeed = MAX_ESPEED / unfinished as i64;
        let run = RunState::new(ctx);

        ctx.log.line(&format!(
            "resuming {} ({} ledger entries)",
            ctx.file_name,
            entries.len()
        ));
        tracing::info!(id = %ctx.id, entries = entries.len(), "resuming download");

        for (ioff, entry) in entries {
            let length = entry.final_offset - ioff + 1;
            if entry.compiled {
                run.env.bytes_read.fetch_add(length, Ordering::AcqRel);
                ctx.bus.compile_skipped(&entry.id, length).await;
                continue;
            }
            // Scratch problems surface before any task launches.
            let part =
                SegmentWorker::reopen(run.env.clone(), &ctx.work_dir, entry.id.clone(), ioff)
                    .await?;
            let recovered = part.read();
            run.env.bytes_read.fetch_add(recovered, Ordering::AcqRel);
            if recovered > 0 {
                ctx.bus.resume_progress(recovered as usize).await;
            }
            ctx.ohmap.insert(ioff, entry.id.clone());
            ctx.counters.seed_segment();
            respawn_segment(ctx.clone(), run.clone(), part, entry.final_offset, espeed);
        }

        self.wait(run).await
    }

    fn check_length(&self) -> Result<(), BlitzError> {
        let cl = self.ctx.content_length;
        if cl.is_invalid() {
            Err(BlitzError::InvalidContentLength)
        } else if cl.is_unknown() {
            Err(BlitzError::UnknownContentLength)
        } else {
            Ok(())
        }
    }

    async fn wait(&self, run: Arc<RunState>) -> Result<(), BlitzError> {
        run.tracker.close();
        run.tracker.wait().await;

        if let Some(err) = run.first_error.lock().take() {
            return Err(err);
        }
        let read = run.env.bytes_read.load(Ordering::Acquire);
        let expected = self.ctx.content_length.get();
        if read != expected {
            return Err(BlitzError::Incomplete { expected, read });
        }

        self.ctx.bus.download_complete(MAIN_ID, read).await;
        self.ctx.log.line(&format!("completed ({read} bytes)"));
        tracing::info!(id = %self.ctx.id, read, "download complete");
        Ok(())
    }
}

/// Partition `length` into `n` ranges of `length / n` bytes; the remainder
/// goes to the last range only.
fn partition(length: i64, n: i64) -> (i64, i64) {
    (length / n, length % n)
}

/// Split arithmetic: the child takes the second half of the unreceived
/// bytes, the parent keeps the first.
fn split_range(poff: i64, foff: i64) -> (i64, i64) {
    let div = (foff - poff) / 2;
    (poff + div - 1, poff + div)
}

/// Snapshot a ledger for iteration, clamping each entry below its
/// successor's key. A crash between the two catalog writes of a split can
/// persist a child entry while the parent still covers the full range; the
/// clamp restores exactly the post-split ranges.
fn normalize_ledger(ledger: &BTreeMap<i64, ItemPart>) -> Vec<(i64, ItemPart)> {
    let mut entries: Vec<(i64, ItemPart)> =
        ledger.iter().map(|(k, v)| (*k, v.clone())).collect();
    for i in 0..entries.len().saturating_sub(1) {
        let next_key = entries[i + 1].0;
        if entries[i].1.final_offset >= next_key {
            entries[i].1.final_offset = next_key - 1;
        }
    }
    entries
}

/// Create a fresh segment for `[ioff, foff]`, publish its spawn, and hand
/// it to a task. The caller has already reserved its connection and segment
/// slots. The spawn event (and with it the ledger entry) is published
/// before this returns, so a split's child is always recorded before its
/// parent shrinks.
async fn spawn_fresh(
    ctx: &Arc<DownloadCtx>,
    run: &Arc<RunState>,
    ioff: i64,
    foff: i64,
    espeed: i64,
) -> Result<(), BlitzError> {
    let part = SegmentWorker::create(run.env.clone(), &ctx.work_dir, ioff).await?;
    ctx.ohmap.insert(ioff, part.id().clone());
    ctx.bus.spawn(part.id(), ioff, foff).await;
    launch(ctx.clone(), run.clone(), part, ioff, foff, espeed);
    Ok(())
}

fn launch(
    ctx: Arc<DownloadCtx>,
    run: Arc<RunState>,
    part: SegmentWorker,
    ioff: i64,
    foff: i64,
    espeed: i64,
) {
    let tracker = run.tracker.clone();
    tracker.spawn(async move {
        drive_segment(&ctx, &run, part, ioff, foff, espeed).await;
        ctx.counters.release_connection();
    });
}

/// Relaunch a persisted segment over what remains of `[offset, foff]`.
fn respawn_segment(
    ctx: Arc<DownloadCtx>,
    run: Arc<RunState>,
    mut part: SegmentWorker,
    foff: i64,
    espeed: i64,
) {
    let tracker = run.tracker.clone();
    tracker.spawn(async move {
        let id = part.id().clone();
        let ioff = part.offset() + part.read();
        if ioff > foff {
            // The range was fully fetched before the kill; no new
            // connection, just the compile.
            ctx.bus.compile_skipped(&id, part.read()).await;
            let solo = ctx.solo(&part);
            if let Err(err) = part.compile(&ctx.save_path(), solo).await {
                fail(&ctx, &run, &id, err).await;
            }
            return;
        }

        // A resume can carry more ledger entries than the connection
        // ceiling allows at once; queue for a slot.
        while !ctx.counters.try_reserve_connection() {
            if ctx.cancel.is_cancelled() {
                fail(&ctx, &run, &id, BlitzError::Cancelled).await;
                return;
            }
            tokio::time::sleep(WAIT_FOR_SLOT).await;
        }
        drive_segment(&ctx, &run, part, ioff, foff, espeed).await;
        ctx.counters.release_connection();
    });
}

/// Run one segment to completion: download, react to slowness, compile.
async fn drive_segment(
    ctx: &Arc<DownloadCtx>,
    run: &Arc<RunState>,
    mut part: SegmentWorker,
    mut ioff: i64,
    mut foff: i64,
    mut espeed: i64,
) {
    let original_ioff = part.offset();
    let id = part.id().clone();

    loop {
        part.set_espeed(espeed);
        match part.download(ioff, foff, !ctx.range_supported).await {
            Err(err) => {
                fail(ctx, run, &id, err).await;
                return;
            }
            Ok(SegmentOutcome::Completed) => break,
            Ok(SegmentOutcome::Slow) => {
                let poff = original_ioff + part.read();

                // At the segment ceiling, or with too little left to be
                // worth a second connection, finish the range in place.
                if ctx.counters.segments_exhausted() || foff - poff < 2 {
                    match part.download(poff, foff, true).await {
                        Ok(_) => break,
                        Err(err) => {
                            fail(ctx, run, &id, err).await;
                            return;
                        }
                    }
                }

                if ctx.counters.try_reserve_connection() {
                    if ctx.counters.try_reserve_segment() {
                        // Split: the child takes the second half of the
                        // unreceived bytes, both sides continue at half the
                        // expected speed. The child's spawn publishes
                        // before the parent's shrink.
                        let (parent_foff, child_ioff) = split_range(poff, foff);
                        espeed /= 2;
                        match spawn_fresh(ctx, run, child_ioff, foff, espeed).await {
                            Ok(()) => {
                                foff = parent_foff;
                                ctx.bus.respawn(&id, original_ioff, poff, foff).await;
                                ioff = poff;
                                continue;
                            }
                            Err(err) => {
                                ctx.counters.release_connection();
                                fail(ctx, run, &SegmentId::new(), err).await;
                                // The child never materialized; finish the
                                // whole range in place.
                                match part.download(poff, foff, true).await {
                                    Ok(_) => break,
                                    Err(err) => {
                                        fail(ctx, run, &id, err).await;
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    // The last segment slot went to a concurrent split.
                    ctx.counters.release_connection();
                    match part.download(poff, foff, true).await {
                        Ok(_) => break,
                        Err(err) => {
                            fail(ctx, run, &id, err).await;
                            return;
                        }
                    }
                }

                // No free connection slot: retry the same range with the
                // same expected speed once a beat has passed.
                tokio::time::sleep(WAIT_FOR_SLOT).await;
                ioff = poff;
            }
        }
    }

    let solo = ctx.solo(&part);
    if let Err(err) = part.compile(&ctx.save_path(), solo).await {
        fail(ctx, run, &id, err).await;
    }
}

async fn fail(ctx: &DownloadCtx, run: &RunState, id: &SegmentId, err: BlitzError) {
    ctx.bus.error(id, &err).await;
    let mut slot = run.first_error.lock();
    if slot.is_none() {
        *slot = Some(err);
    }
}

pub(crate) fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "blitzdl")
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".blitzdl"))
}
