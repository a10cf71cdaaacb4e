//! Segment worker - one HTTP range request feeding one scratch file
//!
//! A worker streams its byte range in chunk-sized copies, timing every 10th
//! chunk against the expected speed; a miss surfaces as `Slow` so the
//! scheduler can split the remaining range. When the range is done the
//! worker compiles its scratch file into the shared output at its offset.

use crate::engine::download_time;
use crate::engine::events::EventBus;
use crate::engine::probe::request_headers;
use crate::error::BlitzError;
use blitzdl_types::SegmentId;
use futures::TryStreamExt;
use reqwest::header::{HeaderMap, HeaderValue, RANGE};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

/// How one `download` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentOutcome {
    /// The range was fully written.
    Completed,
    /// Throughput fell below the expected speed; the body was not drained.
    Slow,
}

/// Download-wide context shared by all segment workers of one run.
pub(crate) struct SegmentEnv {
    pub(crate) client: Client,
    pub(crate) url: String,
    pub(crate) chunk_size: usize,
    pub(crate) headers: HeaderMap,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) cancel: CancellationToken,
    /// Bytes fetched across the whole run, verified against the content
    /// length at the end.
    pub(crate) bytes_read: Arc<AtomicI64>,
}

pub(crate) struct SegmentWorker {
    env: Arc<SegmentEnv>,
    id: SegmentId,
    /// Original initial offset; keys the ledger entry and never changes.
    offset: i64,
    /// Bytes written to the scratch file so far.
    read: i64,
    /// Expected speed in bytes/second; halved on every split.
    espeed: i64,
    scratch_path: PathBuf,
    file: File,
}

impl SegmentWorker {
    /// Spawn a fresh segment with an empty scratch file.
    pub(crate) async fn create(
        env: Arc<SegmentEnv>,
        work_dir: &Path,
        offset: i64,
    ) -> Result<Self, BlitzError> {
        let id = SegmentId::new();
        let scratch_path = work_dir.join(id.as_str());
        let file = File::create(&scratch_path).await?;
        Ok(Self {
            env,
            id,
            offset,
            read: 0,
            espeed: 0,
            scratch_path,
            file,
        })
    }

    /// Reopen a persisted segment, recovering `read` from the scratch
    /// file's on-disk length. Errors if the ledger references a scratch
    /// file that no longer exists.
    pub(crate) async fn reopen(
        env: Arc<SegmentEnv>,
        work_dir: &Path,
        id: SegmentId,
        offset: i64,
    ) -> Result<Self, BlitzError> {
        let scratch_path = work_dir.join(id.as_str());
        let file = match OpenOptions::new().append(true).open(&scratch_path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlitzError::ScratchMissing(scratch_path));
            }
            Err(e) => return Err(e.into()),
        };
        let read = file.metadata().await?.len() as i64;
        Ok(Self {
            env,
            id,
            offset,
            read,
            espeed: 0,
            scratch_path,
            file,
        })
    }

    pub(crate) fn id(&self) -> &SegmentId {
        &self.id
    }

    pub(crate) fn offset(&self) -> i64 {
        self.offset
    }

    pub(crate) fn read(&self) -> i64 {
        self.read
    }

    pub(crate) fn set_espeed(&mut self, espeed: i64) {
        self.espeed = espeed;
    }

    /// Fetch `[ioff, foff]` (inclusive; `foff < 0` requests an open-ended
    /// range) into the scratch file. With `force` set the speed check is
    /// skipped and the range runs to completion.
    pub(crate) async fn download(
        &mut self,
        ioff: i64,
        foff: i64,
        force: bool,
    ) -> Result<SegmentOutcome, BlitzError> {
        let mut headers = request_headers(&self.env.headers);
        let range = if foff >= 0 {
            format!("bytes={ioff}-{foff}")
        } else {
            format!("bytes={ioff}-")
        };
        headers.insert(
            RANGE,
            HeaderValue::from_str(&range).expect("range header is always ascii"),
        );

        let resp = self
            .env
            .client
            .get(&self.env.url)
            .headers(headers)
            .send()
            .await?
            .error_for_status()?;

        let mut reader = StreamReader::new(resp.bytes_stream().map_err(std::io::Error::other));
        let mut buf = vec![0u8; self.env.chunk_size];
        let expected = download_time(self.espeed, self.env.chunk_size as i64);
        let mut chunk_no: u64 = 0;

        loop {
            if self.env.cancel.is_cancelled() {
                self.file.flush().await?;
                return Err(BlitzError::Cancelled);
            }
            chunk_no += 1;
            if !force && chunk_no % 10 == 0 {
                let started = Instant::now();
                let n = self.copy_chunk(&mut reader, &mut buf).await?;
                if n == 0 {
                    break;
                }
                if started.elapsed() > expected {
                    self.file.flush().await?;
                    return Ok(SegmentOutcome::Slow);
                }
            } else if self.copy_chunk(&mut reader, &mut buf).await? == 0 {
                break;
            }
        }

        self.file.flush().await?;
        self.env.bus.download_complete(self.id.as_str(), self.read).await;
        Ok(SegmentOutcome::Completed)
    }

    async fn copy_chunk(
        &mut self,
        reader: &mut (impl AsyncRead + Unpin),
        buf: &mut [u8],
    ) -> Result<usize, BlitzError> {
        let n = reader.read(buf).await?;
        if n > 0 {
            self.file.write_all(&buf[..n]).await?;
            self.read += n as i64;
            self.env.bytes_read.fetch_add(n as i64, Ordering::AcqRel);
            self.env.bus.download_progress(&self.id, n).await;
        }
        Ok(n)
    }

    /// Copy the scratch file into the output at this segment's offset and
    /// remove it. A `solo` segment (the only one the run ever spawned)
    /// renames instead, when the filesystem allows.
    pub(crate) async fn compile(&mut self, output: &Path, solo: bool) -> Result<i64, BlitzError> {
        self.env.bus.compile_start(&self.id).await;
        self.file.flush().await?;
        self.file.sync_all().await?;

        if solo && tokio::fs::rename(&self.scratch_path, output).await.is_ok() {
            self.env.bus.compile_complete(&self.id, self.read).await;
            return Ok(self.read);
        }

        let mut src = File::open(&self.scratch_path).await?;
        let mut dst = OpenOptions::new()
            .write(true)
            .create(true)
            .open(output)
            .await?;
        dst.seek(std::io::SeekFrom::Start(self.offset as u64)).await?;

        let mut buf = vec![0u8; self.env.chunk_size];
        let mut total: i64 = 0;
        loop {
            let n = src.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            dst.write_all(&buf[..n]).await?;
            total += n as i64;
            self.env.bus.compile_progress(n).await;
        }
        dst.flush().await?;
        dst.sync_all().await?;
        drop(src);
        tokio::fs::remove_file(&self.scratch_path).await?;

        self.env.bus.compile_complete(&self.id, total).await;
        Ok(total)
    }
}
