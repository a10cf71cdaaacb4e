//! blitzdl - parallel, resumable HTTP download engine
//!
//! A download is probed once to learn its size, filename and connection
//! speed, then fetched through multiple concurrent range requests. Segments
//! that fall below their expected speed are split in two to exploit spare
//! parallelism, bounded by connection and segment ceilings. Every segment's
//! progress is recorded in a durable catalog, so a killed process can resume
//! from exact byte offsets via [`Manager::resume_download`].

mod engine;
mod error;

pub use engine::*;
pub use error::*;

pub use blitzdl_types as types;
pub use blitzdl_types::{ContentLength, DownloadId, Item, ItemOpts, ItemPart, SegmentId};
