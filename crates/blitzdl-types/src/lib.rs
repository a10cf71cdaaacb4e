//! Shared types for blitzdl
//!
//! This crate contains the data model shared between the engine and its
//! embedders: download/segment identifiers, content lengths, and the
//! persisted catalog item with its segment ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

fn short_hex() -> String {
    let mut s = Uuid::new_v4().simple().to_string();
    s.truncate(8);
    s
}

/// Identifier of one download, unique within a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(String);

impl DownloadId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(short_hex())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DownloadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for DownloadId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DownloadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of one segment, unique within its download.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(String);

impl SegmentId {
    pub fn new() -> Self {
        Self(short_hex())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SegmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SegmentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SegmentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// Content length
// ============================================================================

/// Total size of a remote resource in bytes.
///
/// `-1` means the server did not report a size, `0` means the reported size
/// was invalid; both are rejected by the probe before a download starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentLength(i64);

impl ContentLength {
    pub const UNKNOWN: ContentLength = ContentLength(-1);

    pub fn new(v: i64) -> Self {
        Self(v)
    }

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn is_unknown(self) -> bool {
        self.0 == -1
    }

    pub fn is_invalid(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ContentLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ContentLength {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

// ============================================================================
// Catalog item
// ============================================================================

/// One entry of the persisted segment ledger, keyed in [`Item::parts`] by the
/// segment's original initial offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPart {
    pub id: SegmentId,
    /// Final byte offset of the segment, inclusive. Shrinks when the
    /// segment is split.
    pub final_offset: i64,
    /// Whether the segment's bytes have been written into the output file.
    pub compiled: bool,
}

/// A download as recorded in the catalog. Together with the scratch files in
/// the download's working directory this is sufficient to resume after a
/// process restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: DownloadId,
    pub name: String,
    pub url: String,
    pub date_added: DateTime<Utc>,
    pub total_size: ContentLength,
    /// Bytes fetched so far, summed over all segments.
    pub downloaded: i64,
    pub download_location: PathBuf,
    /// Optional absolute path of the finished file, when it differs from
    /// `download_location/name`.
    pub absolute_location: Option<PathBuf>,
    pub hidden: bool,
    pub is_child: bool,
    pub parent_id: Option<DownloadId>,
    /// Ceilings the download was created with, restored on resume.
    pub max_connections: usize,
    pub max_segments: usize,
    /// Segment ledger keyed by original initial offset. Emptied once the
    /// download completes.
    pub parts: BTreeMap<i64, ItemPart>,
}

/// Linkage options recognized when an item is added to the catalog.
#[derive(Debug, Clone, Default)]
pub struct ItemOpts {
    pub hidden: bool,
    pub is_child: bool,
    pub parent_id: Option<DownloadId>,
    pub absolute_location: Option<PathBuf>,
}

impl Item {
    pub fn is_complete(&self) -> bool {
        !self.total_size.is_unknown()
            && !self.total_size.is_invalid()
            && self.downloaded >= self.total_size.get()
    }

    /// Completion percentage in whole percent, 0 when the size is unusable.
    pub fn percentage(&self) -> i64 {
        match self.total_size.get() {
            v if v > 0 => (self.downloaded * 100) / v,
            _ => 0,
        }
    }

    /// Path the finished file is (or will be) saved at.
    pub fn save_path(&self) -> PathBuf {
        self.absolute_location
            .clone()
            .unwrap_or_else(|| self.download_location.join(&self.name))
    }
}
