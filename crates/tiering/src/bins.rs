//! Small bins
//!
//! Values too small to justify their own pages accumulate in the current
//! bin until it fills one page; the sealed page is written once and every
//! participant becomes an external sub-segment of it. The index tracks
//! which entries of each written page are still live so deletes can free
//! or defragment whole pages.
//!
//! Page layout: a 2-byte little-endian entry count, then the raw entry
//! payloads back to back. The header guarantees sub-segments never start
//! at page offset 0, which is the marker for multi-page blobs.

use std::collections::HashMap;

use bytes::Bytes;
use storage::PAGE_SIZE;
use tracing::debug;

/// Sub-segments smaller than this fraction of a page trigger defrag
/// once a page's live bytes fall below it
const FRAGMENTATION_RATIO: f64 = 0.5;

const HEADER_LEN: usize = 2;

/// Slice of a bin page occupied by one value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubSegment {
    pub offset_in_page: u16,
    pub len: u32,
}

/// A sealed bin ready to be written as one page
#[derive(Debug)]
pub struct SealedBin {
    /// Full page image, zero-padded to the page size
    pub image: Vec<u8>,
    /// Participants and their slices
    pub entries: Vec<(Bytes, SubSegment)>,
    pub checksum: u32,
}

#[derive(Debug, Default)]
struct PendingBin {
    entries: Vec<(Bytes, Vec<u8>)>,
    bytes: usize,
}

impl PendingBin {
    fn fits(&self, len: usize) -> bool {
        HEADER_LEN + self.bytes + len <= PAGE_SIZE
    }
}

/// A written page with live-entry tracking
#[derive(Debug)]
struct BinPage {
    live: HashMap<Bytes, SubSegment>,
    live_bytes: usize,
    checksum: u32,
}

/// Outcome of a delete against the bins index
#[derive(Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The key was not tracked by the bins
    Untracked,
    /// Removed from the still-pending bin; nothing on disk
    Pending,
    /// Page still healthy
    Kept,
    /// Last live entry gone; the page can be freed
    FreePage { page_index: u32 },
    /// Fragmentation crossed the threshold; read the page back
    Defrag { page_index: u32 },
}

/// Accumulator and live index for small-value pages
#[derive(Debug, Default)]
pub struct SmallBins {
    current: PendingBin,
    pages: HashMap<u32, BinPage>,
}

impl SmallBins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a value of `len` stored bytes belongs in a bin rather
    /// than its own pages
    pub fn fits_in_bin(len: usize) -> bool {
        HEADER_LEN + len <= PAGE_SIZE
    }

    /// Number of entries waiting in the unsealed bin
    pub fn pending_len(&self) -> usize {
        self.current.entries.len()
    }

    /// Pages currently tracked
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Add a small value. If the bin cannot take it, the bin is sealed
    /// and returned for stashing and a fresh bin absorbs the value.
    pub fn add(&mut self, key: Bytes, data: Vec<u8>) -> Option<SealedBin> {
        debug_assert!(Self::fits_in_bin(data.len()));
        let sealed = if self.current.fits(data.len()) {
            None
        } else {
            Some(self.seal())
        };
        self.current.bytes += data.len();
        self.current.entries.push((key, data));
        sealed
    }

    /// Seal the current bin regardless of fill level (used when forcing
    /// a flush)
    pub fn seal(&mut self) -> SealedBin {
        let pending = std::mem::take(&mut self.current);
        let mut image = Vec::with_capacity(PAGE_SIZE);
        image.extend_from_slice(&(pending.entries.len() as u16).to_le_bytes());
        let mut entries = Vec::with_capacity(pending.entries.len());
        for (key, data) in pending.entries {
            let segment = SubSegment {
                offset_in_page: image.len() as u16,
                len: data.len() as u32,
            };
            image.extend_from_slice(&data);
            entries.push((key, segment));
        }
        image.resize(PAGE_SIZE, 0);
        let checksum = crc32fast::hash(&image);
        SealedBin { image, entries, checksum }
    }

    /// Record a sealed bin as written at `page_index`
    pub fn register_page(&mut self, page_index: u32, sealed: &SealedBin) {
        let live_bytes = sealed.entries.iter().map(|(_, s)| s.len as usize).sum();
        self.pages.insert(
            page_index,
            BinPage {
                live: sealed.entries.iter().cloned().collect(),
                live_bytes,
                checksum: sealed.checksum,
            },
        );
    }

    /// Expected checksum of a tracked page
    pub fn page_checksum(&self, page_index: u32) -> Option<u32> {
        self.pages.get(&page_index).map(|p| p.checksum)
    }

    /// Remove a key from the index, reporting what the caller must do
    pub fn delete(&mut self, key: &[u8], page_index: Option<u32>) -> DeleteOutcome {
        // Still in the pending bin?
        if let Some(at) = self.current.entries.iter().position(|(k, _)| &k[..] == key) {
            let (_, data) = self.current.entries.remove(at);
            self.current.bytes -= data.len();
            return DeleteOutcome::Pending;
        }
        let Some(page_index) = page_index else {
            return DeleteOutcome::Untracked;
        };
        let Some(page) = self.pages.get_mut(&page_index) else {
            return DeleteOutcome::Untracked;
        };
        let Some(segment) = page.live.remove(key) else {
            return DeleteOutcome::Untracked;
        };
        page.live_bytes -= segment.len as usize;
        if page.live.is_empty() {
            self.pages.remove(&page_index);
            debug!(page_index, "bin page fully dead");
            return DeleteOutcome::FreePage { page_index };
        }
        if (page.live_bytes as f64) < PAGE_SIZE as f64 * FRAGMENTATION_RATIO {
            return DeleteOutcome::Defrag { page_index };
        }
        DeleteOutcome::Kept
    }

    /// Live entries of a page sliced out of its raw image; the page
    /// record is dropped
    pub fn extract_live(&mut self, page_index: u32, image: &[u8]) -> Vec<(Bytes, Vec<u8>)> {
        let Some(page) = self.pages.remove(&page_index) else {
            return Vec::new();
        };
        page.live
            .into_iter()
            .map(|(key, segment)| {
                let start = segment.offset_in_page as usize;
                (key, image[start..start + segment.len as usize].to_vec())
            })
            .collect()
    }

    /// Sub-segment of a live entry, if the page still tracks it
    pub fn lookup(&self, page_index: u32, key: &[u8]) -> Option<SubSegment> {
        self.pages.get(&page_index)?.live.get(key).copied()
    }
}
