//! Tiered storage
//!
//! Offloads eligible string values from the prime table to a per-shard
//! page file. Large values take whole pages and a single write; small
//! values coalesce in the current bin and move out together when the bin
//! fills a page. All I/O is asynchronous: values carry `IO_PENDING`
//! while a stash or defrag is outstanding, and completions are applied
//! on the shard worker by draining the engine's completion queue.

pub mod bins;
pub mod disk;

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use bytes::Bytes;
use tracing::{debug, info, warn};

use shoal_core::config::TieringConfig;
use shoal_core::{OpResult, OpStatus, ShardId};
use storage::db::Db;
use storage::value::{CompactValue, CoreType, DiskSegment};
use storage::PAGE_SIZE;

use bins::{DeleteOutcome, SealedBin, SmallBins};
use disk::{IoCompletion, IoEngine, PageAllocator};

/// Budget of one background offloading pass
const MAX_OFFLOAD_ITERATIONS: usize = 500;

/// Delivered to read callbacks: the decoded value bytes
pub type ReadCallback = Box<dyn FnOnce(OpResult<Vec<u8>>)>;

/// Counters mirrored into INFO-style reporting
#[derive(Debug, Default, Clone, Copy)]
pub struct TieredStats {
    pub total_stashes: u64,
    pub total_fetches: u64,
    pub total_cancels: u64,
    pub total_defrags: u64,
    pub stash_overflow_cnt: u64,
    pub pending_stash_cnt: usize,
    pub allocated_bytes: u64,
    pub small_bins_pending: usize,
    pub small_bin_pages: usize,
}

enum PendingOp {
    StashLarge {
        key: Bytes,
        first_page: u32,
        page_count: u32,
        stored_len: u32,
    },
    StashBin {
        first_page: u32,
        sealed: SealedBin,
    },
    Read {
        key: Bytes,
        modify_intent: bool,
        callback: ReadCallback,
    },
    DefragRead {
        page_index: u32,
    },
}

/// Per-shard tiered storage manager
pub struct TieredStorage {
    engine: IoEngine,
    pages: PageAllocator,
    bins: SmallBins,
    pending: HashMap<u64, PendingOp>,
    next_io_id: u64,
    min_value_size: usize,
    write_depth_limit: usize,
    max_file_size: u64,
    upload_on_read: bool,
    snapshot_in_progress: bool,
    offloading_cursor: u64,
    stats: TieredStats,
}

impl TieredStorage {
    pub fn open(config: &TieringConfig, shard_id: ShardId) -> Result<Self> {
        let path = PathBuf::from(format!("{}{}", config.path_prefix, shard_id));
        let engine = IoEngine::open(&path)?;
        info!(shard_id, ?path, "tiered storage enabled");
        Ok(Self {
            engine,
            pages: PageAllocator::new(),
            bins: SmallBins::new(),
            pending: HashMap::new(),
            next_io_id: 1,
            min_value_size: config.min_value_size,
            write_depth_limit: config.write_depth,
            max_file_size: config.max_file_size,
            upload_on_read: config.experimental_upload_on_read,
            snapshot_in_progress: false,
            offloading_cursor: 0,
            stats: TieredStats::default(),
        })
    }

    pub fn stats(&self) -> TieredStats {
        let mut stats = self.stats;
        stats.allocated_bytes = self.pages.allocated_bytes();
        stats.small_bins_pending = self.bins.pending_len();
        stats.small_bin_pages = self.bins.page_count();
        stats
    }

    /// Snapshot scans must not cause read-uploads that evict hot values
    pub fn set_snapshot_in_progress(&mut self, on: bool) {
        self.snapshot_in_progress = on;
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_io_id;
        self.next_io_id += 1;
        id
    }

    /// Stash eligibility for one value
    pub fn should_stash(&self, value: &CompactValue) -> bool {
        !value.is_external()
            && !value.has_io_pending()
            && value.type_of() == CoreType::String
            && value.str_len() >= self.min_value_size
            && (self.pages.allocated_bytes() + PAGE_SIZE as u64 + value.str_len() as u64)
                < self.max_file_size
    }

    /// Start offloading a value. Returns false when the value is not
    /// eligible or the write depth is saturated.
    pub fn try_stash(&mut self, db: &mut Db, key: &[u8]) -> bool {
        let stored = {
            let Some(value) = db.table.find_mut_quiet(key) else {
                return false;
            };
            if !self.should_stash(value) {
                return false;
            }
            // The integer form has no stored buffer; its disk bytes are
            // the decimal string
            match value.stored_bytes() {
                Some(stored) => stored.to_vec(),
                None => value.get_string(),
            }
        };
        if self.stats.pending_stash_cnt >= self.write_depth_limit {
            self.stats.stash_overflow_cnt += 1;
            return false;
        }

        if !SmallBins::fits_in_bin(stored.len()) {
            // Large value: its own page run, one write
            let page_count = PageAllocator::pages_for(stored.len());
            let first_page = self.pages.alloc(page_count);
            let stored_len = stored.len() as u32;
            let id = self.next_id();
            self.engine
                .submit_write(id, PageAllocator::offset_of(first_page), stored);
            self.pending.insert(
                id,
                PendingOp::StashLarge { key: Bytes::copy_from_slice(key), first_page, page_count, stored_len },
            );
            self.stats.pending_stash_cnt += 1;
        } else {
            // Small value: join the current bin; a full bin flushes as
            // one page
            let sealed = self.bins.add(Bytes::copy_from_slice(key), stored);
            if let Some(sealed) = sealed {
                self.write_sealed_bin(sealed);
            }
        }
        db.table
            .find_mut_quiet(key)
            .expect("value present")
            .set_io_pending(true);
        true
    }

    /// Force the current bin out even if it has spare room
    pub fn flush_bin(&mut self) {
        if self.bins.pending_len() > 0 {
            let sealed = self.bins.seal();
            self.write_sealed_bin(sealed);
        }
    }

    fn write_sealed_bin(&mut self, sealed: SealedBin) {
        let first_page = self.pages.alloc(1);
        let id = self.next_id();
        self.engine
            .submit_write(id, PageAllocator::offset_of(first_page), sealed.image.clone());
        self.pending
            .insert(id, PendingOp::StashBin { first_page, sealed });
        self.stats.pending_stash_cnt += 1;
    }

    /// Enqueue a read of an offloaded value. The callback receives the
    /// decoded bytes; with `modify_intent` the value is re-uploaded to
    /// memory, otherwise upload follows the cache-on-read policy.
    pub fn read(
        &mut self,
        db: &mut Db,
        key: &[u8],
        modify_intent: bool,
        callback: ReadCallback,
    ) -> bool {
        let segment = {
            let Some(value) = db.table.find(key) else {
                callback(Err(OpStatus::KeyNotFound));
                return false;
            };
            if !value.is_external() {
                callback(Err(OpStatus::KeyNotFound));
                return false;
            }
            value.external_segment()
        };
        let id = self.next_id();
        self.engine.submit_read(id, segment.offset, segment.length);
        self.pending.insert(
            id,
            PendingOp::Read { key: Bytes::copy_from_slice(key), modify_intent, callback },
        );
        self.stats.total_fetches += 1;
        true
    }

    /// Release the disk space behind a value that is leaving EXTERNAL
    /// state (delete or upload)
    fn release_segment(&mut self, key: &[u8], segment: DiskSegment, multi_page: bool) {
        if multi_page {
            let pages = segment.containing_pages();
            self.pages.free(
                (pages.offset / PAGE_SIZE as u64) as u32,
                PageAllocator::pages_for(pages.length),
            );
            return;
        }
        match self.bins.delete(key, Some(segment.page_index())) {
            DeleteOutcome::FreePage { page_index } => self.pages.free(page_index, 1),
            DeleteOutcome::Defrag { page_index } => self.schedule_defrag(page_index),
            _ => {}
        }
    }

    fn schedule_defrag(&mut self, page_index: u32) {
        let id = self.next_id();
        self.engine
            .submit_read(id, PageAllocator::offset_of(page_index), PAGE_SIZE);
        self.pending.insert(id, PendingOp::DefragRead { page_index });
        debug!(page_index, "scheduled bin defrag read");
    }

    /// Must be called before a key is erased so its disk space and any
    /// pending bin entry are reclaimed
    pub fn on_delete(&mut self, key: &[u8], value: &mut CompactValue) {
        if value.is_external() {
            let segment = value.external_segment();
            let multi = value.is_multi_page();
            self.release_segment(key, segment, multi);
            return;
        }
        if value.has_io_pending() {
            // Still pending in the current bin, or racing an in-flight
            // write that will cancel itself on completion
            if self.bins.delete(key, None) == DeleteOutcome::Pending {
                value.set_io_pending(false);
            }
        }
    }

    /// Apply every finished I/O to the table. Non-blocking.
    pub fn drain_completions(&mut self, db: &mut Db) -> usize {
        let completions = self.engine.try_completions();
        let count = completions.len();
        for completion in completions {
            self.apply_completion(db, completion);
        }
        count
    }

    /// Block for one completion and apply it (tests and shutdown drains)
    pub fn wait_and_process(&mut self, db: &mut Db) -> bool {
        match self.engine.wait_completion() {
            Some(completion) => {
                self.apply_completion(db, completion);
                true
            }
            None => false,
        }
    }

    fn apply_completion(&mut self, db: &mut Db, completion: IoCompletion) {
        let Some(op) = self.pending.remove(&completion.id()) else {
            warn!(id = completion.id(), "completion for unknown io");
            return;
        };
        match (op, completion) {
            (
                PendingOp::StashLarge { key, first_page, page_count, stored_len },
                IoCompletion::Write { result, .. },
            ) => {
                self.stats.pending_stash_cnt -= 1;
                let slot = db.table.find_mut_quiet(&key);
                match slot {
                    Some(value) if value.has_io_pending() && !value.is_external() => {
                        value.set_io_pending(false);
                        if result.is_ok() {
                            value.set_external(PageAllocator::offset_of(first_page), stored_len);
                            self.stats.total_stashes += 1;
                        } else {
                            // Stash failure: value stays resident
                            self.pages.free(first_page, page_count);
                        }
                    }
                    _ => {
                        // Deleted or overwritten while the write flew
                        self.pages.free(first_page, page_count);
                        self.stats.total_cancels += 1;
                    }
                }
            }
            (PendingOp::StashBin { first_page, sealed }, IoCompletion::Write { result, .. }) => {
                self.stats.pending_stash_cnt -= 1;
                if result.is_err() {
                    for (key, _) in &sealed.entries {
                        if let Some(value) = db.table.find_mut_quiet(key) {
                            value.set_io_pending(false);
                        }
                    }
                    self.pages.free(first_page, 1);
                    return;
                }
                self.bins.register_page(first_page, &sealed);
                for (key, sub) in &sealed.entries {
                    match db.table.find_mut_quiet(key) {
                        Some(value) if value.has_io_pending() && !value.is_external() => {
                            value.set_io_pending(false);
                            value.set_external(
                                PageAllocator::offset_of(first_page) + sub.offset_in_page as u64,
                                sub.len,
                            );
                            self.stats.total_stashes += 1;
                        }
                        _ => {
                            // Participant vanished mid-flight
                            self.stats.total_cancels += 1;
                            match self.bins.delete(key, Some(first_page)) {
                                DeleteOutcome::FreePage { page_index } => {
                                    self.pages.free(page_index, 1)
                                }
                                DeleteOutcome::Defrag { page_index } => {
                                    self.schedule_defrag(page_index)
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }
            (
                PendingOp::Read { key, modify_intent, callback },
                IoCompletion::Read { result, .. },
            ) => {
                let raw = match result {
                    Ok(raw) => raw,
                    Err(e) => {
                        callback(Err(OpStatus::InvalidArgument(e.to_string())));
                        return;
                    }
                };
                let Some(value) = db.table.find_mut_quiet(&key) else {
                    // Raced delete; deliberately non-fatal
                    warn!(?key, "value deleted during tiered read");
                    self.stats.total_cancels += 1;
                    callback(Err(OpStatus::KeyNotFound));
                    return;
                };
                if !value.is_external() {
                    warn!(?key, "value replaced during tiered read");
                    self.stats.total_cancels += 1;
                    callback(Err(OpStatus::KeyNotFound));
                    return;
                }
                let decoded = value.decode_raw(&raw);
                let upload =
                    modify_intent || (self.upload_on_read && !self.snapshot_in_progress);
                if upload {
                    let segment = value.external_segment();
                    let multi = value.is_multi_page();
                    value.materialize(&raw, true);
                    self.release_segment(&key, segment, multi);
                }
                callback(Ok(decoded));
            }
            (PendingOp::DefragRead { page_index }, IoCompletion::Read { result, .. }) => {
                let image = match result {
                    Ok(image) => image,
                    Err(e) => {
                        warn!(page_index, "defrag read failed: {e}");
                        return;
                    }
                };
                if let Some(expected) = self.bins.page_checksum(page_index) {
                    if crc32fast::hash(&image) != expected {
                        warn!(page_index, "bin page checksum mismatch on defrag");
                    }
                }
                let live = self.bins.extract_live(page_index, &image);
                for (key, data) in live {
                    match db.table.find_mut_quiet(&key) {
                        Some(value)
                            if value.is_external()
                                && value.external_segment().page_index() == page_index =>
                        {
                            value.materialize(&data, true);
                        }
                        _ => {
                            self.stats.total_cancels += 1;
                        }
                    }
                }
                self.pages.free(page_index, 1);
                self.stats.total_defrags += 1;
            }
            _ => unreachable!("completion kind does not match pending op"),
        }
    }

    /// Background offloading pass: walk the table from the cursor and
    /// stash eligible values until the write depth saturates or the
    /// iteration budget runs out
    pub fn run_offloading(&mut self, db: &mut Db) -> usize {
        // Leave headroom so the pass cannot run the file into its cap
        if self.pages.allocated_bytes()
            + (MAX_OFFLOAD_ITERATIONS as u64 / 2) * PAGE_SIZE as u64
            > self.max_file_size
        {
            return 0;
        }
        let bucket_count = db.table.bucket_count() as u64;
        let start = self.offloading_cursor % bucket_count;
        let mut cursor = start;
        let mut iterations = 0;
        let mut candidates: Vec<Bytes> = Vec::new();
        loop {
            let bucket = db.table.bucket(cursor as usize);
            for (key, value) in bucket.entries() {
                if self.should_stash(value) {
                    candidates.push(key.clone());
                }
            }
            cursor = (cursor + 1) % bucket_count;
            iterations += 1;
            if cursor == start || iterations >= MAX_OFFLOAD_ITERATIONS {
                break;
            }
            if self.stats.pending_stash_cnt + candidates.len() >= self.write_depth_limit {
                break;
            }
        }
        self.offloading_cursor = cursor;

        let mut stashed = 0;
        for key in candidates {
            if self.stats.pending_stash_cnt >= self.write_depth_limit {
                break;
            }
            if self.try_stash(db, &key) {
                stashed += 1;
            }
        }
        if cursor == start {
            // Finished a full sweep; push out whatever the bin holds
            self.flush_bin();
        }
        stashed
    }
}
