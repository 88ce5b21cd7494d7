//! Slot migration streamer
//!
//! Extends the journal streamer with a snapshot-versioned traversal of
//! the prime table. Registration captures a snapshot version; the
//! traversal emits `RESTORE key ttl_ms dump ABSTTL [STICK]` for every
//! pre-snapshot bucket entry whose slot is outgoing, bumping the bucket
//! version as it goes. Any mutation of a pre-snapshot bucket first runs
//! the registered change callback, which flushes the bucket before its
//! contents change — so every migrated key is emitted at least once and
//! the receiver observes the final state of interleaved mutations.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

use shoal_core::error::literals;
use shoal_core::{slot_for_key, OpStatus, RunContext, SlotSet};
use storage::db::{Db, ExpireTable};
use storage::table::Bucket;
use storage::{dump_value, CompactValue};

use crate::streamer::{JournalStreamer, StreamerConfig};
use crate::{Journal, JournalItem, WireEntry};

/// Buckets visited between cooperative yields
const YIELD_EVERY: u64 = 100;

/// Migration streamer for an outgoing slot set
pub struct RestoreStreamer {
    streamer: Rc<RefCell<JournalStreamer>>,
    slots: Rc<SlotSet>,
    snapshot_version: Rc<Cell<u64>>,
    expire: ExpireTable,
    ctx: RunContext,
    cancelled: Rc<Cell<bool>>,
    table_cb_id: Option<u64>,
    journal_cb_id: Option<u32>,
}

impl RestoreStreamer {
    /// Register against the table and the journal and capture the
    /// snapshot version. Must run on the owning shard.
    pub fn start(
        db: &mut Db,
        journal: &mut Journal,
        slots: SlotSet,
        sink: Box<dyn AsyncWrite + Unpin>,
        ctx: RunContext,
        config: StreamerConfig,
    ) -> Self {
        let streamer = Rc::new(RefCell::new(JournalStreamer::new(sink, ctx.clone(), config)));
        let slots = Rc::new(slots);
        let snapshot_version = Rc::new(Cell::new(u64::MAX));
        let cancelled = Rc::new(Cell::new(false));
        let expire = db.expire_handle();

        // Pre-mutation flush: a bucket still below the snapshot version
        // is written out before its contents may change
        let table_cb_id = {
            let streamer = streamer.clone();
            let slots = slots.clone();
            let snapshot = snapshot_version.clone();
            let expire = expire.clone();
            let (id, version) = db.table.register_on_change(Box::new(move |bucket| {
                write_bucket(bucket, snapshot.get(), &slots, &streamer, &expire);
            }));
            snapshot_version.set(version);
            id
        };

        // Live mutations in the outgoing slots stream behind the
        // snapshot entries
        let journal_cb_id = {
            let streamer = streamer.clone();
            let slots = slots.clone();
            let ctx = ctx.clone();
            journal.register_on_change(Box::new(move |item: &JournalItem| {
                if item.cmd == "FLUSHALL" || item.cmd == "FLUSHDB" {
                    // On FLUSH* the migration restarts from scratch
                    warn!("flush while migration in progress, aborting stream");
                    ctx.report_error(OpStatus::InvalidArgument(
                        literals::FLUSH_DURING_MIGRATION.to_string(),
                    ));
                    streamer.borrow_mut().abort();
                    return;
                }
                let Some(slot) = item.slot else { return };
                if !slots.contains(slot) {
                    return;
                }
                let mut streamer = streamer.borrow_mut();
                streamer.write(&item.data);
                streamer.write_lsn_if_due(item.lsn);
            }))
        };

        info!(
            snapshot = snapshot_version.get(),
            slots = slots.slot_count(),
            "restore streamer started"
        );
        Self {
            streamer,
            slots,
            snapshot_version,
            expire,
            ctx,
            cancelled,
            table_cb_id: Some(table_cb_id),
            journal_cb_id: Some(journal_cb_id),
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Traverse the whole table, emitting pre-snapshot buckets. Yields
    /// every few buckets and throttles whenever data was written.
    pub async fn run(&self, db: &Rc<RefCell<Db>>) {
        debug!("restore streamer traversal starting");
        let throttle = self.streamer.borrow().throttle_handle();
        let mut cursor = 0u64;
        let mut since_yield = 0u64;
        loop {
            if self.cancelled.get() || self.ctx.is_cancelled() {
                return;
            }
            let mut written = false;
            let next = {
                let mut db = db.borrow_mut();
                let snapshot = self.snapshot_version.get();
                let slots = &self.slots;
                let streamer = &self.streamer;
                let expire = &self.expire;
                db.table.traverse(cursor, |bucket| {
                    written = write_bucket(bucket, snapshot, slots, streamer, expire);
                })
            };
            if written {
                throttle.throttle_if_needed().await;
            }
            since_yield += 1;
            if since_yield >= YIELD_EVERY {
                since_yield = 0;
                tokio::task::yield_now().await;
            }
            match next {
                Some(c) => cursor = c,
                None => break,
            }
        }
        self.send_finalize(0).await;
    }

    /// Emit a trailing LSN marker and let the sink drain
    pub async fn send_finalize(&self, attempt: u64) {
        let throttle = {
            let mut streamer = self.streamer.borrow_mut();
            streamer.write_entry(&WireEntry::Lsn(attempt));
            streamer.throttle_handle()
        };
        throttle.throttle_if_needed().await;
    }

    /// Unregister everything and wait for in-flight writes. Idempotent:
    /// a second cancel (or a cancel racing the traversal) finds the
    /// callback ids already taken.
    pub async fn cancel(&mut self, db: &mut Db, journal: &mut Journal) {
        self.cancelled.set(true);
        if let Some(id) = self.table_cb_id.take() {
            db.table.unregister_on_change(id);
        }
        if let Some(id) = self.journal_cb_id.take() {
            journal.unregister_on_change(id);
        }
        let handle = {
            let mut streamer = self.streamer.borrow_mut();
            streamer.begin_close();
            streamer.throttle_handle()
        };
        while handle.in_flight_bytes() > 0 {
            handle.wait_event().await;
        }
        let writer = self.streamer.borrow_mut().take_writer();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        debug!("restore streamer cancelled");
    }
}

/// Emit every outgoing entry of a pre-snapshot bucket, then stamp the
/// bucket with the snapshot version. Returns whether anything was
/// written.
fn write_bucket(
    bucket: &mut Bucket,
    snapshot: u64,
    slots: &SlotSet,
    streamer: &Rc<RefCell<JournalStreamer>>,
    expire: &ExpireTable,
) -> bool {
    if bucket.version() >= snapshot {
        return false;
    }
    bucket.set_version(snapshot);
    let mut written = false;
    for (key, value) in bucket.entries() {
        if !slots.contains(slot_for_key(key)) {
            continue;
        }
        let expire_ms = expire.borrow().get(key).copied().unwrap_or(0);
        match restore_payload(key, value, expire_ms) {
            Some(entry) => {
                streamer.borrow_mut().write_entry(&entry);
                written = true;
            }
            None => warn!(?key, "skipping non-serializable value in migration"),
        }
    }
    written
}

/// `RESTORE key ttl_ms dump ABSTTL [STICK]`
fn restore_payload(key: &[u8], value: &CompactValue, expire_ms: u64) -> Option<WireEntry> {
    let dump = dump_value(value, 0).ok()?;
    let mut args = vec![
        b"RESTORE".to_vec(),
        key.to_vec(),
        expire_ms.to_string().into_bytes(),
        dump,
        // The expire argument is an absolute epoch time
        b"ABSTTL".to_vec(),
    ];
    if value.is_sticky() {
        args.push(b"STICK".to_vec());
    }
    Some(WireEntry::Command { args })
}

#[cfg(test)]
#[path = "restore_tests.rs"]
mod tests;
