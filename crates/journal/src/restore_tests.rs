//! Migration streaming scenarios: snapshot traversal, interleaved
//! mutations, slot filtering and flush aborts.

use super::*;
use std::collections::HashMap;
use std::future::Future;

use tokio::io::AsyncReadExt;

use shoal_core::SlotSet;
use storage::db::DbLimits;
use storage::hash::HSetFlags;
use storage::zset::ZAddFlags;
use storage::{load_value, restore_into};

use crate::decode_entries;

fn run_local<F: Future>(f: F) -> F::Output {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, f)
}

fn new_db() -> Rc<RefCell<Db>> {
    Rc::new(RefCell::new(Db::new(DbLimits::default())))
}

/// Replay a migration byte stream onto an empty keyspace
fn replay(stream: &[u8]) -> Db {
    let mut db = Db::new(DbLimits::default());
    for entry in decode_entries(stream) {
        let WireEntry::Command { args } = entry else { continue };
        if args[0] != b"RESTORE" {
            continue;
        }
        let key = &args[1];
        let ttl_ms: u64 = std::str::from_utf8(&args[2]).unwrap().parse().unwrap();
        let dump = load_value(&args[3]).unwrap();
        let sticky = args.iter().any(|a| a == b"STICK");
        let expire = (ttl_ms > 0).then_some(ttl_ms);
        restore_into(&mut db, key, dump, expire, sticky, 0).unwrap();
    }
    db
}

/// Dump every key of a keyspace for comparison
fn keyspace_dumps(db: &Db, slots: &SlotSet) -> HashMap<Vec<u8>, Vec<u8>> {
    db.table
        .iter()
        .filter(|(key, _)| slots.contains(slot_for_key(key)))
        .map(|(key, value)| (key.to_vec(), dump_value(value, 0).unwrap()))
        .collect()
}

/// Stream the mutated state of a key as a live journal record, the way
/// command replication does during a migration
fn record_live_state(db: &Db, journal: &mut Journal, key: &[u8]) {
    let dump = dump_value(db.table.find(key).unwrap(), 0).unwrap();
    let args = vec![
        b"RESTORE".to_vec(),
        key.to_vec(),
        b"0".to_vec(),
        dump,
        b"ABSTTL".to_vec(),
    ];
    journal.record("SET", Some(slot_for_key(key)), args);
}

#[test]
fn test_migration_replay_matches_source() {
    run_local(async {
        let db = new_db();
        {
            let mut db = db.borrow_mut();
            for i in 0..60 {
                db.set_string(format!("key-{i}").as_bytes(), format!("value-{i}").as_bytes());
            }
            db.hset(b"hash-key", &[(b"f1", b"v1"), (b"f2", b"v2")], HSetFlags::default(), 0)
                .unwrap();
            db.zadd(
                b"zset-key",
                &[(1.5, b"a"), (2.5, b"b")],
                ZAddFlags::default(),
                false,
                0,
            )
            .unwrap();
            db.set_key_expire_ms(b"key-7", Some(12_345_678));
        }

        let mut journal = Journal::new();
        let (client, mut server) = tokio::io::duplex(1 << 20);
        let ctx = RunContext::new();
        let mut streamer = RestoreStreamer::start(
            &mut db.borrow_mut(),
            &mut journal,
            SlotSet::full(),
            Box::new(client),
            ctx.clone(),
            StreamerConfig::default(),
        );

        // Mutations after the snapshot: the touched buckets flush their
        // pre-mutation state first, the new state follows on the live
        // channel
        {
            let mut dbm = db.borrow_mut();
            dbm.set_string(b"key-3", b"mutated after snapshot");
            record_live_state(&dbm, &mut journal, b"key-3");
            dbm.set_string(b"brand-new", b"created during migration");
            record_live_state(&dbm, &mut journal, b"brand-new");
        }

        streamer.run(&db).await;
        streamer.cancel(&mut db.borrow_mut(), &mut journal).await;
        assert!(ctx.error().is_none());

        let mut stream = Vec::new();
        server.read_to_end(&mut stream).await.unwrap();
        let replayed = replay(&stream);

        let source = db.borrow();
        let expected = keyspace_dumps(&source, &SlotSet::full());
        let got = keyspace_dumps(&replayed, &SlotSet::full());
        assert_eq!(got.len(), expected.len());
        assert_eq!(got, expected);
        // Key-level TTL travels through ABSTTL
        assert_eq!(replayed.key_expire_ms(b"key-7"), Some(12_345_678));
        assert_eq!(
            replayed.get_string(b"key-3").unwrap(),
            storage::StringFetch::Resident(b"mutated after snapshot".to_vec())
        );
    });
}

#[test]
fn test_slot_filtering() {
    run_local(async {
        let db = new_db();
        let keys: Vec<Vec<u8>> = (0..40).map(|i| format!("key-{i}").into_bytes()).collect();
        {
            let mut db = db.borrow_mut();
            for key in &keys {
                db.set_string(key, b"v");
            }
        }
        // Migrate only the slots of the even keys
        let ranges: Vec<(u32, u32)> = keys
            .iter()
            .step_by(2)
            .map(|k| {
                let slot = slot_for_key(k);
                (slot, slot)
            })
            .collect();
        let slots = SlotSet::from_ranges(ranges);

        let mut journal = Journal::new();
        let (client, mut server) = tokio::io::duplex(1 << 20);
        let mut streamer = RestoreStreamer::start(
            &mut db.borrow_mut(),
            &mut journal,
            slots.clone(),
            Box::new(client),
            RunContext::new(),
            StreamerConfig::default(),
        );
        streamer.run(&db).await;
        streamer.cancel(&mut db.borrow_mut(), &mut journal).await;

        let mut stream = Vec::new();
        server.read_to_end(&mut stream).await.unwrap();
        let replayed = replay(&stream);

        for key in &keys {
            let in_set = slots.contains(slot_for_key(key));
            assert_eq!(replayed.table.contains(key), in_set, "key {key:?}");
        }
    });
}

#[test]
fn test_sticky_marker_travels() {
    run_local(async {
        let db = new_db();
        {
            let mut db = db.borrow_mut();
            db.set_string(b"pinned", b"v");
            db.table.find_mut_quiet(b"pinned").unwrap().set_sticky(true);
        }
        let mut journal = Journal::new();
        let (client, mut server) = tokio::io::duplex(1 << 20);
        let mut streamer = RestoreStreamer::start(
            &mut db.borrow_mut(),
            &mut journal,
            SlotSet::full(),
            Box::new(client),
            RunContext::new(),
            StreamerConfig::default(),
        );
        streamer.run(&db).await;
        streamer.cancel(&mut db.borrow_mut(), &mut journal).await;

        let mut stream = Vec::new();
        server.read_to_end(&mut stream).await.unwrap();
        let replayed = replay(&stream);
        assert!(replayed.table.find(b"pinned").unwrap().is_sticky());
    });
}

#[test]
fn test_flush_during_migration_aborts() {
    run_local(async {
        let db = new_db();
        db.borrow_mut().set_string(b"k", b"v");
        let mut journal = Journal::new();
        let (client, _server) = tokio::io::duplex(1 << 20);
        let ctx = RunContext::new();
        let mut streamer = RestoreStreamer::start(
            &mut db.borrow_mut(),
            &mut journal,
            SlotSet::full(),
            Box::new(client),
            ctx.clone(),
            StreamerConfig::default(),
        );

        journal.record("FLUSHALL", None, vec![b"FLUSHALL".to_vec()]);
        assert!(ctx.is_cancelled());
        assert_eq!(
            ctx.error().unwrap().to_string(),
            "FLUSH command during migration"
        );
        streamer.cancel(&mut db.borrow_mut(), &mut journal).await;
    });
}

#[test]
fn test_cancel_is_idempotent() {
    run_local(async {
        let db = new_db();
        db.borrow_mut().set_string(b"k", b"v");
        let mut journal = Journal::new();
        let (client, _server) = tokio::io::duplex(1 << 20);
        let mut streamer = RestoreStreamer::start(
            &mut db.borrow_mut(),
            &mut journal,
            SlotSet::full(),
            Box::new(client),
            RunContext::new(),
            StreamerConfig::default(),
        );
        streamer.cancel(&mut db.borrow_mut(), &mut journal).await;
        streamer.cancel(&mut db.borrow_mut(), &mut journal).await;

        // Mutations after cancel fire no stale callbacks
        db.borrow_mut().set_string(b"k", b"v2");
    });
}

#[test]
fn test_mutation_before_traversal_not_lost() {
    run_local(async {
        let db = new_db();
        {
            let mut db = db.borrow_mut();
            db.set_string(b"stable", b"untouched");
            db.set_string(b"victim", b"original");
        }
        let mut journal = Journal::new();
        let (client, mut server) = tokio::io::duplex(1 << 20);
        let mut streamer = RestoreStreamer::start(
            &mut db.borrow_mut(),
            &mut journal,
            SlotSet::full(),
            Box::new(client),
            RunContext::new(),
            StreamerConfig::default(),
        );

        // Delete before the traversal reaches the bucket: the flush-
        // before-mutation callback emits the old value, the live record
        // of the delete is what a real migration would append. Here the
        // key simply disappears with no live record, so the replay keeps
        // the flushed copy — at-least-once, resolved by the live stream.
        {
            let mut dbm = db.borrow_mut();
            dbm.set_string(b"victim", b"rewritten");
            record_live_state(&dbm, &mut journal, b"victim");
        }

        streamer.run(&db).await;
        streamer.cancel(&mut db.borrow_mut(), &mut journal).await;

        let mut stream = Vec::new();
        server.read_to_end(&mut stream).await.unwrap();

        // The pre-mutation copy was flushed, the rewritten copy followed
        let restores: Vec<WireEntry> = decode_entries(&stream)
            .into_iter()
            .filter(|e| matches!(e, WireEntry::Command { args } if args[1] == b"victim"))
            .collect();
        assert_eq!(restores.len(), 2);

        let replayed = replay(&stream);
        assert_eq!(
            replayed.get_string(b"victim").unwrap(),
            storage::StringFetch::Resident(b"rewritten".to_vec())
        );
    });
}
