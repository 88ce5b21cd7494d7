//! Change journal and replication streamers
//!
//! The journal distributes change records to registered subscribers on
//! the owning shard. Streamers subscribe and forward serialized entries
//! to a network sink with back-pressure; the restore streamer adds a
//! snapshot-versioned table traversal for slot migration.

pub mod restore;
pub mod streamer;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use shoal_core::SlotId;

pub use restore::RestoreStreamer;
pub use streamer::{JournalStreamer, StreamerConfig, ThrottleHandle};

/// Journal opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Command,
    Lsn,
}

/// One change record as seen by subscribers
#[derive(Debug, Clone)]
pub struct JournalItem {
    pub lsn: u64,
    pub opcode: Op,
    /// Slot of the affected key, when the change is key-scoped
    pub slot: Option<SlotId>,
    /// Primary command name, e.g. "SET" or "FLUSHALL"
    pub cmd: String,
    /// Serialized wire entry
    pub data: Bytes,
}

/// Entry as written to a replication sink. Framed with a u32 length
/// prefix so a receiver can split the byte stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireEntry {
    Command { args: Vec<Vec<u8>> },
    Lsn(u64),
}

/// Encode one framed entry
pub fn encode_entry(entry: &WireEntry) -> Vec<u8> {
    let body = bincode::serialize(entry).expect("wire entry serializes");
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

/// Split a byte stream back into entries (receiver side and tests)
pub fn decode_entries(mut data: &[u8]) -> Vec<WireEntry> {
    let mut out = Vec::new();
    while data.len() >= 4 {
        let len = u32::from_le_bytes(data[..4].try_into().unwrap()) as usize;
        if data.len() < 4 + len {
            break;
        }
        if let Ok(entry) = bincode::deserialize(&data[4..4 + len]) {
            out.push(entry);
        }
        data = &data[4 + len..];
    }
    out
}

type ChangeFn = Box<dyn FnMut(&JournalItem)>;

/// Per-shard change journal with an on-change subscriber list
#[derive(Default)]
pub struct Journal {
    next_lsn: u64,
    subscribers: Vec<(u32, ChangeFn)>,
    next_sub_id: u32,
}

impl Journal {
    pub fn new() -> Self {
        Self { next_lsn: 0, subscribers: Vec::new(), next_sub_id: 1 }
    }

    pub fn lsn(&self) -> u64 {
        self.next_lsn
    }

    /// Subscribe to future changes
    pub fn register_on_change(&mut self, callback: ChangeFn) -> u32 {
        let id = self.next_sub_id;
        self.next_sub_id += 1;
        self.subscribers.push((id, callback));
        id
    }

    /// Unsubscribe; unknown ids are ignored so cancel paths can be
    /// idempotent
    pub fn unregister_on_change(&mut self, id: u32) {
        self.subscribers.retain(|(sub_id, _)| *sub_id != id);
    }

    /// Record a command change and fan it out to subscribers
    pub fn record(&mut self, cmd: &str, slot: Option<SlotId>, args: Vec<Vec<u8>>) -> u64 {
        self.next_lsn += 1;
        let item = JournalItem {
            lsn: self.next_lsn,
            opcode: Op::Command,
            slot,
            cmd: cmd.to_string(),
            data: Bytes::from(encode_entry(&WireEntry::Command { args })),
        };
        // Subscribers may unregister reentrantly through their own
        // handles; take the list for the duration of the fan-out
        let mut subscribers = std::mem::take(&mut self.subscribers);
        for (_, callback) in subscribers.iter_mut() {
            callback(&item);
        }
        subscribers.extend(std::mem::take(&mut self.subscribers));
        self.subscribers = subscribers;
        self.next_lsn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_entry_framing_roundtrip() {
        let entries = vec![
            WireEntry::Command { args: vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()] },
            WireEntry::Lsn(42),
            WireEntry::Command { args: vec![b"DEL".to_vec(), b"k".to_vec()] },
        ];
        let mut stream = Vec::new();
        for entry in &entries {
            stream.extend_from_slice(&encode_entry(entry));
        }
        assert_eq!(decode_entries(&stream), entries);
        // Truncated tail decodes the complete prefix only
        assert_eq!(decode_entries(&stream[..stream.len() - 3]).len(), 2);
    }

    #[test]
    fn test_journal_fanout_and_lsn() {
        let mut journal = Journal::new();
        let seen: Rc<RefCell<Vec<u64>>> = Rc::default();
        let seen_cb = seen.clone();
        let id = journal.register_on_change(Box::new(move |item| {
            seen_cb.borrow_mut().push(item.lsn);
        }));

        assert_eq!(journal.record("SET", Some(11), vec![b"SET".to_vec()]), 1);
        assert_eq!(journal.record("DEL", Some(11), vec![b"DEL".to_vec()]), 2);
        assert_eq!(*seen.borrow(), vec![1, 2]);

        journal.unregister_on_change(id);
        journal.unregister_on_change(id); // idempotent
        journal.record("SET", None, vec![]);
        assert_eq!(seen.borrow().len(), 2);
    }
}
