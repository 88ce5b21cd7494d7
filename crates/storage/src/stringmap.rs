//! Open-addressed string map
//!
//! Field → value table with linear probing, tombstone deletion and
//! power-of-two capacity. Each entry may carry an absolute expiry in
//! epoch milliseconds; expired entries are filtered on read and reaped
//! on the mutable paths. The slot array is directly indexable, which is
//! what gives SCAN its bounded-work cursor.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

const INITIAL_CAPACITY: usize = 8;

#[derive(Debug, Clone)]
pub struct MapEntry {
    pub field: Box<[u8]>,
    pub value: Vec<u8>,
    /// Absolute expiry in epoch milliseconds
    pub expires_at: Option<u64>,
}

impl MapEntry {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now_ms)
    }
}

#[derive(Debug, Clone, Default)]
enum Slot {
    #[default]
    Empty,
    Tombstone,
    Full(MapEntry),
}

/// Open-addressed field→value table with per-field expiry
#[derive(Debug, Clone)]
pub struct StringMap {
    slots: Vec<Slot>,
    live: usize,
    tombstones: usize,
    /// Entries carrying an expiry; zero keeps len() O(1)
    ttl_entries: usize,
}

fn hash_of(field: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(field);
    hasher.finish()
}

impl Default for StringMap {
    fn default() -> Self {
        Self::new()
    }
}

impl StringMap {
    pub fn new() -> Self {
        Self {
            slots: (0..INITIAL_CAPACITY).map(|_| Slot::Empty).collect(),
            live: 0,
            tombstones: 0,
            ttl_entries: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Live entries, ignoring expiry. Use `len(now)` for the user-visible
    /// count.
    pub fn raw_len(&self) -> usize {
        self.live
    }

    /// User-visible entry count at `now_ms`
    pub fn len(&self, now_ms: u64) -> usize {
        if self.ttl_entries == 0 {
            return self.live;
        }
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Full(e) if !e.is_expired(now_ms)))
            .count()
    }

    pub fn is_empty(&self, now_ms: u64) -> bool {
        self.len(now_ms) == 0
    }

    fn probe(&self, field: &[u8]) -> Option<usize> {
        let mask = self.slots.len() - 1;
        let mut at = (hash_of(field) as usize) & mask;
        loop {
            match &self.slots[at] {
                Slot::Empty => return None,
                Slot::Full(entry) if &*entry.field == field => return Some(at),
                _ => at = (at + 1) & mask,
            }
        }
    }

    /// Insert or replace. Returns true if the field was newly created
    /// (an expired entry counts as absent).
    pub fn insert(
        &mut self,
        field: &[u8],
        value: Vec<u8>,
        expires_at: Option<u64>,
        now_ms: u64,
    ) -> bool {
        self.maybe_grow();
        let mask = self.slots.len() - 1;
        let mut at = (hash_of(field) as usize) & mask;
        let mut first_gap: Option<usize> = None;
        loop {
            match &mut self.slots[at] {
                Slot::Empty => break,
                Slot::Tombstone => {
                    first_gap.get_or_insert(at);
                    at = (at + 1) & mask;
                }
                Slot::Full(entry) if &*entry.field == field => {
                    let was_expired = entry.is_expired(now_ms);
                    if entry.expires_at.is_some() {
                        self.ttl_entries -= 1;
                    }
                    entry.value = value;
                    entry.expires_at = expires_at;
                    if expires_at.is_some() {
                        self.ttl_entries += 1;
                    }
                    return was_expired;
                }
                Slot::Full(_) => at = (at + 1) & mask,
            }
        }
        let target = match first_gap {
            Some(gap) => {
                self.tombstones -= 1;
                gap
            }
            None => at,
        };
        self.slots[target] = Slot::Full(MapEntry {
            field: field.into(),
            value,
            expires_at,
        });
        self.live += 1;
        if expires_at.is_some() {
            self.ttl_entries += 1;
        }
        true
    }

    pub fn get(&self, field: &[u8], now_ms: u64) -> Option<&MapEntry> {
        match self.probe(field) {
            Some(at) => match &self.slots[at] {
                Slot::Full(entry) if !entry.is_expired(now_ms) => Some(entry),
                _ => None,
            },
            None => None,
        }
    }

    pub fn get_mut(&mut self, field: &[u8], now_ms: u64) -> Option<&mut MapEntry> {
        let at = self.probe(field)?;
        // Reap an expired entry on the mutable path
        if matches!(&self.slots[at], Slot::Full(e) if e.is_expired(now_ms)) {
            self.clear_slot(at);
            return None;
        }
        match &mut self.slots[at] {
            Slot::Full(entry) => Some(entry),
            _ => None,
        }
    }

    /// Remove a field. Expired entries count as absent but are reaped.
    pub fn remove(&mut self, field: &[u8], now_ms: u64) -> bool {
        match self.probe(field) {
            Some(at) => {
                let expired = matches!(&self.slots[at], Slot::Full(e) if e.is_expired(now_ms));
                self.clear_slot(at);
                !expired
            }
            None => false,
        }
    }

    fn clear_slot(&mut self, at: usize) {
        if let Slot::Full(entry) = &self.slots[at] {
            if entry.expires_at.is_some() {
                self.ttl_entries -= 1;
            }
            self.live -= 1;
            self.tombstones += 1;
            self.slots[at] = Slot::Tombstone;
        }
    }

    /// Drop every expired entry
    pub fn expire_sweep(&mut self, now_ms: u64) {
        if self.ttl_entries == 0 {
            return;
        }
        for at in 0..self.slots.len() {
            if matches!(&self.slots[at], Slot::Full(e) if e.is_expired(now_ms)) {
                self.clear_slot(at);
            }
        }
    }

    /// Live entries at `now_ms`
    pub fn iter(&self, now_ms: u64) -> impl Iterator<Item = &MapEntry> {
        self.slots.iter().filter_map(move |slot| match slot {
            Slot::Full(entry) if !entry.is_expired(now_ms) => Some(entry),
            _ => None,
        })
    }

    /// Walk at most `max_slots` slots from the cursor; returns the next
    /// cursor (0 when the walk wrapped) and the live entries seen
    pub fn scan(&self, cursor: u64, max_slots: usize, now_ms: u64) -> (u64, Vec<&MapEntry>) {
        let cap = self.slots.len();
        let mut at = cursor as usize;
        if at >= cap {
            return (0, Vec::new());
        }
        let mut out = Vec::new();
        let mut walked = 0;
        while at < cap && walked < max_slots {
            if let Slot::Full(entry) = &self.slots[at] {
                if !entry.is_expired(now_ms) {
                    out.push(entry);
                }
            }
            at += 1;
            walked += 1;
        }
        let next = if at >= cap { 0 } else { at as u64 };
        (next, out)
    }

    fn maybe_grow(&mut self) {
        if (self.live + self.tombstones) * 4 < self.slots.len() * 3 {
            return;
        }
        let new_cap = self.slots.len() * 2;
        let old = std::mem::replace(
            &mut self.slots,
            (0..new_cap).map(|_| Slot::Empty).collect(),
        );
        self.live = 0;
        self.tombstones = 0;
        self.ttl_entries = 0;
        for slot in old {
            if let Slot::Full(entry) = slot {
                self.reinsert(entry);
            }
        }
    }

    fn reinsert(&mut self, entry: MapEntry) {
        let mask = self.slots.len() - 1;
        let mut at = (hash_of(&entry.field) as usize) & mask;
        while matches!(self.slots[at], Slot::Full(_)) {
            at = (at + 1) & mask;
        }
        if entry.expires_at.is_some() {
            self.ttl_entries += 1;
        }
        self.live += 1;
        self.slots[at] = Slot::Full(entry);
    }
}
