//! Hash container
//!
//! Field→value map with two encodings: a packed listpack of alternating
//! field,value entries for small containers, and an open-addressed string
//! map with per-field expiry once the container crosses the configured
//! thresholds or any field asks for a TTL. The upgrade is one-way; a map
//! container never converts back.

use rand::seq::index::sample;
use rand::Rng;

use shoal_core::error::literals;
use shoal_core::{OpResult, OpStatus};

use crate::listpack::Listpack;
use crate::num::{format_double, parse_double};
use crate::pattern::glob_match;
use crate::stringmap::StringMap;
use crate::value::parse_canonical_int;

/// Listpack thresholds; crossing either converts the container
#[derive(Debug, Clone, Copy)]
pub struct HashLimits {
    /// Max field/value byte length for the packed form
    pub max_value_len: usize,
    /// Max listpack buffer size in bytes
    pub max_pack_bytes: usize,
}

impl Default for HashLimits {
    fn default() -> Self {
        Self { max_value_len: 64, max_pack_bytes: 1024 }
    }
}

/// Insert behavior flags
#[derive(Debug, Clone, Copy, Default)]
pub struct HSetFlags {
    /// HSETNX: keep an existing field untouched
    pub skip_if_exists: bool,
    /// Absolute expiry in epoch milliseconds for the written field
    pub ttl_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashEncoding {
    Pack = 0,
    Map = 1,
}

#[derive(Debug, Clone)]
enum Repr {
    Pack(Listpack),
    Map(StringMap),
}

/// Field→value container with dual encoding and field TTL
#[derive(Debug, Clone)]
pub struct HashContainer {
    repr: Repr,
}

impl Default for HashContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl HashContainer {
    pub fn new() -> Self {
        Self { repr: Repr::Pack(Listpack::new()) }
    }

    pub fn with_map_encoding() -> Self {
        Self { repr: Repr::Map(StringMap::new()) }
    }

    pub fn encoding(&self) -> HashEncoding {
        match &self.repr {
            Repr::Pack(_) => HashEncoding::Pack,
            Repr::Map(_) => HashEncoding::Map,
        }
    }

    pub fn encoding_bits(&self) -> u8 {
        self.encoding() as u8
    }

    /// Find the pair index of `field` in the packed form
    fn pack_find(lp: &Listpack, field: &[u8]) -> Option<usize> {
        lp.pairs().position(|(f, _)| f == field)
    }

    fn fits_pack(lp: &Listpack, field: &[u8], value: &[u8], limits: &HashLimits) -> bool {
        field.len() <= limits.max_value_len
            && value.len() <= limits.max_value_len
            && lp.num_bytes() + Listpack::entry_cost(field.len()) + Listpack::entry_cost(value.len())
                < limits.max_pack_bytes
    }

    /// One-way conversion to the map encoding
    fn upgrade_to_map(&mut self, now_ms: u64) {
        if let Repr::Pack(lp) = &self.repr {
            let mut map = StringMap::new();
            for (field, value) in lp.pairs() {
                map.insert(field, value.to_vec(), None, now_ms);
            }
            self.repr = Repr::Map(map);
        }
    }

    /// Insert or replace a field. Returns true if the field was created.
    pub fn set(
        &mut self,
        field: &[u8],
        value: &[u8],
        flags: HSetFlags,
        limits: &HashLimits,
        now_ms: u64,
    ) -> bool {
        if let Repr::Pack(lp) = &mut self.repr {
            if flags.ttl_at.is_none() && Self::fits_pack(lp, field, value, limits) {
                return match Self::pack_find(lp, field) {
                    Some(pair) => {
                        if !flags.skip_if_exists {
                            lp.replace(pair * 2 + 1, value);
                        }
                        false
                    }
                    None => {
                        lp.push(field);
                        lp.push(value);
                        true
                    }
                };
            }
            self.upgrade_to_map(now_ms);
        }
        let Repr::Map(map) = &mut self.repr else { unreachable!() };
        if flags.skip_if_exists && map.get(field, now_ms).is_some() {
            return false;
        }
        map.insert(field, value.to_vec(), flags.ttl_at, now_ms)
    }

    pub fn get(&self, field: &[u8], now_ms: u64) -> Option<Vec<u8>> {
        match &self.repr {
            Repr::Pack(lp) => lp
                .pairs()
                .find(|(f, _)| *f == field)
                .map(|(_, v)| v.to_vec()),
            Repr::Map(map) => map.get(field, now_ms).map(|e| e.value.clone()),
        }
    }

    /// Batch get; the packed form is resolved in a single forward pass
    pub fn mget(&self, fields: &[&[u8]], now_ms: u64) -> Vec<Option<Vec<u8>>> {
        match &self.repr {
            Repr::Pack(lp) => {
                let mut out: Vec<Option<Vec<u8>>> = vec![None; fields.len()];
                for (f, v) in lp.pairs() {
                    for (i, wanted) in fields.iter().enumerate() {
                        if out[i].is_none() && *wanted == f {
                            out[i] = Some(v.to_vec());
                        }
                    }
                }
                out
            }
            Repr::Map(map) => fields
                .iter()
                .map(|f| map.get(f, now_ms).map(|e| e.value.clone()))
                .collect(),
        }
    }

    /// Delete fields; the caller drops the key when the container empties
    pub fn del(&mut self, fields: &[&[u8]], now_ms: u64) -> usize {
        match &mut self.repr {
            Repr::Pack(lp) => {
                let mut deleted = 0;
                for field in fields {
                    if let Some(pair) = Self::pack_find(lp, field) {
                        lp.remove_range(pair * 2, 2);
                        deleted += 1;
                    }
                }
                deleted
            }
            Repr::Map(map) => fields.iter().filter(|f| map.remove(f, now_ms)).count(),
        }
    }

    pub fn len(&self, now_ms: u64) -> usize {
        match &self.repr {
            Repr::Pack(lp) => lp.len() / 2,
            Repr::Map(map) => map.len(now_ms),
        }
    }

    pub fn is_empty(&self, now_ms: u64) -> bool {
        self.len(now_ms) == 0
    }

    pub fn exists(&self, field: &[u8], now_ms: u64) -> bool {
        match &self.repr {
            Repr::Pack(lp) => Self::pack_find(lp, field).is_some(),
            Repr::Map(map) => map.get(field, now_ms).is_some(),
        }
    }

    pub fn strlen(&self, field: &[u8], now_ms: u64) -> usize {
        self.get(field, now_ms).map(|v| v.len()).unwrap_or(0)
    }

    /// Absolute expiry of a field, if one is set
    pub fn field_ttl(&self, field: &[u8], now_ms: u64) -> Option<u64> {
        match &self.repr {
            Repr::Pack(_) => None,
            Repr::Map(map) => map.get(field, now_ms).and_then(|e| e.expires_at),
        }
    }

    /// HINCRBY: integer increment with overflow detection
    pub fn incr_by(
        &mut self,
        field: &[u8],
        delta: i64,
        limits: &HashLimits,
        now_ms: u64,
    ) -> OpResult<i64> {
        let current = match self.get(field, now_ms) {
            Some(raw) => parse_canonical_int(&raw)
                .ok_or(OpStatus::InvalidValue(literals::HASH_VALUE_NOT_INT))?,
            None => 0,
        };
        let next = current.checked_add(delta).ok_or(OpStatus::OutOfRange)?;
        self.write_back(field, next.to_string().as_bytes(), limits, now_ms);
        Ok(next)
    }

    /// HINCRBYFLOAT: float increment; NaN/Inf results are rejected
    pub fn incr_by_float(
        &mut self,
        field: &[u8],
        delta: f64,
        limits: &HashLimits,
        now_ms: u64,
    ) -> OpResult<f64> {
        let current = match self.get(field, now_ms) {
            Some(raw) => parse_double(&raw)
                .filter(|v| v.is_finite())
                .ok_or(OpStatus::InvalidValue(literals::HASH_VALUE_NOT_FLOAT))?,
            None => 0.0,
        };
        let next = current + delta;
        if !next.is_finite() {
            return Err(OpStatus::InvalidFloat(literals::INCR_NAN_INF));
        }
        self.write_back(field, format_double(next).as_bytes(), limits, now_ms);
        Ok(next)
    }

    /// Replace a field's value, preserving any expiry, upgrading the
    /// encoding if the packed form outgrows its limits
    fn write_back(&mut self, field: &[u8], value: &[u8], limits: &HashLimits, now_ms: u64) {
        if let Repr::Map(map) = &mut self.repr {
            if let Some(entry) = map.get_mut(field, now_ms) {
                entry.value = value.to_vec();
                return;
            }
            map.insert(field, value.to_vec(), None, now_ms);
            return;
        }
        self.set(field, value, HSetFlags::default(), limits, now_ms);
    }

    /// HRANDFIELD: `n >= 0` samples unique fields, `n < 0` samples with
    /// repetition
    pub fn random_fields(
        &self,
        n: i64,
        with_values: bool,
        now_ms: u64,
    ) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = self.entries(now_ms);
        if entries.is_empty() {
            return Vec::new();
        }
        let mut rng = rand::thread_rng();
        let pick = |i: usize| {
            let (f, v) = &entries[i];
            (f.clone(), with_values.then(|| v.clone()))
        };
        if n >= 0 {
            let count = (n as usize).min(entries.len());
            sample(&mut rng, entries.len(), count)
                .into_iter()
                .map(pick)
                .collect()
        } else {
            (0..n.unsigned_abs() as usize)
                .map(|_| pick(rng.gen_range(0..entries.len())))
                .collect()
        }
    }

    /// Cursor scan. The packed form returns everything in one pass; the
    /// map form walks at most `count_hint * 10` slots per call. Output is
    /// a flattened field,value sequence.
    pub fn scan(
        &self,
        cursor: u64,
        pattern: Option<&[u8]>,
        count_hint: usize,
        now_ms: u64,
    ) -> (u64, Vec<Vec<u8>>) {
        let matches = |field: &[u8]| pattern.map_or(true, |p| glob_match(p, field));
        match &self.repr {
            Repr::Pack(lp) => {
                let mut out = Vec::new();
                for (f, v) in lp.pairs() {
                    if matches(f) {
                        out.push(f.to_vec());
                        out.push(v.to_vec());
                    }
                }
                (0, out)
            }
            Repr::Map(map) => {
                let (next, entries) = map.scan(cursor, count_hint.max(1) * 10, now_ms);
                let mut out = Vec::new();
                for entry in entries {
                    if matches(&entry.field) {
                        out.push(entry.field.to_vec());
                        out.push(entry.value.clone());
                    }
                }
                (next, out)
            }
        }
    }

    /// All live field,value pairs
    pub fn entries(&self, now_ms: u64) -> Vec<(Vec<u8>, Vec<u8>)> {
        match &self.repr {
            Repr::Pack(lp) => lp.pairs().map(|(f, v)| (f.to_vec(), v.to_vec())).collect(),
            Repr::Map(map) => map
                .iter(now_ms)
                .map(|e| (e.field.to_vec(), e.value.clone()))
                .collect(),
        }
    }

    /// All live entries with their expiry, for serialization
    pub fn entries_with_ttl(&self, now_ms: u64) -> Vec<(Vec<u8>, Vec<u8>, Option<u64>)> {
        match &self.repr {
            Repr::Pack(lp) => lp
                .pairs()
                .map(|(f, v)| (f.to_vec(), v.to_vec(), None))
                .collect(),
            Repr::Map(map) => map
                .iter(now_ms)
                .map(|e| (e.field.to_vec(), e.value.clone(), e.expires_at))
                .collect(),
        }
    }

    /// Reap expired fields on the map form
    pub fn expire_sweep(&mut self, now_ms: u64) {
        if let Repr::Map(map) = &mut self.repr {
            map.expire_sweep(now_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> HashLimits {
        HashLimits::default()
    }

    #[test]
    fn test_set_get_replace() {
        let mut h = HashContainer::new();
        assert!(h.set(b"f1", b"v1", HSetFlags::default(), &limits(), 0));
        assert!(!h.set(b"f1", b"newv", HSetFlags::default(), &limits(), 0));
        assert_eq!(h.get(b"f1", 0), Some(b"newv".to_vec()));
        assert_eq!(h.encoding(), HashEncoding::Pack);
    }

    #[test]
    fn test_skip_if_exists() {
        let mut h = HashContainer::new();
        h.set(b"f", b"v", HSetFlags::default(), &limits(), 0);
        let nx = HSetFlags { skip_if_exists: true, ttl_at: None };
        assert!(!h.set(b"f", b"other", nx, &limits(), 0));
        assert_eq!(h.get(b"f", 0), Some(b"v".to_vec()));
        assert!(h.set(b"g", b"w", nx, &limits(), 0));
    }

    #[test]
    fn test_mget_single_pass() {
        let mut h = HashContainer::new();
        h.set(b"f1", b"v1", HSetFlags::default(), &limits(), 0);
        h.set(b"f2", b"v2", HSetFlags::default(), &limits(), 0);
        let got = h.mget(&[b"f1", b"nope", b"f2"], 0);
        assert_eq!(
            got,
            vec![Some(b"v1".to_vec()), None, Some(b"v2".to_vec())]
        );
    }

    #[test]
    fn test_del_and_emptiness() {
        let mut h = HashContainer::new();
        h.set(b"f1", b"v1", HSetFlags::default(), &limits(), 0);
        h.set(b"f2", b"v2", HSetFlags::default(), &limits(), 0);
        assert_eq!(h.del(&[b"f1", b"f2", b"f3"], 0), 2);
        assert!(h.is_empty(0));
        assert!(!h.exists(b"f1", 0));
    }

    #[test]
    fn test_upgrade_on_long_value() {
        let mut h = HashContainer::new();
        h.set(b"short", b"v", HSetFlags::default(), &limits(), 0);
        let long = vec![b'x'; 100];
        h.set(b"long", &long, HSetFlags::default(), &limits(), 0);
        assert_eq!(h.encoding(), HashEncoding::Map);
        assert_eq!(h.get(b"short", 0), Some(b"v".to_vec()));
        assert_eq!(h.get(b"long", 0), Some(long));
    }

    #[test]
    fn test_upgrade_on_total_bytes() {
        let mut h = HashContainer::new();
        for i in 0..40 {
            h.set(
                format!("field-{i}").as_bytes(),
                &[b'v'; 30],
                HSetFlags::default(),
                &limits(),
                0,
            );
        }
        assert_eq!(h.encoding(), HashEncoding::Map);
        assert_eq!(h.len(0), 40);
    }

    #[test]
    fn test_ttl_forces_map() {
        let mut h = HashContainer::new();
        h.set(b"f", b"v", HSetFlags { skip_if_exists: false, ttl_at: Some(500) }, &limits(), 0);
        assert_eq!(h.encoding(), HashEncoding::Map);
        assert_eq!(h.field_ttl(b"f", 0), Some(500));
        assert!(h.exists(b"f", 499));
        assert!(!h.exists(b"f", 500));
        assert_eq!(h.len(500), 0);
    }

    #[test]
    fn test_incr_by() {
        let mut h = HashContainer::new();
        assert_eq!(h.incr_by(b"f", 10, &limits(), 0), Ok(10));
        assert_eq!(h.get(b"f", 0), Some(b"10".to_vec()));
        assert_eq!(h.incr_by_float(b"f", 0.5, &limits(), 0), Ok(10.5));
        assert_eq!(h.get(b"f", 0), Some(b"10.5".to_vec()));
        assert_eq!(
            h.incr_by(b"f", 1, &limits(), 0),
            Err(OpStatus::InvalidValue(literals::HASH_VALUE_NOT_INT))
        );
    }

    #[test]
    fn test_incr_overflow_and_nan() {
        let mut h = HashContainer::new();
        h.set(b"big", i64::MAX.to_string().as_bytes(), HSetFlags::default(), &limits(), 0);
        assert_eq!(h.incr_by(b"big", 1, &limits(), 0), Err(OpStatus::OutOfRange));

        h.set(b"inf", b"inf", HSetFlags::default(), &limits(), 0);
        assert_eq!(
            h.incr_by_float(b"inf", 1.0, &limits(), 0),
            Err(OpStatus::InvalidValue(literals::HASH_VALUE_NOT_FLOAT))
        );
        h.set(b"f", b"1.0", HSetFlags::default(), &limits(), 0);
        assert!(h.incr_by_float(b"f", f64::MAX, &limits(), 0).is_ok());
        h.set(b"f", format_double(f64::MAX).as_bytes(), HSetFlags::default(), &limits(), 0);
        assert_eq!(
            h.incr_by_float(b"f", f64::MAX, &limits(), 0),
            Err(OpStatus::InvalidFloat(literals::INCR_NAN_INF))
        );
    }

    #[test]
    fn test_random_fields() {
        let mut h = HashContainer::new();
        for i in 0..10 {
            h.set(format!("f{i}").as_bytes(), b"v", HSetFlags::default(), &limits(), 0);
        }
        let unique = h.random_fields(5, false, 0);
        assert_eq!(unique.len(), 5);
        let set: std::collections::HashSet<_> = unique.iter().map(|(f, _)| f.clone()).collect();
        assert_eq!(set.len(), 5);

        let over = h.random_fields(100, true, 0);
        assert_eq!(over.len(), 10);
        assert!(over.iter().all(|(_, v)| v.is_some()));

        let dups = h.random_fields(-25, false, 0);
        assert_eq!(dups.len(), 25);
    }

    #[test]
    fn test_encoding_equivalence() {
        // Same operation stream against a pack-only and a map-only
        // container must observe identical results
        let wide = HashLimits { max_value_len: 1000, max_pack_bytes: 1 << 20 };
        let mut pack = HashContainer::new();
        let mut map = HashContainer::with_map_encoding();
        let fields: Vec<String> = (0..40).map(|i| format!("f{:02}", i * 3 % 25)).collect();
        for (i, field) in fields.iter().enumerate() {
            let value = format!("v{i}");
            pack.set(field.as_bytes(), value.as_bytes(), HSetFlags::default(), &wide, 0);
            map.set(field.as_bytes(), value.as_bytes(), HSetFlags::default(), &wide, 0);
        }
        assert_eq!(pack.encoding(), HashEncoding::Pack);
        assert_eq!(map.encoding(), HashEncoding::Map);
        assert_eq!(pack.len(0), map.len(0));
        for field in &fields {
            assert_eq!(pack.get(field.as_bytes(), 0), map.get(field.as_bytes(), 0));
            assert_eq!(pack.exists(field.as_bytes(), 0), map.exists(field.as_bytes(), 0));
            assert_eq!(pack.strlen(field.as_bytes(), 0), map.strlen(field.as_bytes(), 0));
        }
        let wanted: Vec<&[u8]> = fields.iter().map(|f| f.as_bytes()).collect();
        assert_eq!(pack.mget(&wanted, 0), map.mget(&wanted, 0));

        let mut pack_entries = pack.entries(0);
        let mut map_entries = map.entries(0);
        pack_entries.sort();
        map_entries.sort();
        assert_eq!(pack_entries, map_entries);
    }

    #[test]
    fn test_scan_pack_and_map() {
        let mut h = HashContainer::new();
        for i in 0..5 {
            h.set(format!("key-{i}").as_bytes(), b"v", HSetFlags::default(), &limits(), 0);
        }
        let (cursor, items) = h.scan(0, Some(b"key-*"), 10, 0);
        assert_eq!(cursor, 0);
        assert_eq!(items.len(), 10);

        // Force the map encoding and walk with a cursor
        let mut h = HashContainer::with_map_encoding();
        for i in 0..100 {
            h.set(format!("key-{i}").as_bytes(), b"v", HSetFlags::default(), &limits(), 0);
        }
        let mut cursor = 0;
        let mut fields = std::collections::HashSet::new();
        loop {
            let (next, items) = h.scan(cursor, None, 2, 0);
            for pair in items.chunks(2) {
                fields.insert(pair[0].clone());
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(fields.len(), 100);
    }
}
