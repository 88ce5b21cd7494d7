//! Per-shard database facade
//!
//! Binds the prime table to the typed containers: key lifecycle (create
//! on first write, drop on empty), wrong-type checks, key-level expiry,
//! and the hash/sorted-set/geo command shapes the core supports. All
//! methods run on the owning shard's worker.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use bytes::Bytes;

use shoal_core::error::literals;
use shoal_core::{OpResult, OpStatus};

use crate::geo::{self, GeoPoint, GeoSearchHit, GeoShape, GeoSort, GeoUnit};
use crate::hash::{HSetFlags, HashContainer, HashLimits};
use crate::setops::{self, AggType, ScoredMap};
use crate::table::PrimeTable;
use crate::value::{CompactValue, CoreType};
use crate::zset::{
    AddResult, LexBound, ScoreBound, SortedContainer, ZAddFlags, ZSetLimits,
};

/// HSETEX accepts ttl seconds in `(0, 2^26]`
const MAX_FIELD_TTL_SECS: u64 = 1 << 26;

/// Container limits snapshot, taken from the process config at shard
/// creation
#[derive(Debug, Clone, Copy, Default)]
pub struct DbLimits {
    pub hash: HashLimits,
    pub zset: ZSetLimits,
}

/// Key-level expiry table, shared with the migration streamer which
/// reads TTLs from inside table change callbacks
pub type ExpireTable = Rc<RefCell<HashMap<Bytes, u64>>>;

/// One shard's keyspace
pub struct Db {
    pub table: PrimeTable,
    /// Key-level absolute expiry, epoch milliseconds
    expire: ExpireTable,
    limits: DbLimits,
}

impl Db {
    pub fn new(limits: DbLimits) -> Self {
        Self { table: PrimeTable::new(), expire: ExpireTable::default(), limits }
    }

    /// Shared handle onto the expiry table
    pub fn expire_handle(&self) -> ExpireTable {
        self.expire.clone()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Key-level TTL accessor used by the migration serializer
    pub fn key_expire_ms(&self, key: &[u8]) -> Option<u64> {
        self.expire.borrow().get(key).copied()
    }

    pub fn set_key_expire_ms(&mut self, key: &[u8], at_ms: Option<u64>) {
        match at_ms {
            Some(at) => {
                self.expire.borrow_mut().insert(Bytes::copy_from_slice(key), at);
                if let Some(v) = self.table.find_mut_quiet(key) {
                    v.set_expire_flag(true);
                }
            }
            None => {
                self.expire.borrow_mut().remove(key);
                if let Some(v) = self.table.find_mut_quiet(key) {
                    v.set_expire_flag(false);
                }
            }
        }
    }

    /// Reap the key if its TTL has passed
    fn check_expired(&mut self, key: &[u8], now_ms: u64) {
        if matches!(self.expire.borrow().get(key), Some(&at) if at <= now_ms) {
            self.expire.borrow_mut().remove(key);
            self.table.erase(key);
        }
    }

    fn drop_key(&mut self, key: &[u8]) {
        self.expire.borrow_mut().remove(key);
        self.table.erase(key);
    }

    /// DEL; returns whether the key existed
    pub fn del(&mut self, key: &[u8]) -> bool {
        self.expire.borrow_mut().remove(key);
        self.table.erase(key).is_some()
    }

    /// FLUSHDB
    pub fn flush(&mut self) {
        self.expire.borrow_mut().clear();
        self.table = PrimeTable::new();
    }

    pub fn type_of(&self, key: &[u8]) -> Option<CoreType> {
        self.table.find(key).map(|v| v.type_of())
    }

    // ---- plain string keys (tiering surface) -----------------------------

    /// SET
    pub fn set_string(&mut self, key: &[u8], value: &[u8]) {
        match self.table.find_mut(key) {
            Some(slot) => slot.set_string(value),
            None => {
                self.table
                    .insert(Bytes::copy_from_slice(key), CompactValue::from_str(value));
            }
        }
    }

    /// GET. Offloaded values must be fetched through the tiered storage;
    /// this surface reports them distinctly.
    pub fn get_string(&self, key: &[u8]) -> OpResult<StringFetch> {
        match self.table.find(key) {
            None => Ok(StringFetch::Missing),
            Some(v) if v.type_of() != CoreType::String => Err(OpStatus::WrongType),
            Some(v) if v.is_external() => Ok(StringFetch::External(v.external_segment())),
            Some(v) => Ok(StringFetch::Resident(v.get_string())),
        }
    }

    // ---- typed container plumbing ----------------------------------------

    fn hash_mut(&mut self, key: &[u8], create: bool) -> OpResult<Option<&mut CompactValue>> {
        if self.table.find(key).is_none() {
            if !create {
                return Ok(None);
            }
            let mut value = CompactValue::new();
            value.init_hash(Box::new(HashContainer::new()));
            self.table.insert(Bytes::copy_from_slice(key), value);
        }
        let value = self.table.find_mut(key).unwrap();
        if value.as_hash().is_none() {
            return Err(OpStatus::WrongType);
        }
        Ok(Some(value))
    }

    fn hash_ref(&self, key: &[u8]) -> OpResult<Option<&HashContainer>> {
        match self.table.find(key) {
            None => Ok(None),
            Some(v) => v.as_hash().map(Some).ok_or(OpStatus::WrongType),
        }
    }

    fn zset_mut(&mut self, key: &[u8], create: bool) -> OpResult<Option<&mut CompactValue>> {
        if self.table.find(key).is_none() {
            if !create {
                return Ok(None);
            }
            let mut value = CompactValue::new();
            value.init_zset(Box::new(SortedContainer::new()));
            self.table.insert(Bytes::copy_from_slice(key), value);
        }
        let value = self.table.find_mut(key).unwrap();
        if value.as_zset().is_none() {
            return Err(OpStatus::WrongType);
        }
        Ok(Some(value))
    }

    fn zset_ref(&self, key: &[u8]) -> OpResult<Option<&SortedContainer>> {
        match self.table.find(key) {
            None => Ok(None),
            Some(v) => v.as_zset().map(Some).ok_or(OpStatus::WrongType),
        }
    }

    // ---- hash family -----------------------------------------------------

    /// HSET / HSETNX / HSETEX core: returns the number of new fields
    pub fn hset(
        &mut self,
        key: &[u8],
        pairs: &[(&[u8], &[u8])],
        flags: HSetFlags,
        now_ms: u64,
    ) -> OpResult<usize> {
        self.check_expired(key, now_ms);
        let limits = self.limits.hash;
        let slot = self.hash_mut(key, true)?.unwrap();
        let hash = slot.as_hash_mut().unwrap();
        let mut created = 0;
        for (field, value) in pairs {
            if hash.set(field, value, flags, &limits, now_ms) {
                created += 1;
            }
        }
        slot.sync_encoding();
        Ok(created)
    }

    /// Validate the HSETEX ttl argument and convert it to absolute ms
    pub fn hsetex_ttl_at(&self, ttl_secs: u64, now_ms: u64) -> OpResult<u64> {
        if ttl_secs == 0 || ttl_secs > MAX_FIELD_TTL_SECS {
            return Err(OpStatus::InvalidArgument("invalid expire time".to_string()));
        }
        Ok(now_ms + ttl_secs * 1000)
    }

    pub fn hget(&mut self, key: &[u8], field: &[u8], now_ms: u64) -> OpResult<Option<Vec<u8>>> {
        self.check_expired(key, now_ms);
        Ok(self.hash_ref(key)?.and_then(|h| h.get(field, now_ms)))
    }

    pub fn hmget(
        &mut self,
        key: &[u8],
        fields: &[&[u8]],
        now_ms: u64,
    ) -> OpResult<Vec<Option<Vec<u8>>>> {
        self.check_expired(key, now_ms);
        match self.hash_ref(key)? {
            Some(h) => Ok(h.mget(fields, now_ms)),
            None => Ok(vec![None; fields.len()]),
        }
    }

    pub fn hgetall(&mut self, key: &[u8], now_ms: u64) -> OpResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check_expired(key, now_ms);
        Ok(self
            .hash_ref(key)?
            .map(|h| h.entries(now_ms))
            .unwrap_or_default())
    }

    pub fn hdel(&mut self, key: &[u8], fields: &[&[u8]], now_ms: u64) -> OpResult<usize> {
        self.check_expired(key, now_ms);
        let Some(slot) = self.hash_mut(key, false)? else {
            return Ok(0);
        };
        let hash = slot.as_hash_mut().unwrap();
        let deleted = hash.del(fields, now_ms);
        if hash.is_empty(now_ms) {
            self.drop_key(key);
        }
        Ok(deleted)
    }

    pub fn hlen(&mut self, key: &[u8], now_ms: u64) -> OpResult<usize> {
        self.check_expired(key, now_ms);
        Ok(self.hash_ref(key)?.map(|h| h.len(now_ms)).unwrap_or(0))
    }

    pub fn hexists(&mut self, key: &[u8], field: &[u8], now_ms: u64) -> OpResult<bool> {
        self.check_expired(key, now_ms);
        Ok(self
            .hash_ref(key)?
            .map(|h| h.exists(field, now_ms))
            .unwrap_or(false))
    }

    pub fn hstrlen(&mut self, key: &[u8], field: &[u8], now_ms: u64) -> OpResult<usize> {
        self.check_expired(key, now_ms);
        Ok(self
            .hash_ref(key)?
            .map(|h| h.strlen(field, now_ms))
            .unwrap_or(0))
    }

    pub fn hincrby(&mut self, key: &[u8], field: &[u8], delta: i64, now_ms: u64) -> OpResult<i64> {
        self.check_expired(key, now_ms);
        let limits = self.limits.hash;
        let slot = self.hash_mut(key, true)?.unwrap();
        let hash = slot.as_hash_mut().unwrap();
        let out = hash.incr_by(field, delta, &limits, now_ms);
        let empty = hash.is_empty(now_ms);
        slot.sync_encoding();
        // A failed increment must not leave behind a key it created
        if empty {
            self.drop_key(key);
        }
        out
    }

    pub fn hincrbyfloat(
        &mut self,
        key: &[u8],
        field: &[u8],
        delta: f64,
        now_ms: u64,
    ) -> OpResult<f64> {
        self.check_expired(key, now_ms);
        let limits = self.limits.hash;
        let slot = self.hash_mut(key, true)?.unwrap();
        let hash = slot.as_hash_mut().unwrap();
        let out = hash.incr_by_float(field, delta, &limits, now_ms);
        let empty = hash.is_empty(now_ms);
        slot.sync_encoding();
        if empty {
            self.drop_key(key);
        }
        out
    }

    pub fn hrandfield(
        &mut self,
        key: &[u8],
        count: i64,
        with_values: bool,
        now_ms: u64,
    ) -> OpResult<Vec<(Vec<u8>, Option<Vec<u8>>)>> {
        self.check_expired(key, now_ms);
        Ok(self
            .hash_ref(key)?
            .map(|h| h.random_fields(count, with_values, now_ms))
            .unwrap_or_default())
    }

    pub fn hscan(
        &mut self,
        key: &[u8],
        cursor: u64,
        pattern: Option<&[u8]>,
        count_hint: usize,
        now_ms: u64,
    ) -> OpResult<(u64, Vec<Vec<u8>>)> {
        self.check_expired(key, now_ms);
        Ok(self
            .hash_ref(key)?
            .map(|h| h.scan(cursor, pattern, count_hint, now_ms))
            .unwrap_or((0, Vec::new())))
    }

    // ---- sorted-set family -----------------------------------------------

    /// ZADD; `override_existing` models the journal-restore OVERRIDE shape
    pub fn zadd(
        &mut self,
        key: &[u8],
        members: &[(f64, &[u8])],
        flags: ZAddFlags,
        override_existing: bool,
        now_ms: u64,
    ) -> OpResult<AddResult> {
        self.check_expired(key, now_ms);
        flags.validate(members.len())?;
        if override_existing {
            self.drop_key(key);
        }
        // XX against a missing key must not create it
        if flags.xx && self.table.find(key).is_none() {
            return Ok(if flags.incr {
                AddResult::IncrScore(None)
            } else {
                AddResult::Count(0)
            });
        }
        let limits = self.limits.zset;
        let slot = self.zset_mut(key, true)?.unwrap();
        let zset = slot.as_zset_mut().unwrap();
        let out = zset.add(members, flags, &limits);
        let empty = zset.is_empty();
        slot.sync_encoding();
        if empty {
            self.drop_key(key);
        }
        out
    }

    pub fn zcard(&mut self, key: &[u8], now_ms: u64) -> OpResult<usize> {
        self.check_expired(key, now_ms);
        Ok(self.zset_ref(key)?.map(|z| z.len()).unwrap_or(0))
    }

    pub fn zscore(&mut self, key: &[u8], member: &[u8], now_ms: u64) -> OpResult<Option<f64>> {
        self.check_expired(key, now_ms);
        Ok(self.zset_ref(key)?.and_then(|z| z.score(member)))
    }

    pub fn zmscore(
        &mut self,
        key: &[u8],
        members: &[&[u8]],
        now_ms: u64,
    ) -> OpResult<Vec<Option<f64>>> {
        self.check_expired(key, now_ms);
        match self.zset_ref(key)? {
            Some(z) => Ok(z.mscore(members)),
            None => Ok(vec![None; members.len()]),
        }
    }

    pub fn zincrby(&mut self, key: &[u8], member: &[u8], delta: f64, now_ms: u64) -> OpResult<f64> {
        self.check_expired(key, now_ms);
        let limits = self.limits.zset;
        let slot = self.zset_mut(key, true)?.unwrap();
        let zset = slot.as_zset_mut().unwrap();
        let out = zset.incr_by(member, delta, &limits);
        let empty = zset.is_empty();
        slot.sync_encoding();
        if empty {
            self.drop_key(key);
        }
        out
    }

    pub fn zrank(
        &mut self,
        key: &[u8],
        member: &[u8],
        reverse: bool,
        now_ms: u64,
    ) -> OpResult<Option<usize>> {
        self.check_expired(key, now_ms);
        Ok(self.zset_ref(key)?.and_then(|z| z.rank(member, reverse)))
    }

    pub fn zrange_by_rank(
        &mut self,
        key: &[u8],
        start: i64,
        end: i64,
        reverse: bool,
        now_ms: u64,
    ) -> OpResult<Vec<(Bytes, f64)>> {
        self.check_expired(key, now_ms);
        Ok(self
            .zset_ref(key)?
            .map(|z| z.range_by_rank(start, end, reverse))
            .unwrap_or_default())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn zrange_by_score(
        &mut self,
        key: &[u8],
        min: &ScoreBound,
        max: &ScoreBound,
        reverse: bool,
        offset: usize,
        limit: Option<usize>,
        now_ms: u64,
    ) -> OpResult<Vec<(Bytes, f64)>> {
        self.check_expired(key, now_ms);
        Ok(self
            .zset_ref(key)?
            .map(|z| z.range_by_score(min, max, reverse, offset, limit))
            .unwrap_or_default())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn zrange_by_lex(
        &mut self,
        key: &[u8],
        min: &LexBound,
        max: &LexBound,
        reverse: bool,
        offset: usize,
        limit: Option<usize>,
        now_ms: u64,
    ) -> OpResult<Vec<(Bytes, f64)>> {
        self.check_expired(key, now_ms);
        Ok(self
            .zset_ref(key)?
            .map(|z| z.range_by_lex(min, max, reverse, offset, limit))
            .unwrap_or_default())
    }

    pub fn zcount(
        &mut self,
        key: &[u8],
        min: &ScoreBound,
        max: &ScoreBound,
        now_ms: u64,
    ) -> OpResult<usize> {
        self.check_expired(key, now_ms);
        Ok(self
            .zset_ref(key)?
            .map(|z| z.count_in_score(min, max))
            .unwrap_or(0))
    }

    pub fn zlexcount(
        &mut self,
        key: &[u8],
        min: &LexBound,
        max: &LexBound,
        now_ms: u64,
    ) -> OpResult<usize> {
        self.check_expired(key, now_ms);
        Ok(self
            .zset_ref(key)?
            .map(|z| z.lex_count(min, max))
            .unwrap_or(0))
    }

    pub fn zrem(&mut self, key: &[u8], members: &[&[u8]], now_ms: u64) -> OpResult<usize> {
        self.check_expired(key, now_ms);
        let Some(slot) = self.zset_mut(key, false)? else {
            return Ok(0);
        };
        let zset = slot.as_zset_mut().unwrap();
        let removed = zset.remove(members);
        if zset.is_empty() {
            self.drop_key(key);
        }
        Ok(removed)
    }

    pub fn zpop(
        &mut self,
        key: &[u8],
        count: usize,
        reverse: bool,
        now_ms: u64,
    ) -> OpResult<Vec<(Bytes, f64)>> {
        self.check_expired(key, now_ms);
        let Some(slot) = self.zset_mut(key, false)? else {
            return Ok(Vec::new());
        };
        let zset = slot.as_zset_mut().unwrap();
        let popped = zset.pop(count, reverse);
        if zset.is_empty() {
            self.drop_key(key);
        }
        Ok(popped)
    }

    pub fn zremrange_by_rank(
        &mut self,
        key: &[u8],
        start: i64,
        end: i64,
        now_ms: u64,
    ) -> OpResult<usize> {
        self.zremrange_with(key, now_ms, |z| z.remove_range_by_rank(start, end))
    }

    pub fn zremrange_by_score(
        &mut self,
        key: &[u8],
        min: &ScoreBound,
        max: &ScoreBound,
        now_ms: u64,
    ) -> OpResult<usize> {
        self.zremrange_with(key, now_ms, |z| z.remove_range_by_score(min, max))
    }

    pub fn zremrange_by_lex(
        &mut self,
        key: &[u8],
        min: &LexBound,
        max: &LexBound,
        now_ms: u64,
    ) -> OpResult<usize> {
        self.zremrange_with(key, now_ms, |z| z.remove_range_by_lex(min, max))
    }

    fn zremrange_with(
        &mut self,
        key: &[u8],
        now_ms: u64,
        op: impl FnOnce(&mut SortedContainer) -> usize,
    ) -> OpResult<usize> {
        self.check_expired(key, now_ms);
        let Some(slot) = self.zset_mut(key, false)? else {
            return Ok(0);
        };
        let zset = slot.as_zset_mut().unwrap();
        let removed = op(zset);
        if zset.is_empty() {
            self.drop_key(key);
        }
        Ok(removed)
    }

    pub fn zscan(
        &mut self,
        key: &[u8],
        cursor: u64,
        pattern: Option<&[u8]>,
        count_hint: usize,
        now_ms: u64,
    ) -> OpResult<(u64, Vec<Vec<u8>>)> {
        self.check_expired(key, now_ms);
        Ok(self
            .zset_ref(key)?
            .map(|z| z.scan(cursor, pattern, count_hint))
            .unwrap_or((0, Vec::new())))
    }

    pub fn zrandmember(
        &mut self,
        key: &[u8],
        count: i64,
        with_scores: bool,
        now_ms: u64,
    ) -> OpResult<Vec<(Bytes, Option<f64>)>> {
        self.check_expired(key, now_ms);
        Ok(self
            .zset_ref(key)?
            .map(|z| z.random_members(count, with_scores))
            .unwrap_or_default())
    }

    // ---- multi-key set operations ----------------------------------------

    /// Scored view of one input key: sorted sets keep their scores, plain
    /// sets score 1.0 per member, missing keys are empty
    pub fn scored_input(&mut self, key: &[u8], now_ms: u64) -> OpResult<Vec<(Bytes, f64)>> {
        self.check_expired(key, now_ms);
        match self.table.find(key) {
            None => Ok(Vec::new()),
            Some(v) => {
                if let Some(z) = v.as_zset() {
                    Ok(z.entries())
                } else if let Some(s) = v.as_set() {
                    Ok(s.members()
                        .into_iter()
                        .map(|m| (Bytes::from(m), 1.0))
                        .collect())
                } else {
                    Err(OpStatus::WrongType)
                }
            }
        }
    }

    /// ZUNIONSTORE/ZINTERSTORE destination write: replaces the key
    pub fn store_scored(&mut self, key: &[u8], result: ScoredMap, now_ms: u64) -> OpResult<usize> {
        self.check_expired(key, now_ms);
        self.drop_key(key);
        if result.is_empty() {
            return Ok(0);
        }
        let limits = self.limits.zset;
        let slot = self.zset_mut(key, true)?.unwrap();
        let zset = slot.as_zset_mut().unwrap();
        let entries = setops::into_sorted(result);
        let count = entries.len();
        for (member, score) in &entries {
            zset.add(&[(*score, &member[..])], ZAddFlags::default(), &limits)?;
        }
        slot.sync_encoding();
        Ok(count)
    }

    /// ZINTERCARD: intersection cardinality with an optional early-stop
    /// limit
    pub fn zintercard(
        &mut self,
        keys: &[&[u8]],
        limit: Option<usize>,
        now_ms: u64,
    ) -> OpResult<usize> {
        let mut inputs = Vec::with_capacity(keys.len());
        for key in keys {
            inputs.push(self.scored_input(key, now_ms)?);
        }
        Ok(setops::inter_card(inputs, limit))
    }

    /// Single-shard ZUNION / ZINTER / ZDIFF over local keys
    pub fn zset_combine(
        &mut self,
        keys: &[&[u8]],
        weights: &[f64],
        agg: AggType,
        op: CombineOp,
        now_ms: u64,
    ) -> OpResult<ScoredMap> {
        let mut inputs = Vec::with_capacity(keys.len());
        for key in keys {
            inputs.push(self.scored_input(key, now_ms)?);
        }
        Ok(match op {
            CombineOp::Union => setops::union(inputs, weights, agg),
            CombineOp::Inter => setops::intersect(inputs, weights, agg),
            CombineOp::Diff => setops::diff(inputs),
        })
    }

    // ---- geo family --------------------------------------------------------

    /// GEOADD: members scored by their interleaved position hash
    pub fn geoadd(
        &mut self,
        key: &[u8],
        points: &[(GeoPoint, &[u8])],
        flags: ZAddFlags,
        now_ms: u64,
    ) -> OpResult<AddResult> {
        let scored: Vec<(f64, &[u8])> = points
            .iter()
            .map(|(p, m)| (geo::score_of(*p), *m))
            .collect();
        self.zadd(key, &scored, flags, false, now_ms)
    }

    /// GEOPOS
    pub fn geopos(
        &mut self,
        key: &[u8],
        members: &[&[u8]],
        now_ms: u64,
    ) -> OpResult<Vec<Option<GeoPoint>>> {
        self.check_expired(key, now_ms);
        match self.zset_ref(key)? {
            Some(z) => Ok(members
                .iter()
                .map(|m| z.score(m).map(geo::point_of))
                .collect()),
            None => Ok(vec![None; members.len()]),
        }
    }

    /// GEOHASH replies; None for missing members
    pub fn geohash(
        &mut self,
        key: &[u8],
        members: &[&[u8]],
        now_ms: u64,
    ) -> OpResult<Vec<Option<String>>> {
        self.check_expired(key, now_ms);
        match self.zset_ref(key)? {
            Some(z) => Ok(members
                .iter()
                .map(|m| z.score(m).map(geo::hash_string))
                .collect()),
            None => Ok(vec![None; members.len()]),
        }
    }

    /// GEODIST in the requested unit
    pub fn geodist(
        &mut self,
        key: &[u8],
        m1: &[u8],
        m2: &[u8],
        unit: GeoUnit,
        now_ms: u64,
    ) -> OpResult<Option<f64>> {
        self.check_expired(key, now_ms);
        let Some(z) = self.zset_ref(key)? else {
            return Ok(None);
        };
        let (Some(p1), Some(p2)) = (geo::member_point(z, m1), geo::member_point(z, m2)) else {
            return Ok(None);
        };
        Ok(Some(geo::distance(p1, p2) / unit.to_meters()))
    }

    /// GEOSEARCH ... STORE / STOREDIST destination write. With
    /// `store_dist` the members are scored by their distance in `unit`,
    /// otherwise by their position hash.
    pub fn geo_store(
        &mut self,
        dest: &[u8],
        hits: &[GeoSearchHit],
        store_dist: bool,
        unit: GeoUnit,
        now_ms: u64,
    ) -> OpResult<usize> {
        let map: ScoredMap = hits
            .iter()
            .map(|h| {
                let score = if store_dist { h.dist_m / unit.to_meters() } else { h.score };
                (h.member.clone(), score)
            })
            .collect();
        self.store_scored(dest, map, now_ms)
    }

    /// GEOSEARCH / GEORADIUSBYMEMBER with reply shaping and the STORE
    /// forms. STORE and STOREDIST are incompatible with WITHCOORD,
    /// WITHDIST and WITHHASH.
    #[allow(clippy::too_many_arguments)]
    pub fn geosearch_with_options(
        &mut self,
        key: &[u8],
        center: GeoCenter<'_>,
        shape: GeoShape,
        sort: GeoSort,
        count: Option<usize>,
        any: bool,
        reply: GeoReplyOpts,
        store: Option<GeoStoreTarget<'_>>,
        now_ms: u64,
    ) -> OpResult<GeoSearchOutcome> {
        if store.is_some() && reply.wants_any() {
            return Err(OpStatus::InvalidArgument(
                literals::STORE_WITH_INCOMPATIBLE.to_string(),
            ));
        }
        let hits = self.geosearch(key, center, shape, sort, count, any, now_ms)?;
        match store {
            Some(target) => {
                let stored =
                    self.geo_store(target.dest, &hits, target.store_dist, target.unit, now_ms)?;
                Ok(GeoSearchOutcome::Stored(stored))
            }
            None => Ok(GeoSearchOutcome::Hits(
                hits.into_iter()
                    .map(|h| GeoReplyItem {
                        member: h.member,
                        dist_m: reply.with_dist.then_some(h.dist_m),
                        point: reply.with_coord.then_some(h.point),
                        hash: reply.with_hash.then_some(h.score as u64),
                    })
                    .collect(),
            )),
        }
    }

    /// GEOSEARCH / GEORADIUSBYMEMBER core
    #[allow(clippy::too_many_arguments)]
    pub fn geosearch(
        &mut self,
        key: &[u8],
        center: GeoCenter<'_>,
        shape: GeoShape,
        sort: GeoSort,
        count: Option<usize>,
        any: bool,
        now_ms: u64,
    ) -> OpResult<Vec<GeoSearchHit>> {
        self.check_expired(key, now_ms);
        let Some(z) = self.zset_ref(key)? else {
            return Ok(Vec::new());
        };
        let center = match center {
            GeoCenter::LonLat(point) => point,
            GeoCenter::Member(m) => {
                geo::member_point(z, m).ok_or(OpStatus::MemberNotFound)?
            }
        };
        Ok(geo::search(z, center, shape, sort, count, any))
    }
}

/// Search origin of the geo queries
#[derive(Debug, Clone, Copy)]
pub enum GeoCenter<'a> {
    LonLat(GeoPoint),
    Member(&'a [u8]),
}

/// WITHCOORD / WITHDIST / WITHHASH reply shaping
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoReplyOpts {
    pub with_coord: bool,
    pub with_dist: bool,
    pub with_hash: bool,
}

impl GeoReplyOpts {
    pub fn wants_any(&self) -> bool {
        self.with_coord || self.with_dist || self.with_hash
    }
}

/// STORE / STOREDIST destination
#[derive(Debug, Clone, Copy)]
pub struct GeoStoreTarget<'a> {
    pub dest: &'a [u8],
    /// STOREDIST: score members by distance in `unit` instead of by
    /// position hash
    pub store_dist: bool,
    pub unit: GeoUnit,
}

/// One shaped search reply entry; optional fields follow the WITH* opts
#[derive(Debug, Clone, PartialEq)]
pub struct GeoReplyItem {
    pub member: Bytes,
    pub dist_m: Option<f64>,
    pub point: Option<GeoPoint>,
    pub hash: Option<u64>,
}

/// Result of a geo search: shaped hits, or the stored cardinality
#[derive(Debug, Clone, PartialEq)]
pub enum GeoSearchOutcome {
    Hits(Vec<GeoReplyItem>),
    Stored(usize),
}

/// Outcome of a plain-string read
#[derive(Debug, Clone, PartialEq)]
pub enum StringFetch {
    Missing,
    Resident(Vec<u8>),
    /// The value lives on disk; fetch it through the tiered storage
    External(crate::value::DiskSegment),
}

/// Multi-key set operation selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineOp {
    Union,
    Inter,
    Diff,
}

#[cfg(test)]
#[path = "db_tests.rs"]
mod tests;
