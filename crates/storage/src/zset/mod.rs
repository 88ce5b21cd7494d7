//! Sorted-set container
//!
//! Member→score set ordered by (score, member). Two encodings: a packed
//! listpack of alternating member,score-text entries kept in order, and a
//! skip list paired with a member→score map for O(1) membership and
//! O(log N) rank. Both encodings yield identical observable ordering;
//! the packed form upgrades once the container crosses the configured
//! entry-count or member-length thresholds and never converts back.

mod skiplist;

pub use skiplist::SkipList;

use std::collections::HashMap;

use bytes::Bytes;
use rand::seq::index::sample;
use rand::Rng;

use shoal_core::error::literals;
use shoal_core::{OpResult, OpStatus};

use crate::listpack::Listpack;
use crate::num::{format_double, parse_double};
use crate::pattern::glob_match;
use skiplist::NIL;

/// Listpack thresholds for the packed encoding
#[derive(Debug, Clone, Copy)]
pub struct ZSetLimits {
    pub max_entries: usize,
    pub max_value_len: usize,
}

impl Default for ZSetLimits {
    fn default() -> Self {
        Self { max_entries: 128, max_value_len: 64 }
    }
}

/// ZADD behavior flags. NX/XX are mutually exclusive; NX excludes GT/LT.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZAddFlags {
    pub nx: bool,
    pub xx: bool,
    pub gt: bool,
    pub lt: bool,
    pub ch: bool,
    pub incr: bool,
}

impl ZAddFlags {
    /// Reject incompatible combinations with their exact error strings
    pub fn validate(&self, member_count: usize) -> OpResult<()> {
        if self.nx && self.xx {
            return Err(OpStatus::InvalidArgument(
                literals::NX_XX_INCOMPATIBLE.to_string(),
            ));
        }
        if self.nx && (self.gt || self.lt) || (self.gt && self.lt) {
            return Err(OpStatus::InvalidArgument(
                literals::GT_LT_NX_INCOMPATIBLE.to_string(),
            ));
        }
        if self.incr && member_count > 1 {
            return Err(OpStatus::InvalidArgument(
                literals::INCR_SINGLE_PAIR.to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of an `add` call
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AddResult {
    /// Members added (plus updated, when CH is set)
    Count(usize),
    /// INCR form: the new score, or None when a condition declined it
    IncrScore(Option<f64>),
}

/// One bound of a score range; `exclusive` models the `(` prefix
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBound {
    pub value: f64,
    pub exclusive: bool,
}

impl ScoreBound {
    pub fn inclusive(value: f64) -> Self {
        Self { value, exclusive: false }
    }

    /// Parse `5`, `(5`, `inf`, `-inf`, `+inf`
    pub fn parse(data: &[u8]) -> OpResult<Self> {
        let (exclusive, rest) = match data.first() {
            Some(b'(') => (true, &data[1..]),
            _ => (false, data),
        };
        let value =
            parse_double(rest).ok_or(OpStatus::InvalidValue(literals::FLOAT_RANGE))?;
        Ok(Self { value, exclusive })
    }

    fn admits_from_below(&self, score: f64) -> bool {
        if self.exclusive {
            score > self.value
        } else {
            score >= self.value
        }
    }

    fn admits_from_above(&self, score: f64) -> bool {
        if self.exclusive {
            score < self.value
        } else {
            score <= self.value
        }
    }
}

/// One bound of a lexicographic range: `[m`, `(m`, `-`, `+`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LexBound {
    NegInf,
    PosInf,
    Incl(Vec<u8>),
    Excl(Vec<u8>),
}

impl LexBound {
    pub fn parse(data: &[u8]) -> OpResult<Self> {
        match data.first() {
            Some(b'-') if data.len() == 1 => Ok(LexBound::NegInf),
            Some(b'+') if data.len() == 1 => Ok(LexBound::PosInf),
            Some(b'[') => Ok(LexBound::Incl(data[1..].to_vec())),
            Some(b'(') => Ok(LexBound::Excl(data[1..].to_vec())),
            _ => Err(OpStatus::InvalidValue(literals::LEX_RANGE)),
        }
    }

    fn admits_from_below(&self, member: &[u8]) -> bool {
        match self {
            LexBound::NegInf => true,
            LexBound::PosInf => false,
            LexBound::Incl(b) => member >= &b[..],
            LexBound::Excl(b) => member > &b[..],
        }
    }

    fn admits_from_above(&self, member: &[u8]) -> bool {
        match self {
            LexBound::NegInf => false,
            LexBound::PosInf => true,
            LexBound::Incl(b) => member <= &b[..],
            LexBound::Excl(b) => member < &b[..],
        }
    }
}

#[derive(Debug)]
struct SkipMap {
    list: SkipList,
    scores: HashMap<Bytes, f64>,
}

#[derive(Debug)]
enum Repr {
    Pack(Listpack),
    Skip(SkipMap),
}

/// Member→score container with dual encoding
#[derive(Debug)]
pub struct SortedContainer {
    repr: Repr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZSetEncoding {
    Pack = 0,
    Skip = 1,
}

impl Default for SortedContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl SortedContainer {
    pub fn new() -> Self {
        Self { repr: Repr::Pack(Listpack::new()) }
    }

    pub fn with_skip_encoding() -> Self {
        Self {
            repr: Repr::Skip(SkipMap { list: SkipList::new(), scores: HashMap::new() }),
        }
    }

    pub fn encoding(&self) -> ZSetEncoding {
        match &self.repr {
            Repr::Pack(_) => ZSetEncoding::Pack,
            Repr::Skip(_) => ZSetEncoding::Skip,
        }
    }

    pub fn encoding_bits(&self) -> u8 {
        self.encoding() as u8
    }

    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Pack(lp) => lp.len() / 2,
            Repr::Skip(sm) => sm.list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries in (score, member) order
    pub fn entries(&self) -> Vec<(Bytes, f64)> {
        match &self.repr {
            Repr::Pack(lp) => lp
                .pairs()
                .map(|(m, s)| (Bytes::copy_from_slice(m), parse_double(s).unwrap()))
                .collect(),
            Repr::Skip(sm) => {
                let mut out = Vec::with_capacity(sm.list.len());
                let mut at = sm.list.front();
                while at != NIL {
                    out.push((sm.list.member(at).clone(), sm.list.score(at)));
                    at = sm.list.next(at);
                }
                out
            }
        }
    }

    fn upgrade(&mut self) {
        if let Repr::Pack(lp) = &self.repr {
            let mut sm = SkipMap { list: SkipList::new(), scores: HashMap::new() };
            for (member, score_text) in lp.pairs() {
                let member = Bytes::copy_from_slice(member);
                let score = parse_double(score_text).unwrap();
                sm.list.insert(member.clone(), score);
                sm.scores.insert(member, score);
            }
            self.repr = Repr::Skip(sm);
        }
    }

    /// Rank (in pair units) where (score, member) sorts into the packed
    /// form, plus the existing pair index of the member if present
    fn pack_position(lp: &Listpack, score: f64, member: &[u8]) -> (usize, Option<(usize, f64)>) {
        let mut insert_at = 0;
        let mut found = None;
        for (i, (m, s)) in lp.pairs().enumerate() {
            let other = parse_double(s).unwrap();
            if other < score || (other == score && m < member) {
                insert_at = i + 1;
            }
            if m == member {
                found = Some((i, other));
            }
        }
        (insert_at, found)
    }

    fn pack_insert(lp: &mut Listpack, score: f64, member: &[u8]) {
        let (at, _) = Self::pack_position(lp, score, member);
        lp.insert_at(at * 2, format_double(score).as_bytes());
        lp.insert_at(at * 2, member);
    }

    fn insert_raw(&mut self, member: &[u8], score: f64) {
        match &mut self.repr {
            Repr::Pack(lp) => Self::pack_insert(lp, score, member),
            Repr::Skip(sm) => {
                let member = Bytes::copy_from_slice(member);
                sm.list.insert(member.clone(), score);
                sm.scores.insert(member, score);
            }
        }
    }

    fn remove_raw(&mut self, member: &[u8]) -> Option<f64> {
        match &mut self.repr {
            Repr::Pack(lp) => {
                let found = lp
                    .pairs()
                    .enumerate()
                    .find(|(_, (m, _))| *m == member)
                    .map(|(i, (_, s))| (i, parse_double(s).unwrap()));
                found.map(|(i, score)| {
                    lp.remove_range(i * 2, 2);
                    score
                })
            }
            Repr::Skip(sm) => {
                let score = sm.scores.remove(member)?;
                sm.list.delete(member, score);
                Some(score)
            }
        }
    }

    /// ZADD core. `members` are (score, member) pairs in argument order.
    pub fn add(
        &mut self,
        members: &[(f64, &[u8])],
        flags: ZAddFlags,
        limits: &ZSetLimits,
    ) -> OpResult<AddResult> {
        flags.validate(members.len())?;
        if members.iter().any(|(s, _)| s.is_nan()) {
            return Err(OpStatus::InvalidFloat(literals::SCORE_NAN));
        }

        let mut added = 0;
        let mut updated = 0;
        let mut incr_result = None;
        for &(score, member) in members {
            if self.encoding() == ZSetEncoding::Pack
                && (member.len() > limits.max_value_len || self.len() + 1 > limits.max_entries)
            {
                self.upgrade();
            }
            match self.score(member) {
                Some(old) => {
                    if flags.nx {
                        if flags.incr {
                            return Ok(AddResult::IncrScore(None));
                        }
                        continue;
                    }
                    let new = if flags.incr { old + score } else { score };
                    if new.is_nan() {
                        return Err(OpStatus::InvalidFloat(literals::SCORE_NAN));
                    }
                    if (flags.gt && new <= old) || (flags.lt && new >= old) {
                        if flags.incr {
                            return Ok(AddResult::IncrScore(None));
                        }
                        continue;
                    }
                    if new != old {
                        self.remove_raw(member);
                        self.insert_raw(member, new);
                        updated += 1;
                    }
                    incr_result = Some(new);
                }
                None => {
                    if flags.xx {
                        if flags.incr {
                            return Ok(AddResult::IncrScore(None));
                        }
                        continue;
                    }
                    if score.is_nan() {
                        return Err(OpStatus::InvalidFloat(literals::SCORE_NAN));
                    }
                    self.insert_raw(member, score);
                    added += 1;
                    incr_result = Some(score);
                }
            }
        }

        if flags.incr {
            return Ok(AddResult::IncrScore(incr_result));
        }
        Ok(AddResult::Count(if flags.ch { added + updated } else { added }))
    }

    /// ZREM; the caller drops the key when the container empties
    pub fn remove(&mut self, members: &[&[u8]]) -> usize {
        members
            .iter()
            .filter(|m| self.remove_raw(m).is_some())
            .count()
    }

    /// ZINCRBY
    pub fn incr_by(
        &mut self,
        member: &[u8],
        delta: f64,
        limits: &ZSetLimits,
    ) -> OpResult<f64> {
        let flags = ZAddFlags { incr: true, ..Default::default() };
        match self.add(&[(delta, member)], flags, limits)? {
            AddResult::IncrScore(Some(score)) => Ok(score),
            _ => unreachable!("unconditional INCR cannot be declined"),
        }
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        match &self.repr {
            Repr::Pack(lp) => lp
                .pairs()
                .find(|(m, _)| *m == member)
                .map(|(_, s)| parse_double(s).unwrap()),
            Repr::Skip(sm) => sm.scores.get(member).copied(),
        }
    }

    pub fn mscore(&self, members: &[&[u8]]) -> Vec<Option<f64>> {
        members.iter().map(|m| self.score(m)).collect()
    }

    /// 0-based rank from the smallest score; reversed counts from the top
    pub fn rank(&self, member: &[u8], reverse: bool) -> Option<usize> {
        let forward = match &self.repr {
            Repr::Pack(lp) => lp.pairs().position(|(m, _)| m == member),
            Repr::Skip(sm) => {
                let score = *sm.scores.get(member)?;
                sm.list.rank_of(member, score)
            }
        }?;
        Some(if reverse { self.len() - 1 - forward } else { forward })
    }

    /// Normalize a possibly negative index pair against the length.
    /// Returns None when the window is empty.
    fn normalize_range(&self, start: i64, end: i64) -> Option<(usize, usize)> {
        let len = self.len() as i64;
        let mut start = if start < 0 { len + start } else { start };
        let mut end = if end < 0 { len + end } else { end };
        start = start.max(0);
        end = end.min(len - 1);
        if start > end || len == 0 {
            return None;
        }
        Some((start as usize, end as usize))
    }

    /// ZRANGE by rank; negative indices count from the end
    pub fn range_by_rank(&self, start: i64, end: i64, reverse: bool) -> Vec<(Bytes, f64)> {
        let Some((from, to)) = self.normalize_range(start, end) else {
            return Vec::new();
        };
        let entries = self.entries();
        let len = entries.len();
        if reverse {
            (from..=to)
                .map(|r| entries[len - 1 - r].clone())
                .collect()
        } else {
            entries[from..=to].to_vec()
        }
    }

    /// Ascending slice of entries admitted by both score bounds,
    /// starting at the first admitted node
    fn score_slice(&self, min: &ScoreBound, max: &ScoreBound) -> Vec<(Bytes, f64)> {
        match &self.repr {
            Repr::Pack(lp) => lp
                .pairs()
                .map(|(m, s)| (Bytes::copy_from_slice(m), parse_double(s).unwrap()))
                .filter(|(_, s)| min.admits_from_below(*s) && max.admits_from_above(*s))
                .collect(),
            Repr::Skip(sm) => {
                let mut out = Vec::new();
                let (mut at, _) = sm.list.first_in_score(min.value, min.exclusive);
                while at != NIL {
                    let score = sm.list.score(at);
                    if !max.admits_from_above(score) {
                        break;
                    }
                    out.push((sm.list.member(at).clone(), score));
                    at = sm.list.next(at);
                }
                out
            }
        }
    }

    /// ZRANGEBYSCORE (+ REV form). `limit` of None means unlimited.
    pub fn range_by_score(
        &self,
        min: &ScoreBound,
        max: &ScoreBound,
        reverse: bool,
        offset: usize,
        limit: Option<usize>,
    ) -> Vec<(Bytes, f64)> {
        let mut slice = self.score_slice(min, max);
        if reverse {
            slice.reverse();
        }
        apply_window(slice, offset, limit)
    }

    fn lex_slice(&self, min: &LexBound, max: &LexBound) -> Vec<(Bytes, f64)> {
        match &self.repr {
            Repr::Pack(lp) => lp
                .pairs()
                .map(|(m, s)| (Bytes::copy_from_slice(m), parse_double(s).unwrap()))
                .filter(|(m, _)| min.admits_from_below(m) && max.admits_from_above(m))
                .collect(),
            Repr::Skip(sm) => {
                let mut out = Vec::new();
                let mut at = match min {
                    LexBound::NegInf => sm.list.front(),
                    LexBound::PosInf => NIL,
                    LexBound::Incl(b) => sm.list.first_in_lex(b, false).0,
                    LexBound::Excl(b) => sm.list.first_in_lex(b, true).0,
                };
                while at != NIL {
                    let member = sm.list.member(at);
                    if !max.admits_from_above(member) {
                        break;
                    }
                    out.push((member.clone(), sm.list.score(at)));
                    at = sm.list.next(at);
                }
                out
            }
        }
    }

    /// ZRANGEBYLEX (+ REV form)
    pub fn range_by_lex(
        &self,
        min: &LexBound,
        max: &LexBound,
        reverse: bool,
        offset: usize,
        limit: Option<usize>,
    ) -> Vec<(Bytes, f64)> {
        let mut slice = self.lex_slice(min, max);
        if reverse {
            slice.reverse();
        }
        apply_window(slice, offset, limit)
    }

    /// ZCOUNT; O(log N) on the skip encoding via boundary ranks
    pub fn count_in_score(&self, min: &ScoreBound, max: &ScoreBound) -> usize {
        match &self.repr {
            Repr::Pack(_) => self.score_slice(min, max).len(),
            Repr::Skip(sm) => {
                let (first, rank_in) = sm.list.first_in_score(min.value, min.exclusive);
                if first == NIL {
                    return 0;
                }
                let (_, rank_out) = sm.list.first_in_score(max.value, !max.exclusive);
                rank_out.saturating_sub(rank_in)
            }
        }
    }

    /// ZLEXCOUNT
    pub fn lex_count(&self, min: &LexBound, max: &LexBound) -> usize {
        match &self.repr {
            Repr::Pack(_) => self.lex_slice(min, max).len(),
            Repr::Skip(sm) => {
                let rank_in = match min {
                    LexBound::NegInf => 0,
                    LexBound::PosInf => return 0,
                    LexBound::Incl(b) => sm.list.first_in_lex(b, false).1,
                    LexBound::Excl(b) => sm.list.first_in_lex(b, true).1,
                };
                let rank_out = match max {
                    LexBound::NegInf => 0,
                    LexBound::PosInf => sm.list.len(),
                    LexBound::Incl(b) => sm.list.first_in_lex(b, true).1,
                    LexBound::Excl(b) => sm.list.first_in_lex(b, false).1,
                };
                rank_out.saturating_sub(rank_in)
            }
        }
    }

    /// ZPOPMIN / ZPOPMAX
    pub fn pop(&mut self, count: usize, reverse: bool) -> Vec<(Bytes, f64)> {
        let count = count.min(self.len());
        if count == 0 {
            return Vec::new();
        }
        let victims: Vec<(Bytes, f64)> = if reverse {
            self.range_by_rank(-(count as i64), -1, false)
                .into_iter()
                .rev()
                .collect()
        } else {
            self.range_by_rank(0, count as i64 - 1, false)
        };
        for (member, _) in &victims {
            self.remove_raw(member);
        }
        victims
    }

    /// ZREMRANGEBYRANK; the packed form deletes one contiguous range
    pub fn remove_range_by_rank(&mut self, start: i64, end: i64) -> usize {
        let Some((from, to)) = self.normalize_range(start, end) else {
            return 0;
        };
        match &mut self.repr {
            Repr::Pack(lp) => {
                lp.remove_range(from * 2, (to - from + 1) * 2);
                to - from + 1
            }
            Repr::Skip(_) => {
                let victims = self.range_by_rank(from as i64, to as i64, false);
                for (member, _) in &victims {
                    self.remove_raw(member);
                }
                victims.len()
            }
        }
    }

    /// ZREMRANGEBYSCORE
    pub fn remove_range_by_score(&mut self, min: &ScoreBound, max: &ScoreBound) -> usize {
        let victims = self.score_slice(min, max);
        for (member, _) in &victims {
            self.remove_raw(member);
        }
        victims.len()
    }

    /// ZREMRANGEBYLEX
    pub fn remove_range_by_lex(&mut self, min: &LexBound, max: &LexBound) -> usize {
        let victims = self.lex_slice(min, max);
        for (member, _) in &victims {
            self.remove_raw(member);
        }
        victims.len()
    }

    /// ZSCAN: flattened member,score-text sequence. The packed form
    /// returns everything in one pass; the skip form walks by rank.
    pub fn scan(
        &self,
        cursor: u64,
        pattern: Option<&[u8]>,
        count_hint: usize,
    ) -> (u64, Vec<Vec<u8>>) {
        let matches = |member: &[u8]| pattern.map_or(true, |p| glob_match(p, member));
        match &self.repr {
            Repr::Pack(lp) => {
                let mut out = Vec::new();
                for (m, s) in lp.pairs() {
                    if matches(m) {
                        out.push(m.to_vec());
                        out.push(s.to_vec());
                    }
                }
                (0, out)
            }
            Repr::Skip(sm) => {
                let budget = count_hint.max(1) * 10;
                let start = cursor as usize;
                let mut out = Vec::new();
                let mut at = match sm.list.at_rank(start) {
                    Some(idx) => idx,
                    None => return (0, out),
                };
                let mut walked = 0;
                while at != NIL && walked < budget {
                    let member = sm.list.member(at);
                    if matches(member) {
                        out.push(member.to_vec());
                        out.push(format_double(sm.list.score(at)).into_bytes());
                    }
                    at = sm.list.next(at);
                    walked += 1;
                }
                let next = if at == NIL { 0 } else { (start + walked) as u64 };
                (next, out)
            }
        }
    }

    /// ZRANDMEMBER: `n >= 0` unique, `n < 0` with repetition
    pub fn random_members(&self, n: i64, with_scores: bool) -> Vec<(Bytes, Option<f64>)> {
        let entries = self.entries();
        if entries.is_empty() {
            return Vec::new();
        }
        let mut rng = rand::thread_rng();
        let pick = |i: usize| {
            let (m, s) = &entries[i];
            (m.clone(), with_scores.then_some(*s))
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
}

fn apply_window(slice: Vec<(Bytes, f64)>, offset: usize, limit: Option<usize>) -> Vec<(Bytes, f64)> {
    slice
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}
