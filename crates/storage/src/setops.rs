//! Multi-key union / intersection / difference
//!
//! Each input key is materialized into a scored map (plain sets score 1.0
//! per member), weights multiply scores before aggregation, and the fold
//! always iterates the smaller operand while mutating the larger one.
//! Cross-shard callers reduce their per-shard results with the same fold.

use std::collections::HashMap;

use bytes::Bytes;

use shoal_core::error::literals;
use shoal_core::{OpResult, OpStatus};

use crate::num::parse_double;

/// Member → aggregated score
pub type ScoredMap = HashMap<Bytes, f64>;

/// Aggregation mode of ZUNION/ZINTER families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggType {
    #[default]
    Sum,
    Min,
    Max,
}

impl AggType {
    pub fn parse(data: &[u8]) -> OpResult<Self> {
        match data.to_ascii_lowercase().as_slice() {
            b"sum" => Ok(AggType::Sum),
            b"min" => Ok(AggType::Min),
            b"max" => Ok(AggType::Max),
            _ => Err(OpStatus::SyntaxErr),
        }
    }

    /// Combine two already-weighted scores. An infinite sum collapsing
    /// to NaN normalizes to 0.
    pub fn combine(&self, a: f64, b: f64) -> f64 {
        match self {
            AggType::Sum => {
                let sum = a + b;
                if sum.is_nan() {
                    0.0
                } else {
                    sum
                }
            }
            AggType::Min => a.min(b),
            AggType::Max => a.max(b),
        }
    }
}

/// Parse the WEIGHTS arguments; defaults to 1.0 per key
pub fn parse_weights(args: &[&[u8]], num_keys: usize) -> OpResult<Vec<f64>> {
    if args.is_empty() {
        return Ok(vec![1.0; num_keys]);
    }
    if args.len() != num_keys {
        return Err(OpStatus::SyntaxErr);
    }
    args.iter()
        .map(|raw| {
            parse_double(raw).ok_or(OpStatus::InvalidValue(literals::WEIGHT_NOT_FLOAT))
        })
        .collect()
}

fn weighted(entries: Vec<(Bytes, f64)>, weight: f64) -> ScoredMap {
    entries
        .into_iter()
        .map(|(member, score)| {
            let w = score * weight;
            (member, if w.is_nan() { 0.0 } else { w })
        })
        .collect()
}

/// Union of the inputs. `weights` must match the input count.
pub fn union(inputs: Vec<Vec<(Bytes, f64)>>, weights: &[f64], agg: AggType) -> ScoredMap {
    debug_assert_eq!(inputs.len(), weights.len());
    let mut maps: Vec<ScoredMap> = inputs
        .into_iter()
        .zip(weights)
        .map(|(entries, &w)| weighted(entries, w))
        .collect();
    if maps.is_empty() {
        return ScoredMap::new();
    }
    // Mutate the largest map, fold the smaller ones into it
    let largest = maps
        .iter()
        .enumerate()
        .max_by_key(|(_, m)| m.len())
        .map(|(i, _)| i)
        .unwrap();
    let mut acc = maps.swap_remove(largest);
    for other in maps {
        for (member, score) in other {
            acc.entry(member)
                .and_modify(|s| *s = agg.combine(*s, score))
                .or_insert(score);
        }
    }
    acc
}

/// Intersection of the inputs; members missing from any side drop out
pub fn intersect(inputs: Vec<Vec<(Bytes, f64)>>, weights: &[f64], agg: AggType) -> ScoredMap {
    debug_assert_eq!(inputs.len(), weights.len());
    let maps: Vec<ScoredMap> = inputs
        .into_iter()
        .zip(weights)
        .map(|(entries, &w)| weighted(entries, w))
        .collect();
    if maps.is_empty() || maps.iter().any(|m| m.is_empty()) {
        return ScoredMap::new();
    }
    // Probe from the smallest input
    let smallest = maps
        .iter()
        .enumerate()
        .min_by_key(|(_, m)| m.len())
        .map(|(i, _)| i)
        .unwrap();
    let mut out = ScoredMap::new();
    'member: for (member, &seed) in &maps[smallest] {
        let mut score = seed;
        for (i, other) in maps.iter().enumerate() {
            if i == smallest {
                continue;
            }
            match other.get(member) {
                Some(&s) => score = agg.combine(score, s),
                None => continue 'member,
            }
        }
        out.insert(member.clone(), score);
    }
    out
}

/// Cardinality of the intersection, stopping early at `limit`
pub fn inter_card(inputs: Vec<Vec<(Bytes, f64)>>, limit: Option<usize>) -> usize {
    let ones = vec![1.0; inputs.len()];
    let full = intersect(inputs, &ones, AggType::Sum).len();
    match limit {
        Some(n) if n > 0 => full.min(n),
        _ => full,
    }
}

/// First input minus the union of the rest; scores come from the first
pub fn diff(inputs: Vec<Vec<(Bytes, f64)>>) -> ScoredMap {
    let mut iter = inputs.into_iter();
    let Some(first) = iter.next() else {
        return ScoredMap::new();
    };
    let mut out: ScoredMap = first.into_iter().collect();
    for other in iter {
        for (member, _) in other {
            out.remove(&member);
        }
    }
    out
}

/// Sorted (score, member) view of a result map, for replies and stores
pub fn into_sorted(map: ScoredMap) -> Vec<(Bytes, f64)> {
    let mut out: Vec<(Bytes, f64)> = map.into_iter().collect();
    out.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    out
}
