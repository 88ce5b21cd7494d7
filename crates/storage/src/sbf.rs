//! Scalable Bloom filter
//!
//! A stack of plain Bloom filters. When the newest filter reaches its
//! capacity a larger one (2x) with a tighter error target is pushed on top.
//! Membership consults every layer; inserts go to the newest.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

/// Error-probability shrink factor applied to each new layer
const TIGHTENING_RATIO: f64 = 0.5;

/// Capacity growth factor for each new layer
const GROWTH_FACTOR: usize = 2;

struct BloomLayer {
    bits: Vec<u64>,
    bit_count: u64,
    hash_count: u32,
    capacity: usize,
    inserted: usize,
}

impl BloomLayer {
    fn new(capacity: usize, fp_prob: f64) -> Self {
        // Standard sizing: m = -n ln p / (ln 2)^2, k = m/n ln 2
        let ln2 = std::f64::consts::LN_2;
        let m = (-(capacity as f64) * fp_prob.ln() / (ln2 * ln2)).ceil().max(64.0) as u64;
        let k = ((m as f64 / capacity as f64) * ln2).round().max(1.0) as u32;
        Self {
            bits: vec![0u64; m.div_ceil(64) as usize],
            bit_count: m,
            hash_count: k,
            capacity,
            inserted: 0,
        }
    }

    fn index_pair(item: &[u8]) -> (u64, u64) {
        let mut h1 = DefaultHasher::new();
        h1.write(item);
        let a = h1.finish();
        let mut h2 = DefaultHasher::new();
        h2.write_u64(a);
        h2.write(item);
        (a, h2.finish() | 1)
    }

    fn set(&mut self, item: &[u8]) {
        let (a, b) = Self::index_pair(item);
        for i in 0..self.hash_count as u64 {
            let bit = a.wrapping_add(i.wrapping_mul(b)) % self.bit_count;
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
        self.inserted += 1;
    }

    fn test(&self, item: &[u8]) -> bool {
        let (a, b) = Self::index_pair(item);
        (0..self.hash_count as u64).all(|i| {
            let bit = a.wrapping_add(i.wrapping_mul(b)) % self.bit_count;
            self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0
        })
    }

    fn is_full(&self) -> bool {
        self.inserted >= self.capacity
    }

    fn mem_used(&self) -> usize {
        self.bits.len() * 8
    }
}

/// Scalable Bloom filter value payload
pub struct Sbf {
    layers: Vec<BloomLayer>,
    fp_prob: f64,
    items: usize,
}

impl Sbf {
    pub fn new(initial_capacity: usize, fp_prob: f64) -> Self {
        Self {
            layers: vec![BloomLayer::new(initial_capacity.max(1), fp_prob)],
            fp_prob,
            items: 0,
        }
    }

    /// Insert an item; returns false if it was (probably) already present
    pub fn add(&mut self, item: &[u8]) -> bool {
        if self.might_contain(item) {
            return false;
        }
        if self.layers.last().unwrap().is_full() {
            let last = self.layers.last().unwrap();
            let capacity = last.capacity * GROWTH_FACTOR;
            let prob = self.fp_prob * TIGHTENING_RATIO.powi(self.layers.len() as i32);
            self.layers.push(BloomLayer::new(capacity, prob));
        }
        self.layers.last_mut().unwrap().set(item);
        self.items += 1;
        true
    }

    /// Probabilistic membership test (no false negatives)
    pub fn might_contain(&self, item: &[u8]) -> bool {
        self.layers.iter().any(|layer| layer.test(item))
    }

    /// Items successfully added
    pub fn len(&self) -> usize {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    /// Approximate heap usage in bytes
    pub fn mem_used(&self) -> usize {
        self.layers.iter().map(BloomLayer::mem_used).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut sbf = Sbf::new(100, 0.01);
        let items: Vec<String> = (0..1000).map(|i| format!("item-{i}")).collect();
        for item in &items {
            sbf.add(item.as_bytes());
        }
        for item in &items {
            assert!(sbf.might_contain(item.as_bytes()));
        }
        // Growth happened: initial capacity was 100
        assert!(sbf.layers.len() > 1);
    }

    #[test]
    fn test_duplicate_add_reports_existing() {
        let mut sbf = Sbf::new(16, 0.01);
        assert!(sbf.add(b"dup"));
        assert!(!sbf.add(b"dup"));
        assert_eq!(sbf.len(), 1);
    }

    #[test]
    fn test_false_positive_rate_reasonable() {
        let mut sbf = Sbf::new(1000, 0.01);
        for i in 0..1000 {
            sbf.add(format!("present-{i}").as_bytes());
        }
        let false_hits = (0..10_000)
            .filter(|i| sbf.might_contain(format!("absent-{i}").as_bytes()))
            .count();
        // Headroom over the nominal 1% target
        assert!(false_hits < 500, "false positive count {false_hits}");
    }
}
