//! Skip list keyed by (score, member)
//!
//! Probabilistic skip list over an index arena (no raw pointers). Every
//! level link carries a span count, which is what makes rank queries
//! O(log N). Nodes are ordered by score, ties broken by member bytes,
//! matching the observable ordering of the packed encoding.

use bytes::Bytes;
use rand::Rng;

const MAX_LEVEL: usize = 32;
const HEAD: u32 = 0;
pub const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct Link {
    forward: u32,
    /// Nodes skipped by following this link (including the target)
    span: u32,
}

const EMPTY_LINK: Link = Link { forward: NIL, span: 0 };

#[derive(Debug)]
struct Node {
    member: Bytes,
    score: f64,
    backward: u32,
    links: Vec<Link>,
}

/// Skip list with per-level spans
#[derive(Debug)]
pub struct SkipList {
    nodes: Vec<Node>,
    free: Vec<u32>,
    level: usize,
    len: usize,
    tail: u32,
}

/// Strict (score, member) order
fn key_less(a_score: f64, a_member: &[u8], b_score: f64, b_member: &[u8]) -> bool {
    if a_score != b_score {
        return a_score < b_score;
    }
    a_member < b_member
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

impl SkipList {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                member: Bytes::new(),
                score: f64::NEG_INFINITY,
                backward: NIL,
                links: vec![EMPTY_LINK],
            }],
            free: Vec::new(),
            level: 1,
            len: 0,
            tail: NIL,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn member(&self, idx: u32) -> &Bytes {
        &self.nodes[idx as usize].member
    }

    pub fn score(&self, idx: u32) -> f64 {
        self.nodes[idx as usize].score
    }

    /// Next node in (score, member) order
    pub fn next(&self, idx: u32) -> u32 {
        self.nodes[idx as usize].links[0].forward
    }

    /// Previous node, or NIL at the front
    pub fn prev(&self, idx: u32) -> u32 {
        let back = self.nodes[idx as usize].backward;
        if back == HEAD {
            NIL
        } else {
            back
        }
    }

    /// First node, or NIL when empty
    pub fn front(&self) -> u32 {
        self.nodes[HEAD as usize].links[0].forward
    }

    pub fn back(&self) -> u32 {
        self.tail
    }

    fn random_level(rng: &mut impl Rng) -> usize {
        let mut level = 1;
        while level < MAX_LEVEL && rng.gen_ratio(1, 4) {
            level += 1;
        }
        level
    }

    fn alloc_node(&mut self, member: Bytes, score: f64, levels: usize) -> u32 {
        let node = Node {
            member,
            score,
            backward: NIL,
            links: vec![EMPTY_LINK; levels],
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as u32
            }
        }
    }

    /// Insert a member that is not already present at this (score, member)
    pub fn insert(&mut self, member: Bytes, score: f64) {
        debug_assert!(!score.is_nan());
        let mut update = [HEAD; MAX_LEVEL];
        let mut rank = [0u32; MAX_LEVEL];

        let mut x = HEAD;
        for i in (0..self.level).rev() {
            rank[i] = if i == self.level - 1 { 0 } else { rank[i + 1] };
            loop {
                let link = self.nodes[x as usize].links[i];
                if link.forward == NIL {
                    break;
                }
                let fwd = &self.nodes[link.forward as usize];
                if key_less(fwd.score, &fwd.member, score, &member) {
                    rank[i] += link.span;
                    x = link.forward;
                } else {
                    break;
                }
            }
            update[i] = x;
        }

        let levels = Self::random_level(&mut rand::thread_rng());
        if levels > self.level {
            for i in self.level..levels {
                rank[i] = 0;
                update[i] = HEAD;
                self.nodes[HEAD as usize].links.push(Link {
                    forward: NIL,
                    span: self.len as u32,
                });
            }
            self.level = levels;
        }

        let idx = self.alloc_node(member, score, levels);
        for i in 0..levels {
            let up = update[i] as usize;
            let up_link = self.nodes[up].links[i];
            self.nodes[idx as usize].links[i] = Link {
                forward: up_link.forward,
                span: up_link.span - (rank[0] - rank[i]),
            };
            self.nodes[up].links[i] = Link {
                forward: idx,
                span: rank[0] - rank[i] + 1,
            };
        }
        for i in levels..self.level {
            self.nodes[update[i] as usize].links[i].span += 1;
        }

        self.nodes[idx as usize].backward = if update[0] == HEAD { HEAD } else { update[0] };
        let after = self.nodes[idx as usize].links[0].forward;
        if after != NIL {
            self.nodes[after as usize].backward = idx;
        } else {
            self.tail = idx;
        }
        self.len += 1;
    }

    /// Remove an exact (member, score) pair; returns false if absent
    pub fn delete(&mut self, member: &[u8], score: f64) -> bool {
        let mut update = [HEAD; MAX_LEVEL];
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            loop {
                let link = self.nodes[x as usize].links[i];
                if link.forward == NIL {
                    break;
                }
                let fwd = &self.nodes[link.forward as usize];
                if key_less(fwd.score, &fwd.member, score, member) {
                    x = link.forward;
                } else {
                    break;
                }
            }
            update[i] = x;
        }

        let target = self.nodes[update[0] as usize].links[0].forward;
        if target == NIL {
            return false;
        }
        {
            let node = &self.nodes[target as usize];
            if node.score != score || &*node.member != member {
                return false;
            }
        }

        for i in 0..self.level {
            let up = update[i] as usize;
            let up_link = self.nodes[up].links[i];
            if up_link.forward == target {
                let target_link = self.nodes[target as usize].links[i];
                self.nodes[up].links[i] = Link {
                    forward: target_link.forward,
                    span: up_link.span + target_link.span - 1,
                };
            } else {
                self.nodes[up].links[i].span -= 1;
            }
        }

        let after = self.nodes[target as usize].links[0].forward;
        let before = self.nodes[target as usize].backward;
        if after != NIL {
            self.nodes[after as usize].backward = before;
        } else {
            self.tail = if before == HEAD { NIL } else { before };
        }

        while self.level > 1
            && self.nodes[HEAD as usize].links[self.level - 1].forward == NIL
        {
            self.nodes[HEAD as usize].links.pop();
            self.level -= 1;
        }

        self.nodes[target as usize].member = Bytes::new();
        self.free.push(target);
        self.len -= 1;
        true
    }

    /// 0-based rank of an exact (member, score) pair
    pub fn rank_of(&self, member: &[u8], score: f64) -> Option<usize> {
        let mut x = HEAD;
        let mut rank = 0u32;
        for i in (0..self.level).rev() {
            loop {
                let link = self.nodes[x as usize].links[i];
                if link.forward == NIL {
                    break;
                }
                let fwd = &self.nodes[link.forward as usize];
                if key_less(fwd.score, &fwd.member, score, member)
                    || (fwd.score == score && &*fwd.member == member)
                {
                    rank += link.span;
                    x = link.forward;
                } else {
                    break;
                }
            }
        }
        if x != HEAD && &*self.nodes[x as usize].member == member {
            Some(rank as usize - 1)
        } else {
            None
        }
    }

    /// Node at 0-based rank
    pub fn at_rank(&self, rank: usize) -> Option<u32> {
        if rank >= self.len {
            return None;
        }
        let target = rank as u32 + 1;
        let mut x = HEAD;
        let mut traversed = 0u32;
        for i in (0..self.level).rev() {
            loop {
                let link = self.nodes[x as usize].links[i];
                if link.forward != NIL && traversed + link.span <= target {
                    traversed += link.span;
                    x = link.forward;
                } else {
                    break;
                }
            }
            if traversed == target {
                return Some(x);
            }
        }
        None
    }

    /// First node whose score is ≥ `min` (or > with `exclusive`),
    /// together with its 0-based rank. NIL when none qualify.
    pub fn first_in_score(&self, min: f64, exclusive: bool) -> (u32, usize) {
        self.descend(|score, _| {
            if exclusive {
                score <= min
            } else {
                score < min
            }
        })
    }

    /// First node whose member is ≥ `min` (or > with `exclusive`).
    /// Meaningful when all scores are equal, which is the lex contract.
    pub fn first_in_lex(&self, min: &[u8], exclusive: bool) -> (u32, usize) {
        self.descend(|_, member| {
            if exclusive {
                member <= min
            } else {
                member < min
            }
        })
    }

    /// Descend to the first node where `before` is false; `before` must
    /// be monotone along the list
    fn descend(&self, before: impl Fn(f64, &[u8]) -> bool) -> (u32, usize) {
        let mut x = HEAD;
        let mut rank = 0u32;
        for i in (0..self.level).rev() {
            loop {
                let link = self.nodes[x as usize].links[i];
                if link.forward == NIL {
                    break;
                }
                let fwd = &self.nodes[link.forward as usize];
                if before(fwd.score, &fwd.member) {
                    rank += link.span;
                    x = link.forward;
                } else {
                    break;
                }
            }
        }
        (self.nodes[x as usize].links[0].forward, rank as usize)
    }
}
