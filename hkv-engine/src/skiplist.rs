//! # Skip List
//!
//! Purpose: rank-aware ordered index over (score, member) pairs backing
//! `SortedSet`. Arena-based rather than pointer-owned: nodes live in a `Vec`
//! and links are indices, which keeps backward/predecessor updates safe
//! without unsafe code.
//!
//! ## Design Principles
//! 1. **Span Invariant**: the sum of spans along any level from the head to
//!    a node equals that node's 1-based bottom-layer rank.
//! 2. **Arena Reuse**: removed slots go on a free list so long-running
//!    ZADD/ZREM churn doesn't grow the arena unbounded.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::border::Border;

pub const MAX_LEVEL: usize = 16;

#[derive(Debug, Clone)]
struct Level {
    forward: Option<usize>,
    span: u64,
}

#[derive(Debug, Clone)]
struct Node {
    member: Vec<u8>,
    score: f64,
    backward: Option<usize>,
    levels: Vec<Level>,
}

/// An ordered index of (score, member) pairs with O(log N) rank and range
/// queries. Ordering key is (score ascending, member lexicographic ascending).
#[derive(Debug)]
pub struct SkipList {
    arena: Vec<Option<Node>>,
    free: Vec<usize>,
    head_forward: Vec<Option<usize>>,
    head_span: Vec<u64>,
    tail: Option<usize>,
    level: usize,
    length: usize,
    rng: u64,
}

impl SkipList {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9E3779B97F4A7C15)
            | 1;
        SkipList {
            arena: Vec::new(),
            free: Vec::new(),
            head_forward: vec![None; MAX_LEVEL],
            head_span: vec![0; MAX_LEVEL],
            tail: None,
            level: 1,
            length: 0,
            rng: seed,
        }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Geometric level choice, p=1/2, capped at `MAX_LEVEL`: count the
    /// trailing zero bits of a freshly advanced xorshift word.
    fn random_level(&mut self) -> usize {
        // xorshift64*
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng = x;
        let word = (x & 0xFFFF) as u16;
        let level = word.trailing_zeros() as usize + 1;
        level.min(MAX_LEVEL)
    }

    fn node(&self, idx: usize) -> &Node {
        self.arena[idx].as_ref().expect("arena slot is live")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.arena[idx].as_mut().expect("arena slot is live")
    }

    fn forward_at(&self, idx: Option<usize>, level: usize) -> Option<usize> {
        match idx {
            None => self.head_forward[level],
            Some(i) => self.node(i).levels.get(level).and_then(|l| l.forward),
        }
    }

    fn span_at(&self, idx: Option<usize>, level: usize) -> u64 {
        match idx {
            None => self.head_span[level],
            Some(i) => self.node(i).levels.get(level).map(|l| l.span).unwrap_or(0),
        }
    }

    fn key_of(&self, idx: usize) -> (f64, &[u8]) {
        let n = self.node(idx);
        (n.score, n.member.as_slice())
    }

    /// Inserts (score, member); the caller guarantees the member is not
    /// already present (`SortedSet` enforces uniqueness via its dict).
    pub fn insert(&mut self, score: f64, member: Vec<u8>) {
        let mut update: [Option<usize>; MAX_LEVEL] = [None; MAX_LEVEL];
        let mut rank: [u64; MAX_LEVEL] = [0; MAX_LEVEL];

        let mut cursor: Option<usize> = None;
        for i in (0..self.level).rev() {
            rank[i] = if i == self.level - 1 { 0 } else { rank[i + 1] };
            loop {
                let fwd = self.forward_at(cursor, i);
                let should_advance = match fwd {
                    Some(f) => {
                        let (fs, fm) = self.key_of(f);
                        (fs, fm) < (score, member.as_slice())
                    }
                    None => false,
                };
                if should_advance {
                    rank[i] += self.span_at(cursor, i);
                    cursor = fwd;
                } else {
                    break;
                }
            }
            update[i] = cursor;
        }

        let new_level = self.random_level();
        if new_level > self.level {
            for i in self.level..new_level {
                rank[i] = 0;
                update[i] = None;
                self.head_span[i] = self.length as u64;
            }
            self.level = new_level;
        }

        let idx = self.free.pop().unwrap_or_else(|| {
            self.arena.push(None);
            self.arena.len() - 1
        });
        self.arena[idx] = Some(Node {
            member: member.clone(),
            score,
            backward: None,
            levels: (0..new_level).map(|_| Level { forward: None, span: 0 }).collect(),
        });

        for i in 0..new_level {
            let pred = update[i];
            let fwd = self.forward_at(pred, i);
            self.node_mut(idx).levels[i].forward = fwd;
            match pred {
                None => {
                    self.node_mut(idx).levels[i].span = self.head_span[i] - (rank[0] - rank[i]);
                    self.head_span[i] = rank[0] - rank[i] + 1;
                    self.head_forward[i] = Some(idx);
                }
                Some(p) => {
                    let p_span = self.node(p).levels[i].span;
                    self.node_mut(idx).levels[i].span = p_span - (rank[0] - rank[i]);
                    self.node_mut(p).levels[i].span = rank[0] - rank[i] + 1;
                    self.node_mut(p).levels[i].forward = Some(idx);
                }
            }
        }

        for i in new_level..self.level {
            match update[i] {
                None => self.head_span[i] += 1,
                Some(p) => self.node_mut(p).levels[i].span += 1,
            }
        }

        let backward = update[0];
        self.node_mut(idx).backward = backward;
        match self.forward_at(Some(idx), 0) {
            Some(next) => self.node_mut(next).backward = Some(idx),
            None => self.tail = Some(idx),
        }

        self.length += 1;
    }

    /// Removes the node matching `(score, member)` exactly; false if absent.
    pub fn remove(&mut self, score: f64, member: &[u8]) -> bool {
        let mut update: [Option<usize>; MAX_LEVEL] = [None; MAX_LEVEL];
        let mut cursor: Option<usize> = None;
        for i in (0..self.level).rev() {
            loop {
                let fwd = self.forward_at(cursor, i);
                let should_advance = match fwd {
                    Some(f) => {
                        let (fs, fm) = self.key_of(f);
                        (fs, fm) < (score, member)
                    }
                    None => false,
                };
                if should_advance {
                    cursor = fwd;
                } else {
                    break;
                }
            }
            update[i] = cursor;
        }

        let target = self.forward_at(cursor, 0);
        let target = match target {
            Some(t) if self.key_of(t) == (score, member) => t,
            _ => return false,
        };

        let target_levels = self.node(target).levels.len();
        for i in 0..self.level {
            match update[i] {
                None => {
                    if self.head_forward[i] == Some(target) {
                        self.head_forward[i] = if i < target_levels { self.node(target).levels[i].forward } else { None };
                        self.head_span[i] += if i < target_levels { self.node(target).levels[i].span } else { 0 };
                        self.head_span[i] -= 1;
                    } else {
                        self.head_span[i] -= 1;
                    }
                }
                Some(p) => {
                    if self.node(p).levels[i].forward == Some(target) {
                        let (t_fwd, t_span) = if i < target_levels {
                            (self.node(target).levels[i].forward, self.node(target).levels[i].span)
                        } else {
                            (None, 0)
                        };
                        self.node_mut(p).levels[i].forward = t_fwd;
                        self.node_mut(p).levels[i].span += t_span - 1;
                    } else {
                        self.node_mut(p).levels[i].span -= 1;
                    }
                }
            }
        }

        let backward = self.node(target).backward;
        match self.forward_at(Some(target), 0) {
            Some(next) => self.node_mut(next).backward = backward,
            None => self.tail = backward,
        }

        while self.level > 1 && self.head_forward[self.level - 1].is_none() {
            self.level -= 1;
        }

        self.arena[target] = None;
        self.free.push(target);
        self.length -= 1;
        true
    }

    /// 1-based rank of `(score, member)`, or `None` if absent.
    pub fn rank(&self, score: f64, member: &[u8]) -> Option<u64> {
        let mut cursor: Option<usize> = None;
        let mut rank: u64 = 0;
        for i in (0..self.level).rev() {
            loop {
                let fwd = self.forward_at(cursor, i);
                let should_advance = match fwd {
                    Some(f) => {
                        let (fs, fm) = self.key_of(f);
                        (fs, fm) < (score, member) || (fs, fm) == (score, member)
                    }
                    None => false,
                };
                if !should_advance {
                    break;
                }
                rank += self.span_at(cursor, i);
                cursor = fwd;
                if let Some(c) = cursor {
                    if self.key_of(c) == (score, member) {
                        return Some(rank);
                    }
                }
            }
        }
        None
    }

    /// 1-based rank lookup by position; `rank` is 1-based.
    pub fn by_rank(&self, rank: u64) -> Option<(f64, &[u8])> {
        if rank == 0 || rank > self.length as u64 {
            return None;
        }
        let mut cursor: Option<usize> = None;
        let mut traversed: u64 = 0;
        for i in (0..self.level).rev() {
            loop {
                let fwd = self.forward_at(cursor, i);
                let span = self.span_at(cursor, i);
                if fwd.is_some() && traversed + span <= rank {
                    traversed += span;
                    cursor = fwd;
                } else {
                    break;
                }
            }
            if traversed == rank {
                break;
            }
        }
        cursor.map(|idx| {
            let n = self.node(idx);
            (n.score, n.member.as_slice())
        })
    }

    /// First node whose score/member lies within `[min, max]`, scanning by
    /// skip-list descent rather than a linear walk.
    pub fn first_in_range<B>(&self, min: &B, max: &B) -> Option<usize>
    where
        B: Border<f64>,
    {
        let mut cursor: Option<usize> = None;
        for i in (0..self.level).rev() {
            loop {
                let fwd = self.forward_at(cursor, i);
                let should_advance = match fwd {
                    Some(f) => !min.admits_as_min(&self.node(f).score),
                    None => false,
                };
                if should_advance {
                    cursor = fwd;
                } else {
                    break;
                }
            }
        }
        let candidate = self.forward_at(cursor, 0)?;
        if max.admits_as_max(&self.node(candidate).score) {
            Some(candidate)
        } else {
            None
        }
    }

    pub fn last_in_range<B>(&self, min: &B, max: &B) -> Option<usize>
    where
        B: Border<f64>,
    {
        let mut cursor: Option<usize> = None;
        for i in (0..self.level).rev() {
            loop {
                let fwd = self.forward_at(cursor, i);
                let should_advance = match fwd {
                    Some(f) => max.admits_as_max(&self.node(f).score),
                    None => false,
                };
                if should_advance {
                    cursor = fwd;
                } else {
                    break;
                }
            }
        }
        let candidate = cursor?;
        if min.admits_as_min(&self.node(candidate).score) {
            Some(candidate)
        } else {
            None
        }
    }

    pub fn entry(&self, idx: usize) -> (f64, &[u8]) {
        self.key_of(idx)
    }

    pub fn next_of(&self, idx: usize) -> Option<usize> {
        self.forward_at(Some(idx), 0)
    }

    pub fn prev_of(&self, idx: usize) -> Option<usize> {
        self.node(idx).backward
    }

    pub fn first(&self) -> Option<usize> {
        self.head_forward[0]
    }

    pub fn last(&self) -> Option<usize> {
        self.tail
    }
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::border::ScoreBorder;

    fn collect(list: &SkipList) -> Vec<(f64, Vec<u8>)> {
        let mut out = Vec::new();
        let mut cursor = list.first();
        while let Some(idx) = cursor {
            let (s, m) = list.entry(idx);
            out.push((s, m.to_vec()));
            cursor = list.next_of(idx);
        }
        out
    }

    #[test]
    fn insert_keeps_order_and_spans() {
        let mut list = SkipList::new();
        list.insert(3.0, b"c".to_vec());
        list.insert(1.0, b"a".to_vec());
        list.insert(2.0, b"b".to_vec());
        assert_eq!(
            collect(&list),
            vec![(1.0, b"a".to_vec()), (2.0, b"b".to_vec()), (3.0, b"c".to_vec())]
        );
        assert_eq!(list.rank(2.0, b"b"), Some(2));
        assert_eq!(list.by_rank(1).map(|(s, m)| (s, m.to_vec())), Some((1.0, b"a".to_vec())));
        assert_eq!(list.by_rank(3).map(|(s, m)| (s, m.to_vec())), Some((3.0, b"c".to_vec())));
    }

    #[test]
    fn remove_unlinks_and_shrinks_length() {
        let mut list = SkipList::new();
        for i in 0..20 {
            list.insert(i as f64, format!("m{i:02}").into_bytes());
        }
        assert!(list.remove(10.0, b"m10"));
        assert_eq!(list.len(), 19);
        assert!(!list.remove(10.0, b"m10"));
        assert_eq!(list.rank(11.0, b"m11"), Some(11));
    }

    #[test]
    fn range_scan_respects_borders() {
        let mut list = SkipList::new();
        for i in 0..10 {
            list.insert(i as f64, format!("m{i}").into_bytes());
        }
        let min = ScoreBorder::Finite { value: 3.0, exclude: false };
        let max = ScoreBorder::Finite { value: 6.0, exclude: true };
        let mut out = Vec::new();
        let mut cursor = list.first_in_range(&min, &max);
        while let Some(idx) = cursor {
            let (s, _) = list.entry(idx);
            if !max.admits_as_max(&s) {
                break;
            }
            out.push(s);
            cursor = list.next_of(idx);
        }
        assert_eq!(out, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn backward_walk_from_tail_reaches_head() {
        let mut list = SkipList::new();
        for i in 0..5 {
            list.insert(i as f64, format!("m{i}").into_bytes());
        }
        let mut out = Vec::new();
        let mut cursor = list.last();
        while let Some(idx) = cursor {
            let (s, _) = list.entry(idx);
            out.push(s);
            cursor = list.prev_of(idx);
        }
        assert_eq!(out, vec![4.0, 3.0, 2.0, 1.0, 0.0]);
    }
}
