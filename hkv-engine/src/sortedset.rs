//! # Sorted Set
//!
//! Purpose: pairs a member→score dictionary with a `SkipList` so lookups are
//! O(1) and ordered/range/rank operations are O(log N). Invariant: both
//! structures always hold exactly the same member set.

use hashbrown::HashMap;

use crate::border::{LexBorder, ScoreBorder};
use crate::skiplist::SkipList;

#[derive(Debug)]
pub struct SortedSet {
    dict: HashMap<Vec<u8>, f64>,
    list: SkipList,
}

/// One (member, score) pair as returned from range/rank queries.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: Vec<u8>,
    pub score: f64,
}

impl SortedSet {
    pub fn new() -> Self {
        SortedSet { dict: HashMap::new(), list: SkipList::new() }
    }

    pub fn len(&self) -> usize {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    /// Adds or updates `member` with `score`. Returns true if this inserted a
    /// new member, false if it updated an existing one. A score change on an
    /// existing member is a remove-then-insert in the skip list.
    pub fn add(&mut self, member: Vec<u8>, score: f64) -> bool {
        match self.dict.get(&member).copied() {
            Some(old_score) => {
                if old_score != score {
                    self.list.remove(old_score, &member);
                    self.list.insert(score, member.clone());
                    self.dict.insert(member, score);
                }
                false
            }
            None => {
                self.list.insert(score, member.clone());
                self.dict.insert(member, score);
                true
            }
        }
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.dict.get(member).copied()
    }

    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.dict.remove(member) {
            Some(score) => {
                self.list.remove(score, member);
                true
            }
            None => false,
        }
    }

    /// Increments `member`'s score by `delta`, creating it at `delta` if absent.
    pub fn incr_by(&mut self, member: &[u8], delta: f64) -> f64 {
        let new_score = self.dict.get(member).copied().unwrap_or(0.0) + delta;
        self.add(member.to_vec(), new_score);
        new_score
    }

    /// 0-based rank; `desc` reverses the ordering (highest score first).
    pub fn rank(&self, member: &[u8], desc: bool) -> Option<u64> {
        let score = self.score(member)?;
        let forward_rank = self.list.rank(score, member)? - 1;
        if desc {
            Some(self.len() as u64 - 1 - forward_rank)
        } else {
            Some(forward_rank)
        }
    }

    /// 0-based `[start, stop]` inclusive rank range, `desc` for reverse order.
    pub fn range_by_rank(&self, start: i64, stop: i64, desc: bool) -> Vec<ScoredMember> {
        let len = self.len() as i64;
        if len == 0 {
            return Vec::new();
        }
        let (mut start, mut stop) = normalize_range(start, stop, len);
        if start > stop || start >= len {
            return Vec::new();
        }
        stop = stop.min(len - 1);
        start = start.max(0);

        let mut out = Vec::with_capacity((stop - start + 1) as usize);
        if desc {
            let mut idx = self.rank_to_node(len - 1 - start);
            let mut remaining = stop - start + 1;
            while remaining > 0 {
                let Some(node) = idx else { break };
                let (score, member) = self.list.entry(node);
                out.push(ScoredMember { member: member.to_vec(), score });
                idx = self.list.prev_of(node);
                remaining -= 1;
            }
        } else {
            let mut idx = self.rank_to_node(start);
            let mut remaining = stop - start + 1;
            while remaining > 0 {
                let Some(node) = idx else { break };
                let (score, member) = self.list.entry(node);
                out.push(ScoredMember { member: member.to_vec(), score });
                idx = self.list.next_of(node);
                remaining -= 1;
            }
        }
        out
    }

    fn rank_to_node(&self, zero_based_rank: i64) -> Option<usize> {
        if zero_based_rank < 0 {
            return None;
        }
        let mut idx = self.list.first()?;
        for _ in 0..zero_based_rank {
            idx = self.list.next_of(idx)?;
        }
        Some(idx)
    }

    pub fn count_by_score(&self, min: &ScoreBorder, max: &ScoreBorder) -> u64 {
        self.range_by_score(min, max, 0, None, false).len() as u64
    }

    /// Value-range scan with `offset`/`limit` (None = unlimited) and direction.
    pub fn range_by_score(
        &self,
        min: &ScoreBorder,
        max: &ScoreBorder,
        offset: u64,
        limit: Option<u64>,
        desc: bool,
    ) -> Vec<ScoredMember> {
        use crate::border::{score_range_empty, Border};
        if score_range_empty(min, max) {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut skipped = 0u64;
        let mut taken = 0u64;

        if !desc {
            let mut cursor = self.list.first_in_range(min, max);
            while let Some(idx) = cursor {
                let (score, member) = self.list.entry(idx);
                if !max.admits_as_max(&score) {
                    break;
                }
                if skipped < offset {
                    skipped += 1;
                } else {
                    out.push(ScoredMember { member: member.to_vec(), score });
                    taken += 1;
                    if let Some(l) = limit {
                        if taken >= l {
                            break;
                        }
                    }
                }
                cursor = self.list.next_of(idx);
            }
        } else {
            let mut cursor = self.list.last_in_range(min, max);
            while let Some(idx) = cursor {
                let (score, member) = self.list.entry(idx);
                if !min.admits_as_min(&score) {
                    break;
                }
                if skipped < offset {
                    skipped += 1;
                } else {
                    out.push(ScoredMember { member: member.to_vec(), score });
                    taken += 1;
                    if let Some(l) = limit {
                        if taken >= l {
                            break;
                        }
                    }
                }
                cursor = self.list.prev_of(idx);
            }
        }
        out
    }

    pub fn range_by_lex(&self, min: &LexBorder, max: &LexBorder, offset: u64, limit: Option<u64>, desc: bool) -> Vec<ScoredMember> {
        use crate::border::{lex_range_empty, Border};
        if lex_range_empty(min, max) {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut skipped = 0u64;
        let mut taken = 0u64;
        let mut cursor = if !desc { self.list.first() } else { self.list.last() };
        while let Some(idx) = cursor {
            let (score, member) = self.list.entry(idx);
            let in_range = min.admits_as_min(member) && max.admits_as_max(member);
            if in_range {
                if skipped < offset {
                    skipped += 1;
                } else {
                    out.push(ScoredMember { member: member.to_vec(), score });
                    taken += 1;
                    if let Some(l) = limit {
                        if taken >= l {
                            break;
                        }
                    }
                }
            }
            cursor = if !desc { self.list.next_of(idx) } else { self.list.prev_of(idx) };
        }
        out
    }

    /// Removes and returns up to `count` members with the lowest scores.
    pub fn pop_min(&mut self, count: u64) -> Vec<ScoredMember> {
        let mut out = Vec::new();
        for _ in 0..count {
            let Some(idx) = self.list.first() else { break };
            let (score, member) = self.list.entry(idx);
            let member = member.to_vec();
            self.remove(&member);
            out.push(ScoredMember { member, score });
        }
        out
    }

    /// Removes every member whose score lies in `[min, max]`; returns removed pairs.
    pub fn remove_range_by_score(&mut self, min: &ScoreBorder, max: &ScoreBorder) -> Vec<ScoredMember> {
        let victims = self.range_by_score(min, max, 0, None, false);
        for v in &victims {
            self.remove(&v.member);
        }
        victims
    }

    /// Removes the 0-based `[start, stop]` inclusive rank range; returns removed pairs.
    pub fn remove_range_by_rank(&mut self, start: i64, stop: i64) -> Vec<ScoredMember> {
        let victims = self.range_by_rank(start, stop, false);
        for v in &victims {
            self.remove(&v.member);
        }
        victims
    }

    pub fn for_each(&self, mut f: impl FnMut(&[u8], f64)) {
        let mut cursor = self.list.first();
        while let Some(idx) = cursor {
            let (score, member) = self.list.entry(idx);
            f(member, score);
            cursor = self.list.next_of(idx);
        }
    }
}

impl Default for SortedSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SortedSet {
    fn clone(&self) -> Self {
        let mut copy = SortedSet::new();
        self.for_each(|member, score| {
            copy.add(member.to_vec(), score);
        });
        copy
    }
}

/// Redis-style negative-index normalization: -1 is the last element.
fn normalize_range(start: i64, stop: i64, len: i64) -> (i64, i64) {
    let norm = |i: i64| if i < 0 { (len + i).max(0) } else { i };
    (norm(start), norm(stop))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_reports_insert_vs_update() {
        let mut set = SortedSet::new();
        assert!(set.add(b"a".to_vec(), 1.0));
        assert!(!set.add(b"a".to_vec(), 2.0));
        assert_eq!(set.score(b"a"), Some(2.0));
    }

    #[test]
    fn range_by_rank_supports_negative_indices_and_desc() {
        let mut set = SortedSet::new();
        for (m, s) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
            set.add(m.as_bytes().to_vec(), s);
        }
        let all = set.range_by_rank(0, -1, false);
        assert_eq!(all.iter().map(|e| e.member.clone()).collect::<Vec<_>>(), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        let desc = set.range_by_rank(0, -1, true);
        assert_eq!(desc.iter().map(|e| e.member.clone()).collect::<Vec<_>>(), vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn range_by_score_respects_limit_and_offset() {
        let mut set = SortedSet::new();
        for i in 0..10 {
            set.add(format!("m{i}").into_bytes(), i as f64);
        }
        let min = ScoreBorder::Finite { value: 2.0, exclude: false };
        let max = ScoreBorder::PosInf;
        let page = set.range_by_score(&min, &max, 1, Some(2), false);
        assert_eq!(page.iter().map(|e| e.score).collect::<Vec<_>>(), vec![3.0, 4.0]);
    }

    #[test]
    fn pop_min_removes_lowest_scores_in_order() {
        let mut set = SortedSet::new();
        set.add(b"a".to_vec(), 1.0);
        set.add(b"b".to_vec(), 2.0);
        set.add(b"c".to_vec(), 3.0);
        let popped = set.pop_min(2);
        assert_eq!(popped, vec![
            ScoredMember { member: b"a".to_vec(), score: 1.0 },
            ScoredMember { member: b"b".to_vec(), score: 2.0 },
        ]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn remove_range_by_score_deletes_matching_members() {
        let mut set = SortedSet::new();
        for i in 0..5 {
            set.add(format!("m{i}").into_bytes(), i as f64);
        }
        let min = ScoreBorder::Finite { value: 1.0, exclude: false };
        let max = ScoreBorder::Finite { value: 3.0, exclude: false };
        let removed = set.remove_range_by_score(&min, &max);
        assert_eq!(removed.len(), 3);
        assert_eq!(set.len(), 2);
    }
}
