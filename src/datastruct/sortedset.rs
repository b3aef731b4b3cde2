//! Sorted set: a member index paired with a skip list.
//!
//! The hash map answers existence and score lookups in O(1); the skip list
//! keeps (score, member) order for rank and range queries. `add` keeps the
//! two views consistent by removing the old node before re-inserting when a
//! member's score changes.

use std::collections::HashMap;

use crate::datastruct::border::{RangeBorder, ScoreBorder};
use crate::datastruct::skiplist::{Element, SkipList};

#[derive(Debug, Clone, Default)]
pub struct SortedSet {
    dict: HashMap<String, f64>,
    skiplist: SkipList,
}

impl SortedSet {
    pub fn new() -> Self {
        SortedSet {
            dict: HashMap::new(),
            skiplist: SkipList::new(),
        }
    }

    /// Inserts or updates a member. Returns true when the member was new.
    pub fn add(&mut self, member: &str, score: f64) -> bool {
        let old = self.dict.insert(member.to_string(), score);
        match old {
            Some(old_score) => {
                if score != old_score {
                    self.skiplist.remove(member, old_score);
                    self.skiplist.insert(member, score);
                }
                false
            }
            None => {
                self.skiplist.insert(member, score);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    pub fn get(&self, member: &str) -> Option<f64> {
        self.dict.get(member).copied()
    }

    pub fn remove(&mut self, member: &str) -> bool {
        match self.dict.remove(member) {
            Some(score) => {
                self.skiplist.remove(member, score);
                true
            }
            None => false,
        }
    }

    /// 0-based rank of a member; `None` distinguishes a miss from rank 0.
    /// Descending rank is `len - 1 - ascending`.
    pub fn rank(&self, member: &str, desc: bool) -> Option<usize> {
        let score = self.dict.get(member)?;
        let ascending = self.skiplist.rank(member, *score);
        if ascending == 0 {
            return None;
        }
        if desc {
            Some(self.skiplist.len() - ascending)
        } else {
            Some(ascending - 1)
        }
    }

    /// Visits elements with 0-based rank in `[start, stop)`, ascending or
    /// descending. The range must be inside `[0, len]`; callers clamp.
    pub fn for_each_by_rank(
        &self,
        start: usize,
        stop: usize,
        desc: bool,
        mut consumer: impl FnMut(&Element) -> bool,
    ) {
        let size = self.len();
        assert!(start < size, "illegal start {}", start);
        assert!(stop > start && stop <= size, "illegal stop {}", stop);

        let mut node = if desc {
            if start > 0 {
                self.skiplist.by_rank(size - start)
            } else {
                self.skiplist.tail_index()
            }
        } else if start > 0 {
            // The skip list counts the sentinel header as rank 0.
            self.skiplist.by_rank(start + 1)
        } else {
            self.skiplist.first_index()
        };

        let slice_size = stop - start;
        for _ in 0..slice_size {
            let Some(index) = node else { break };
            if !consumer(self.skiplist.element(index)) {
                break;
            }
            node = if desc {
                self.skiplist.prev_index(index)
            } else {
                self.skiplist.next_index(index)
            };
        }
    }

    pub fn range_by_rank(&self, start: usize, stop: usize, desc: bool) -> Vec<Element> {
        if stop <= start {
            return Vec::new();
        }
        let mut slice = Vec::with_capacity(stop - start);
        self.for_each_by_rank(start, stop, desc, |element| {
            slice.push(element.clone());
            true
        });
        slice
    }

    /// Number of elements inside `[min, max]`.
    pub fn range_count<B: RangeBorder>(&self, min: &B, max: &B) -> usize {
        if self.is_empty() {
            return 0;
        }
        let mut count = 0;
        self.for_each_by_rank(0, self.len(), false, |element| {
            if !min.less(element) {
                return true;
            }
            if !max.greater(element) {
                return false;
            }
            count += 1;
            true
        });
        count
    }

    /// Walks elements inside `[min, max]` from `offset`, at most `limit`
    /// elements when `limit >= 0`, unlimited otherwise.
    pub fn for_each_in_range<B: RangeBorder>(
        &self,
        min: &B,
        max: &B,
        offset: usize,
        limit: i64,
        desc: bool,
        mut consumer: impl FnMut(&Element) -> bool,
    ) {
        let mut node = if desc {
            self.skiplist.last_in_range(min, max)
        } else {
            self.skiplist.first_in_range(min, max)
        };
        let mut remaining_offset = offset;
        while remaining_offset > 0 {
            let Some(index) = node else { return };
            node = if desc {
                self.skiplist.prev_index(index)
            } else {
                self.skiplist.next_index(index)
            };
            remaining_offset -= 1;
        }
        let mut taken = 0i64;
        while limit < 0 || taken < limit {
            let Some(index) = node else { break };
            if !consumer(self.skiplist.element(index)) {
                break;
            }
            taken += 1;
            node = if desc {
                self.skiplist.prev_index(index)
            } else {
                self.skiplist.next_index(index)
            };
            match node {
                Some(next) => {
                    let element = self.skiplist.element(next);
                    if !min.less(element) || !max.greater(element) {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    pub fn range<B: RangeBorder>(
        &self,
        min: &B,
        max: &B,
        offset: usize,
        limit: i64,
        desc: bool,
    ) -> Vec<Element> {
        if limit == 0 {
            return Vec::new();
        }
        let mut slice = Vec::new();
        self.for_each_in_range(min, max, offset, limit, desc, |element| {
            slice.push(element.clone());
            true
        });
        slice
    }

    pub fn remove_range<B: RangeBorder>(&mut self, min: &B, max: &B) -> usize {
        let removed = self.skiplist.remove_range(min, max, 0);
        for element in &removed {
            self.dict.remove(&element.member);
        }
        removed.len()
    }

    /// Removes the `count` smallest elements.
    pub fn pop_min(&mut self, count: usize) -> Vec<Element> {
        let first = match self
            .skiplist
            .first_in_range(&ScoreBorder::NEG_INF, &ScoreBorder::POS_INF)
        {
            Some(index) => self.skiplist.element(index).clone(),
            None => return Vec::new(),
        };
        let border = ScoreBorder::inclusive(first.score);
        let removed = self
            .skiplist
            .remove_range(&border, &ScoreBorder::POS_INF, count);
        for element in &removed {
            self.dict.remove(&element.member);
        }
        removed
    }

    /// Removes elements with 0-based rank in `[start, stop)`.
    pub fn remove_by_rank(&mut self, start: usize, stop: usize) -> usize {
        // Shift by one for the skip list's sentinel rank.
        let removed = self.skiplist.remove_range_by_rank(start + 1, stop + 1);
        for element in &removed {
            self.dict.remove(&element.member);
        }
        removed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastruct::border::parse_score_border;

    fn sample() -> SortedSet {
        let mut zset = SortedSet::new();
        for (member, score) in [("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)] {
            zset.add(member, score);
        }
        zset
    }

    #[test]
    fn test_add_and_update() {
        let mut zset = SortedSet::new();
        assert!(zset.add("a", 1.0));
        assert!(!zset.add("a", 5.0));
        assert_eq!(zset.get("a"), Some(5.0));
        assert_eq!(zset.len(), 1);
        assert_eq!(zset.rank("a", false), Some(0));
    }

    #[test]
    fn test_rank_both_directions() {
        let zset = sample();
        assert_eq!(zset.rank("a", false), Some(0));
        assert_eq!(zset.rank("d", false), Some(3));
        assert_eq!(zset.rank("d", true), Some(0));
        assert_eq!(zset.rank("a", true), Some(3));
        assert_eq!(zset.rank("missing", false), None);
    }

    #[test]
    fn test_range_by_rank() {
        let zset = sample();
        let ascending: Vec<_> = zset
            .range_by_rank(0, 4, false)
            .into_iter()
            .map(|e| e.member)
            .collect();
        assert_eq!(ascending, vec!["a", "b", "c", "d"]);

        let descending: Vec<_> = zset
            .range_by_rank(1, 3, true)
            .into_iter()
            .map(|e| e.member)
            .collect();
        assert_eq!(descending, vec!["c", "b"]);
    }

    #[test]
    fn test_range_by_score_with_offset_and_limit() {
        let zset = sample();
        let min = parse_score_border("(1").unwrap();
        let max = parse_score_border("4").unwrap();
        let all: Vec<_> = zset
            .range(&min, &max, 0, -1, false)
            .into_iter()
            .map(|e| e.member)
            .collect();
        assert_eq!(all, vec!["b", "c", "d"]);

        let limited: Vec<_> = zset
            .range(&min, &max, 1, 1, false)
            .into_iter()
            .map(|e| e.member)
            .collect();
        assert_eq!(limited, vec!["c"]);

        let reversed: Vec<_> = zset
            .range(&min, &max, 0, -1, true)
            .into_iter()
            .map(|e| e.member)
            .collect();
        assert_eq!(reversed, vec!["d", "c", "b"]);
    }

    #[test]
    fn test_range_count() {
        let zset = sample();
        let min = parse_score_border("2").unwrap();
        let max = parse_score_border("(4").unwrap();
        assert_eq!(zset.range_count(&min, &max), 2);
    }

    #[test]
    fn test_remove_range_and_by_rank() {
        let mut zset = sample();
        let min = parse_score_border("2").unwrap();
        let max = parse_score_border("3").unwrap();
        assert_eq!(zset.remove_range(&min, &max), 2);
        assert_eq!(zset.len(), 2);
        assert_eq!(zset.get("b"), None);

        let mut zset = sample();
        assert_eq!(zset.remove_by_rank(0, 2), 2);
        assert_eq!(zset.get("a"), None);
        assert_eq!(zset.get("b"), None);
        assert_eq!(zset.rank("c", false), Some(0));
    }

    #[test]
    fn test_pop_min() {
        let mut zset = sample();
        let popped = zset.pop_min(2);
        let members: Vec<_> = popped.iter().map(|e| e.member.as_str()).collect();
        assert_eq!(members, vec!["a", "b"]);
        assert_eq!(zset.len(), 2);
        assert_eq!(zset.get("a"), None);

        let rest = zset.pop_min(10);
        assert_eq!(rest.len(), 2);
        assert!(zset.is_empty());
        assert!(zset.pop_min(1).is_empty());
    }
}
