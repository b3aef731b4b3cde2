//! Probabilistic skip list with rank support.
//!
//! Nodes live in an arena and link to each other by index, with a sentinel
//! header occupying rank 0. Every level pointer carries a `span`: the number
//! of level-0 nodes its forward jump crosses. Maintaining spans on insert and
//! remove is what makes rank lookups and rank ranges logarithmic instead of
//! linear; every range command on the sorted set depends on them being exact.
//!
//! Ordering is by score ascending, ties broken by member lexicographic
//! ascending. The list never holds two nodes for the same member; the owning
//! sorted set removes the old node before re-inserting on a score change.

use rand::Rng;

use crate::datastruct::border::RangeBorder;

pub(crate) const MAX_LEVEL: usize = 16;
const NIL: usize = usize::MAX;

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub member: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
struct Level {
    forward: usize,
    span: usize,
}

#[derive(Debug, Clone)]
struct Node {
    element: Element,
    backward: usize,
    level: Vec<Level>,
}

#[derive(Debug, Clone)]
pub struct SkipList {
    arena: Vec<Node>,
    free: Vec<usize>,
    header: usize,
    tail: usize,
    length: usize,
    level: usize,
}

/// Geometric level in `1..=MAX_LEVEL` with p = 1/2.
fn random_level() -> usize {
    let total: u64 = (1u64 << MAX_LEVEL) - 1;
    let k = rand::rng().random::<u64>() % total;
    MAX_LEVEL - (64 - (k + 1).leading_zeros() as usize) + 1
}

impl SkipList {
    pub fn new() -> Self {
        let header = Node {
            element: Element {
                member: String::new(),
                score: 0.0,
            },
            backward: NIL,
            level: (0..MAX_LEVEL)
                .map(|_| Level {
                    forward: NIL,
                    span: 0,
                })
                .collect(),
        };
        SkipList {
            arena: vec![header],
            free: Vec::new(),
            header: 0,
            tail: NIL,
            length: 0,
            level: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    fn alloc(&mut self, level: usize, score: f64, member: String) -> usize {
        let node = Node {
            element: Element { member, score },
            backward: NIL,
            level: (0..level)
                .map(|_| Level {
                    forward: NIL,
                    span: 0,
                })
                .collect(),
        };
        match self.free.pop() {
            Some(index) => {
                self.arena[index] = node;
                index
            }
            None => {
                self.arena.push(node);
                self.arena.len() - 1
            }
        }
    }

    pub fn element(&self, index: usize) -> &Element {
        &self.arena[index].element
    }

    /// Index of the first real node.
    pub fn first_index(&self) -> Option<usize> {
        let forward = self.arena[self.header].level[0].forward;
        if forward == NIL {
            None
        } else {
            Some(forward)
        }
    }

    pub fn tail_index(&self) -> Option<usize> {
        if self.tail == NIL {
            None
        } else {
            Some(self.tail)
        }
    }

    pub fn next_index(&self, index: usize) -> Option<usize> {
        let forward = self.arena[index].level[0].forward;
        if forward == NIL {
            None
        } else {
            Some(forward)
        }
    }

    pub fn prev_index(&self, index: usize) -> Option<usize> {
        let backward = self.arena[index].backward;
        if backward == NIL {
            None
        } else {
            Some(backward)
        }
    }

    /// True when the forward node at (`node`, `lvl`) sorts before
    /// (`score`, `member`).
    fn forward_sorts_before(&self, node: usize, lvl: usize, member: &str, score: f64) -> bool {
        let forward = self.arena[node].level[lvl].forward;
        if forward == NIL {
            return false;
        }
        let element = &self.arena[forward].element;
        element.score < score || (element.score == score && element.member.as_str() < member)
    }

    pub fn insert(&mut self, member: &str, score: f64) -> usize {
        let mut update = [NIL; MAX_LEVEL];
        let mut rank = [0usize; MAX_LEVEL];
        let mut node = self.header;
        for i in (0..self.level).rev() {
            rank[i] = if i == self.level - 1 { 0 } else { rank[i + 1] };
            while self.forward_sorts_before(node, i, member, score) {
                rank[i] += self.arena[node].level[i].span;
                node = self.arena[node].level[i].forward;
            }
            update[i] = node;
        }

        let level = random_level();
        if level > self.level {
            for i in self.level..level {
                rank[i] = 0;
                update[i] = self.header;
                self.arena[self.header].level[i].span = self.length;
            }
            self.level = level;
        }

        let new_index = self.alloc(level, score, member.to_string());
        for i in 0..level {
            let prev = update[i];
            let prev_forward = self.arena[prev].level[i].forward;
            let prev_span = self.arena[prev].level[i].span;
            self.arena[new_index].level[i].forward = prev_forward;
            self.arena[new_index].level[i].span = prev_span - (rank[0] - rank[i]);
            self.arena[prev].level[i].forward = new_index;
            self.arena[prev].level[i].span = rank[0] + 1 - rank[i];
        }
        // Levels above the new node still cross one more level-0 node.
        for i in level..self.level {
            self.arena[update[i]].level[i].span += 1;
        }

        self.arena[new_index].backward = if update[0] == self.header {
            NIL
        } else {
            update[0]
        };
        let forward0 = self.arena[new_index].level[0].forward;
        if forward0 != NIL {
            self.arena[forward0].backward = new_index;
        } else {
            self.tail = new_index;
        }
        self.length += 1;
        new_index
    }

    fn remove_node(&mut self, node: usize, update: &[usize; MAX_LEVEL]) {
        for i in 0..self.level {
            if self.arena[update[i]].level[i].forward == node {
                let node_span = self.arena[node].level[i].span;
                let node_forward = self.arena[node].level[i].forward;
                self.arena[update[i]].level[i].span += node_span - 1;
                self.arena[update[i]].level[i].forward = node_forward;
            } else {
                self.arena[update[i]].level[i].span -= 1;
            }
        }
        let forward0 = self.arena[node].level[0].forward;
        if forward0 != NIL {
            self.arena[forward0].backward = self.arena[node].backward;
        } else {
            self.tail = self.arena[node].backward;
        }
        while self.level > 1 && self.arena[self.header].level[self.level - 1].forward == NIL {
            self.level -= 1;
        }
        self.length -= 1;
        self.free.push(node);
    }

    pub fn remove(&mut self, member: &str, score: f64) -> bool {
        let mut update = [NIL; MAX_LEVEL];
        let mut node = self.header;
        for i in (0..self.level).rev() {
            while self.forward_sorts_before(node, i, member, score) {
                node = self.arena[node].level[i].forward;
            }
            update[i] = node;
        }
        let target = self.arena[node].level[0].forward;
        if target != NIL {
            let element = &self.arena[target].element;
            if element.score == score && element.member == member {
                self.remove_node(target, &update);
                return true;
            }
        }
        false
    }

    /// 1-based ascending rank of (`member`, `score`); 0 when absent. The
    /// sentinel header counts as rank 0.
    pub fn rank(&self, member: &str, score: f64) -> usize {
        let mut rank = 0usize;
        let mut node = self.header;
        for i in (0..self.level).rev() {
            loop {
                let forward = self.arena[node].level[i].forward;
                if forward == NIL {
                    break;
                }
                let element = &self.arena[forward].element;
                let advance = element.score < score
                    || (element.score == score && element.member.as_str() <= member);
                if !advance {
                    break;
                }
                rank += self.arena[node].level[i].span;
                node = forward;
            }
        }
        if node != self.header && self.arena[node].element.member == member {
            return rank;
        }
        0
    }

    /// Node at the given 1-based rank.
    pub fn by_rank(&self, rank: usize) -> Option<usize> {
        if rank == 0 || rank > self.length {
            return None;
        }
        let mut current_rank = 0usize;
        let mut node = self.header;
        for i in (0..self.level).rev() {
            loop {
                let forward = self.arena[node].level[i].forward;
                if forward == NIL || current_rank + self.arena[node].level[i].span > rank {
                    break;
                }
                current_rank += self.arena[node].level[i].span;
                node = forward;
            }
        }
        if current_rank == rank {
            Some(node)
        } else {
            None
        }
    }

    /// Removes nodes whose 1-based rank lies in `[start, stop)`.
    pub fn remove_range_by_rank(&mut self, start: usize, stop: usize) -> Vec<Element> {
        let mut rank = 0usize;
        let mut update = [NIL; MAX_LEVEL];
        let mut removed = Vec::new();
        let mut node = self.header;
        for i in (0..self.level).rev() {
            loop {
                let forward = self.arena[node].level[i].forward;
                if forward == NIL || rank + self.arena[node].level[i].span >= start {
                    break;
                }
                rank += self.arena[node].level[i].span;
                node = forward;
            }
            update[i] = node;
        }
        rank += 1;
        let mut node = self.arena[node].level[0].forward;
        while node != NIL && rank < stop {
            let next = self.arena[node].level[0].forward;
            removed.push(self.arena[node].element.clone());
            self.remove_node(node, &update);
            rank += 1;
            node = next;
        }
        removed
    }

    /// True when at least one element lies inside `[min, max]`.
    pub fn has_in_range<B: RangeBorder>(&self, min: &B, max: &B) -> bool {
        if min.is_intersected(max) {
            return false;
        }
        // The largest element must clear the lower border...
        if self.tail == NIL || !min.less(&self.arena[self.tail].element) {
            return false;
        }
        // ...and the smallest must clear the upper one.
        let first = self.arena[self.header].level[0].forward;
        if first == NIL || !max.greater(&self.arena[first].element) {
            return false;
        }
        true
    }

    pub fn first_in_range<B: RangeBorder>(&self, min: &B, max: &B) -> Option<usize> {
        if !self.has_in_range(min, max) {
            return None;
        }
        let mut node = self.header;
        for i in (0..self.level).rev() {
            loop {
                let forward = self.arena[node].level[i].forward;
                if forward == NIL || min.less(&self.arena[forward].element) {
                    break;
                }
                node = forward;
            }
        }
        let node = self.arena[node].level[0].forward;
        if max.greater(&self.arena[node].element) {
            Some(node)
        } else {
            None
        }
    }

    pub fn last_in_range<B: RangeBorder>(&self, min: &B, max: &B) -> Option<usize> {
        if !self.has_in_range(min, max) {
            return None;
        }
        let mut node = self.header;
        for i in (0..self.level).rev() {
            loop {
                let forward = self.arena[node].level[i].forward;
                if forward == NIL || !max.greater(&self.arena[forward].element) {
                    break;
                }
                node = forward;
            }
        }
        if min.less(&self.arena[node].element) {
            Some(node)
        } else {
            None
        }
    }

    /// Removes up to `limit` elements inside `[min, max]`; `limit` 0 means
    /// unlimited.
    pub fn remove_range<B: RangeBorder>(&mut self, min: &B, max: &B, limit: usize) -> Vec<Element> {
        let mut update = [NIL; MAX_LEVEL];
        let mut removed = Vec::new();
        let mut node = self.header;
        for i in (0..self.level).rev() {
            loop {
                let forward = self.arena[node].level[i].forward;
                if forward == NIL || min.less(&self.arena[forward].element) {
                    break;
                }
                node = forward;
            }
            update[i] = node;
        }
        let mut node = self.arena[node].level[0].forward;
        while node != NIL {
            if !max.greater(&self.arena[node].element) {
                break;
            }
            removed.push(self.arena[node].element.clone());
            let next = self.arena[node].level[0].forward;
            self.remove_node(node, &update);
            if limit > 0 && removed.len() == limit {
                break;
            }
            node = next;
        }
        removed
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
    use crate::datastruct::border::{parse_score_border, ScoreBorder};

    fn sample() -> SkipList {
        let mut list = SkipList::new();
        for (member, score) in [("a", 1.0), ("b", 2.0), ("c", 2.0), ("d", 3.0), ("e", 5.0)] {
            list.insert(member, score);
        }
        list
    }

    #[test]
    fn test_random_level_bounds() {
        for _ in 0..10_000 {
            let level = random_level();
            assert!((1..=MAX_LEVEL).contains(&level));
        }
    }

    #[test]
    fn test_insert_keeps_order() {
        let list = sample();
        let mut members = Vec::new();
        let mut index = list.first_index();
        while let Some(i) = index {
            members.push(list.element(i).member.clone());
            index = list.next_index(i);
        }
        assert_eq!(members, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_rank_matches_smaller_count() {
        // Rank must equal 1 + the number of elements sorting before it.
        let list = sample();
        let elements = [("a", 1.0), ("b", 2.0), ("c", 2.0), ("d", 3.0), ("e", 5.0)];
        for (member, score) in elements {
            let smaller = elements
                .iter()
                .filter(|(m, s)| *s < score || (*s == score && *m < member))
                .count();
            assert_eq!(list.rank(member, score), smaller + 1, "rank of {}", member);
        }
        assert_eq!(list.rank("missing", 1.0), 0);
    }

    #[test]
    fn test_by_rank_round_trip() {
        let list = sample();
        for rank in 1..=list.len() {
            let index = list.by_rank(rank).unwrap();
            let element = list.element(index);
            assert_eq!(list.rank(&element.member, element.score), rank);
        }
        assert_eq!(list.by_rank(0), None);
        assert_eq!(list.by_rank(6), None);
    }

    #[test]
    fn test_remove_updates_spans() {
        let mut list = sample();
        assert!(list.remove("b", 2.0));
        assert!(!list.remove("b", 2.0));
        assert_eq!(list.len(), 4);
        assert_eq!(list.rank("c", 2.0), 2);
        assert_eq!(list.rank("e", 5.0), 4);
        let tail = list.tail_index().unwrap();
        assert_eq!(list.element(tail).member, "e");
    }

    #[test]
    fn test_remove_range_by_rank() {
        let mut list = sample();
        // Ranks [2, 4) -> b and c.
        let removed = list.remove_range_by_rank(2, 4);
        let members: Vec<_> = removed.iter().map(|e| e.member.as_str()).collect();
        assert_eq!(members, vec!["b", "c"]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.rank("d", 3.0), 2);
    }

    #[test]
    fn test_range_queries() {
        let list = sample();
        let min = parse_score_border("(1").unwrap();
        let max = parse_score_border("3").unwrap();
        assert!(list.has_in_range(&min, &max));
        let first = list.first_in_range(&min, &max).unwrap();
        assert_eq!(list.element(first).member, "b");
        let last = list.last_in_range(&min, &max).unwrap();
        assert_eq!(list.element(last).member, "d");

        let empty_min = parse_score_border("(5").unwrap();
        assert!(!list.has_in_range(&empty_min, &ScoreBorder::POS_INF));
        assert_eq!(
            list.first_in_range(&empty_min, &ScoreBorder::POS_INF),
            None
        );
    }

    #[test]
    fn test_remove_range_with_limit() {
        let mut list = sample();
        let removed = list.remove_range(&ScoreBorder::NEG_INF, &ScoreBorder::POS_INF, 2);
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].member, "a");
        assert_eq!(removed[1].member, "b");
        assert_eq!(list.len(), 3);

        let rest = list.remove_range(&ScoreBorder::NEG_INF, &ScoreBorder::POS_INF, 0);
        assert_eq!(rest.len(), 3);
        assert!(list.is_empty());
        assert_eq!(list.tail_index(), None);
    }

    #[test]
    fn test_large_insert_remove_stays_consistent() {
        let mut list = SkipList::new();
        for i in 0..500 {
            list.insert(&format!("m{:03}", i), f64::from(i));
        }
        assert_eq!(list.len(), 500);
        for i in (0..500).step_by(2) {
            assert!(list.remove(&format!("m{:03}", i), f64::from(i)));
        }
        assert_eq!(list.len(), 250);
        // Remaining odd members must occupy contiguous ranks.
        let mut expected_rank = 1;
        for i in (1..500).step_by(2) {
            assert_eq!(list.rank(&format!("m{:03}", i), f64::from(i)), expected_rank);
            expected_rank += 1;
        }
    }
}
