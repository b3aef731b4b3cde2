//! Unordered member set with the combinators the set commands need.

use std::collections::HashSet;

use globset::Glob;
use rand::seq::IteratorRandom;

#[derive(Debug, Clone, Default)]
pub struct Set {
    members: HashSet<String>,
}

impl Set {
    pub fn new() -> Self {
        Set {
            members: HashSet::new(),
        }
    }

    pub fn with_members<I: IntoIterator<Item = String>>(members: I) -> Self {
        Set {
            members: members.into_iter().collect(),
        }
    }

    /// Returns 1 when the member was newly added.
    pub fn add(&mut self, member: &str) -> usize {
        usize::from(self.members.insert(member.to_string()))
    }

    /// Returns 1 when the member existed.
    pub fn remove(&mut self, member: &str) -> usize {
        usize::from(self.members.remove(member))
    }

    pub fn has(&self, member: &str) -> bool {
        self.members.contains(member)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn for_each(&self, mut consumer: impl FnMut(&str) -> bool) {
        for member in &self.members {
            if !consumer(member) {
                break;
            }
        }
    }

    pub fn to_slice(&self) -> Vec<String> {
        self.members.iter().cloned().collect()
    }

    pub fn shallow_copy(&self) -> Set {
        self.clone()
    }

    /// Up to `limit` members, possibly with duplicates.
    pub fn random_keys(&self, limit: usize) -> Vec<String> {
        let mut rng = rand::rng();
        let mut result = Vec::with_capacity(limit);
        if self.members.is_empty() {
            return result;
        }
        for _ in 0..limit {
            if let Some(member) = self.members.iter().choose(&mut rng) {
                result.push(member.clone());
            }
        }
        result
    }

    /// Up to `min(limit, len)` distinct members.
    pub fn random_distinct_keys(&self, limit: usize) -> Vec<String> {
        let mut rng = rand::rng();
        self.members
            .iter()
            .choose_multiple(&mut rng, limit)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Members matching the glob pattern; `(empty, -1)` on a bad pattern.
    pub fn scan(&self, pattern: &str) -> (Vec<String>, i64) {
        let matcher = match Glob::new(pattern) {
            Ok(glob) => glob.compile_matcher(),
            Err(_) => return (Vec::new(), -1),
        };
        let mut result = Vec::new();
        self.for_each(|member| {
            if pattern == "*" || matcher.is_match(member) {
                result.push(member.to_string());
            }
            true
        });
        (result, 0)
    }

    /// Members present in every set.
    pub fn intersect(sets: &[&Set]) -> Set {
        let mut result = Set::new();
        if sets.is_empty() {
            return result;
        }
        let mut count_map: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
        for set in sets {
            for member in &set.members {
                *count_map.entry(member.as_str()).or_insert(0) += 1;
            }
        }
        for (member, count) in count_map {
            if count == sets.len() {
                result.add(member);
            }
        }
        result
    }

    /// Members present in any set.
    pub fn union(sets: &[&Set]) -> Set {
        let mut result = Set::new();
        for set in sets {
            for member in &set.members {
                result.add(member);
            }
        }
        result
    }

    /// Members of the first set not present in any later set.
    pub fn diff(sets: &[&Set]) -> Set {
        let Some(first) = sets.first() else {
            return Set::new();
        };
        let mut result = first.shallow_copy();
        for set in &sets[1..] {
            for member in &set.members {
                result.remove(member);
            }
            if result.is_empty() {
                break;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(members: &[&str]) -> Set {
        Set::with_members(members.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_add_remove_has() {
        let mut set = Set::new();
        assert_eq!(set.add("a"), 1);
        assert_eq!(set.add("a"), 0);
        assert!(set.has("a"));
        assert_eq!(set.len(), 1);
        assert_eq!(set.remove("a"), 1);
        assert_eq!(set.remove("a"), 0);
        assert!(set.is_empty());
    }

    #[test]
    fn test_intersect() {
        let a = set_of(&["x", "y", "z"]);
        let b = set_of(&["y", "z", "w"]);
        let c = set_of(&["z", "w", "v"]);
        let result = Set::intersect(&[&a, &b, &c]);
        assert_eq!(result.to_slice(), vec!["z".to_string()]);
        assert!(Set::intersect(&[]).is_empty());
    }

    #[test]
    fn test_union() {
        let a = set_of(&["x", "y"]);
        let b = set_of(&["y", "z"]);
        let result = Set::union(&[&a, &b]);
        let mut members = result.to_slice();
        members.sort();
        assert_eq!(members, vec!["x", "y", "z"]);
    }

    #[test]
    fn test_diff() {
        let a = set_of(&["x", "y", "z"]);
        let b = set_of(&["y"]);
        let c = set_of(&["z"]);
        let result = Set::diff(&[&a, &b, &c]);
        assert_eq!(result.to_slice(), vec!["x".to_string()]);
        assert!(Set::diff(&[]).is_empty());
    }

    #[test]
    fn test_random_keys() {
        let set = set_of(&["a", "b", "c", "d", "e"]);
        assert_eq!(set.random_keys(3).len(), 3);
        let distinct = set.random_distinct_keys(3);
        assert_eq!(distinct.len(), 3);
        let unique: HashSet<_> = distinct.iter().collect();
        assert_eq!(unique.len(), 3);
        assert_eq!(set.random_distinct_keys(10).len(), 5);
    }

    #[test]
    fn test_scan() {
        let set = set_of(&["apple", "apricot", "banana"]);
        let (mut matches, cursor) = set.scan("ap*");
        matches.sort();
        assert_eq!(matches, vec!["apple", "apricot"]);
        assert_eq!(cursor, 0);

        let (matches, cursor) = set.scan("[bad");
        assert!(matches.is_empty());
        assert_eq!(cursor, -1);
    }
}
