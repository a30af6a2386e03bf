//! Duplicate-state detection.
//!
//! The combined state of a step is the concatenation of every node's state
//! string, the network rendering and the timer rendering. Its Blake3 digest
//! is folded to a 32-bit fingerprint that keys the visited set.

use im::Vector;
use pathcheck_types::StateHash;
use std::collections::HashMap;

/// Outcome of looking up a state in the visited set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// First time this state is seen.
    New,
    /// Seen before on a longer choice sequence, which this one replaces.
    Shorter,
    /// Seen before on exactly this choice sequence.
    Revisit,
    /// Reached earlier by a different, no longer choice sequence.
    Duplicate,
}

impl Visit {
    pub fn is_duplicate(self) -> bool {
        self == Visit::Duplicate
    }
}

/// Digest of a combined state rendering.
pub fn combined_state_hash<'a>(parts: impl IntoIterator<Item = &'a str>) -> StateHash {
    let parts: Vec<&[u8]> = parts.into_iter().map(str::as_bytes).collect();
    StateHash::from_parts(&parts)
}

/// Fingerprints of visited states, each with the shortest search path known
/// to reach it. Lives for a whole run.
#[derive(Debug, Clone, Default)]
pub struct VisitedStateSet {
    states: HashMap<u32, Vector<u64>>,
}

impl VisitedStateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the state reached by `path` unless it is a duplicate.
    pub fn visit(&mut self, hash: StateHash, path: &Vector<u64>) -> Visit {
        let key = hash.fingerprint();
        match self.states.get_mut(&key) {
            None => {
                self.states.insert(key, path.clone());
                Visit::New
            }
            Some(known) if path.len() < known.len() => {
                *known = path.clone();
                Visit::Shorter
            }
            Some(known) if known == path => Visit::Revisit,
            Some(_) => Visit::Duplicate,
        }
    }

    /// Record `hash` as reached by `path` without checking.
    pub fn record(&mut self, hash: StateHash, path: &Vector<u64>) {
        self.states.insert(hash.fingerprint(), path.clone());
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(values: &[u64]) -> Vector<u64> {
        values.iter().copied().collect()
    }

    #[test]
    fn test_duplicate_on_longer_or_equal_distinct_path() {
        let mut set = VisitedStateSet::new();
        let h = combined_state_hash(["node0", "net", "timers"]);
        assert_eq!(set.visit(h, &path(&[0, 1])), Visit::New);
        assert_eq!(set.visit(h, &path(&[1, 0])), Visit::Duplicate);
        assert_eq!(set.visit(h, &path(&[1, 0, 0])), Visit::Duplicate);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_same_path_is_not_duplicate() {
        let mut set = VisitedStateSet::new();
        let h = combined_state_hash(["a"]);
        set.visit(h, &path(&[2, 3]));
        assert_eq!(set.visit(h, &path(&[2, 3])), Visit::Revisit);
    }

    #[test]
    fn test_shorter_path_replaces_record() {
        let mut set = VisitedStateSet::new();
        let h = combined_state_hash(["a"]);
        set.visit(h, &path(&[2, 3, 4]));
        assert_eq!(set.visit(h, &path(&[1])), Visit::Shorter);
        assert_eq!(set.visit(h, &path(&[1])), Visit::Revisit);
        assert_eq!(set.visit(h, &path(&[2, 3, 4])), Visit::Duplicate);
    }

    #[test]
    fn test_hash_depends_on_every_part() {
        let a = combined_state_hash(["x", "y"]);
        let b = combined_state_hash(["x", "z"]);
        assert_ne!(a, b);
        assert_eq!(a, combined_state_hash(["x", "y"]));
    }
}
