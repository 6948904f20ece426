//! Pseudo-LRU Replacement Engine
//!
//! Tree-based pseudo-LRU victim selection shared by the device-context,
//! process-context and address-translation caches. A binary tree of
//! direction bits (N-1 bits for N ways) approximates least-recently-used
//! ordering at O(log N) per access.

/// Tree pseudo-LRU state for one fully-associative cache.
///
/// Internal nodes are stored heap-style in a bit vector: node 1 is the
/// root, node `n` has children `2n` and `2n+1`. A set bit points at the
/// upper half of the node's way range; the victim is reached by following
/// the pointed direction from the root, and a touch flips every node on
/// the way's path to point away from it.
#[derive(Debug, Clone)]
pub struct Plru {
    /// Direction bits, indexed by heap node number (bit 0 unused)
    bits: u64,
    ways: usize,
}

impl Plru {
    /// Create replacement state for `ways` ways.
    ///
    /// The way count must be a power of two, at least 2 and at most 64.
    pub fn new(ways: usize) -> Self {
        assert!(
            (2..=64).contains(&ways) && ways.is_power_of_two(),
            "PLRU way count must be a power of two in 2..=64 (got {ways})"
        );
        Self { bits: 0, ways }
    }

    /// Number of ways covered by this tree
    #[inline]
    pub fn ways(&self) -> usize {
        self.ways
    }

    /// Mark `way` most recently used: every node on its root-to-leaf path
    /// is set to point away from it.
    pub fn touch(&mut self, way: usize) {
        debug_assert!(way < self.ways);
        let mut node = 1;
        let mut lo = 0;
        let mut hi = self.ways;
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if way >= mid {
                // Accessed way is in the upper half; point at the lower.
                self.bits &= !(1 << node);
                node = node * 2 + 1;
                lo = mid;
            } else {
                self.bits |= 1 << node;
                node *= 2;
                hi = mid;
            }
        }
    }

    /// Select the victim way by following the pointed direction from the
    /// root. Does not modify the tree; the subsequent fill touches it.
    pub fn victim(&self) -> usize {
        let mut node = 1;
        let mut lo = 0;
        let mut hi = self.ways;
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if self.bits & (1 << node) != 0 {
                node = node * 2 + 1;
                lo = mid;
            } else {
                node *= 2;
                hi = mid;
            }
        }
        lo
    }

    /// Forget all usage history
    pub fn reset(&mut self) {
        self.bits = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(2)]
    #[test_case(4)]
    #[test_case(8)]
    #[test_case(32)]
    fn untouched_way_is_victim(ways: usize) {
        let mut plru = Plru::new(ways);
        for spared in 0..ways {
            plru.reset();
            for way in 0..ways {
                if way != spared {
                    plru.touch(way);
                }
            }
            assert_eq!(plru.victim(), spared, "ways={ways} spared={spared}");
        }
    }

    #[test]
    fn victim_rotates_under_touch() {
        let mut plru = Plru::new(4);
        plru.touch(0);
        assert_ne!(plru.victim(), 0);
        let v = plru.victim();
        plru.touch(v);
        assert_ne!(plru.victim(), v);
    }

    #[test]
    fn fresh_tree_victimizes_way_zero() {
        assert_eq!(Plru::new(8).victim(), 0);
    }

    #[test_case(0)]
    #[test_case(1)]
    #[test_case(3)]
    #[test_case(6)]
    #[test_case(128)]
    #[should_panic(expected = "PLRU way count")]
    fn rejects_bad_way_counts(ways: usize) {
        let _ = Plru::new(ways);
    }
}
