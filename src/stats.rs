//! Cache Statistics
//!
//! Hit/miss/eviction counters kept by each translation cache. Counters
//! are monotonically increasing; `reset` zeroes them without touching
//! cache contents.

/// Statistics for one translation cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups satisfied from the cache
    pub hits: u64,
    /// Lookups that missed
    pub misses: u64,
    /// Fills that displaced a resident entry
    pub evictions: u64,
    /// Entries removed by invalidation operations
    pub invalidations: u64,
}

impl CacheStats {
    pub const fn new() -> Self {
        Self {
            hits: 0,
            misses: 0,
            evictions: 0,
            invalidations: 0,
        }
    }

    /// Hit rate in the range 0.0..=1.0 (0.0 when no lookups occurred)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Zero all counters
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_calculation() {
        let mut stats = CacheStats::new();
        assert_eq!(stats.hit_rate(), 0.0);
        stats.hits = 3;
        stats.misses = 1;
        assert_eq!(stats.hit_rate(), 0.75);
        stats.reset();
        assert_eq!(stats, CacheStats::new());
    }
}
