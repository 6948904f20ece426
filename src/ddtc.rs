//! Device-Context Cache
//!
//! Fully-associative cache of decoded device contexts, tagged by device
//! id and replaced with tree pseudo-LRU. A hit skips the device
//! directory walk entirely.

use log::trace;

use crate::context::DeviceContext;
use crate::plru::Plru;
use crate::stats::CacheStats;

#[derive(Debug, Clone)]
struct DdtcEntry {
    device_id: u32,
    context: DeviceContext,
}

/// Device-context cache
#[derive(Debug)]
pub struct Ddtc {
    entries: Vec<Option<DdtcEntry>>,
    plru: Plru,
    stats: CacheStats,
}

impl Ddtc {
    /// Create a cache with `ways` entries (power of two, at least 2)
    pub fn new(ways: usize) -> Self {
        Self {
            entries: vec![None; ways],
            plru: Plru::new(ways),
            stats: CacheStats::new(),
        }
    }

    /// Look up the context for `device_id`, refreshing its recency on a
    /// hit. At most one way may match; violations indicate a fill bug
    /// and trip the debug assertion.
    pub fn lookup(&mut self, device_id: u32) -> Option<DeviceContext> {
        let mut hit: Option<(usize, DeviceContext)> = None;
        for (way, slot) in self.entries.iter().enumerate() {
            if let Some(entry) = slot {
                if entry.device_id == device_id {
                    debug_assert!(
                        hit.is_none(),
                        "multiple DDTC ways hit for device {device_id:#x}"
                    );
                    hit = Some((way, entry.context));
                    if cfg!(not(debug_assertions)) {
                        break;
                    }
                }
            }
        }
        match hit {
            Some((way, context)) => {
                self.plru.touch(way);
                self.stats.hits += 1;
                Some(context)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Insert or overwrite the context for `device_id`
    pub fn update(&mut self, device_id: u32, context: DeviceContext) {
        let way = self
            .entries
            .iter()
            .position(|slot| matches!(slot, Some(e) if e.device_id == device_id))
            .unwrap_or_else(|| {
                let victim = self.plru.victim();
                if self.entries[victim].is_some() {
                    self.stats.evictions += 1;
                }
                victim
            });
        trace!("DDTC fill: device_id={device_id:#x} way={way}");
        self.entries[way] = Some(DdtcEntry { device_id, context });
        self.plru.touch(way);
    }

    /// Invalidate one device id, or the whole cache when `None`
    pub fn flush(&mut self, device_id: Option<u32>) {
        for slot in self.entries.iter_mut() {
            let drop_it = match (&slot, device_id) {
                (Some(e), Some(id)) => e.device_id == id,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if drop_it {
                *slot = None;
                self.stats.invalidations += 1;
            }
        }
        if device_id.is_none() {
            self.plru.reset();
        }
    }

    /// Current counters
    #[inline]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Fsc, Iohgatp, Iosatp, TcFlags};

    fn dc(pscid: u32) -> DeviceContext {
        DeviceContext {
            tc: TcFlags::V,
            iohgatp: Iohgatp::bare(),
            pscid,
            fsc: Fsc::Iosatp(Iosatp::bare()),
            msiptp: None,
            msi_addr_mask: 0,
            msi_addr_pattern: 0,
        }
    }

    #[test]
    fn hit_after_fill() {
        let mut ddtc = Ddtc::new(4);
        assert!(ddtc.lookup(5).is_none());
        ddtc.update(5, dc(1));
        assert_eq!(ddtc.lookup(5).unwrap().pscid, 1);
        assert_eq!(ddtc.stats().hits, 1);
        assert_eq!(ddtc.stats().misses, 1);
    }

    #[test]
    fn update_overwrites_in_place() {
        let mut ddtc = Ddtc::new(2);
        ddtc.update(5, dc(1));
        ddtc.update(5, dc(2));
        // One resident way; the lookup scan asserts at most one hit.
        assert_eq!(ddtc.entries.iter().flatten().count(), 1);
        assert_eq!(ddtc.lookup(5).unwrap().pscid, 2);
        assert_eq!(ddtc.stats().evictions, 0);
    }

    #[test]
    fn eviction_follows_plru() {
        let mut ddtc = Ddtc::new(2);
        ddtc.update(1, dc(1));
        ddtc.update(2, dc(2));
        // Refresh device 1 so device 2 becomes the victim.
        ddtc.lookup(1);
        ddtc.update(3, dc(3));
        assert!(ddtc.lookup(1).is_some());
        assert!(ddtc.lookup(2).is_none());
        assert!(ddtc.lookup(3).is_some());
        assert_eq!(ddtc.stats().evictions, 1);
    }

    #[test]
    fn selective_and_full_flush() {
        let mut ddtc = Ddtc::new(4);
        ddtc.update(1, dc(1));
        ddtc.update(2, dc(2));
        ddtc.flush(Some(1));
        assert!(ddtc.lookup(1).is_none());
        assert!(ddtc.lookup(2).is_some());
        ddtc.flush(None);
        assert!(ddtc.lookup(2).is_none());
    }
}
