//! Process-Context Cache
//!
//! Fully-associative cache of decoded process contexts, tagged by the
//! (device id, process id) pair. Shares the tree pseudo-LRU replacement
//! engine with the other caches.

use log::trace;

use crate::context::ProcessContext;
use crate::plru::Plru;
use crate::stats::CacheStats;

#[derive(Debug, Clone)]
struct PdtcEntry {
    device_id: u32,
    process_id: u32,
    context: ProcessContext,
}

/// Process-context cache
#[derive(Debug)]
pub struct Pdtc {
    entries: Vec<Option<PdtcEntry>>,
    plru: Plru,
    stats: CacheStats,
}

impl Pdtc {
    /// Create a cache with `ways` entries (power of two, at least 2)
    pub fn new(ways: usize) -> Self {
        Self {
            entries: vec![None; ways],
            plru: Plru::new(ways),
            stats: CacheStats::new(),
        }
    }

    /// Look up the context for a (device, process) pair. At most one
    /// way may match; violations indicate a fill bug and trip the
    /// debug assertion.
    pub fn lookup(&mut self, device_id: u32, process_id: u32) -> Option<ProcessContext> {
        let mut hit: Option<(usize, ProcessContext)> = None;
        for (way, slot) in self.entries.iter().enumerate() {
            if let Some(entry) = slot {
                if entry.device_id == device_id && entry.process_id == process_id {
                    debug_assert!(
                        hit.is_none(),
                        "multiple PDTC ways hit for device {device_id:#x} process {process_id:#x}"
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

    /// Insert or overwrite the context for a (device, process) pair
    pub fn update(&mut self, device_id: u32, process_id: u32, context: ProcessContext) {
        let way = self
            .entries
            .iter()
            .position(|slot| {
                matches!(slot, Some(e) if e.device_id == device_id && e.process_id == process_id)
            })
            .unwrap_or_else(|| {
                let victim = self.plru.victim();
                if self.entries[victim].is_some() {
                    self.stats.evictions += 1;
                }
                victim
            });
        trace!("PDTC fill: device_id={device_id:#x} process_id={process_id:#x} way={way}");
        self.entries[way] = Some(PdtcEntry {
            device_id,
            process_id,
            context,
        });
        self.plru.touch(way);
    }

    /// Invalidate by scope: one (device, process) pair, every process of
    /// one device, or the whole cache.
    pub fn flush(&mut self, device_id: Option<u32>, process_id: Option<u32>) {
        for slot in self.entries.iter_mut() {
            let drop_it = match slot {
                Some(e) => {
                    device_id.map_or(true, |d| e.device_id == d)
                        && process_id.map_or(true, |p| e.process_id == p)
                }
                None => false,
            };
            if drop_it {
                *slot = None;
                self.stats.invalidations += 1;
            }
        }
        if device_id.is_none() && process_id.is_none() {
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
    use crate::context::Iosatp;

    fn pc(pscid: u32) -> ProcessContext {
        ProcessContext {
            ens: false,
            sum: false,
            pscid,
            iosatp: Iosatp::bare(),
        }
    }

    #[test]
    fn update_overwrites_in_place() {
        let mut pdtc = Pdtc::new(4);
        pdtc.update(1, 10, pc(1));
        pdtc.update(1, 10, pc(2));
        // One resident way; the lookup scan asserts at most one hit.
        assert_eq!(pdtc.entries.iter().flatten().count(), 1);
        assert_eq!(pdtc.lookup(1, 10).unwrap().pscid, 2);
        assert_eq!(pdtc.stats().evictions, 0);
    }

    #[test]
    fn tag_includes_both_ids() {
        let mut pdtc = Pdtc::new(4);
        pdtc.update(1, 10, pc(1));
        assert!(pdtc.lookup(1, 10).is_some());
        assert!(pdtc.lookup(1, 11).is_none());
        assert!(pdtc.lookup(2, 10).is_none());
    }

    #[test]
    fn device_scoped_flush() {
        let mut pdtc = Pdtc::new(4);
        pdtc.update(1, 10, pc(1));
        pdtc.update(1, 11, pc(2));
        pdtc.update(2, 10, pc(3));
        pdtc.flush(Some(1), None);
        assert!(pdtc.lookup(1, 10).is_none());
        assert!(pdtc.lookup(1, 11).is_none());
        assert!(pdtc.lookup(2, 10).is_some());
    }

    #[test]
    fn exact_flush() {
        let mut pdtc = Pdtc::new(4);
        pdtc.update(1, 10, pc(1));
        pdtc.update(1, 11, pc(2));
        pdtc.flush(Some(1), Some(10));
        assert!(pdtc.lookup(1, 10).is_none());
        assert!(pdtc.lookup(1, 11).is_some());
    }
}
