//! Address-Translation Cache (IOTLB)
//!
//! Fully-associative cache of completed walks. Each entry carries the
//! leaf entries of both stages plus their page sizes so the orchestrator
//! can re-check permissions and splice the final physical address on a
//! hit without touching memory.
//!
//! Tag matching is stage-aware: the guest address-space id participates
//! only when stage-2 is enabled, the process address-space id only when
//! stage-1 is enabled and the mapping is not global, and the page-number
//! comparison is masked by the effective (smaller) page size.

use log::trace;

use crate::pte::{PageSize, Pte, PAGE_SHIFT};
use crate::plru::Plru;
use crate::stats::CacheStats;

/// One cached translation
#[derive(Debug, Clone, Copy)]
pub struct IotlbEntry {
    /// Virtual page number of the fill address (untruncated)
    pub vpn: u64,
    /// Host address-space id (meaningful when stage-2 is enabled)
    pub gscid: u16,
    /// Process address-space id (meaningful when stage-1 is enabled)
    pub pscid: u32,
    pub s1_enabled: bool,
    pub s2_enabled: bool,
    /// Stage-1 mapping is global; process id does not participate in match
    pub global: bool,
    pub s1_size: PageSize,
    pub s2_size: PageSize,
    /// The mapping targets the MSI translation window
    pub is_msi: bool,
    /// Stage-1 leaf (valid when stage-1 is enabled)
    pub pte_s1: Pte,
    /// Stage-2 leaf, or the synthesized MSI mapping
    pub pte_s2: Pte,
}

impl IotlbEntry {
    /// Effective page size: the smaller of the enabled stages
    pub fn effective_size(&self) -> PageSize {
        match (self.s1_enabled, self.s2_enabled) {
            (true, true) => self.s1_size.min(self.s2_size),
            (true, false) => self.s1_size,
            (false, true) => self.s2_size,
            // MSI-window mappings without an enabled stage are base pages.
            (false, false) => PageSize::Size4K,
        }
    }

    fn matches(&self, iova: u64, gscid: u16, pscid: u32, s1: bool, s2: bool) -> bool {
        if self.s1_enabled != s1 || self.s2_enabled != s2 {
            return false;
        }
        if self.s2_enabled && self.gscid != gscid {
            return false;
        }
        if self.s1_enabled && !self.global && self.pscid != pscid {
            return false;
        }
        let mask = self.effective_size().offset_mask() >> PAGE_SHIFT;
        (self.vpn ^ (iova >> PAGE_SHIFT)) & !mask == 0
    }

    fn covers(&self, addr: u64) -> bool {
        (self.vpn ^ (addr >> PAGE_SHIFT)) & !(self.effective_size().offset_mask() >> PAGE_SHIFT)
            == 0
    }

    /// Splice the final physical address for `iova`.
    ///
    /// For nested mappings the page-number bits come from the stage-2
    /// leaf down to the stage-2 page size, then from the stage-1 leaf
    /// down to the stage-1 page size, then from the IOVA. The six
    /// superpage combinations are enumerated explicitly.
    pub fn paddr(&self, iova: u64) -> u64 {
        use PageSize::*;
        match (self.s1_enabled, self.s2_enabled) {
            (true, true) => {
                let s1 = self.pte_s1.pa();
                let s2 = self.pte_s2.pa();
                match (self.s1_size, self.s2_size) {
                    (_, Size4K) => s2 | (iova & Size4K.offset_mask()),
                    (Size4K, Size2M) => s2 | (s1 & 0x001f_f000) | (iova & Size4K.offset_mask()),
                    (Size2M | Size1G, Size2M) => s2 | (iova & Size2M.offset_mask()),
                    (Size4K, Size1G) => s2 | (s1 & 0x3fff_f000) | (iova & Size4K.offset_mask()),
                    (Size2M, Size1G) => s2 | (s1 & 0x3fe0_0000) | (iova & Size2M.offset_mask()),
                    (Size1G, Size1G) => s2 | (iova & Size1G.offset_mask()),
                }
            }
            (true, false) => self.pte_s1.pa() | (iova & self.s1_size.offset_mask()),
            (false, _) => self.pte_s2.pa() | (iova & self.effective_size().offset_mask()),
        }
    }
}

/// Address-translation cache
#[derive(Debug)]
pub struct Iotlb {
    entries: Vec<Option<IotlbEntry>>,
    plru: Plru,
    stats: CacheStats,
}

impl Iotlb {
    /// Create a cache with `ways` entries (power of two, at least 2)
    pub fn new(ways: usize) -> Self {
        Self {
            entries: vec![None; ways],
            plru: Plru::new(ways),
            stats: CacheStats::new(),
        }
    }

    /// Look up a translation. At most one way may match; violations
    /// indicate a fill bug and trip the debug assertion.
    pub fn lookup(
        &mut self,
        iova: u64,
        gscid: u16,
        pscid: u32,
        s1: bool,
        s2: bool,
    ) -> Option<IotlbEntry> {
        let mut hit: Option<(usize, IotlbEntry)> = None;
        for (way, slot) in self.entries.iter().enumerate() {
            if let Some(entry) = slot {
                if entry.matches(iova, gscid, pscid, s1, s2) {
                    debug_assert!(hit.is_none(), "multiple IOTLB ways hit for {iova:#x}");
                    hit = Some((way, *entry));
                    if cfg!(not(debug_assertions)) {
                        break;
                    }
                }
            }
        }
        match hit {
            Some((way, entry)) => {
                self.plru.touch(way);
                self.stats.hits += 1;
                Some(entry)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Fill a completed walk, overwriting any entry with the same tag
    pub fn update(&mut self, entry: IotlbEntry) {
        let iova = entry.vpn << PAGE_SHIFT;
        let way = self
            .entries
            .iter()
            .position(|slot| {
                matches!(slot, Some(e) if e.matches(
                    iova,
                    entry.gscid,
                    entry.pscid,
                    entry.s1_enabled,
                    entry.s2_enabled,
                ))
            })
            .unwrap_or_else(|| {
                let victim = self.plru.victim();
                if self.entries[victim].is_some() {
                    self.stats.evictions += 1;
                }
                victim
            });
        trace!(
            "IOTLB fill: vpn={:#x} gscid={} pscid={} way={way}",
            entry.vpn,
            entry.gscid,
            entry.pscid
        );
        self.entries[way] = Some(entry);
        self.plru.touch(way);
    }

    /// Invalidate stage-1 translations.
    ///
    /// Scope narrows with each given selector: host address-space id,
    /// process address-space id, and one address. A process-scoped flush
    /// spares global mappings.
    pub fn flush_vma(&mut self, gscid: Option<u16>, pscid: Option<u32>, addr: Option<u64>) {
        self.retain(|e| {
            if !e.s1_enabled {
                return true;
            }
            if let Some(g) = gscid {
                if e.s2_enabled && e.gscid != g {
                    return true;
                }
            }
            if let Some(p) = pscid {
                if e.global || e.pscid != p {
                    return true;
                }
            }
            if let Some(a) = addr {
                if !e.covers(a) {
                    return true;
                }
            }
            false
        });
    }

    /// Invalidate stage-2 translations.
    ///
    /// Nested entries are tagged by IOVA rather than guest physical
    /// address, so an address-scoped flush drops every nested entry in
    /// the matching address space.
    pub fn flush_gvma(&mut self, gscid: Option<u16>, addr: Option<u64>) {
        self.retain(|e| {
            if !e.s2_enabled {
                return true;
            }
            if let Some(g) = gscid {
                if e.gscid != g {
                    return true;
                }
            }
            if let Some(a) = addr {
                if !e.s1_enabled && !e.covers(a) {
                    return true;
                }
            }
            false
        });
    }

    /// Drop every entry and forget replacement history
    pub fn flush_all(&mut self) {
        self.retain(|_| false);
        self.plru.reset();
    }

    fn retain(&mut self, keep: impl Fn(&IotlbEntry) -> bool) {
        for slot in self.entries.iter_mut() {
            if matches!(slot, Some(e) if !keep(e)) {
                *slot = None;
                self.stats.invalidations += 1;
            }
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
    use crate::pte::PteFlags;

    fn entry(iova: u64, gscid: u16, pscid: u32, s1: bool, s2: bool) -> IotlbEntry {
        IotlbEntry {
            vpn: iova >> PAGE_SHIFT,
            gscid,
            pscid,
            s1_enabled: s1,
            s2_enabled: s2,
            global: false,
            s1_size: PageSize::Size4K,
            s2_size: PageSize::Size4K,
            is_msi: false,
            pte_s1: Pte::leaf(0x8020_0000, PteFlags::R | PteFlags::U | PteFlags::A),
            pte_s2: Pte::leaf(0xc000_0000, PteFlags::R | PteFlags::U | PteFlags::A),
        }
    }

    #[test]
    fn stage_flags_partition_hits() {
        let mut tlb = Iotlb::new(8);
        tlb.update(entry(0x1000, 1, 2, true, true));
        assert!(tlb.lookup(0x1000, 1, 2, true, true).is_some());
        assert!(tlb.lookup(0x1000, 1, 2, true, false).is_none());
        assert!(tlb.lookup(0x1000, 1, 2, false, true).is_none());
    }

    #[test]
    fn gscid_ignored_without_stage2() {
        let mut tlb = Iotlb::new(8);
        tlb.update(entry(0x1000, 0, 2, true, false));
        // Stage-1-only entries hit regardless of the presented GSCID.
        assert!(tlb.lookup(0x1000, 9, 2, true, false).is_some());
    }

    #[test]
    fn pscid_ignored_for_global_mappings() {
        let mut tlb = Iotlb::new(8);
        let mut e = entry(0x1000, 1, 2, true, true);
        e.global = true;
        tlb.update(e);
        assert!(tlb.lookup(0x1000, 1, 77, true, true).is_some());
    }

    #[test]
    fn superpage_match_uses_effective_size() {
        let mut tlb = Iotlb::new(8);
        let mut e = entry(0x4020_0000, 1, 2, true, true);
        e.s1_size = PageSize::Size2M;
        e.s2_size = PageSize::Size1G;
        tlb.update(e);
        // Any address inside the 2 MiB region hits; outside misses.
        assert!(tlb.lookup(0x4030_1000, 1, 2, true, true).is_some());
        assert!(tlb.lookup(0x4040_0000, 1, 2, true, true).is_none());
    }

    #[test]
    fn nested_splice_2m_over_1g() {
        let mut e = entry(0x4020_0000, 1, 2, true, true);
        e.s1_size = PageSize::Size2M;
        e.s2_size = PageSize::Size1G;
        e.pte_s1 = Pte::leaf(0x8020_0000, PteFlags::R | PteFlags::U | PteFlags::A);
        e.pte_s2 = Pte::leaf(0xc000_0000, PteFlags::R | PteFlags::U | PteFlags::A);
        assert_eq!(e.paddr(0x4020_1000), 0xc020_1000);
    }

    #[test]
    fn splice_combinations() {
        // 4K stage-1 leaf under a 2M stage-2 leaf keeps the guest
        // page-number bits between the two sizes.
        let mut e = entry(0x0000_3000, 1, 2, true, true);
        e.s1_size = PageSize::Size4K;
        e.s2_size = PageSize::Size2M;
        e.pte_s1 = Pte::leaf(0x801e_5000, PteFlags::R | PteFlags::U | PteFlags::A);
        e.pte_s2 = Pte::leaf(0xc060_0000, PteFlags::R | PteFlags::U | PteFlags::A);
        assert_eq!(e.paddr(0x3123), 0xc07e_5123);

        let mut e = entry(0x4000_0000, 1, 2, true, true);
        e.s1_size = PageSize::Size1G;
        e.s2_size = PageSize::Size4K;
        e.pte_s1 = Pte::leaf(0x4000_0000, PteFlags::R | PteFlags::U | PteFlags::A);
        e.pte_s2 = Pte::leaf(0x8888_8000, PteFlags::R | PteFlags::U | PteFlags::A);
        assert_eq!(e.paddr(0x4012_3456), 0x8888_8456);
    }

    #[test]
    fn single_hit_is_preserved_by_update() {
        let mut tlb = Iotlb::new(4);
        tlb.update(entry(0x1000, 1, 2, true, true));
        tlb.update(entry(0x1000, 1, 2, true, true));
        assert_eq!(tlb.entries.iter().flatten().count(), 1);
        assert_eq!(tlb.stats().evictions, 0);
    }

    #[test]
    fn untouched_way_is_evicted() {
        let mut tlb = Iotlb::new(4);
        for i in 0..4 {
            tlb.update(entry(0x1000 * (i + 1), 1, 2, true, true));
        }
        // Touch all but the entry at 0x2000.
        for iova in [0x1000u64, 0x3000, 0x4000] {
            assert!(tlb.lookup(iova, 1, 2, true, true).is_some());
        }
        tlb.update(entry(0x9000, 1, 2, true, true));
        assert!(tlb.lookup(0x2000, 1, 2, true, true).is_none());
        for iova in [0x1000u64, 0x3000, 0x4000, 0x9000] {
            assert!(tlb.lookup(iova, 1, 2, true, true).is_some());
        }
    }

    #[test]
    fn vma_flush_scoping() {
        let mut tlb = Iotlb::new(8);
        tlb.update(entry(0x1000, 1, 2, true, true));
        tlb.update(entry(0x2000, 1, 3, true, true));
        tlb.update(entry(0x3000, 2, 2, true, true));
        tlb.flush_vma(Some(1), Some(2), None);
        assert!(tlb.lookup(0x1000, 1, 2, true, true).is_none());
        assert!(tlb.lookup(0x2000, 1, 3, true, true).is_some());
        assert!(tlb.lookup(0x3000, 2, 2, true, true).is_some());
    }

    #[test]
    fn vma_flush_spares_globals() {
        let mut tlb = Iotlb::new(8);
        let mut g = entry(0x1000, 1, 2, true, true);
        g.global = true;
        tlb.update(g);
        tlb.flush_vma(Some(1), Some(2), None);
        assert!(tlb.lookup(0x1000, 1, 2, true, true).is_some());
        // An address-space-wide flush (no process selector) drops it.
        tlb.flush_vma(Some(1), None, None);
        assert!(tlb.lookup(0x1000, 1, 2, true, true).is_none());
    }

    #[test]
    fn gvma_flush_drops_nested_conservatively() {
        let mut tlb = Iotlb::new(8);
        tlb.update(entry(0x1000, 1, 2, true, true));
        tlb.update(entry(0x2000, 1, 0, false, true));
        tlb.update(entry(0x3000, 2, 0, false, true));
        // Address-scoped: the stage-2-only entry at another GPA survives,
        // the nested entry in the same address space does not.
        tlb.flush_gvma(Some(1), Some(0x2000));
        assert!(tlb.lookup(0x1000, 1, 2, true, true).is_none());
        assert!(tlb.lookup(0x2000, 1, 0, false, true).is_none());
        assert!(tlb.lookup(0x3000, 2, 0, false, true).is_some());
    }
}
