//! Translation Orchestrator
//!
//! Sequences one inbound request through the pipeline: top-level mode
//! check, device-context resolution, process-context resolution,
//! address-translation cache lookup, page-table walk on a miss, and
//! final physical-address splice. The orchestrator owns the three
//! caches and exposes the invalidation surface; it never touches memory
//! itself except through the walkers.
//!
//! At most one fault is produced per request; the first detected cause
//! wins. Faults raised after the device context is resolved honor the
//! device's fault-report suppression flag.

use log::{debug, trace};

use crate::cdw;
use crate::config::{DdtMode, IommuConfig};
use crate::context::{DeviceContext, Fsc, Iosatp, TcFlags};
use crate::ddtc::Ddtc;
use crate::fault::{Fault, FaultCause};
use crate::iotlb::{Iotlb, IotlbEntry};
use crate::memory::WalkMemory;
use crate::msi;
use crate::pdtc::Pdtc;
use crate::pte::{check_ad, check_s1_access, check_s2_access, PA_MASK};
use crate::ptw::{self, Stage1Params};
use crate::request::{Privilege, TransReq, Translation};
use crate::stats::CacheStats;

/// Default device-context cache ways
const DDTC_WAYS: usize = 8;
/// Default process-context cache ways
const PDTC_WAYS: usize = 8;
/// Default address-translation cache ways
const IOTLB_WAYS: usize = 32;

/// The translation pipeline: caches plus orchestration logic.
///
/// Memory is not owned; each `translate` call borrows a walk port so
/// the model can sit on top of any bus implementation.
#[derive(Debug)]
pub struct Iommu {
    ddtc: Ddtc,
    pdtc: Pdtc,
    iotlb: Iotlb,
}

impl Iommu {
    /// Pipeline with default cache geometry
    pub fn new() -> Self {
        Self::with_capacity(DDTC_WAYS, PDTC_WAYS, IOTLB_WAYS)
    }

    /// Pipeline with explicit way counts (each a power of two, at least 2)
    pub fn with_capacity(ddtc_ways: usize, pdtc_ways: usize, iotlb_ways: usize) -> Self {
        Self {
            ddtc: Ddtc::new(ddtc_ways),
            pdtc: Pdtc::new(pdtc_ways),
            iotlb: Iotlb::new(iotlb_ways),
        }
    }

    /// Translate one request against the configuration snapshot `cfg`.
    pub fn translate(
        &mut self,
        bus: &mut impl WalkMemory,
        cfg: &IommuConfig,
        req: &TransReq,
    ) -> Result<Translation, Fault> {
        trace!(
            "translate: device_id={:#x} iova={:#x} access={:?}",
            req.device_id,
            req.iova,
            req.access
        );
        match cfg.mode {
            DdtMode::Off => return Err(Fault::new(FaultCause::AllInboundDisallowed)),
            DdtMode::Bare => {
                // Pass-through is for plain untranslated requests only.
                if req.translated || req.pcie {
                    return Err(Fault::new(FaultCause::TransTypeDisallowed));
                }
                return Ok(Translation::new(req.iova & PA_MASK));
            }
            _ => {}
        }

        let dc = self.device_context(bus, cfg, req.device_id)?;
        let dtf = dc.tc.contains(TcFlags::DTF);
        self.translate_with_dc(bus, &dc, req)
            .map_err(|f| f.suppressed_by(dtf))
    }

    fn translate_with_dc(
        &mut self,
        bus: &mut impl WalkMemory,
        dc: &DeviceContext,
        req: &TransReq,
    ) -> Result<Translation, Fault> {
        if req.translated {
            return self.translate_ats(bus, dc, req);
        }
        if req.process_id.is_some() && !dc.tc.contains(TcFlags::PDTV) {
            return Err(Fault::new(FaultCause::TransTypeDisallowed));
        }

        let s1 = self.stage1_params(bus, dc, req)?;
        let s1_enabled = s1.iosatp.enabled();
        let s2_enabled = dc.s2_enabled();

        // With both stages off only the MSI window can redirect, and the
        // resolved MSI page is cached like any other walk result.
        if !s1_enabled && !s2_enabled && !msi::is_msi_gpa(dc, req.iova) {
            return Ok(Translation::new(req.iova & PA_MASK));
        }

        let entry = match self.iotlb.lookup(
            req.iova,
            dc.iohgatp.gscid,
            s1.pscid,
            s1_enabled,
            s2_enabled,
        ) {
            Some(entry) => {
                self.check_cached_entry(&entry, req, &s1)?;
                entry
            }
            None => {
                let entry = ptw::walk(bus, dc, s1, req.iova, req.access)?;
                self.iotlb.update(entry);
                entry
            }
        };

        let paddr = entry.paddr(req.iova) & PA_MASK;
        debug!("translate: iova={:#x} -> paddr={paddr:#x}", req.iova);
        Ok(Translation {
            paddr,
            is_msi: entry.is_msi,
            t2gpa: false,
        })
    }

    /// Handle an ATS-style pre-translated request.
    ///
    /// Under T2GPA the device was handed guest physical addresses, so
    /// the presented address is walked through stage 2 alone; otherwise
    /// the address is already final.
    fn translate_ats(
        &mut self,
        bus: &mut impl WalkMemory,
        dc: &DeviceContext,
        req: &TransReq,
    ) -> Result<Translation, Fault> {
        if !dc.tc.contains(TcFlags::EN_ATS) {
            return Err(Fault::new(FaultCause::TransTypeDisallowed));
        }
        if dc.tc.contains(TcFlags::T2GPA) && dc.s2_enabled() {
            let s1 = Stage1Params {
                iosatp: Iosatp::bare(),
                pscid: 0,
                user: true,
                sum: false,
            };
            let entry = match self
                .iotlb
                .lookup(req.iova, dc.iohgatp.gscid, 0, false, true)
            {
                Some(entry) => {
                    self.check_cached_entry(&entry, req, &s1)?;
                    entry
                }
                None => {
                    let entry = ptw::walk(bus, dc, s1, req.iova, req.access)?;
                    self.iotlb.update(entry);
                    entry
                }
            };
            return Ok(Translation {
                paddr: entry.paddr(req.iova) & PA_MASK,
                is_msi: entry.is_msi,
                t2gpa: true,
            });
        }
        Ok(Translation::new(req.iova & PA_MASK))
    }

    /// Resolve the device context through the cache or the directory
    fn device_context(
        &mut self,
        bus: &mut impl WalkMemory,
        cfg: &IommuConfig,
        device_id: u32,
    ) -> Result<DeviceContext, Fault> {
        if let Some(dc) = self.ddtc.lookup(device_id) {
            return Ok(dc);
        }
        let dc = cdw::walk_ddt(bus, cfg, device_id)?;
        self.ddtc.update(device_id, dc);
        Ok(dc)
    }

    /// Resolve the effective stage-1 inputs for this request
    fn stage1_params(
        &mut self,
        bus: &mut impl WalkMemory,
        dc: &DeviceContext,
        req: &TransReq,
    ) -> Result<Stage1Params, Fault> {
        match dc.fsc {
            Fsc::Iosatp(iosatp) => Ok(Stage1Params {
                iosatp,
                pscid: dc.pscid,
                user: true,
                sum: false,
            }),
            Fsc::Pdtp(pdtp) => {
                let process_id = match req.process_id {
                    Some(pid) => pid,
                    // Default-process substitution for PASID-less requests.
                    None if dc.tc.contains(TcFlags::DPE) => 0,
                    None => return Err(Fault::new(FaultCause::TransTypeDisallowed)),
                };
                let pc = match self.pdtc.lookup(req.device_id, process_id) {
                    Some(pc) => pc,
                    None => {
                        let pc = cdw::walk_pdt(bus, dc, pdtp, process_id)?;
                        self.pdtc.update(req.device_id, process_id, pc);
                        pc
                    }
                };
                let supervisor =
                    req.process_id.is_some() && req.privilege == Privilege::Supervisor;
                if supervisor && !pc.ens {
                    return Err(Fault::new(FaultCause::TransTypeDisallowed));
                }
                Ok(Stage1Params {
                    iosatp: pc.iosatp,
                    pscid: pc.pscid,
                    user: !supervisor,
                    sum: pc.sum,
                })
            }
        }
    }

    /// Re-evaluate permissions against a cached entry; a failure turns
    /// the hit into the corresponding page fault.
    fn check_cached_entry(
        &self,
        entry: &IotlbEntry,
        req: &TransReq,
        s1: &Stage1Params,
    ) -> Result<(), Fault> {
        if entry.s1_enabled
            && (!check_s1_access(entry.pte_s1, req.access, s1.user, s1.sum)
                || !check_ad(entry.pte_s1, req.access))
        {
            return Err(Fault::new(FaultCause::page_fault(req.access)));
        }
        if entry.s2_enabled
            && !entry.is_msi
            && (!check_s2_access(entry.pte_s2, req.access) || !check_ad(entry.pte_s2, req.access))
        {
            let gpa = if entry.s1_enabled {
                entry.pte_s1.pa() | (req.iova & entry.s1_size.offset_mask())
            } else {
                req.iova
            };
            return Err(Fault::guest(FaultCause::guest_page_fault(req.access), gpa));
        }
        Ok(())
    }

    /// Invalidate cached device contexts (and the dependent process
    /// contexts) for one device id, or all of them.
    pub fn inval_ddt(&mut self, device_id: Option<u32>) {
        self.ddtc.flush(device_id);
        self.pdtc.flush(device_id, None);
    }

    /// Invalidate cached process contexts by device and process scope
    pub fn inval_pdt(&mut self, device_id: Option<u32>, process_id: Option<u32>) {
        self.pdtc.flush(device_id, process_id);
    }

    /// Invalidate stage-1 translations (address-space, process, address)
    pub fn inval_vma(&mut self, gscid: Option<u16>, pscid: Option<u32>, addr: Option<u64>) {
        self.iotlb.flush_vma(gscid, pscid, addr);
    }

    /// Invalidate stage-2 translations (address-space, guest address)
    pub fn inval_gvma(&mut self, gscid: Option<u16>, addr: Option<u64>) {
        self.iotlb.flush_gvma(gscid, addr);
    }

    /// Global reset: drop every cached entry
    pub fn reset(&mut self) {
        self.ddtc.flush(None);
        self.pdtc.flush(None, None);
        self.iotlb.flush_all();
    }

    /// Device-context cache counters
    pub fn ddtc_stats(&self) -> CacheStats {
        self.ddtc.stats()
    }

    /// Process-context cache counters
    pub fn pdtc_stats(&self) -> CacheStats {
        self.pdtc.stats()
    }

    /// Address-translation cache counters
    pub fn iotlb_stats(&self) -> CacheStats {
        self.iotlb.stats()
    }
}

impl Default for Iommu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FlatMemory;

    #[test]
    fn off_mode_disallows_everything() {
        let mut iommu = Iommu::new();
        let mut mem = FlatMemory::new(0x8000_0000, 0x1000);
        let fault = iommu
            .translate(&mut mem, &IommuConfig::off(), &TransReq::read(1, 0x1000))
            .unwrap_err();
        assert_eq!(fault.cause, FaultCause::AllInboundDisallowed);
        assert!(fault.report);
    }

    #[test]
    fn bare_mode_is_identity() {
        let mut iommu = Iommu::new();
        let mut mem = FlatMemory::new(0x8000_0000, 0x1000);
        let cfg = IommuConfig::bare();
        let t = iommu
            .translate(&mut mem, &cfg, &TransReq::read(1, 0x1234_5678))
            .unwrap();
        assert_eq!(t.paddr, 0x1234_5678);
        assert!(!t.is_msi);
        // Address truncates to the physical address width.
        let t = iommu
            .translate(&mut mem, &cfg, &TransReq::read(1, 0xff00_1234_5678_9000))
            .unwrap();
        assert_eq!(t.paddr, 0x1234_5678_9000);
    }

    #[test]
    fn bare_mode_rejects_translated_requests() {
        let mut iommu = Iommu::new();
        let mut mem = FlatMemory::new(0x8000_0000, 0x1000);
        let req = TransReq::read(1, 0x1000).pre_translated();
        let fault = iommu
            .translate(&mut mem, &IommuConfig::bare(), &req)
            .unwrap_err();
        assert_eq!(fault.cause, FaultCause::TransTypeDisallowed);
    }
}
