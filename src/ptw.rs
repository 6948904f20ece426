//! Two-Stage Page-Table Walker
//!
//! Walks Sv39 first-stage and Sv39x4 second-stage page tables through
//! the read-only walk port. Nested walks interleave: each first-stage
//! table pointer is itself a guest physical address and is translated
//! by an intermediate second-stage walk before the fetch; the final
//! first-stage leaf triggers one last second-stage walk of the resulting
//! guest page.
//!
//! The walker keeps no state across invocations; a caller that abandons
//! a request and re-issues it restarts the walk from the root. The
//! directory walker reuses the second-stage machinery for its implicit
//! table-pointer translations; those do not produce cache fills.

use log::trace;

use crate::context::{DeviceContext, Iohgatp, Iosatp};
use crate::fault::{Fault, FaultCause};
use crate::iotlb::IotlbEntry;
use crate::memory::WalkMemory;
use crate::msi;
use crate::pte::{
    check_ad, check_s1_access, check_s2_access, gppn, is_canonical_sv39, is_valid_gpa, vpn,
    PageSize, Pte, LEVELS, PAGE_SHIFT, PTE_BYTES,
};
use crate::request::AccessType;

/// A completed walk of one stage
#[derive(Debug, Clone, Copy)]
struct StageLeaf {
    pte: Pte,
    size: PageSize,
}

fn fetch(bus: &mut impl WalkMemory, pa: u64, access: AccessType) -> Result<Pte, Fault> {
    match bus.read_u64(pa) {
        Ok(raw) => Ok(Pte::from_raw(raw)),
        Err(_) => Err(Fault::new(FaultCause::access_fault(access))),
    }
}

/// Walk the Sv39x4 second-stage table for `gpa`.
///
/// All failures other than transport errors are guest page faults and
/// carry the faulting guest physical address.
fn walk_stage2(
    bus: &mut impl WalkMemory,
    iohgatp: Iohgatp,
    gpa: u64,
    access: AccessType,
) -> Result<StageLeaf, Fault> {
    let gpf = || Fault::guest(FaultCause::guest_page_fault(access), gpa);
    if !is_valid_gpa(gpa) {
        return Err(gpf());
    }
    let mut table = iohgatp.root();
    for level in (0..LEVELS).rev() {
        let pte = fetch(bus, table + gppn(gpa, level) * PTE_BYTES, access)?;
        if !pte.is_valid() || pte.is_malformed() {
            return Err(gpf());
        }
        if pte.is_leaf() {
            if pte.is_misaligned(level) || !check_s2_access(pte, access) || !check_ad(pte, access)
            {
                return Err(gpf());
            }
            return Ok(StageLeaf {
                pte,
                size: PageSize::from_level(level),
            });
        }
        if level == 0 {
            return Err(gpf());
        }
        table = pte.pa();
    }
    unreachable!("second-stage walk fell through all levels")
}

/// Translate a table-pointer guest physical address for an implicit
/// access made on behalf of the directory walker. Reads only; never
/// fills the address-translation cache.
pub(crate) fn implicit_translate(
    bus: &mut impl WalkMemory,
    iohgatp: Iohgatp,
    gpa: u64,
) -> Result<u64, Fault> {
    if !iohgatp.enabled() {
        return Ok(gpa);
    }
    let leaf = walk_stage2(bus, iohgatp, gpa, AccessType::Read)?;
    Ok(leaf.pte.pa() | (gpa & leaf.size.offset_mask()))
}

/// Per-request stage-1 inputs resolved by the orchestrator
#[derive(Debug, Clone, Copy)]
pub(crate) struct Stage1Params {
    pub iosatp: Iosatp,
    pub pscid: u32,
    /// Effective privilege is user-mode
    pub user: bool,
    /// Supervisor access to user pages is permitted
    pub sum: bool,
}

/// Walk both stages for `iova` and assemble a cacheable translation.
///
/// At least one stage (or the MSI window) must be enabled; the
/// orchestrator short-circuits fully-bare requests.
pub(crate) fn walk(
    bus: &mut impl WalkMemory,
    dc: &DeviceContext,
    s1: Stage1Params,
    iova: u64,
    access: AccessType,
) -> Result<IotlbEntry, Fault> {
    let s1_enabled = s1.iosatp.enabled();
    let s2_enabled = dc.iohgatp.enabled();
    trace!("walk: iova={iova:#x} access={access:?} s1={s1_enabled} s2={s2_enabled}");

    let mut s1_leaf: Option<StageLeaf> = None;
    let gpa = if s1_enabled {
        if !is_canonical_sv39(iova) {
            return Err(Fault::new(FaultCause::page_fault(access)));
        }
        let pf = || Fault::new(FaultCause::page_fault(access));
        let mut table_gpa = s1.iosatp.root();
        let mut leaf = None;
        for level in (0..LEVELS).rev() {
            // The pointer itself is a guest physical address.
            let entry_gpa = table_gpa + vpn(iova, level) * PTE_BYTES;
            let entry_pa = implicit_translate(bus, dc.iohgatp, entry_gpa)?;
            let pte = fetch(bus, entry_pa, access)?;
            if !pte.is_valid() || pte.is_malformed() {
                return Err(pf());
            }
            if pte.is_leaf() {
                if pte.is_misaligned(level)
                    || !check_s1_access(pte, access, s1.user, s1.sum)
                    || !check_ad(pte, access)
                {
                    return Err(pf());
                }
                leaf = Some(StageLeaf {
                    pte,
                    size: PageSize::from_level(level),
                });
                break;
            }
            if level == 0 {
                return Err(pf());
            }
            table_gpa = pte.pa();
        }
        // The loop either produced a leaf or returned a fault.
        let leaf = leaf.ok_or_else(pf)?;
        let gpa = leaf.pte.pa() | (iova & leaf.size.offset_mask());
        s1_leaf = Some(leaf);
        gpa
    } else {
        iova
    };

    // MSI-window pages bypass stage 2 entirely.
    if let Some(msiptp) = dc.msiptp {
        if msi::is_msi_gpa(dc, gpa) {
            let pa =
                msi::translate_msi(bus, msiptp, dc.msi_addr_mask, gpa).map_err(Fault::new)?;
            return Ok(assemble(dc, &s1, iova, s1_leaf, s2_msi_leaf(pa), true));
        }
    }

    let s2_leaf = if s2_enabled {
        Some(walk_stage2(bus, dc.iohgatp, gpa, access)?)
    } else {
        None
    };

    Ok(assemble(
        dc,
        &s1,
        iova,
        s1_leaf,
        s2_leaf,
        false,
    ))
}

/// Synthesize a base-page stage-2 leaf for a resolved MSI address
fn s2_msi_leaf(pa: u64) -> Option<StageLeaf> {
    use crate::pte::PteFlags;
    Some(StageLeaf {
        pte: Pte::leaf(
            pa & !((1 << PAGE_SHIFT) - 1),
            PteFlags::R | PteFlags::W | PteFlags::U | PteFlags::A | PteFlags::D,
        ),
        size: PageSize::Size4K,
    })
}

fn assemble(
    dc: &DeviceContext,
    s1: &Stage1Params,
    iova: u64,
    s1_leaf: Option<StageLeaf>,
    s2_leaf: Option<StageLeaf>,
    is_msi: bool,
) -> IotlbEntry {
    IotlbEntry {
        vpn: iova >> PAGE_SHIFT,
        gscid: dc.iohgatp.gscid,
        pscid: s1.pscid,
        s1_enabled: s1.iosatp.enabled(),
        s2_enabled: dc.iohgatp.enabled(),
        global: s1_leaf.map_or(false, |l| l.pte.is_global()),
        s1_size: s1_leaf.map_or(PageSize::Size4K, |l| l.size),
        s2_size: s2_leaf.map_or(PageSize::Size4K, |l| l.size),
        is_msi,
        pte_s1: s1_leaf.map_or_else(Pte::new, |l| l.pte),
        pte_s2: s2_leaf.map_or_else(Pte::new, |l| l.pte),
    }
}
