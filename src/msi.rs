//! MSI Address Translation
//!
//! Guest physical pages matching the device's MSI address mask/pattern
//! bypass second-stage translation and resolve through a flat MSI page
//! table instead. Only the basic-translate entry mode is modeled;
//! memory-resident-interrupt-file modes are rejected as misconfigured.

use crate::context::{DeviceContext, Msiptp};
use crate::fault::FaultCause;
use crate::memory::WalkMemory;
use crate::pte::PAGE_SHIFT;

/// Size of one MSI page table entry in bytes
const MSI_PTE_BYTES: u64 = 16;

const MSI_PTE_V: u64 = 1 << 0;
/// Entry mode field, bits 2:1; 3 selects basic translate
const MSI_PTE_M_MASK: u64 = 0x3 << 1;
const MSI_PTE_M_BASIC: u64 = 0x3 << 1;
const MSI_PTE_PPN_MASK: u64 = ((1 << 44) - 1) << 10;

/// Whether `gpa` falls in the device's MSI translation window.
///
/// The page number is compared against the pattern on every bit the
/// mask leaves uncovered.
pub fn is_msi_gpa(dc: &DeviceContext, gpa: u64) -> bool {
    match dc.msiptp {
        Some(_) => {
            let pn = gpa >> PAGE_SHIFT;
            (pn & !dc.msi_addr_mask) == (dc.msi_addr_pattern & !dc.msi_addr_mask)
        }
        None => false,
    }
}

/// Extract the interrupt file number: the page-number bits selected by
/// the mask, compressed toward bit 0.
pub fn interrupt_file_number(mask: u64, gpa: u64) -> u64 {
    let pn = gpa >> PAGE_SHIFT;
    let mut ifn = 0;
    let mut out = 0;
    for bit in 0..52 {
        if mask & (1 << bit) != 0 {
            ifn |= ((pn >> bit) & 1) << out;
            out += 1;
        }
    }
    ifn
}

/// Resolve an MSI-window guest physical address to a host physical
/// address through the flat MSI page table.
pub fn translate_msi(
    bus: &mut impl WalkMemory,
    msiptp: Msiptp,
    mask: u64,
    gpa: u64,
) -> Result<u64, FaultCause> {
    let ifn = interrupt_file_number(mask, gpa);
    let entry_addr = (msiptp.ppn << PAGE_SHIFT) + ifn * MSI_PTE_BYTES;
    let lo = bus
        .read_u64(entry_addr)
        .map_err(|_| FaultCause::MsiPteLoadFault)?;
    let hi = bus
        .read_u64(entry_addr + 8)
        .map_err(|_| FaultCause::MsiPteLoadFault)?;

    if lo & MSI_PTE_V == 0 {
        return Err(FaultCause::MsiPteInvalid);
    }
    if lo & MSI_PTE_M_MASK != MSI_PTE_M_BASIC {
        return Err(FaultCause::MsiPteMisconfigured);
    }
    if lo & !(MSI_PTE_V | MSI_PTE_M_MASK | MSI_PTE_PPN_MASK) != 0 || hi != 0 {
        return Err(FaultCause::MsiPteMisconfigured);
    }

    let ppn = (lo & MSI_PTE_PPN_MASK) >> 10;
    Ok((ppn << PAGE_SHIFT) | (gpa & ((1 << PAGE_SHIFT) - 1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Fsc, Iohgatp, Iosatp, TcFlags};
    use crate::memory::FlatMemory;

    fn msi_dc(mask: u64, pattern: u64) -> DeviceContext {
        DeviceContext {
            tc: TcFlags::V,
            iohgatp: Iohgatp::bare(),
            pscid: 0,
            fsc: Fsc::Iosatp(Iosatp::bare()),
            msiptp: Some(Msiptp { ppn: 0x81000 }),
            msi_addr_mask: mask,
            msi_addr_pattern: pattern,
        }
    }

    #[test]
    fn window_match() {
        // Window: pages 0x280xx with the low 8 page-number bits masked.
        let dc = msi_dc(0xff, 0x2_8000);
        assert!(is_msi_gpa(&dc, 0x2_8042_000));
        assert!(!is_msi_gpa(&dc, 0x2_9000_000));
        assert!(!is_msi_gpa(&msi_dc(0, 0), 0x2_8042_000));
    }

    #[test]
    fn interrupt_file_extraction() {
        // Non-contiguous mask bits compress toward bit zero.
        assert_eq!(interrupt_file_number(0b101, 0b100 << PAGE_SHIFT), 0b10);
        assert_eq!(interrupt_file_number(0xff, 0x42 << PAGE_SHIFT), 0x42);
    }

    #[test]
    fn basic_translate_entry() {
        let mut mem = FlatMemory::new(0x8100_0000, 0x1000);
        // Interrupt file 2 maps to host page 0xc0005.
        mem.write_u64(0x8100_0020, (0xc0005 << 10) | MSI_PTE_M_BASIC | MSI_PTE_V);
        let msiptp = Msiptp { ppn: 0x81000 };
        let pa = translate_msi(&mut mem, msiptp, 0xff, 0x2 << PAGE_SHIFT | 0x123).unwrap();
        assert_eq!(pa, 0xc000_5123);
    }

    #[test]
    fn entry_faults() {
        let mut mem = FlatMemory::new(0x8100_0000, 0x1000);
        let msiptp = Msiptp { ppn: 0x81000 };
        assert_eq!(
            translate_msi(&mut mem, msiptp, 0xff, 0),
            Err(FaultCause::MsiPteInvalid)
        );
        // Memory-resident-interrupt-file mode is unsupported.
        mem.write_u64(0x8100_0000, (1 << 1) | MSI_PTE_V);
        assert_eq!(
            translate_msi(&mut mem, msiptp, 0xff, 0),
            Err(FaultCause::MsiPteMisconfigured)
        );
        // Table outside the populated window.
        let far = Msiptp { ppn: 0x99999 };
        assert_eq!(
            translate_msi(&mut mem, far, 0xff, 0),
            Err(FaultCause::MsiPteLoadFault)
        );
    }
}
