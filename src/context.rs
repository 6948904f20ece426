//! Device and Process Context Records
//!
//! This module provides the per-device and per-process translation
//! configuration records resolved by the directory walker:
//! - Translation-control flag decoding with reserved-field validation
//! - First/second-stage page-table root pointers and modes
//! - MSI translation-window fields
//! - In-memory encoding helpers for building directory tables

use bitflags::bitflags;

use crate::fault::FaultCause;
use crate::pte::PAGE_SHIFT;

bitflags! {
    /// Device-context translation-control flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcFlags: u64 {
        const V = 1 << 0;       // Context valid
        const EN_ATS = 1 << 1;  // Accept ATS-style translated requests
        const EN_PRI = 1 << 2;  // Accept page requests
        const T2GPA = 1 << 3;   // Translated responses return guest physical addresses
        const DTF = 1 << 4;     // Disable translation-fault reporting
        const PDTV = 1 << 5;    // fsc holds a process directory pointer
        const PRPR = 1 << 6;    // Page-request PASID required
        const GADE = 1 << 7;    // Second-stage A/D update enable
        const SADE = 1 << 8;    // First-stage A/D update enable
        const DPE = 1 << 9;     // Default process id 0 for PASID-less requests
        const SBE = 1 << 10;    // Big-endian table accesses
        const SXL = 1 << 11;    // 32-bit first-stage formats
    }
}

/// Second-stage translation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IohgatpMode {
    /// Guest physical addresses pass through unchanged
    Bare,
    /// Sv39x4 three-level second-stage translation
    Sv39x4,
}

/// First-stage translation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IosatpMode {
    /// Virtual addresses pass through to the next stage unchanged
    Bare,
    /// Sv39 three-level first-stage translation
    Sv39,
}

/// Process directory table mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdtMode {
    /// No process directory; PASID-bearing requests use stage-1 bare
    Bare,
    /// Single-level directory (8-bit process ids)
    Pd8,
    /// Two-level directory (17-bit process ids)
    Pd17,
    /// Three-level directory (20-bit process ids)
    Pd20,
}

impl PdtMode {
    /// Number of directory levels walked
    #[inline]
    pub fn levels(self) -> u8 {
        match self {
            PdtMode::Bare => 0,
            PdtMode::Pd8 => 1,
            PdtMode::Pd17 => 2,
            PdtMode::Pd20 => 3,
        }
    }

    /// Width of process ids representable in this mode
    #[inline]
    pub fn process_id_bits(self) -> u32 {
        match self {
            PdtMode::Bare => 0,
            PdtMode::Pd8 => 8,
            PdtMode::Pd17 => 17,
            PdtMode::Pd20 => 20,
        }
    }
}

/// Second-stage root pointer (hgatp-style field)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iohgatp {
    pub mode: IohgatpMode,
    /// Host address-space id scoping cached entries
    pub gscid: u16,
    /// Root table physical page number
    pub ppn: u64,
}

impl Iohgatp {
    /// Second-stage pass-through
    pub fn bare() -> Self {
        Self {
            mode: IohgatpMode::Bare,
            gscid: 0,
            ppn: 0,
        }
    }

    /// Sv39x4 rooted at `root` (16 KiB aligned physical address)
    pub fn sv39x4(gscid: u16, root: u64) -> Self {
        Self {
            mode: IohgatpMode::Sv39x4,
            gscid,
            ppn: root >> PAGE_SHIFT,
        }
    }

    /// Physical address of the root table
    #[inline]
    pub fn root(&self) -> u64 {
        self.ppn << PAGE_SHIFT
    }

    /// Whether second-stage translation applies
    #[inline]
    pub fn enabled(&self) -> bool {
        self.mode == IohgatpMode::Sv39x4
    }
}

/// First-stage root pointer (satp-style field)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iosatp {
    pub mode: IosatpMode,
    /// Root table physical (or guest physical) page number
    pub ppn: u64,
}

impl Iosatp {
    /// First-stage pass-through
    pub fn bare() -> Self {
        Self {
            mode: IosatpMode::Bare,
            ppn: 0,
        }
    }

    /// Sv39 rooted at `root` (page-aligned)
    pub fn sv39(root: u64) -> Self {
        Self {
            mode: IosatpMode::Sv39,
            ppn: root >> PAGE_SHIFT,
        }
    }

    /// Address of the root table (guest physical when stage-2 is active)
    #[inline]
    pub fn root(&self) -> u64 {
        self.ppn << PAGE_SHIFT
    }

    /// Whether first-stage translation applies
    #[inline]
    pub fn enabled(&self) -> bool {
        self.mode == IosatpMode::Sv39
    }
}

/// Process directory root pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pdtp {
    pub mode: PdtMode,
    /// Root table page number (guest physical when stage-2 is active)
    pub ppn: u64,
}

impl Pdtp {
    pub fn new(mode: PdtMode, root: u64) -> Self {
        Self {
            mode,
            ppn: root >> PAGE_SHIFT,
        }
    }

    #[inline]
    pub fn root(&self) -> u64 {
        self.ppn << PAGE_SHIFT
    }
}

/// MSI translation-table pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Msiptp {
    /// Flat-mode table root page number; `None` disables MSI translation
    pub ppn: u64,
}

/// First-stage context field: either a direct page-table root or a
/// process-directory root, selected by `TcFlags::PDTV`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fsc {
    Iosatp(Iosatp),
    Pdtp(Pdtp),
}

/// Per-device translation configuration record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceContext {
    /// Translation-control flags
    pub tc: TcFlags,
    /// Second-stage root and host address-space id
    pub iohgatp: Iohgatp,
    /// Guest address-space id used when no process directory is configured
    pub pscid: u32,
    /// First-stage context
    pub fsc: Fsc,
    /// MSI translation table, when configured
    pub msiptp: Option<Msiptp>,
    /// MSI address-match mask (page-number bits)
    pub msi_addr_mask: u64,
    /// MSI address-match pattern (page-number bits)
    pub msi_addr_pattern: u64,
}

const PPN_FIELD: u64 = (1 << 44) - 1;
const ATP_MODE_SHIFT: u64 = 60;
// Bits 44..59 hold the GSCID in an hgatp-style field and are reserved in
// satp/pdtp/msiptp-style fields.
const ATP_RESERVED: u64 = 0xffff << 44;
const MSI_FIELD: u64 = (1 << 52) - 1;

const IOHGATP_MODE_BARE: u64 = 0;
const IOHGATP_MODE_SV39X4: u64 = 8;
const IOSATP_MODE_BARE: u64 = 0;
const IOSATP_MODE_SV39: u64 = 8;
const MSIPTP_MODE_OFF: u64 = 0;
const MSIPTP_MODE_FLAT: u64 = 1;

fn decode_iohgatp(raw: u64, bad: FaultCause) -> Result<Iohgatp, FaultCause> {
    let ppn = raw & PPN_FIELD;
    let gscid = ((raw >> 44) & 0xffff) as u16;
    match raw >> ATP_MODE_SHIFT {
        IOHGATP_MODE_BARE => {
            // A bare hgatp must not carry a residual GSCID or root.
            if gscid != 0 || ppn != 0 {
                return Err(bad);
            }
            Ok(Iohgatp::bare())
        }
        IOHGATP_MODE_SV39X4 => Ok(Iohgatp {
            mode: IohgatpMode::Sv39x4,
            gscid,
            ppn,
        }),
        _ => Err(bad),
    }
}

fn decode_iosatp(raw: u64, bad: FaultCause) -> Result<Iosatp, FaultCause> {
    if raw & ATP_RESERVED != 0 {
        return Err(bad);
    }
    let ppn = raw & PPN_FIELD;
    match raw >> ATP_MODE_SHIFT {
        IOSATP_MODE_BARE => Ok(Iosatp::bare()),
        IOSATP_MODE_SV39 => Ok(Iosatp {
            mode: IosatpMode::Sv39,
            ppn,
        }),
        _ => Err(bad),
    }
}

impl DeviceContext {
    /// Decode a 64-byte device context fetched from the device directory.
    ///
    /// Returns `DdtEntryInvalid` when the valid bit is clear and
    /// `DdtEntryMisconfigured` for reserved bits or unsupported fields.
    pub fn decode(dwords: &[u64; 8]) -> Result<Self, FaultCause> {
        let tc_raw = dwords[0];
        if tc_raw & TcFlags::V.bits() == 0 {
            return Err(FaultCause::DdtEntryInvalid);
        }
        if tc_raw & !TcFlags::all().bits() != 0 {
            return Err(FaultCause::DdtEntryMisconfigured);
        }
        let tc = TcFlags::from_bits_truncate(tc_raw);
        // Big-endian tables and 32-bit first-stage formats are unsupported.
        if tc.intersects(TcFlags::SBE | TcFlags::SXL) {
            return Err(FaultCause::DdtEntryMisconfigured);
        }

        let bad = FaultCause::DdtEntryMisconfigured;
        let iohgatp = decode_iohgatp(dwords[1], bad)?;

        let ta = dwords[2];
        if ta & !(0xfffff << 12) != 0 {
            return Err(bad);
        }
        let pscid = ((ta >> 12) & 0xfffff) as u32;

        let fsc_raw = dwords[3];
        let fsc = if tc.contains(TcFlags::PDTV) {
            if fsc_raw & ATP_RESERVED != 0 {
                return Err(bad);
            }
            let mode = match fsc_raw >> ATP_MODE_SHIFT {
                0 => PdtMode::Bare,
                1 => PdtMode::Pd8,
                2 => PdtMode::Pd17,
                3 => PdtMode::Pd20,
                _ => return Err(bad),
            };
            Fsc::Pdtp(Pdtp {
                mode,
                ppn: fsc_raw & PPN_FIELD,
            })
        } else {
            Fsc::Iosatp(decode_iosatp(fsc_raw, bad)?)
        };

        let msiptp_raw = dwords[4];
        if msiptp_raw & ATP_RESERVED != 0 {
            return Err(bad);
        }
        let msiptp = match msiptp_raw >> ATP_MODE_SHIFT {
            MSIPTP_MODE_OFF => None,
            MSIPTP_MODE_FLAT => Some(Msiptp {
                ppn: msiptp_raw & PPN_FIELD,
            }),
            _ => return Err(bad),
        };
        if dwords[5] & !MSI_FIELD != 0 || dwords[6] & !MSI_FIELD != 0 || dwords[7] != 0 {
            return Err(bad);
        }

        Ok(Self {
            tc,
            iohgatp,
            pscid,
            fsc,
            msiptp,
            msi_addr_mask: dwords[5],
            msi_addr_pattern: dwords[6],
        })
    }

    /// Encode the context into its 64-byte directory representation
    pub fn encode(&self) -> [u64; 8] {
        let iohgatp = match self.iohgatp.mode {
            IohgatpMode::Bare => 0,
            IohgatpMode::Sv39x4 => {
                (IOHGATP_MODE_SV39X4 << ATP_MODE_SHIFT)
                    | ((self.iohgatp.gscid as u64) << 44)
                    | self.iohgatp.ppn
            }
        };
        let fsc = match self.fsc {
            Fsc::Iosatp(satp) => match satp.mode {
                IosatpMode::Bare => 0,
                IosatpMode::Sv39 => (IOSATP_MODE_SV39 << ATP_MODE_SHIFT) | satp.ppn,
            },
            Fsc::Pdtp(pdtp) => {
                let mode = match pdtp.mode {
                    PdtMode::Bare => 0,
                    PdtMode::Pd8 => 1,
                    PdtMode::Pd17 => 2,
                    PdtMode::Pd20 => 3,
                };
                (mode << ATP_MODE_SHIFT) | pdtp.ppn
            }
        };
        let msiptp = match self.msiptp {
            None => 0,
            Some(m) => (MSIPTP_MODE_FLAT << ATP_MODE_SHIFT) | m.ppn,
        };
        [
            self.tc.bits(),
            iohgatp,
            (self.pscid as u64) << 12,
            fsc,
            msiptp,
            self.msi_addr_mask,
            self.msi_addr_pattern,
            0,
        ]
    }

    /// Whether second-stage translation applies for this device
    #[inline]
    pub fn s2_enabled(&self) -> bool {
        self.iohgatp.enabled()
    }
}

/// Per-process translation configuration record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessContext {
    /// Supervisor-privileged requests are permitted
    pub ens: bool,
    /// Supervisor loads/stores may touch user pages
    pub sum: bool,
    /// Guest address-space id scoping cached entries
    pub pscid: u32,
    /// First-stage root
    pub iosatp: Iosatp,
}

impl ProcessContext {
    const TA_V: u64 = 1 << 0;
    const TA_ENS: u64 = 1 << 1;
    const TA_SUM: u64 = 1 << 2;
    const TA_KNOWN: u64 = Self::TA_V | Self::TA_ENS | Self::TA_SUM | (0xfffff << 12);

    /// Decode a 16-byte process context fetched from the process directory.
    pub fn decode(dwords: &[u64; 2]) -> Result<Self, FaultCause> {
        let ta = dwords[0];
        if ta & Self::TA_V == 0 {
            return Err(FaultCause::PdtEntryInvalid);
        }
        if ta & !Self::TA_KNOWN != 0 {
            return Err(FaultCause::PdtEntryMisconfigured);
        }
        let iosatp = decode_iosatp(dwords[1], FaultCause::PdtEntryMisconfigured)?;
        Ok(Self {
            ens: ta & Self::TA_ENS != 0,
            sum: ta & Self::TA_SUM != 0,
            pscid: ((ta >> 12) & 0xfffff) as u32,
            iosatp,
        })
    }

    /// Encode the context into its 16-byte directory representation
    pub fn encode(&self) -> [u64; 2] {
        let mut ta = Self::TA_V | ((self.pscid as u64) << 12);
        if self.ens {
            ta |= Self::TA_ENS;
        }
        if self.sum {
            ta |= Self::TA_SUM;
        }
        let fsc = match self.iosatp.mode {
            IosatpMode::Bare => 0,
            IosatpMode::Sv39 => (IOSATP_MODE_SV39 << ATP_MODE_SHIFT) | self.iosatp.ppn,
        };
        [ta, fsc]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic_dc() -> DeviceContext {
        DeviceContext {
            tc: TcFlags::V,
            iohgatp: Iohgatp::sv39x4(7, 0x8100_0000),
            pscid: 3,
            fsc: Fsc::Iosatp(Iosatp::sv39(0x8200_0000)),
            msiptp: None,
            msi_addr_mask: 0,
            msi_addr_pattern: 0,
        }
    }

    #[test]
    fn device_context_roundtrip() {
        let dc = basic_dc();
        let decoded = DeviceContext::decode(&dc.encode()).unwrap();
        assert_eq!(decoded, dc);
    }

    #[test]
    fn invalid_context_is_rejected() {
        let mut dwords = basic_dc().encode();
        dwords[0] &= !TcFlags::V.bits();
        assert_eq!(
            DeviceContext::decode(&dwords),
            Err(FaultCause::DdtEntryInvalid)
        );
    }

    #[test]
    fn reserved_tc_bits_misconfigure() {
        let mut dwords = basic_dc().encode();
        dwords[0] |= 1 << 40;
        assert_eq!(
            DeviceContext::decode(&dwords),
            Err(FaultCause::DdtEntryMisconfigured)
        );
    }

    #[test]
    fn unsupported_hgatp_mode_misconfigures() {
        let mut dwords = basic_dc().encode();
        dwords[1] = (dwords[1] & !(0xf << 60)) | (9 << 60);
        assert_eq!(
            DeviceContext::decode(&dwords),
            Err(FaultCause::DdtEntryMisconfigured)
        );
    }

    #[test]
    fn pdtp_decoding() {
        let mut dc = basic_dc();
        dc.tc |= TcFlags::PDTV;
        dc.fsc = Fsc::Pdtp(Pdtp::new(PdtMode::Pd17, 0x8300_0000));
        let decoded = DeviceContext::decode(&dc.encode()).unwrap();
        assert_eq!(decoded.fsc, dc.fsc);
    }

    #[test]
    fn process_context_roundtrip() {
        let pc = ProcessContext {
            ens: true,
            sum: false,
            pscid: 42,
            iosatp: Iosatp::sv39(0x8400_0000),
        };
        assert_eq!(ProcessContext::decode(&pc.encode()).unwrap(), pc);
    }

    #[test]
    fn process_context_reserved_bits() {
        let pc = ProcessContext {
            ens: false,
            sum: false,
            pscid: 0,
            iosatp: Iosatp::bare(),
        };
        let mut dwords = pc.encode();
        dwords[0] |= 1 << 8;
        assert_eq!(
            ProcessContext::decode(&dwords),
            Err(FaultCause::PdtEntryMisconfigured)
        );
    }
}
