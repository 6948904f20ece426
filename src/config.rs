//! IOMMU Configuration Snapshot
//!
//! The hardware reads its mode and directory root from memory-mapped
//! registers; the model takes a consistent snapshot of those fields at
//! request start and threads it through the translation pipeline.

use crate::pte::PAGE_SHIFT;

/// Top-level translation mode (device directory configuration)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdtMode {
    /// No inbound transactions are allowed
    Off,
    /// Pass-through; no per-device context exists
    Bare,
    /// Single-level device directory (6-bit device ids)
    Level1,
    /// Two-level device directory (15-bit device ids)
    Level2,
    /// Three-level device directory (24-bit device ids)
    Level3,
}

impl DdtMode {
    /// Number of directory levels walked for this mode
    #[inline]
    pub fn levels(self) -> u8 {
        match self {
            DdtMode::Off | DdtMode::Bare => 0,
            DdtMode::Level1 => 1,
            DdtMode::Level2 => 2,
            DdtMode::Level3 => 3,
        }
    }

    /// Width of device ids representable in this mode.
    ///
    /// Extended-format device contexts are 64 bytes, so a 4 KiB leaf
    /// table indexes 6 id bits; each non-leaf level adds 9.
    #[inline]
    pub fn device_id_bits(self) -> u32 {
        match self {
            DdtMode::Off | DdtMode::Bare => 0,
            DdtMode::Level1 => 6,
            DdtMode::Level2 => 15,
            DdtMode::Level3 => 24,
        }
    }
}

/// Immutable per-request configuration snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IommuConfig {
    /// Top-level translation mode
    pub mode: DdtMode,
    /// Physical page number of the device directory root
    pub ddt_root_ppn: u64,
}

impl IommuConfig {
    /// Translation disabled entirely
    pub fn off() -> Self {
        Self {
            mode: DdtMode::Off,
            ddt_root_ppn: 0,
        }
    }

    /// Top-level pass-through mode
    pub fn bare() -> Self {
        Self {
            mode: DdtMode::Bare,
            ddt_root_ppn: 0,
        }
    }

    /// Directory mode rooted at `ddt_root` (page-aligned physical address)
    pub fn with_ddt(mode: DdtMode, ddt_root: u64) -> Self {
        Self {
            mode,
            ddt_root_ppn: ddt_root >> PAGE_SHIFT,
        }
    }

    /// Physical address of the device directory root
    #[inline]
    pub fn ddt_root(&self) -> u64 {
        self.ddt_root_ppn << PAGE_SHIFT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(DdtMode::Level1, 1, 6)]
    #[test_case(DdtMode::Level2, 2, 15)]
    #[test_case(DdtMode::Level3, 3, 24)]
    fn mode_geometry(mode: DdtMode, levels: u8, bits: u32) {
        assert_eq!(mode.levels(), levels);
        assert_eq!(mode.device_id_bits(), bits);
    }

    #[test]
    fn root_address_roundtrip() {
        let cfg = IommuConfig::with_ddt(DdtMode::Level2, 0x8100_0000);
        assert_eq!(cfg.ddt_root(), 0x8100_0000);
    }
}
