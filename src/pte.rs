//! RISC-V Page Table Entry Handling
//!
//! This module provides Sv39/Sv39x4 page table entry support including:
//! - PTE flag and field accessors
//! - Reserved-bit and malformation checks
//! - Superpage alignment checks
//! - Address field slicing helpers for the walkers

use bitflags::bitflags;

use crate::request::AccessType;

/// Base page shift (4 KiB pages)
pub const PAGE_SHIFT: u64 = 12;
/// Base page size in bytes
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
/// Size of one page table entry in bytes
pub const PTE_BYTES: u64 = 8;
/// Number of page table levels (Sv39 / Sv39x4)
pub const LEVELS: u8 = 3;
/// VPN bits per level
pub const VPN_BITS: u64 = 9;
/// Physical address width in bits
pub const PA_BITS: u64 = 56;
/// Mask of representable physical addresses
pub const PA_MASK: u64 = (1 << PA_BITS) - 1;
/// Guest physical address width for Sv39x4 (two extra root bits)
pub const GPA_BITS: u64 = 41;
/// PPN field width in bits
const PPN_BITS: u64 = 44;
const PPN_FIELD: u64 = (1 << PPN_BITS) - 1;
/// Bits 54..63 are reserved for extensions this model does not support
/// (Svpbmt, Svnapot); a set bit makes the entry malformed.
const RESERVED_MASK: u64 = !((1 << 54) - 1);

bitflags! {
    /// Page table entry permission and status flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const V = 1 << 0;       // Valid bit
        const R = 1 << 1;       // Read bit
        const W = 1 << 2;       // Write bit
        const X = 1 << 3;       // Execute bit
        const U = 1 << 4;       // User mode bit
        const G = 1 << 5;       // Global bit
        const A = 1 << 6;       // Accessed bit
        const D = 1 << 7;       // Dirty bit
        const RSW = 0x3 << 8;   // Reserved for software
    }
}

/// Page sizes representable by an Sv39 leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    /// 4 KiB base page (leaf at level 0)
    Size4K,
    /// 2 MiB megapage (leaf at level 1)
    Size2M,
    /// 1 GiB gigapage (leaf at level 2)
    Size1G,
}

impl PageSize {
    /// Page size in bytes
    #[inline]
    pub const fn bytes(self) -> u64 {
        match self {
            PageSize::Size4K => 1 << 12,
            PageSize::Size2M => 1 << 21,
            PageSize::Size1G => 1 << 30,
        }
    }

    /// Offset mask covering the page
    #[inline]
    pub const fn offset_mask(self) -> u64 {
        self.bytes() - 1
    }

    /// Page size for a leaf found at `level`
    #[inline]
    pub fn from_level(level: u8) -> PageSize {
        match level {
            0 => PageSize::Size4K,
            1 => PageSize::Size2M,
            _ => PageSize::Size1G,
        }
    }

    /// The smaller of two page sizes
    #[inline]
    pub fn min(self, other: PageSize) -> PageSize {
        if self.bytes() <= other.bytes() {
            self
        } else {
            other
        }
    }
}

/// Page table entry structure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Pte(u64);

impl Pte {
    /// Create an invalid page table entry
    #[inline]
    pub const fn new() -> Self {
        Self(0)
    }

    /// Create a page table entry from a raw value
    #[inline]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw value
    #[inline]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Check if the entry is valid
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0 & PteFlags::V.bits() != 0
    }

    /// Check if the entry is readable
    #[inline]
    pub fn is_readable(&self) -> bool {
        self.0 & PteFlags::R.bits() != 0
    }

    /// Check if the entry is writable
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.0 & PteFlags::W.bits() != 0
    }

    /// Check if the entry is executable
    #[inline]
    pub fn is_executable(&self) -> bool {
        self.0 & PteFlags::X.bits() != 0
    }

    /// Check if the entry is accessible in user mode
    #[inline]
    pub fn is_user(&self) -> bool {
        self.0 & PteFlags::U.bits() != 0
    }

    /// Check if the entry is global
    #[inline]
    pub fn is_global(&self) -> bool {
        self.0 & PteFlags::G.bits() != 0
    }

    /// Check if the accessed bit is set
    #[inline]
    pub fn is_accessed(&self) -> bool {
        self.0 & PteFlags::A.bits() != 0
    }

    /// Check if the dirty bit is set
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.0 & PteFlags::D.bits() != 0
    }

    /// Get the physical page number
    #[inline]
    pub fn ppn(&self) -> u64 {
        (self.0 >> 10) & PPN_FIELD
    }

    /// Get the physical address of the page this entry maps
    #[inline]
    pub fn pa(&self) -> u64 {
        self.ppn() << PAGE_SHIFT
    }

    /// Check if this is a leaf entry (any of R/W/X set)
    #[inline]
    pub fn is_leaf(&self) -> bool {
        let rwx = PteFlags::R.bits() | PteFlags::W.bits() | PteFlags::X.bits();
        self.0 & rwx != 0
    }

    /// Get the flag set
    #[inline]
    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Check whether the entry is malformed.
    ///
    /// Malformed entries abort a walk with a page fault: reserved high bits
    /// set, write permission without read permission, or (for non-leaf
    /// entries) leaf-only attribute bits set.
    pub fn is_malformed(&self) -> bool {
        if self.0 & RESERVED_MASK != 0 {
            return true;
        }
        if self.is_writable() && !self.is_readable() {
            return true;
        }
        if !self.is_leaf() {
            // Pointer entries must not carry leaf-only attributes.
            let leaf_only = PteFlags::U.bits() | PteFlags::A.bits() | PteFlags::D.bits();
            if self.0 & leaf_only != 0 {
                return true;
            }
        }
        false
    }

    /// Check superpage alignment for a leaf found at `level`.
    ///
    /// A leaf above the deepest level must have all lower-order PPN bits
    /// zero; otherwise the mapping is a misaligned superpage.
    #[inline]
    pub fn is_misaligned(&self, level: u8) -> bool {
        let low_bits = VPN_BITS * level as u64;
        low_bits != 0 && self.ppn() & ((1 << low_bits) - 1) != 0
    }

    /// Create a leaf entry mapping `pa` with the given flags
    pub fn leaf(pa: u64, flags: PteFlags) -> Self {
        let ppn = (pa >> PAGE_SHIFT) & PPN_FIELD;
        Self((ppn << 10) | (flags | PteFlags::V).bits())
    }

    /// Create a pointer entry referencing the next-level table at `pa`
    pub fn branch(pa: u64) -> Self {
        let ppn = (pa >> PAGE_SHIFT) & PPN_FIELD;
        Self((ppn << 10) | PteFlags::V.bits())
    }
}

/// Extract the stage-1 (Sv39) VPN slice of `va` for `level`
#[inline]
pub fn vpn(va: u64, level: u8) -> u64 {
    (va >> (PAGE_SHIFT + VPN_BITS * level as u64)) & ((1 << VPN_BITS) - 1)
}

/// Extract the stage-2 (Sv39x4) GPPN slice of `gpa` for `level`.
///
/// The root level index is widened by two bits (16 KiB root table).
#[inline]
pub fn gppn(gpa: u64, level: u8) -> u64 {
    let shift = PAGE_SHIFT + VPN_BITS * level as u64;
    if level == LEVELS - 1 {
        (gpa >> shift) & ((1 << (VPN_BITS + 2)) - 1)
    } else {
        (gpa >> shift) & ((1 << VPN_BITS) - 1)
    }
}

/// Check Sv39 virtual address canonicality: bits 63:39 must equal bit 38
#[inline]
pub fn is_canonical_sv39(va: u64) -> bool {
    ((va as i64) << 25 >> 25) as u64 == va
}

/// Check an Sv39x4 guest physical address: bits above 40 must be zero
#[inline]
pub fn is_valid_gpa(gpa: u64) -> bool {
    gpa < (1 << GPA_BITS)
}

/// Evaluate stage-1 access permissions against a leaf entry.
///
/// `user` is the effective privilege of the transaction; `sum` permits
/// supervisor loads/stores (never fetches) to user pages.
pub fn check_s1_access(pte: Pte, access: AccessType, user: bool, sum: bool) -> bool {
    let perm_ok = match access {
        AccessType::Read => pte.is_readable(),
        AccessType::Write => pte.is_writable(),
        AccessType::Execute => pte.is_executable(),
    };
    if !perm_ok {
        return false;
    }
    if user {
        pte.is_user()
    } else if pte.is_user() {
        sum && access != AccessType::Execute
    } else {
        true
    }
}

/// Evaluate stage-2 access permissions against a leaf entry.
///
/// G-stage leaves must be marked user-accessible; permission bits are
/// checked against the access type of the original transaction.
pub fn check_s2_access(pte: Pte, access: AccessType) -> bool {
    if !pte.is_user() {
        return false;
    }
    match access {
        AccessType::Read => pte.is_readable(),
        AccessType::Write => pte.is_writable(),
        AccessType::Execute => pte.is_executable(),
    }
}

/// Check the accessed/dirty policy for a leaf entry.
///
/// The walk port is read-only, so a cleared A bit (or cleared D bit on a
/// store) cannot be repaired in place and is a page fault.
#[inline]
pub fn check_ad(pte: Pte, access: AccessType) -> bool {
    pte.is_accessed() && (access != AccessType::Write || pte.is_dirty())
}
