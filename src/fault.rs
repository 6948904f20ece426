//! IOMMU Fault Taxonomy
//!
//! This module provides the layered fault model of the translation core:
//! - Cause codes matching the hardware enumeration
//! - Guest (stage-2) fault annotation with the faulting guest address
//! - Report suppression per the owning device's configuration

use crate::request::AccessType;

/// Translation fault causes.
///
/// Discriminants are the hardware cause codes. Codes below 256 are shared
/// with the CPU exception encoding; codes at 256 and above are specific to
/// the IOMMU context lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FaultCause {
    /// Transport error while fetching for an execute transaction
    InstructionAccessFault = 1,
    /// Transport error while fetching for a read transaction
    ReadAccessFault = 5,
    /// Transport error while fetching for a write transaction
    WriteAccessFault = 7,
    /// Stage-1 page fault on an execute transaction
    InstructionPageFault = 12,
    /// Stage-1 page fault on a read transaction
    LoadPageFault = 13,
    /// Stage-1 page fault on a write transaction
    StorePageFault = 15,
    /// Stage-2 page fault on an execute transaction
    InstructionGuestPageFault = 20,
    /// Stage-2 page fault on a read transaction
    LoadGuestPageFault = 21,
    /// Stage-2 page fault on a write transaction
    StoreGuestPageFault = 23,
    /// Translation is off; all inbound transactions are disallowed
    AllInboundDisallowed = 256,
    /// Transport error while walking the device directory
    DdtEntryLoadFault = 257,
    /// Device directory entry has its valid bit clear
    DdtEntryInvalid = 258,
    /// Device directory entry has reserved bits set or an unsupported field
    DdtEntryMisconfigured = 259,
    /// Transaction type not allowed by the device configuration
    TransTypeDisallowed = 260,
    /// Transport error while fetching an MSI page table entry
    MsiPteLoadFault = 261,
    /// MSI page table entry has its valid bit clear
    MsiPteInvalid = 262,
    /// MSI page table entry is malformed or uses an unsupported mode
    MsiPteMisconfigured = 263,
    /// Transport error while walking the process directory
    PdtEntryLoadFault = 265,
    /// Process directory entry has its valid bit clear
    PdtEntryInvalid = 266,
    /// Process directory entry has reserved bits set or an unsupported field
    PdtEntryMisconfigured = 267,
}

impl FaultCause {
    /// Numeric hardware cause code
    #[inline]
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Stage-1 page fault cause for an access type
    #[inline]
    pub fn page_fault(access: AccessType) -> Self {
        match access {
            AccessType::Read => FaultCause::LoadPageFault,
            AccessType::Write => FaultCause::StorePageFault,
            AccessType::Execute => FaultCause::InstructionPageFault,
        }
    }

    /// Stage-2 (guest) page fault cause for an access type
    #[inline]
    pub fn guest_page_fault(access: AccessType) -> Self {
        match access {
            AccessType::Read => FaultCause::LoadGuestPageFault,
            AccessType::Write => FaultCause::StoreGuestPageFault,
            AccessType::Execute => FaultCause::InstructionGuestPageFault,
        }
    }

    /// Transport (bus) fault cause for an access type
    #[inline]
    pub fn access_fault(access: AccessType) -> Self {
        match access {
            AccessType::Read => FaultCause::ReadAccessFault,
            AccessType::Write => FaultCause::WriteAccessFault,
            AccessType::Execute => FaultCause::InstructionAccessFault,
        }
    }

    /// Whether the fault originated in stage-2 translation
    #[inline]
    pub fn is_guest(self) -> bool {
        matches!(
            self,
            FaultCause::InstructionGuestPageFault
                | FaultCause::LoadGuestPageFault
                | FaultCause::StoreGuestPageFault
        )
    }

    /// Whether the fault is exempt from device-level report suppression.
    ///
    /// Faults raised before or while locating the device context are always
    /// reported; everything after the context lookup may be suppressed.
    #[inline]
    pub fn always_reported(self) -> bool {
        matches!(
            self,
            FaultCause::AllInboundDisallowed
                | FaultCause::DdtEntryLoadFault
                | FaultCause::DdtEntryInvalid
                | FaultCause::DdtEntryMisconfigured
                | FaultCause::TransTypeDisallowed
        )
    }
}

/// One reported translation fault.
///
/// At most one fault is produced per request; the first detected cause wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    /// Decoded cause
    pub cause: FaultCause,
    /// Faulting guest physical address, present for stage-2 faults
    pub gpa: Option<u64>,
    /// Whether the fault must be made visible to software
    pub report: bool,
}

impl Fault {
    /// Create a reported fault without guest-address annotation
    #[inline]
    pub fn new(cause: FaultCause) -> Self {
        Self {
            cause,
            gpa: None,
            report: true,
        }
    }

    /// Create a reported stage-2 fault carrying the faulting guest address
    #[inline]
    pub fn guest(cause: FaultCause, gpa: u64) -> Self {
        Self {
            cause,
            gpa: Some(gpa),
            report: true,
        }
    }

    /// Apply the device's fault-report suppression flag
    #[inline]
    pub fn suppressed_by(mut self, dtf: bool) -> Self {
        if dtf && !self.cause.always_reported() {
            self.report = false;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_codes_match_hardware() {
        assert_eq!(FaultCause::AllInboundDisallowed.code(), 256);
        assert_eq!(FaultCause::DdtEntryMisconfigured.code(), 259);
        assert_eq!(FaultCause::PdtEntryInvalid.code(), 266);
        assert_eq!(FaultCause::StoreGuestPageFault.code(), 23);
    }

    #[test]
    fn guest_faults_carry_stage_flag() {
        assert!(FaultCause::LoadGuestPageFault.is_guest());
        assert!(!FaultCause::LoadPageFault.is_guest());
    }

    #[test]
    fn suppression_spares_context_faults() {
        let ctx = Fault::new(FaultCause::DdtEntryInvalid).suppressed_by(true);
        assert!(ctx.report);
        let xlate = Fault::new(FaultCause::LoadPageFault).suppressed_by(true);
        assert!(!xlate.report);
        let unsuppressed = Fault::new(FaultCause::LoadPageFault).suppressed_by(false);
        assert!(unsuppressed.report);
    }
}
