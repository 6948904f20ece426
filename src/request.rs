//! Translation Request and Result Types
//!
//! Per-request inputs presented by a DMA-capable device and the
//! translation outcome returned to the bus adapter.

/// Type of memory access being translated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

/// Privilege level a PASID-bearing transaction executes with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    User,
    Supervisor,
}

/// One inbound translation request.
///
/// The request-trigger wire of the hardware maps to the extent of one
/// `Iommu::translate` call; no partial walk state survives the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransReq {
    /// Requester device id (up to 24 bits)
    pub device_id: u32,
    /// Process id (PASID, up to 20 bits) when the transaction carries one
    pub process_id: Option<u32>,
    /// I/O virtual address presented by the device
    pub iova: u64,
    /// Access type
    pub access: AccessType,
    /// ATS-style pre-translated request
    pub translated: bool,
    /// PCIe-style transaction (not eligible for top-level pass-through)
    pub pcie: bool,
    /// Privilege level; meaningful only for PASID-bearing requests
    pub privilege: Privilege,
}

impl TransReq {
    /// Untranslated read request without a PASID
    pub fn read(device_id: u32, iova: u64) -> Self {
        Self {
            device_id,
            process_id: None,
            iova,
            access: AccessType::Read,
            translated: false,
            pcie: false,
            privilege: Privilege::User,
        }
    }

    /// Untranslated write request without a PASID
    pub fn write(device_id: u32, iova: u64) -> Self {
        Self {
            access: AccessType::Write,
            ..Self::read(device_id, iova)
        }
    }

    /// Attach a user-privileged PASID
    pub fn with_process(mut self, process_id: u32) -> Self {
        self.process_id = Some(process_id);
        self
    }

    /// Set the privilege level
    pub fn with_privilege(mut self, privilege: Privilege) -> Self {
        self.privilege = privilege;
        self
    }

    /// Mark the request as ATS-style pre-translated
    pub fn pre_translated(mut self) -> Self {
        self.translated = true;
        self.pcie = true;
        self
    }
}

/// Successful translation outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Translated physical address (or guest physical address under T2GPA)
    pub paddr: u64,
    /// The address resolves into the MSI translation window
    pub is_msi: bool,
    /// The returned address is a guest physical address (T2GPA responses)
    pub t2gpa: bool,
}

impl Translation {
    pub(crate) fn new(paddr: u64) -> Self {
        Self {
            paddr,
            is_msi: false,
            t2gpa: false,
        }
    }
}
