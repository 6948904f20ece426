//! riscv-iommu - A Software Model of a RISC-V I/O Memory Management Unit
//!
//! This crate models the address-translation pipeline of an IOMMU that
//! sits between DMA-capable devices and system memory: per-device and
//! per-process context lookup through in-memory directory trees,
//! two-stage Sv39/Sv39x4 page-table walking, MSI address redirection,
//! and the three translation caches (device-context, process-context
//! and address-translation) with tree pseudo-LRU replacement.
//!
//! The entry point is [`Iommu::translate`]: one call translates one
//! inbound request against a configuration snapshot, returning either a
//! [`Translation`] or a [`Fault`] carrying a hardware cause code.

// Context and configuration
pub mod config;
pub mod context;
pub mod request;

// Fault taxonomy
pub mod fault;

// Caches and replacement
pub mod ddtc;
pub mod iotlb;
pub mod pdtc;
pub mod plru;
pub mod stats;

// Walkers
mod cdw;
pub mod memory;
pub mod msi;
mod ptw;

// Page-table entry handling
pub mod pte;

// Orchestration
pub mod translation;

// Re-export the request-level API
pub use config::{DdtMode, IommuConfig};
pub use context::{DeviceContext, ProcessContext};
pub use fault::{Fault, FaultCause};
pub use memory::{FlatMemory, MemoryError, WalkMemory};
pub use request::{AccessType, Privilege, TransReq, Translation};
pub use translation::Iommu;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
