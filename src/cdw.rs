//! Context Directory Walker
//!
//! Resolves device and process contexts from the in-memory directory
//! trees. The device directory is keyed by device id (1 to 3 levels
//! depending on the configured id width); the process directory hangs
//! off a device context and is keyed by process id. Process directory
//! pointers are guest physical addresses when the device has
//! second-stage translation enabled, so each fetch goes through an
//! implicit second-stage translation.

use log::{debug, trace};

use crate::config::{DdtMode, IommuConfig};
use crate::context::{DeviceContext, PdtMode, Pdtp, ProcessContext};
use crate::fault::{Fault, FaultCause};
use crate::memory::WalkMemory;
use crate::pte::PAGE_SHIFT;
use crate::ptw;

/// Size of a device context record in bytes
const DC_BYTES: u64 = 64;
/// Size of a process context record in bytes
const PC_BYTES: u64 = 16;

const DIR_V: u64 = 1 << 0;
const DIR_PPN_MASK: u64 = ((1 << 44) - 1) << 10;

/// Decode one non-leaf directory entry into the next table address
fn decode_dir_entry(raw: u64, invalid: FaultCause, bad: FaultCause) -> Result<u64, Fault> {
    if raw & DIR_V == 0 {
        return Err(Fault::new(invalid));
    }
    if raw & !(DIR_V | DIR_PPN_MASK) != 0 {
        return Err(Fault::new(bad));
    }
    Ok(((raw & DIR_PPN_MASK) >> 10) << PAGE_SHIFT)
}

/// Device-id slice indexing directory level `level` (0 = leaf table).
///
/// Extended-format split: the leaf table holds 64 contexts of 64 bytes
/// each, so only id bits 5:0 index it; bits 14:6 and 23:15 index the
/// 512-pointer non-leaf tables.
fn ddt_index(device_id: u32, level: u8) -> u64 {
    match level {
        0 => (device_id & 0x3f) as u64,
        1 => ((device_id >> 6) & 0x1ff) as u64,
        _ => ((device_id >> 15) & 0x1ff) as u64,
    }
}

/// Process-id slice indexing directory level `level` (0 = leaf table)
fn pdt_index(process_id: u32, level: u8) -> u64 {
    match level {
        0 => (process_id & 0xff) as u64,
        1 => ((process_id >> 8) & 0x1ff) as u64,
        _ => ((process_id >> 17) & 0x7) as u64,
    }
}

/// Walk the device directory and decode the context for `device_id`.
pub(crate) fn walk_ddt(
    bus: &mut impl WalkMemory,
    cfg: &IommuConfig,
    device_id: u32,
) -> Result<DeviceContext, Fault> {
    debug_assert!(!matches!(cfg.mode, DdtMode::Off | DdtMode::Bare));
    let bits = cfg.mode.device_id_bits();
    if u64::from(device_id) >= 1 << bits {
        return Err(Fault::new(FaultCause::TransTypeDisallowed));
    }
    trace!("DDT walk: device_id={device_id:#x} mode={:?}", cfg.mode);

    let mut table = cfg.ddt_root();
    for level in (1..cfg.mode.levels()).rev() {
        let raw = bus
            .read_u64(table + ddt_index(device_id, level) * 8)
            .map_err(|_| Fault::new(FaultCause::DdtEntryLoadFault))?;
        table = decode_dir_entry(
            raw,
            FaultCause::DdtEntryInvalid,
            FaultCause::DdtEntryMisconfigured,
        )?;
    }

    let dc_addr = table + ddt_index(device_id, 0) * DC_BYTES;
    let mut dwords = [0u64; 8];
    for (i, dw) in dwords.iter_mut().enumerate() {
        *dw = bus
            .read_u64(dc_addr + i as u64 * 8)
            .map_err(|_| Fault::new(FaultCause::DdtEntryLoadFault))?;
    }
    let dc = DeviceContext::decode(&dwords).map_err(Fault::new)?;
    debug!("DDT walk: device_id={device_id:#x} resolved, tc={:?}", dc.tc);
    Ok(dc)
}

/// Walk the process directory of `dc` and decode the context for
/// `process_id`. A bare process directory yields a pass-through context
/// inheriting the device's address-space id.
pub(crate) fn walk_pdt(
    bus: &mut impl WalkMemory,
    dc: &DeviceContext,
    pdtp: Pdtp,
    process_id: u32,
) -> Result<ProcessContext, Fault> {
    if pdtp.mode == PdtMode::Bare {
        return Ok(ProcessContext {
            ens: true,
            sum: false,
            pscid: dc.pscid,
            iosatp: crate::context::Iosatp::bare(),
        });
    }
    let bits = pdtp.mode.process_id_bits();
    if u64::from(process_id) >= 1 << bits {
        return Err(Fault::new(FaultCause::TransTypeDisallowed));
    }
    trace!("PDT walk: process_id={process_id:#x} mode={:?}", pdtp.mode);

    let mut table = pdtp.root();
    for level in (1..pdtp.mode.levels()).rev() {
        let pa = ptw::implicit_translate(bus, dc.iohgatp, table + pdt_index(process_id, level) * 8)?;
        let raw = bus
            .read_u64(pa)
            .map_err(|_| Fault::new(FaultCause::PdtEntryLoadFault))?;
        table = decode_dir_entry(
            raw,
            FaultCause::PdtEntryInvalid,
            FaultCause::PdtEntryMisconfigured,
        )?;
    }

    let pc_gpa = table + pdt_index(process_id, 0) * PC_BYTES;
    let mut dwords = [0u64; 2];
    for (i, dw) in dwords.iter_mut().enumerate() {
        let pa = ptw::implicit_translate(bus, dc.iohgatp, pc_gpa + i as u64 * 8)?;
        *dw = bus
            .read_u64(pa)
            .map_err(|_| Fault::new(FaultCause::PdtEntryLoadFault))?;
    }
    ProcessContext::decode(&dwords).map_err(Fault::new)
}
