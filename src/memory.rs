//! Walk-Port Memory Access
//!
//! The translation pipeline reads directory tables and page tables
//! through a narrow read-only port. The port is a trait so the model can
//! sit on top of any bus implementation; a flat test memory is provided
//! for unit and integration tests.

use crate::pte::PA_MASK;

/// A failed table read (bus abort, hole in the address map)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryError;

/// Read-only port the walkers use to fetch 8-byte table entries.
///
/// Every read targets a physical address; the walkers never write, so
/// accessed/dirty maintenance is out of scope for implementors.
pub trait WalkMemory {
    /// Read a naturally-aligned little-endian u64 at `paddr`
    fn read_u64(&mut self, paddr: u64) -> Result<u64, MemoryError>;
}

impl<M: WalkMemory + ?Sized> WalkMemory for &mut M {
    #[inline]
    fn read_u64(&mut self, paddr: u64) -> Result<u64, MemoryError> {
        (**self).read_u64(paddr)
    }
}

/// Flat byte-addressable memory backing the tests.
///
/// Reads outside the populated window fail with `MemoryError`, which is
/// how tests provoke transport faults at chosen walk steps.
#[derive(Debug, Clone)]
pub struct FlatMemory {
    base: u64,
    data: Vec<u8>,
    reads: u64,
}

impl FlatMemory {
    /// A zero-filled window of `size` bytes starting at `base`
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            data: vec![0; size],
            reads: 0,
        }
    }

    /// Store a little-endian u64 at `paddr` while building tables
    pub fn write_u64(&mut self, paddr: u64, value: u64) {
        let off = (paddr - self.base) as usize;
        self.data[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Number of u64 reads served so far
    #[inline]
    pub fn reads(&self) -> u64 {
        self.reads
    }
}

impl WalkMemory for FlatMemory {
    fn read_u64(&mut self, paddr: u64) -> Result<u64, MemoryError> {
        self.reads += 1;
        let paddr = paddr & PA_MASK;
        if paddr < self.base {
            return Err(MemoryError);
        }
        let off = (paddr - self.base) as usize;
        let bytes = self.data.get(off..off + 8).ok_or(MemoryError)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }
}
