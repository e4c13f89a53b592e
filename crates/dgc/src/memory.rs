//! Device memory abstraction shared by the host-side packer and the generator program.
//!
//! Real drivers map GPU virtual addresses; here the trait is kept small so it can be backed by a
//! driver allocation, a capture file, or the plain [`VecDeviceMemory`] used by tests.

use std::cell::{Ref, RefCell};
use std::ops::Range;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("device memory access out of bounds: addr=0x{addr:x}, len=0x{len:x}")]
pub struct MemoryError {
    pub addr: u64,
    pub len: usize,
}

/// Minimal device memory interface.
pub trait DeviceMemory {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), MemoryError>;
    fn write(&self, addr: u64, src: &[u8]) -> Result<(), MemoryError>;

    fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        let mut b = [0u8; 4];
        self.read(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        let mut b = [0u8; 8];
        self.read(addr, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    fn write_u32(&self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    fn read_vec(&self, addr: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut out = vec![0u8; len];
        self.read(addr, &mut out)?;
        Ok(out)
    }
}

/// Contiguous in-memory device address space `[base, base + size)` for tests and tooling.
#[derive(Clone, Debug)]
pub struct VecDeviceMemory {
    base: u64,
    mem: RefCell<Vec<u8>>,
}

impl VecDeviceMemory {
    pub fn new(base: u64, size_bytes: usize) -> Self {
        Self {
            base,
            mem: RefCell::new(vec![0u8; size_bytes]),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.mem.borrow().len()
    }

    pub fn as_slice(&self) -> Ref<'_, [u8]> {
        Ref::map(self.mem.borrow(), |v| v.as_slice())
    }

    /// Fill `[addr, addr + len)` with `byte`.
    pub fn fill(&self, addr: u64, len: usize, byte: u8) -> Result<(), MemoryError> {
        let range = self.range(addr, len)?;
        self.mem.borrow_mut()[range].fill(byte);
        Ok(())
    }

    fn range(&self, addr: u64, len: usize) -> Result<Range<usize>, MemoryError> {
        let err = MemoryError { addr, len };
        let start = addr
            .checked_sub(self.base)
            .and_then(|off| usize::try_from(off).ok())
            .ok_or(err.clone())?;
        let end = start.checked_add(len).ok_or(err.clone())?;
        if end > self.mem.borrow().len() {
            return Err(err);
        }
        Ok(start..end)
    }
}

impl DeviceMemory for VecDeviceMemory {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), MemoryError> {
        let range = self.range(addr, dst.len())?;
        dst.copy_from_slice(&self.mem.borrow()[range]);
        Ok(())
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<(), MemoryError> {
        let range = self.range(addr, src.len())?;
        self.mem.borrow_mut()[range].copy_from_slice(src);
        Ok(())
    }
}
