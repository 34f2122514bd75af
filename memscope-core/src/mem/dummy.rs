/*!
A small in-process memory snapshot for tests and examples.

Maps a single contiguous buffer at a configurable kernel base address;
everything outside the buffer is unmapped.
*/

use crate::error::{Error, Result};
use crate::mem::AddressSpace;
use crate::types::Address;

/// Vec-backed dummy snapshot.
///
/// Everything at or above `kernel_base` counts as kernel-owned; only the
/// range `[base, base + buf.len())` is mapped.
pub struct DummyMemory {
    base: Address,
    kernel_base: Address,
    buf: Vec<u8>,
}

impl DummyMemory {
    /// Creates a zero-filled snapshot of `size` bytes mapped at `base`,
    /// with the kernel boundary at `base` itself.
    pub fn with_kernel_base(base: Address, size: usize) -> Self {
        Self {
            base,
            kernel_base: base,
            buf: vec![0u8; size],
        }
    }

    /// Creates a snapshot mapped at `base` with a separately chosen
    /// kernel boundary.
    pub fn new(base: Address, kernel_base: Address, size: usize) -> Self {
        Self {
            base,
            kernel_base,
            buf: vec![0u8; size],
        }
    }

    /// Writes bytes into the backing buffer, for snapshot setup.
    ///
    /// # Panics
    ///
    /// Panics if the target range lies outside the mapped buffer.
    pub fn write(&mut self, addr: Address, data: &[u8]) {
        let offs = (addr - self.base) as usize;
        self.buf[offs..offs + data.len()].copy_from_slice(data);
    }

    /// Writes a little-endian u64, for snapshot setup.
    pub fn write_u64(&mut self, addr: Address, val: u64) {
        self.write(addr, &val.to_le_bytes());
    }

    /// Writes a little-endian u32, for snapshot setup.
    pub fn write_u32(&mut self, addr: Address, val: u32) {
        self.write(addr, &val.to_le_bytes());
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }
}

impl AddressSpace for DummyMemory {
    fn read_into(&self, addr: Address, out: &mut [u8]) -> Result<()> {
        if addr < self.base {
            return Err(Error::Unmapped);
        }
        let offs = (addr - self.base) as usize;
        if offs + out.len() > self.buf.len() {
            return Err(Error::Unmapped);
        }
        out.copy_from_slice(&self.buf[offs..offs + out.len()]);
        Ok(())
    }

    fn is_kernel(&self, addr: Address) -> bool {
        addr >= self.kernel_base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let base = Address::from(0xffff_8800_0000_0000u64);
        let mut mem = DummyMemory::with_kernel_base(base, 0x1000);
        mem.write_u64(base + 0x10u64, 0xdead_beef_cafe_babe);
        assert_eq!(mem.read_u64(base + 0x10u64).unwrap(), 0xdead_beef_cafe_babe);
    }

    #[test]
    fn kernel_boundary() {
        let base = Address::from(0x1000u64);
        let kernel = Address::from(0xffff_8800_0000_0000u64);
        let mem = DummyMemory::new(base, kernel, 0x1000);
        assert!(!mem.is_kernel(Address::from(0x2000u64)));
        assert!(mem.is_kernel(kernel + 0x10u64));
    }
}
