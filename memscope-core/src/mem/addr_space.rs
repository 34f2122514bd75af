use crate::error::{Error, Result};
use crate::types::Address;

/**
The `AddressSpace` trait implements read access to the virtual memory of
the inspected system and provides a generic way to read typed values from
a memory snapshot.

All reads go through `&self`: a snapshot is immutable and freely shared
between worker threads without locking. A read of an address the snapshot
cannot translate fails with [`Error::Unmapped`]; that is the only failure
signal consulted mid-traversal.

# Examples

Reading from an `AddressSpace`:
```
use memscope_core::types::Address;
use memscope_core::mem::{AddressSpace, DummyMemory};

let mem = DummyMemory::with_kernel_base(Address::from(0xffff_8800_0000_0000u64), 0x1000);
let val = mem.read_u64(Address::from(0xffff_8800_0000_0010u64)).unwrap();
assert_eq!(val, 0);
```
*/
pub trait AddressSpace {
    /// Reads `out.len()` bytes at `addr` into `out`.
    fn read_into(&self, addr: Address, out: &mut [u8]) -> Result<()>;

    /// Returns `true` if `addr` lies within the kernel-owned part of the
    /// virtual address space. Userspace addresses are never expanded.
    fn is_kernel(&self, addr: Address) -> bool;

    // read helpers
    fn read_bytes(&self, addr: Address, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(addr, &mut buf)?;
        Ok(buf)
    }

    fn read_u8(&self, addr: Address) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_into(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, addr: Address) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_into(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, addr: Address) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_into(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, addr: Address) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_into(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads a little-endian unsigned integer of 1, 2, 4 or 8 bytes.
    fn read_uint(&self, addr: Address, size: usize) -> Result<u64> {
        match size {
            1 => self.read_u8(addr).map(u64::from),
            2 => self.read_u16(addr).map(u64::from),
            4 => self.read_u32(addr).map(u64::from),
            8 => self.read_u64(addr),
            _ => Err(Error::Other("unsupported integer width")),
        }
    }

    /// Reads a pointer cell of the given width (4 or 8 bytes).
    fn read_ptr(&self, addr: Address, ptr_size: usize) -> Result<Address> {
        match ptr_size {
            4 => self.read_u32(addr).map(Address::from),
            8 => self.read_u64(addr).map(Address::from),
            _ => Err(Error::Other("unsupported pointer width")),
        }
    }
}

// forward impls
impl<T: AddressSpace + ?Sized, P: std::ops::Deref<Target = T>> AddressSpace for P {
    fn read_into(&self, addr: Address, out: &mut [u8]) -> Result<()> {
        (**self).read_into(addr, out)
    }

    fn is_kernel(&self, addr: Address) -> bool {
        (**self).is_kernel(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::DummyMemory;
    use std::sync::Arc;

    #[test]
    fn typed_reads() {
        let base = Address::from(0xffff_8800_0000_0000u64);
        let mut mem = DummyMemory::with_kernel_base(base, 0x100);
        mem.write(base, &[0x78, 0x56, 0x34, 0x12]);

        assert_eq!(mem.read_u8(base).unwrap(), 0x78);
        assert_eq!(mem.read_u16(base).unwrap(), 0x5678);
        assert_eq!(mem.read_u32(base).unwrap(), 0x1234_5678);
        assert_eq!(mem.read_uint(base, 4).unwrap(), 0x1234_5678);
        assert_eq!(
            mem.read_ptr(base, 4).unwrap(),
            Address::from(0x1234_5678u64)
        );
    }

    #[test]
    fn unmapped_read_fails() {
        let base = Address::from(0xffff_8800_0000_0000u64);
        let mem = DummyMemory::with_kernel_base(base, 0x100);
        assert_eq!(mem.read_u64(base + 0x100u64), Err(Error::Unmapped));
        assert_eq!(mem.read_u64(Address::from(0x1000u64)), Err(Error::Unmapped));
    }

    #[test]
    fn forward_impl_through_arc() {
        let base = Address::from(0xffff_8800_0000_0000u64);
        let mem = Arc::new(DummyMemory::with_kernel_base(base, 0x100));
        assert_eq!(mem.read_u64(base).unwrap(), 0);
        assert!(mem.is_kernel(base));
    }
}
