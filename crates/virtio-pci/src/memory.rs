//! Guest physical memory as seen by the transport.
//!
//! The hosting VM owns guest RAM; the transport only needs "read into a host buffer" and "write
//! from a host buffer" by guest physical address. Both take `&self` because the vCPU thread and
//! backend worker threads access guest RAM concurrently.

use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuestMemoryError {
    #[error("guest memory access out of range: gpa=0x{gpa:x} len={len}")]
    OutOfRange { gpa: u64, len: usize },
}

pub type GuestMemoryResult<T> = Result<T, GuestMemoryError>;

pub trait GuestMemory: Send + Sync {
    /// Reads `dst.len()` bytes starting at guest physical address `gpa`.
    fn read(&self, gpa: u64, dst: &mut [u8]) -> GuestMemoryResult<()>;

    /// Writes `src` starting at guest physical address `gpa`.
    fn write(&self, gpa: u64, src: &[u8]) -> GuestMemoryResult<()>;
}

pub fn read_u16_le(mem: &dyn GuestMemory, gpa: u64) -> GuestMemoryResult<u16> {
    let mut buf = [0u8; 2];
    mem.read(gpa, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub fn read_u32_le(mem: &dyn GuestMemory, gpa: u64) -> GuestMemoryResult<u32> {
    let mut buf = [0u8; 4];
    mem.read(gpa, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_u64_le(mem: &dyn GuestMemory, gpa: u64) -> GuestMemoryResult<u64> {
    let mut buf = [0u8; 8];
    mem.read(gpa, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn write_u16_le(mem: &dyn GuestMemory, gpa: u64, value: u16) -> GuestMemoryResult<()> {
    mem.write(gpa, &value.to_le_bytes())
}

pub fn write_u32_le(mem: &dyn GuestMemory, gpa: u64, value: u32) -> GuestMemoryResult<()> {
    mem.write(gpa, &value.to_le_bytes())
}

pub fn write_u64_le(mem: &dyn GuestMemory, gpa: u64, value: u64) -> GuestMemoryResult<()> {
    mem.write(gpa, &value.to_le_bytes())
}

/// Flat, zero-based guest RAM backed by a host allocation.
///
/// Used by tests and fuzzers; real VMs plug in their own [`GuestMemory`].
#[derive(Debug)]
pub struct GuestRam {
    bytes: RwLock<Vec<u8>>,
}

impl GuestRam {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: RwLock::new(vec![0; size]),
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.read().len() as u64
    }

    /// Copies `src` into RAM starting at offset 0, truncating to the RAM size.
    pub fn fill_from(&self, src: &[u8]) {
        let mut bytes = self.bytes.write();
        let n = src.len().min(bytes.len());
        bytes[..n].copy_from_slice(&src[..n]);
    }

    fn range(len_total: usize, gpa: u64, len: usize) -> GuestMemoryResult<core::ops::Range<usize>> {
        let start = usize::try_from(gpa).map_err(|_| GuestMemoryError::OutOfRange { gpa, len })?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= len_total)
            .ok_or(GuestMemoryError::OutOfRange { gpa, len })?;
        Ok(start..end)
    }
}

impl GuestMemory for GuestRam {
    fn read(&self, gpa: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let bytes = self.bytes.read();
        let range = Self::range(bytes.len(), gpa, dst.len())?;
        dst.copy_from_slice(&bytes[range]);
        Ok(())
    }

    fn write(&self, gpa: u64, src: &[u8]) -> GuestMemoryResult<()> {
        let mut bytes = self.bytes.write();
        let range = Self::range(bytes.len(), gpa, src.len())?;
        bytes[range].copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_accesses_fail_without_partial_writes() {
        let ram = GuestRam::new(16);
        assert_eq!(
            ram.write(14, &[1, 2, 3]),
            Err(GuestMemoryError::OutOfRange { gpa: 14, len: 3 })
        );
        assert_eq!(read_u16_le(&ram, 14).unwrap(), 0);
        assert!(ram.read(u64::MAX, &mut [0u8; 1]).is_err());
    }
}
