//! # Memory Module
//!
//! Byte sources the unwinder reads from.
//!
//! Two roles exist: the *object file memory* holds the PE/COFF image and is addressed by file
//! offset, the *process memory* holds the live address space of the traced process and is
//! addressed by virtual address. Both are read-only and share the [`Memory`] trait.
//!
//! Reads are all-or-nothing. A read that cannot be fully satisfied fails with
//! [`UnwindError::MemoryInvalid`] carrying the address the read started at.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::addr::Addr;
use crate::errors::{Result, UnwindError};

/// A random-access, read-only byte source
pub trait Memory {
    /// Fills `buf` with the bytes starting at `addr`
    ///
    /// # Errors
    ///
    /// Fails with [`UnwindError::MemoryInvalid`] if any byte of the range is not available. The
    /// contents of `buf` are unspecified in that case.
    fn read_fully(&self, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// Total size of the source, if it is known
    fn size(&self) -> Option<u64> {
        None
    }

    fn read_u8(&self, addr: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_fully(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, addr: u64) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_fully(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, addr: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_fully(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, addr: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_fully(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads `len` bytes into a freshly allocated vector
    fn read_vec(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_fully(addr, &mut buf)?;
        Ok(buf)
    }

    /// Reads a NUL-terminated string of at most `max_len` bytes (terminator excluded)
    ///
    /// # Errors
    ///
    /// Fails with [`UnwindError::MemoryInvalid`] at `addr` if no terminator is found within
    /// `max_len` bytes or a byte cannot be read.
    fn read_string(&self, addr: u64, max_len: usize) -> Result<String> {
        let mut bytes = Vec::new();
        for idx in 0..=max_len as u64 {
            let byte = self
                .read_u8(addr.wrapping_add(idx))
                .map_err(|_| UnwindError::MemoryInvalid(Addr::from(addr)))?;
            if byte == 0 {
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.push(byte);
        }
        Err(UnwindError::MemoryInvalid(Addr::from(addr)))
    }
}

impl<M: Memory + ?Sized> Memory for &M {
    fn read_fully(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_fully(addr, buf)
    }

    fn size(&self) -> Option<u64> {
        (**self).size()
    }
}

impl<M: Memory + ?Sized> Memory for Arc<M> {
    fn read_fully(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_fully(addr, buf)
    }

    fn size(&self) -> Option<u64> {
        (**self).size()
    }
}

/// A contiguous buffer mapped at `base`
///
/// This is the usual object file memory: the whole PE image read into memory with a base of
/// zero. Cloning is cheap, the bytes are shared.
#[derive(Debug, Clone)]
pub struct BufferMemory {
    base: u64,
    data: Arc<[u8]>,
}

impl BufferMemory {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self::with_base(0, data)
    }

    pub fn with_base(base: u64, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            base,
            data: data.into(),
        }
    }

    /// Reads a whole file into memory
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(Self::new(std::fs::read(path)?))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Memory for BufferMemory {
    fn read_fully(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let invalid = UnwindError::MemoryInvalid(Addr::from(addr));
        let start = addr.checked_sub(self.base).ok_or(invalid)? as usize;
        let end = start.checked_add(buf.len()).ok_or(invalid)?;
        let src = self.data.get(start..end).ok_or(invalid)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// Memory made of scattered known bytes, everything else is invalid
///
/// Used for process memory reconstructed from a captured stack snapshot, where only a few
/// regions of the address space are known.
#[derive(Debug, Clone, Default)]
pub struct SparseMemory {
    bytes: BTreeMap<u64, u8>,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bytes(&mut self, addr: u64, data: &[u8]) {
        for (idx, byte) in data.iter().enumerate() {
            self.bytes.insert(addr.wrapping_add(idx as u64), *byte);
        }
    }

    pub fn set_u64(&mut self, addr: u64, value: u64) {
        self.set_bytes(addr, &value.to_le_bytes());
    }

    /// Marks `len` bytes starting at `addr` as valid, filled with `value`
    pub fn fill(&mut self, addr: u64, len: u64, value: u8) {
        for idx in 0..len {
            self.bytes.insert(addr.wrapping_add(idx), value);
        }
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Memory for SparseMemory {
    fn read_fully(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        for (idx, out) in buf.iter_mut().enumerate() {
            *out = *self
                .bytes
                .get(&addr.wrapping_add(idx as u64))
                .ok_or(UnwindError::MemoryInvalid(Addr::from(addr)))?;
        }
        Ok(())
    }
}

/// Counts the reads that reach the wrapped memory
#[cfg(test)]
pub(crate) struct CountingMemory<M> {
    pub(crate) inner: M,
    pub(crate) reads: std::cell::Cell<usize>,
}

#[cfg(test)]
impl<M: Memory> CountingMemory<M> {
    pub(crate) fn new(inner: M) -> Self {
        Self {
            inner,
            reads: std::cell::Cell::new(0),
        }
    }
}

#[cfg(test)]
impl<M: Memory> Memory for CountingMemory<M> {
    fn read_fully(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.reads.set(self.reads.get() + 1);
        self.inner.read_fully(addr, buf)
    }

    fn size(&self) -> Option<u64> {
        self.inner.size()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_buffer_memory_reads() {
        let mem = BufferMemory::with_base(0x100, vec![1u8, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(mem.read_u8(0x100).unwrap(), 1);
        assert_eq!(mem.read_u16(0x101).unwrap(), 0x0302);
        assert_eq!(mem.read_u32(0x100).unwrap(), 0x04030201);
        assert_eq!(mem.read_u64(0x101).unwrap(), 0x0908070605040302);
        assert_eq!(mem.size(), Some(9));
    }

    #[test]
    fn test_buffer_memory_out_of_bounds() {
        let mem = BufferMemory::with_base(0x100, vec![0u8; 4]);
        assert_eq!(
            mem.read_u64(0x100),
            Err(UnwindError::MemoryInvalid(Addr::from(0x100u64)))
        );
        assert_eq!(
            mem.read_u8(0xff),
            Err(UnwindError::MemoryInvalid(Addr::from(0xffu64)))
        );
        assert!(mem.read_u8(0x104).is_err());
        assert!(mem.read_vec(0x100, 4).is_ok());
    }

    #[test]
    fn test_sparse_memory() {
        let mut mem = SparseMemory::new();
        mem.set_u64(0x2000, 0xdead_beef);
        assert_eq!(mem.read_u64(0x2000).unwrap(), 0xdead_beef);
        assert_eq!(
            mem.read_u64(0x2001),
            Err(UnwindError::MemoryInvalid(Addr::from(0x2001u64)))
        );
        mem.fill(0x3000, 16, 0);
        assert_eq!(mem.read_u64(0x3008).unwrap(), 0);
        mem.clear();
        assert!(mem.is_empty());
    }

    #[test]
    fn test_read_string() {
        let mem = BufferMemory::new(b".text\0.longsectionname\0abc".to_vec());
        assert_eq!(mem.read_string(0, 1024).unwrap(), ".text");
        assert_eq!(mem.read_string(6, 1024).unwrap(), ".longsectionname");
        // no terminator before the end of the buffer
        assert!(mem.read_string(23, 1024).is_err());
        // terminator beyond the length limit
        assert!(mem.read_string(6, 4).is_err());
    }
}
