//! # Runtime Function Module
//!
//! The exception table (`.pdata`) of an x64 image: a sorted, non-overlapping array of
//! `RUNTIME_FUNCTION` records, each describing the RVA range of one function and pointing to its
//! unwind info.
//!
//! Lookups run on every frame of every sample, so they use binary search. A miss is a regular
//! outcome: it means the PC belongs to a leaf function.

use std::cmp::Ordering;

use serde::Serialize;
use tracing::{debug, error, trace};

use crate::errors::{Result, UnwindError};
use crate::memory::Memory;

/// Size of one record in the exception table
pub const RUNTIME_FUNCTION_SIZE: u64 = 12;

/// One `RUNTIME_FUNCTION` record
///
/// Source: <https://learn.microsoft.com/en-us/cpp/build/exception-handling-x64#struct-runtime_function>
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct RuntimeFunction {
    pub start_rva: u32,
    /// Exclusive end of the function
    pub end_rva: u32,
    pub unwind_info_rva: u32,
}

impl RuntimeFunction {
    #[must_use]
    pub fn from_bytes(bytes: &[u8; RUNTIME_FUNCTION_SIZE as usize]) -> Self {
        let word = |idx: usize| {
            u32::from_le_bytes([
                bytes[idx * 4],
                bytes[idx * 4 + 1],
                bytes[idx * 4 + 2],
                bytes[idx * 4 + 3],
            ])
        };
        Self {
            start_rva: word(0),
            end_rva: word(1),
            unwind_info_rva: word(2),
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; RUNTIME_FUNCTION_SIZE as usize] {
        let mut out = [0u8; RUNTIME_FUNCTION_SIZE as usize];
        out[0..4].copy_from_slice(&self.start_rva.to_le_bytes());
        out[4..8].copy_from_slice(&self.end_rva.to_le_bytes());
        out[8..12].copy_from_slice(&self.unwind_info_rva.to_le_bytes());
        out
    }

    /// Reads one record from `memory` at `offset`
    ///
    /// # Errors
    ///
    /// Fails with [`UnwindError::MemoryInvalid`] if the twelve bytes cannot be read.
    pub fn read<M: Memory + ?Sized>(memory: &M, offset: u64) -> Result<Self> {
        let mut buf = [0u8; RUNTIME_FUNCTION_SIZE as usize];
        memory.read_fully(offset, &mut buf)?;
        Ok(Self::from_bytes(&buf))
    }

    #[inline]
    pub fn contains(&self, rva: u64) -> bool {
        u64::from(self.start_rva) <= rva && rva < u64::from(self.end_rva)
    }

    fn cmp_rva(&self, rva: u64) -> Ordering {
        if u64::from(self.end_rva) <= rva {
            Ordering::Less
        } else if rva < u64::from(self.start_rva) {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

/// The complete exception table of a module, in file order
#[derive(Debug, Clone, Default)]
pub struct RuntimeFunctions {
    functions: Vec<RuntimeFunction>,
}

impl RuntimeFunctions {
    /// Loads the exception table located at the file offsets `[pdata_begin, pdata_end)`
    ///
    /// The whole array is fetched with one read.
    ///
    /// # Parameters
    ///
    /// * `memory` - The object file memory
    /// * `pdata_begin` - File offset of the first record
    /// * `pdata_end` - File offset one past the last record
    ///
    /// # Errors
    ///
    /// * [`UnwindError::InvalidCoff`] if `pdata_end < pdata_begin` or the size is not a multiple
    ///   of twelve bytes
    /// * [`UnwindError::MemoryInvalid`] if the array is truncated
    pub fn init<M: Memory + ?Sized>(memory: &M, pdata_begin: u64, pdata_end: u64) -> Result<Self> {
        if pdata_end < pdata_begin {
            error!("Exception table ends before it begins: {pdata_begin:#x}..{pdata_end:#x}");
            return Err(UnwindError::InvalidCoff("pdata end before pdata begin"));
        }
        let size = pdata_end - pdata_begin;
        if size % RUNTIME_FUNCTION_SIZE != 0 {
            error!("Exception table size {size:#x} is not a multiple of {RUNTIME_FUNCTION_SIZE}");
            return Err(UnwindError::InvalidCoff("pdata size not a multiple of the record size"));
        }

        let raw = memory.read_vec(pdata_begin, size as usize)?;
        let functions: Vec<RuntimeFunction> = raw
            .chunks_exact(RUNTIME_FUNCTION_SIZE as usize)
            .map(|chunk| {
                let mut record = [0u8; RUNTIME_FUNCTION_SIZE as usize];
                record.copy_from_slice(chunk);
                RuntimeFunction::from_bytes(&record)
            })
            .collect();

        debug!("loaded {} runtime functions", functions.len());
        Ok(Self { functions })
    }

    /// Wraps an already decoded table, which must be sorted by `start_rva`
    #[must_use]
    pub fn from_sorted(functions: Vec<RuntimeFunction>) -> Self {
        debug_assert!(functions.windows(2).all(|w| w[0].end_rva <= w[1].start_rva));
        Self { functions }
    }

    /// Finds the function whose range contains `pc_rva`
    ///
    /// Returns `None` for PCs outside every function, which is how leaf functions show up.
    pub fn find(&self, pc_rva: u64) -> Option<&RuntimeFunction> {
        let found = self
            .functions
            .binary_search_by(|f| f.cmp_rva(pc_rva))
            .ok()
            .map(|idx| &self.functions[idx]);
        trace!("runtime function for rva {pc_rva:#x}: {found:x?}");
        found
    }

    pub fn as_slice(&self) -> &[RuntimeFunction] {
        &self.functions
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod test {
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::addr::Addr;
    use crate::errors::ErrorCode;
    use crate::memory::BufferMemory;

    fn encode(functions: &[RuntimeFunction]) -> Vec<u8> {
        functions.iter().flat_map(|f| f.to_bytes()).collect()
    }

    fn rf(start_rva: u32, end_rva: u32) -> RuntimeFunction {
        RuntimeFunction {
            start_rva,
            end_rva,
            unwind_info_rva: start_rva + 0x8000,
        }
    }

    #[test]
    fn test_init_reads_all_records() {
        let functions = vec![rf(0x1000, 0x1010), rf(0x1010, 0x1100), rf(0x1200, 0x1300)];
        let mut bytes = vec![0xaa; 0x20];
        bytes.extend(encode(&functions));
        let mem = BufferMemory::new(bytes);
        let table = RuntimeFunctions::init(&mem, 0x20, 0x20 + 36).unwrap();
        assert_eq!(table.as_slice(), functions.as_slice());
    }

    #[test]
    fn test_init_empty() {
        let mem = BufferMemory::new(Vec::new());
        let table = RuntimeFunctions::init(&mem, 0, 0).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.find(0x1000), None);
    }

    #[test]
    fn test_init_rejects_bad_bounds() {
        let mem = BufferMemory::new(vec![0u8; 64]);
        assert_eq!(
            RuntimeFunctions::init(&mem, 24, 12).unwrap_err().code(),
            ErrorCode::InvalidCoff
        );
        assert_eq!(
            RuntimeFunctions::init(&mem, 0, 13).unwrap_err().code(),
            ErrorCode::InvalidCoff
        );
    }

    #[test]
    fn test_init_truncated() {
        let mem = BufferMemory::new(vec![0u8; 20]);
        assert_eq!(
            RuntimeFunctions::init(&mem, 8, 32).unwrap_err(),
            UnwindError::MemoryInvalid(Addr::from(8u64))
        );
    }

    #[test]
    fn test_find_boundaries() {
        let functions = vec![rf(0x100, 0x200), rf(0x200, 0x280), rf(0x300, 0x400)];
        let table = RuntimeFunctions::from_sorted(functions);
        assert_eq!(table.find(0xff), None);
        assert_eq!(table.find(0x100).map(|f| f.start_rva), Some(0x100));
        assert_eq!(table.find(0x1ff).map(|f| f.start_rva), Some(0x100));
        assert_eq!(table.find(0x200).map(|f| f.start_rva), Some(0x200));
        assert_eq!(table.find(0x280), None);
        assert_eq!(table.find(0x2ff), None);
        assert_eq!(table.find(0x3ff).map(|f| f.start_rva), Some(0x300));
        assert_eq!(table.find(0x400), None);
        assert_eq!(table.find(u64::MAX), None);
    }

    #[test]
    fn test_find_matches_linear_scan() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            // random sorted, non-overlapping functions with random gaps
            let count = rng.gen_range(0..200);
            let mut functions = Vec::with_capacity(count);
            let mut cursor = rng.gen_range(0..0x100u32);
            for _ in 0..count {
                let start = cursor + rng.gen_range(0..0x20);
                let end = start + rng.gen_range(1..0x80);
                functions.push(rf(start, end));
                cursor = end;
            }

            // the table comes out of the file in sorted order, but the lookups are shuffled
            let mem = BufferMemory::new(encode(&functions));
            let table = RuntimeFunctions::init(&mem, 0, 12 * count as u64).unwrap();
            let limit = u64::from(cursor) + 0x40;
            let mut pcs: Vec<u64> = (0..500).map(|_| rng.gen_range(0..limit)).collect();
            for f in &functions {
                pcs.push(u64::from(f.start_rva));
                pcs.push(u64::from(f.end_rva));
            }
            pcs.shuffle(&mut rng);

            for pc in pcs {
                let expected = functions.iter().find(|f| f.contains(pc));
                assert_eq!(table.find(pc), expected, "rva {pc:#x}");
            }
        }
    }

    #[test]
    fn test_find_on_shuffled_then_sorted_input() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut functions: Vec<RuntimeFunction> =
            (0..64u32).map(|i| rf(i * 0x40, i * 0x40 + 0x30)).collect();
        functions.shuffle(&mut rng);
        functions.sort_by_key(|f| f.start_rva);
        let table = RuntimeFunctions::from_sorted(functions);
        for i in 0..64u64 {
            let pc = i * 0x40;
            let found = table.find(pc + 0x2f).map(|f| u64::from(f.start_rva));
            assert_eq!(found, Some(pc));
            assert_eq!(table.find(pc + 0x30), None);
        }
    }
}
