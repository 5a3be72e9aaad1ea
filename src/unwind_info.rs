//! # Unwind Info Module
//!
//! Parsing of `UNWIND_INFO` records (the `.xdata` data referenced from the exception table) and
//! the per-module cache of parsed records.
//!
//! Layout of a record:
//!
//! ```text
//! [u8 version:3 | flags:5][u8 prolog_size][u8 num_codes][u8 frame_reg:4 | frame_off_scaled:4]
//! [num_codes x u16 unwind code]
//! [u16 padding, if num_codes is odd]     only with UNW_FLAG_CHAININFO
//! [12 byte RUNTIME_FUNCTION]             only with UNW_FLAG_CHAININFO
//! ```
//!
//! Source: <https://learn.microsoft.com/en-us/cpp/build/exception-handling-x64#struct-unwind_info>

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Display;

use serde::Serialize;
use tracing::{error, trace};

use crate::coff::{map_rva_to_file_offset, Section};
use crate::errors::{Result, UnwindError};
use crate::memory::Memory;
use crate::registers::Reg;
use crate::runtime_function::{RuntimeFunction, RUNTIME_FUNCTION_SIZE};

pub const UNW_FLAG_EHANDLER: u8 = 0x1;
pub const UNW_FLAG_UHANDLER: u8 = 0x2;
pub const UNW_FLAG_CHAININFO: u8 = 0x4;

const UNWIND_INFO_HEADER_SIZE: u64 = 4;
const UNWIND_CODE_SIZE: u64 = 2;

/// The operation of an unwind code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum UnwindOp {
    PushNonvol = 0,
    AllocLarge = 1,
    AllocSmall = 2,
    SetFpreg = 3,
    SaveNonvol = 4,
    SaveNonvolFar = 5,
    /// Only defined in version 2 records
    Epilog = 6,
    SpareCode = 7,
    SaveXmm128 = 8,
    SaveXmm128Far = 9,
    PushMachframe = 10,
}

impl UnwindOp {
    #[must_use]
    pub fn from_code(code: u8) -> Option<UnwindOp> {
        Some(match code {
            0 => UnwindOp::PushNonvol,
            1 => UnwindOp::AllocLarge,
            2 => UnwindOp::AllocSmall,
            3 => UnwindOp::SetFpreg,
            4 => UnwindOp::SaveNonvol,
            5 => UnwindOp::SaveNonvolFar,
            6 => UnwindOp::Epilog,
            7 => UnwindOp::SpareCode,
            8 => UnwindOp::SaveXmm128,
            9 => UnwindOp::SaveXmm128Far,
            10 => UnwindOp::PushMachframe,
            _ => return None,
        })
    }
}

/// One two-byte slot of the unwind code array
///
/// A slot is either an operation (`code_offset`, `op`, `info`) or a raw 16-bit value belonging to
/// the preceding operation, which is why both views are offered.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct UnwindCode(pub u16);

impl UnwindCode {
    /// Packs an operation slot; `op` and `info` are truncated to four bits
    #[must_use]
    pub fn new(code_offset: u8, op: u8, info: u8) -> Self {
        Self(u16::from(code_offset) | (u16::from(op & 0xf) << 8) | (u16::from(info & 0xf) << 12))
    }

    /// Offset from the start of the prolog to the end of the instruction this code describes
    #[inline]
    pub fn code_offset(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    #[inline]
    pub fn op(self) -> u8 {
        ((self.0 >> 8) & 0xf) as u8
    }

    #[inline]
    pub fn info(self) -> u8 {
        (self.0 >> 12) as u8
    }

    /// The slot read as a raw auxiliary value
    #[inline]
    pub fn frame_offset(self) -> u16 {
        self.0
    }
}

impl std::fmt::Debug for UnwindCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "UnwindCode({:#06x}: offset {:#x}, op {}, info {})",
            self.0,
            self.code_offset(),
            self.op(),
            self.info()
        )
    }
}

/// A parsed `UNWIND_INFO` record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnwindInfo {
    pub version: u8,
    pub flags: u8,
    pub prolog_size: u8,
    pub num_codes: u8,
    /// Register number of the frame pointer, 0 if none is used
    pub frame_register: u8,
    /// Frame pointer offset in units of 16 bytes
    pub frame_offset_scaled: u8,
    pub codes: Vec<UnwindCode>,
    pub chained_info: Option<RuntimeFunction>,
}

impl UnwindInfo {
    /// Parses the record located at file offset `offset`
    ///
    /// # Errors
    ///
    /// * [`UnwindError::MemoryInvalid`] if a part of the record cannot be read
    /// * [`UnwindError::InvalidCoff`] if the version is neither 1 nor 2
    pub fn read<M: Memory + ?Sized>(memory: &M, offset: u64) -> Result<Self> {
        let mut header = [0u8; UNWIND_INFO_HEADER_SIZE as usize];
        memory.read_fully(offset, &mut header)?;

        let version = header[0] & 0x7;
        if version != 1 && version != 2 {
            error!("Unsupported unwind info version {version} at offset {offset:#x}");
            return Err(UnwindError::InvalidCoff("unknown unwind info version"));
        }

        let mut info = UnwindInfo {
            version,
            flags: header[0] >> 3,
            prolog_size: header[1],
            num_codes: header[2],
            frame_register: header[3] & 0xf,
            frame_offset_scaled: header[3] >> 4,
            codes: Vec::new(),
            chained_info: None,
        };

        let codes_offset = offset + UNWIND_INFO_HEADER_SIZE;
        let codes_size = info.num_codes as usize * UNWIND_CODE_SIZE as usize;
        let raw = memory.read_vec(codes_offset, codes_size)?;
        info.codes = raw
            .chunks_exact(UNWIND_CODE_SIZE as usize)
            .map(|c| UnwindCode(u16::from_le_bytes([c[0], c[1]])))
            .collect();

        if info.has_chained_info() {
            let chained_offset = offset + info.chained_info_offset();
            info.chained_info = Some(RuntimeFunction::read(memory, chained_offset)?);
        }

        Ok(info)
    }

    /// Serializes the record back into its on-disk layout
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![
            (self.version & 0x7) | (self.flags << 3),
            self.prolog_size,
            self.num_codes,
            (self.frame_register & 0xf) | (self.frame_offset_scaled << 4),
        ];
        for code in &self.codes {
            out.extend_from_slice(&code.0.to_le_bytes());
        }
        if let Some(chained) = &self.chained_info {
            out.resize(self.chained_info_offset() as usize, 0);
            out.extend_from_slice(&chained.to_bytes());
        }
        out
    }

    #[inline]
    pub fn has_chained_info(&self) -> bool {
        self.flags & UNW_FLAG_CHAININFO != 0
    }

    /// Offset of the chained runtime function from the start of the record; the code array is
    /// padded to an even number of slots
    #[inline]
    pub fn chained_info_offset(&self) -> u64 {
        UNWIND_INFO_HEADER_SIZE + ((u64::from(self.num_codes) + 1) & !1) * UNWIND_CODE_SIZE
    }

    /// Total size of the record in bytes
    pub fn size(&self) -> u64 {
        if self.has_chained_info() {
            self.chained_info_offset() + RUNTIME_FUNCTION_SIZE
        } else {
            UNWIND_INFO_HEADER_SIZE + u64::from(self.num_codes) * UNWIND_CODE_SIZE
        }
    }

    /// The frame pointer register, `None` if the function does not use one
    pub fn frame_pointer(&self) -> Option<Reg> {
        if self.frame_register == 0 {
            None
        } else {
            Reg::from_unwind_code(self.frame_register)
        }
    }

    #[inline]
    pub fn frame_offset(&self) -> u64 {
        u64::from(self.frame_offset_scaled) * 16
    }
}

impl Display for UnwindInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UnwindInfo {{ version: {}", self.version)?;
        write!(f, ", flags: {:#04x}", self.flags)?;
        write!(f, ", prolog_size: {:#x}", self.prolog_size)?;
        write!(f, ", num_codes: {}", self.num_codes)?;
        write!(f, ", frame_register: {}", self.frame_register)?;
        write!(f, ", frame_offset: {:#x} }}", self.frame_offset())
    }
}

/// Parses unwind info on demand and keeps every parsed record
///
/// The cache only grows. A reference handed out by [`Self::get`] stays valid for as long as it
/// is borrowed, and a repeated request for the same RVA is answered without touching the file.
#[derive(Debug, Default)]
pub struct UnwindInfoStore {
    sections: Vec<Section>,
    cache: HashMap<u32, UnwindInfo>,
}

impl UnwindInfoStore {
    pub fn new(sections: Vec<Section>) -> Self {
        Self {
            sections,
            cache: HashMap::new(),
        }
    }

    /// Returns the record for `unwind_info_rva`, parsing it on first use
    ///
    /// # Parameters
    ///
    /// * `memory` - The object file memory
    /// * `unwind_info_rva` - RVA of the record, as found in a [`RuntimeFunction`]
    ///
    /// # Errors
    ///
    /// * [`UnwindError::InvalidCoff`] if the RVA is not inside any section or the version is
    ///   unknown
    /// * [`UnwindError::MemoryInvalid`] if the record cannot be read
    pub fn get<M: Memory + ?Sized>(
        &mut self,
        memory: &M,
        unwind_info_rva: u32,
    ) -> Result<&UnwindInfo> {
        match self.cache.entry(unwind_info_rva) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let offset = map_rva_to_file_offset(&self.sections, u64::from(unwind_info_rva))
                    .ok_or(UnwindError::InvalidCoff("unwind info outside of all sections"))?;
                let info = UnwindInfo::read(memory, offset)?;
                trace!("parsed unwind info at rva {unwind_info_rva:#x}: {info}");
                Ok(entry.insert(info))
            }
        }
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Number of cached records
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
