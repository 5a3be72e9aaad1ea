#![allow(dead_code)]

use pecoff_unwind::coff::PeCoff;
use pecoff_unwind::memory::{BufferMemory, SparseMemory};
use pecoff_unwind::runtime_function::RuntimeFunction;
use pecoff_unwind::unwind_info::{UnwindCode, UnwindInfo, UnwindOp};

pub const IMAGE_BASE: u64 = 0x1_4000_0000;
pub const TEXT_RVA: u32 = 0x1000;
pub const XDATA_RVA: u32 = 0x2000;
pub const PDATA_RVA: u32 = 0x3000;

const E_LFANEW: usize = 0x80;
const TEXT_SIZE: usize = 0x1000;
const XDATA_SIZE: usize = 0x400;
const PDATA_SIZE: usize = 0x200;
const TEXT_OFFSET: usize = 0x400;
const XDATA_OFFSET: usize = TEXT_OFFSET + TEXT_SIZE;
const PDATA_OFFSET: usize = XDATA_OFFSET + XDATA_SIZE;

/// Builds a minimal PE32+ x86-64 image with `.text`, `.xdata` and `.pdata` sections
pub struct PeBuilder {
    text: Vec<u8>,
    xdata: Vec<u8>,
    functions: Vec<RuntimeFunction>,
}

impl Default for PeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PeBuilder {
    pub fn new() -> Self {
        Self {
            text: vec![0xcc; TEXT_SIZE],
            xdata: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn code(&mut self, rva: u32, bytes: &[u8]) -> &mut Self {
        let start = (rva - TEXT_RVA) as usize;
        self.text[start..start + bytes.len()].copy_from_slice(bytes);
        self
    }

    /// Appends an unwind info record and returns its rva
    pub fn unwind_info(&mut self, info: &UnwindInfo) -> u32 {
        let rva = XDATA_RVA + self.xdata.len() as u32;
        self.xdata.extend(info.to_bytes());
        self.xdata.resize((self.xdata.len() + 3) & !3, 0);
        assert!(self.xdata.len() <= XDATA_SIZE);
        rva
    }

    pub fn function(&mut self, start_rva: u32, end_rva: u32, unwind_info_rva: u32) -> &mut Self {
        self.functions.push(RuntimeFunction {
            start_rva,
            end_rva,
            unwind_info_rva,
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut functions = self.functions.clone();
        functions.sort_by_key(|f| f.start_rva);
        let pdata: Vec<u8> = functions.iter().flat_map(|f| f.to_bytes()).collect();
        assert!(pdata.len() <= PDATA_SIZE);

        let mut out = vec![0u8; E_LFANEW];
        out[0..2].copy_from_slice(b"MZ");
        out[0x3c..0x40].copy_from_slice(&(E_LFANEW as u32).to_le_bytes());

        // COFF header
        let data_dirs = 16u32;
        out.extend_from_slice(b"PE\0\0");
        out.extend_from_slice(&0x8664u16.to_le_bytes());
        out.extend_from_slice(&3u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&((112 + 8 * data_dirs) as u16).to_le_bytes());
        out.extend_from_slice(&0x22u16.to_le_bytes());

        // optional header
        out.extend_from_slice(&0x20bu16.to_le_bytes());
        out.extend_from_slice(&[14, 0]);
        out.extend_from_slice(&(TEXT_SIZE as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&TEXT_RVA.to_le_bytes());
        out.extend_from_slice(&TEXT_RVA.to_le_bytes());
        out.extend_from_slice(&IMAGE_BASE.to_le_bytes());
        out.extend_from_slice(&0x1000u32.to_le_bytes());
        out.extend_from_slice(&0x200u32.to_le_bytes());
        out.extend_from_slice(&[0u8; 12]);
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0x4000u32.to_le_bytes());
        out.extend_from_slice(&(TEXT_OFFSET as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&3u16.to_le_bytes());
        out.extend_from_slice(&0x8160u16.to_le_bytes());
        out.extend_from_slice(&[0u8; 32]);
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&data_dirs.to_le_bytes());
        for idx in 0..data_dirs {
            let (vm_addr, vm_size) = if idx == 3 && !pdata.is_empty() {
                (PDATA_RVA, pdata.len() as u32)
            } else {
                (0, 0)
            };
            out.extend_from_slice(&vm_addr.to_le_bytes());
            out.extend_from_slice(&vm_size.to_le_bytes());
        }

        // section table
        for (name, rva, size, offset, flags) in [
            (".text", TEXT_RVA, TEXT_SIZE, TEXT_OFFSET, 0x6000_0020u32),
            (".xdata", XDATA_RVA, XDATA_SIZE, XDATA_OFFSET, 0x4000_0040),
            (".pdata", PDATA_RVA, PDATA_SIZE, PDATA_OFFSET, 0x4000_0040),
        ] {
            let mut raw = [0u8; 8];
            raw[..name.len()].copy_from_slice(name.as_bytes());
            out.extend_from_slice(&raw);
            out.extend_from_slice(&(size as u32).to_le_bytes());
            out.extend_from_slice(&rva.to_le_bytes());
            out.extend_from_slice(&(size as u32).to_le_bytes());
            out.extend_from_slice(&(offset as u32).to_le_bytes());
            out.extend_from_slice(&[0u8; 12]);
            out.extend_from_slice(&flags.to_le_bytes());
        }

        out.resize(TEXT_OFFSET, 0);
        out.extend_from_slice(&self.text);
        out.extend_from_slice(&self.xdata);
        out.resize(PDATA_OFFSET, 0);
        out.extend_from_slice(&pdata);
        out.resize(PDATA_OFFSET + PDATA_SIZE, 0);
        out
    }

    pub fn pecoff(&self) -> PeCoff<BufferMemory> {
        PeCoff::parse(BufferMemory::new(self.build())).expect("test image must parse")
    }
}

pub fn op(code_offset: u8, op: UnwindOp, info: u8) -> UnwindCode {
    UnwindCode::new(code_offset, op as u8, info)
}

pub fn record(prolog_size: u8, codes: Vec<UnwindCode>) -> UnwindInfo {
    UnwindInfo {
        version: 1,
        prolog_size,
        num_codes: codes.len() as u8,
        codes,
        ..Default::default()
    }
}

pub fn stack(base: u64, words: &[u64]) -> SparseMemory {
    let mut memory = SparseMemory::new();
    for (idx, word) in words.iter().enumerate() {
        memory.set_u64(base + idx as u64 * 8, *word);
    }
    memory
}
