//! # PE/COFF Module
//!
//! Parses the header chain of a PE32+ image and exposes what the unwinder needs from it.
//!
//! The header chain is: DOS header, `e_lfanew` pointing at the `"PE\0\0"` signature, the COFF
//! file header, the optional header (standard and Windows-specific fields followed by the data
//! directories) and finally the section table. From this the module keeps the image base, the
//! preprocessed [`Section`] list and the location of the text section, and builds a
//! [`PeCoffUnwinder`] over the exception table (`.pdata`).
//!
//! Parsing follows the layout documented at
//! <https://learn.microsoft.com/en-us/windows/win32/debug/pe-format>.

use serde::Serialize;
use tracing::{debug, error};

use crate::addr::Addr;
use crate::errors::{record, ErrorData, Result, UnwindError};
use crate::memory::Memory;
use crate::registers::Registers;
use crate::unwinder::{PeCoffUnwinder, StepOutcome};

pub const IMAGE_DOS_SIGNATURE: u16 = 0x5a4d;
pub const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550;
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
pub const OPTIONAL_HEADER_MAGIC_PE32: u16 = 0x010b;
pub const OPTIONAL_HEADER_MAGIC_PE32_PLUS: u16 = 0x020b;
pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const DATA_DIR_EXCEPTION_TABLE: usize = 3;

/// Maximum length of a section name looked up in the string table
pub const MAX_SECTION_NAME_LEN: usize = 1024;

const DOS_HEADER_SIZE: u64 = 0x40;
const DOS_E_LFANEW_OFFSET: u64 = 0x3c;
const SECTION_NAME_SIZE: usize = 8;
const SECTION_HEADER_SIZE: u64 = 40;
const SYMBOL_SIZE: u64 = 18;
/// Size of the PE32+ optional header without the data directories
const OPTIONAL_HEADER_FIXED_SIZE: u64 = 112;
const DATA_DIR_ENTRY_SIZE: u64 = 8;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DosHeader {
    pub e_magic: u16,
    pub e_lfanew: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CoffHeader {
    pub machine: u16,
    pub nsects: u16,
    pub modtime: u32,
    pub symoff: u32,
    pub nsyms: u32,
    pub hdrsize: u16,
    pub flags: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DataDirectory {
    pub vm_addr: u32,
    pub vm_size: u32,
}

/// The PE32+ optional header, only the fields the unwinder or the tools look at
#[derive(Debug, Clone, Default, Serialize)]
pub struct OptionalHeader {
    pub magic: u16,
    pub entry: u32,
    pub code_offset: u32,
    pub image_base: u64,
    pub sect_alignment: u32,
    pub file_alignment: u32,
    pub image_size: u32,
    pub header_size: u32,
    pub subsystem: u16,
    pub dll_flags: u16,
    pub data_dirs: Vec<DataDirectory>,
}

/// A section of the image, preprocessed from its section header
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Section {
    pub name: String,
    /// Size of the section once loaded
    pub vmsize: u32,
    /// RVA of the section
    pub vmaddr: u32,
    /// Size of the raw data in the file
    pub size: u32,
    /// File offset of the raw data
    pub offset: u32,
    pub flags: u32,
}

impl Section {
    #[inline]
    pub fn contains_rva(&self, rva: u64) -> bool {
        let start = u64::from(self.vmaddr);
        start <= rva && rva < start + u64::from(self.vmsize)
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        self.flags & IMAGE_SCN_CNT_CODE != 0 && self.flags & IMAGE_SCN_MEM_EXECUTE != 0
    }
}

/// Location of the text section in memory and in the file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TextSection {
    pub memory_offset: u64,
    pub memory_size: u64,
    pub file_offset: u64,
}

/// Maps an RVA to a file offset using the first section whose virtual window contains it
#[must_use]
pub fn map_rva_to_file_offset(sections: &[Section], rva: u64) -> Option<u64> {
    sections
        .iter()
        .find(|s| s.contains_rva(rva))
        .map(|s| rva - u64::from(s.vmaddr) + u64::from(s.offset))
}

/// Maps a file offset to an RVA using the first section whose raw data contains it
#[must_use]
pub fn map_file_offset_to_rva(sections: &[Section], file_offset: u64) -> Option<u64> {
    sections
        .iter()
        .find(|s| {
            let start = u64::from(s.offset);
            start <= file_offset && file_offset < start + u64::from(s.size)
        })
        .map(|s| file_offset - u64::from(s.offset) + u64::from(s.vmaddr))
}

/// Sequential little-endian reader over a [`Memory`]
struct Cursor<'m, M: Memory + ?Sized> {
    memory: &'m M,
    offset: u64,
}

impl<'m, M: Memory + ?Sized> Cursor<'m, M> {
    fn new(memory: &'m M, offset: u64) -> Self {
        Self { memory, offset }
    }

    fn u16(&mut self) -> Result<u16> {
        let v = self.memory.read_u16(self.offset)?;
        self.offset += 2;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32> {
        let v = self.memory.read_u32(self.offset)?;
        self.offset += 4;
        Ok(v)
    }

    fn u64(&mut self) -> Result<u64> {
        let v = self.memory.read_u64(self.offset)?;
        self.offset += 8;
        Ok(v)
    }

    fn bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.memory.read_fully(self.offset, &mut buf)?;
        self.offset += N as u64;
        Ok(buf)
    }
}

fn parse_dos_header<M: Memory + ?Sized>(memory: &M) -> Result<DosHeader> {
    let e_magic = memory.read_u16(0)?;
    if e_magic != IMAGE_DOS_SIGNATURE {
        error!("Magic MS-DOS 2.0 value not found. Value read: {e_magic:x}");
        return Err(UnwindError::InvalidCoff("missing MZ signature"));
    }
    // the rest of the DOS header is unused, but it still has to be readable
    memory.read_vec(0, DOS_HEADER_SIZE as usize)?;
    let e_lfanew = memory.read_u32(DOS_E_LFANEW_OFFSET)?;
    Ok(DosHeader { e_magic, e_lfanew })
}

fn parse_coff_header<M: Memory + ?Sized>(cursor: &mut Cursor<'_, M>) -> Result<CoffHeader> {
    let signature = cursor.u32()?;
    if signature != IMAGE_NT_SIGNATURE {
        error!("PE image signature not found");
        return Err(UnwindError::InvalidCoff("missing PE signature"));
    }
    let header = CoffHeader {
        machine: cursor.u16()?,
        nsects: cursor.u16()?,
        modtime: cursor.u32()?,
        symoff: cursor.u32()?,
        nsyms: cursor.u32()?,
        hdrsize: cursor.u16()?,
        flags: cursor.u16()?,
    };
    Ok(header)
}

fn parse_optional_header<M: Memory + ?Sized>(
    cursor: &mut Cursor<'_, M>,
    hdrsize: u16,
) -> Result<OptionalHeader> {
    let start = cursor.offset;
    let mut header = OptionalHeader {
        magic: cursor.u16()?,
        ..Default::default()
    };

    match header.magic {
        OPTIONAL_HEADER_MAGIC_PE32_PLUS => (),
        OPTIONAL_HEADER_MAGIC_PE32 => {
            error!("Tried to initialize 64-bit PE/COFF interface with 32-bit PE/COFF file");
            return Err(UnwindError::Unsupported("32-bit PE/COFF images"));
        }
        other => {
            error!("Magic PE value not found. Value read: {other:x}");
            return Err(UnwindError::InvalidCoff("bad optional header magic"));
        }
    }

    let _linker_version: [u8; 2] = cursor.bytes()?;
    let _code_size = cursor.u32()?;
    let _data_size = cursor.u32()?;
    let _bss_size = cursor.u32()?;
    header.entry = cursor.u32()?;
    header.code_offset = cursor.u32()?;
    header.image_base = cursor.u64()?;
    header.sect_alignment = cursor.u32()?;
    header.file_alignment = cursor.u32()?;
    let _versions: [u8; 12] = cursor.bytes()?;
    let _reserved = cursor.u32()?;
    header.image_size = cursor.u32()?;
    header.header_size = cursor.u32()?;
    let _checksum = cursor.u32()?;
    header.subsystem = cursor.u16()?;
    header.dll_flags = cursor.u16()?;
    let _stack_reserve = cursor.u64()?;
    let _stack_commit = cursor.u64()?;
    let _heap_reserve = cursor.u64()?;
    let _heap_commit = cursor.u64()?;
    let _loader_flags = cursor.u32()?;
    let num_data_dir_entries = cursor.u32()?;

    // the remaining size according to hdrsize must be exactly the data directories
    let end = start + u64::from(hdrsize);
    let expected = u64::from(num_data_dir_entries) * DATA_DIR_ENTRY_SIZE;
    if end < cursor.offset || end - cursor.offset != expected {
        error!("Optional header size or number of data directories is incorrect");
        return Err(UnwindError::InvalidCoff(
            "optional header size does not match the data directories",
        ));
    }
    debug_assert_eq!(cursor.offset - start, OPTIONAL_HEADER_FIXED_SIZE);

    header.data_dirs = (0..num_data_dir_entries)
        .map(|_| {
            Ok(DataDirectory {
                vm_addr: cursor.u32()?,
                vm_size: cursor.u32()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(header)
}

fn parse_sections<M: Memory + ?Sized>(
    memory: &M,
    offset: u64,
    coff_header: &CoffHeader,
) -> Result<Vec<Section>> {
    let table_end = offset + u64::from(coff_header.nsects) * SECTION_HEADER_SIZE;
    if memory.size().is_some_and(|size| table_end > size) {
        error!("Section table overflows the file");
        return Err(UnwindError::InvalidCoff("section table overflows the file"));
    }

    let mut cursor = Cursor::new(memory, offset);
    let mut sections = Vec::with_capacity(coff_header.nsects as usize);
    for _ in 0..coff_header.nsects {
        let raw_name: [u8; SECTION_NAME_SIZE] = cursor.bytes()?;
        let mut section = Section {
            vmsize: cursor.u32()?,
            vmaddr: cursor.u32()?,
            size: cursor.u32()?,
            offset: cursor.u32()?,
            ..Default::default()
        };
        let _reloff = cursor.u32()?;
        let _lineoff = cursor.u32()?;
        let _nrel = cursor.u16()?;
        let _nline = cursor.u16()?;
        section.flags = cursor.u32()?;
        section.name = section_name(memory, coff_header, &raw_name)?;
        sections.push(section);
    }
    Ok(sections)
}

/// Names longer than eight bytes are stored as `/<decimal offset>` into the string table, which
/// directly follows the symbol table
fn section_name<M: Memory + ?Sized>(
    memory: &M,
    coff_header: &CoffHeader,
    raw: &[u8; SECTION_NAME_SIZE],
) -> Result<String> {
    let nul = raw.iter().position(|b| *b == 0);
    let len = nul.unwrap_or(SECTION_NAME_SIZE);
    let trimmed = String::from_utf8_lossy(&raw[..len]).into_owned();

    let Some(digits) = trimmed.strip_prefix('/') else {
        return Ok(trimmed);
    };
    if coff_header.symoff == 0 {
        return Ok(trimmed);
    }
    let offset: u64 = digits.parse().map_err(|_| {
        error!("Failed to parse section name as integer: {digits}");
        UnwindError::InvalidCoff("bad long section name reference")
    })?;
    let file_offset =
        u64::from(coff_header.symoff) + SYMBOL_SIZE * u64::from(coff_header.nsyms) + offset;
    memory.read_string(file_offset, MAX_SECTION_NAME_LEN)
}

/// A parsed PE32+ x86-64 module, ready for unwinding
///
/// # Examples
///
/// ```no_run
/// use pecoff_unwind::coff::PeCoff;
/// use pecoff_unwind::memory::BufferMemory;
///
/// let memory = BufferMemory::from_file("app.exe").unwrap();
/// let pecoff = PeCoff::parse(memory).unwrap();
/// println!("image base: {:#x}", pecoff.load_bias());
/// for section in pecoff.sections() {
///     println!("{:<10} {:#010x}", section.name, section.vmaddr);
/// }
/// ```
pub struct PeCoff<M: Memory + Clone> {
    dos_header: DosHeader,
    coff_header: CoffHeader,
    optional_header: OptionalHeader,
    sections: Vec<Section>,
    text_section: TextSection,
    unwinder: PeCoffUnwinder<M>,
    last_error: ErrorData,
}

impl<M: Memory + Clone> PeCoff<M> {
    /// Parses all headers and initializes the native unwinder
    ///
    /// # Parameters
    ///
    /// * `memory` - The object file memory, addressed by file offset
    ///
    /// # Returns
    ///
    /// * `Ok(PeCoff)` - The parsed module
    /// * `Err(UnwindError)` - If the file is not a valid PE32+ x86-64 image
    ///
    /// # Errors
    ///
    /// * [`UnwindError::MemoryInvalid`] if a header cannot be read
    /// * [`UnwindError::InvalidCoff`] for bad signatures, inconsistent sizes, a missing text
    ///   section or exception directory, or a non-AMD64 machine
    /// * [`UnwindError::Unsupported`] for 32-bit PE images
    pub fn parse(memory: M) -> Result<Self> {
        let dos_header = parse_dos_header(&memory)?;

        let mut cursor = Cursor::new(&memory, u64::from(dos_header.e_lfanew));
        let coff_header = parse_coff_header(&mut cursor)
            .inspect_err(|e| error!("Parsing the COFF header failed: {e}"))?;
        if coff_header.hdrsize == 0 {
            error!("PE/COFF image has no optional header");
            return Err(UnwindError::InvalidCoff("missing optional header"));
        }

        let optional_start = cursor.offset;
        let optional_header = parse_optional_header(&mut cursor, coff_header.hdrsize)
            .inspect_err(|e| error!("Parsing the optional header failed: {e}"))?;
        let section_table = optional_start + u64::from(coff_header.hdrsize);

        let sections = parse_sections(&memory, section_table, &coff_header)
            .inspect_err(|e| error!("Parsing section headers failed: {e}"))?;

        let text_section = sections
            .iter()
            .find(|s| s.is_code())
            .map(|s| TextSection {
                memory_offset: u64::from(s.vmaddr),
                memory_size: u64::from(s.vmsize),
                file_offset: u64::from(s.offset),
            })
            .ok_or_else(|| {
                error!("PE/COFF object file does not have a .text section");
                UnwindError::InvalidCoff("no text section")
            })?;

        if optional_header.image_base > i64::MAX as u64 {
            error!("Value of ImageBase in PE/COFF file is too large");
            return Err(UnwindError::InvalidCoff("image base too large"));
        }

        let unwinder =
            Self::init_native_unwinder(memory, &coff_header, &optional_header, &sections)?;
        debug!(
            "parsed PE/COFF image: base {:#x}, {} sections, {} runtime functions",
            optional_header.image_base,
            sections.len(),
            unwinder.runtime_functions().len()
        );

        Ok(Self {
            dos_header,
            coff_header,
            optional_header,
            sections,
            text_section,
            unwinder,
            last_error: ErrorData::NONE,
        })
    }

    fn init_native_unwinder(
        memory: M,
        coff_header: &CoffHeader,
        optional_header: &OptionalHeader,
        sections: &[Section],
    ) -> Result<PeCoffUnwinder<M>> {
        let Some(exception_dir) = optional_header.data_dirs.get(DATA_DIR_EXCEPTION_TABLE) else {
            error!("PE/COFF image has no exception table data directory");
            return Err(UnwindError::InvalidCoff("missing exception table directory"));
        };
        if coff_header.machine != IMAGE_FILE_MACHINE_AMD64 {
            error!("Machine type {:#x} is not AMD64", coff_header.machine);
            return Err(UnwindError::InvalidCoff("machine is not AMD64"));
        }

        let (pdata_begin, pdata_end) = if exception_dir.vm_addr == 0 {
            // without runtime functions every function is a leaf function
            (0, 0)
        } else {
            let begin = map_rva_to_file_offset(sections, u64::from(exception_dir.vm_addr))
                .ok_or(UnwindError::InvalidCoff("exception table outside of all sections"))?;
            (begin, begin + u64::from(exception_dir.vm_size))
        };

        PeCoffUnwinder::new(
            memory,
            optional_header.image_base,
            pdata_begin,
            pdata_end,
            sections.to_vec(),
        )
    }

    /// Unwinds one frame, see [`PeCoffUnwinder::step`]
    ///
    /// # Errors
    ///
    /// Propagates the unwinder's error unchanged; the error is also retained in
    /// [`Self::last_error`].
    pub fn step(
        &mut self,
        pc: u64,
        pc_adjustment: u64,
        regs: &mut Registers,
        process_memory: &dyn Memory,
    ) -> Result<StepOutcome> {
        self.last_error = ErrorData::NONE;
        let result = self.unwinder.step(pc, pc_adjustment, regs, process_memory);
        record(&mut self.last_error, result)
    }

    /// Returns the image base, which is the load bias of the module
    pub fn load_bias(&self) -> u64 {
        self.optional_header.image_base
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn dos_header(&self) -> &DosHeader {
        &self.dos_header
    }

    pub fn coff_header(&self) -> &CoffHeader {
        &self.coff_header
    }

    pub fn optional_header(&self) -> &OptionalHeader {
        &self.optional_header
    }

    pub fn unwinder(&self) -> &PeCoffUnwinder<M> {
        &self.unwinder
    }

    pub fn unwinder_mut(&mut self) -> &mut PeCoffUnwinder<M> {
        &mut self.unwinder
    }

    /// Returns `(rva, size)` of the text section
    pub fn text_range(&self) -> (u64, u64) {
        let text = &self.text_section;
        (text.memory_offset, text.memory_size)
    }

    pub fn text_offset_in_file(&self) -> u64 {
        self.text_section.file_offset
    }

    pub fn size_of_image(&self) -> u64 {
        u64::from(self.optional_header.image_size)
    }

    /// Returns `true` if `pc`, given relative to the image base, lies within the image
    pub fn contains_pc(&self, pc: u64) -> bool {
        let base = self.load_bias();
        base <= pc && pc < base.saturating_add(self.size_of_image())
    }

    pub fn map_rva_to_file_offset(&self, rva: u64) -> Option<u64> {
        map_rva_to_file_offset(&self.sections, rva)
    }

    pub fn map_file_offset_to_rva(&self, file_offset: u64) -> Option<u64> {
        map_file_offset_to_rva(&self.sections, file_offset)
    }

    /// Converts an absolute `pc` inside a mapping of this file into the image-base relative
    /// address space the unwinder works in
    ///
    /// `map_object_offset` is the file offset the mapping starts at. Returns 0 if that offset
    /// is not inside any section.
    pub fn rel_pc_with_map_offset(&self, pc: u64, map_start: u64, map_object_offset: u64) -> u64 {
        match self.map_file_offset_to_rva(map_object_offset) {
            Some(map_rva) => self.rel_pc_with_map_rva(pc, map_start, map_rva),
            None => 0,
        }
    }

    /// Like [`Self::rel_pc_with_map_offset`], for a mapping starting at RVA `map_object_rva`
    pub fn rel_pc_with_map_rva(&self, pc: u64, map_start: u64, map_object_rva: u64) -> u64 {
        pc.wrapping_sub(map_start)
            .wrapping_add(self.load_bias())
            .wrapping_add(map_object_rva)
    }

    pub fn last_error(&self) -> ErrorData {
        self.last_error
    }
}

impl<M: Memory + Clone> std::fmt::Debug for PeCoff<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeCoff")
            .field("image_base", &Addr::from(self.load_bias()))
            .field("sections", &self.sections)
            .field("text_section", &self.text_section)
            .finish_non_exhaustive()
    }
}
