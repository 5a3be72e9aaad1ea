//! # Unwinder Module
//!
//! The native x64 unwinder of a PE/COFF module: one call of [`PeCoffUnwinder::step`] turns the
//! registers of a frame into the registers of its caller.
//!
//! A step looks the PC up in the exception table. PCs outside every function belong to leaf
//! functions, which by ABI keep their return address at the stack pointer. For every other PC the
//! innermost frame is first checked for being inside an epilog; if it is not, the unwind codes of
//! the function are evaluated. Either way the step ends with the return address in the PC.

use serde::Serialize;
use tracing::{debug, trace};

use crate::coff::Section;
use crate::epilog::EpilogDetector;
use crate::errors::{record, ErrorData, Result};
use crate::evaluator::evaluate_chain;
use crate::memory::Memory;
use crate::registers::Registers;
use crate::runtime_function::{RuntimeFunction, RuntimeFunctions};
use crate::unwind_info::{UnwindInfo, UnwindInfoStore};

/// Result of a successful step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct StepOutcome {
    /// The caller's PC is zero, there is nothing left to unwind
    pub finished: bool,
    /// Always `false`, PE/COFF has no signal frames
    pub is_signal_frame: bool,
}

impl StepOutcome {
    fn for_pc(pc: u64) -> Self {
        Self {
            finished: pc == 0,
            is_signal_frame: false,
        }
    }
}

/// Unwinds frames of one module, owning the module's caches
///
/// An instance is meant to be used from one thread at a time; independent instances share
/// nothing.
pub struct PeCoffUnwinder<M: Memory> {
    file_memory: M,
    image_base: u64,
    runtime_functions: RuntimeFunctions,
    unwind_infos: UnwindInfoStore,
    epilog: EpilogDetector,
    last_error: ErrorData,
}

impl<M: Memory> PeCoffUnwinder<M> {
    /// Creates the unwinder and loads the exception table
    ///
    /// # Parameters
    ///
    /// * `file_memory` - The object file memory, addressed by file offset
    /// * `image_base` - The preferred load address of the module
    /// * `pdata_begin` - File offset of the exception table
    /// * `pdata_end` - File offset one past the exception table
    /// * `sections` - The section table, for mapping RVAs to file offsets
    ///
    /// # Errors
    ///
    /// Fails if the exception table is malformed or cannot be read, see
    /// [`RuntimeFunctions::init`].
    pub fn new(
        file_memory: M,
        image_base: u64,
        pdata_begin: u64,
        pdata_end: u64,
        sections: Vec<Section>,
    ) -> Result<Self> {
        let runtime_functions = RuntimeFunctions::init(&file_memory, pdata_begin, pdata_end)?;
        Ok(Self {
            file_memory,
            image_base,
            runtime_functions,
            unwind_infos: UnwindInfoStore::new(sections.clone()),
            epilog: EpilogDetector::new(sections),
            last_error: ErrorData::NONE,
        })
    }

    /// Unwinds exactly one frame
    ///
    /// On success `regs` holds the register state of the caller. On error `regs` is left exactly
    /// as it was.
    ///
    /// # Parameters
    ///
    /// * `pc` - The PC of the frame, relative to the image base the module was linked at
    /// * `pc_adjustment` - 0 for the innermost frame, 1 for all others, where the PC is a return
    ///   address pointing past the call instruction
    /// * `regs` - The register bank of the frame
    /// * `process_memory` - Memory of the traced process
    ///
    /// # Returns
    ///
    /// * `Ok(StepOutcome)` - The frame was unwound, `finished` tells whether the caller's PC is 0
    /// * `Err(UnwindError)` - If the frame could not be unwound
    ///
    /// # Errors
    ///
    /// Any error of the exception table, unwind info, evaluator or epilog detector, and
    /// [`UnwindError::MemoryInvalid`](crate::errors::UnwindError::MemoryInvalid) if the return
    /// address cannot be read.
    pub fn step(
        &mut self,
        pc: u64,
        pc_adjustment: u64,
        regs: &mut Registers,
        process_memory: &dyn Memory,
    ) -> Result<StepOutcome> {
        self.last_error = ErrorData::NONE;
        let result = self.step_frame(pc, pc_adjustment, regs, process_memory);
        record(&mut self.last_error, result)
    }

    fn step_frame(
        &mut self,
        pc: u64,
        pc_adjustment: u64,
        regs: &mut Registers,
        process_memory: &dyn Memory,
    ) -> Result<StepOutcome> {
        if pc == 0 {
            return Ok(StepOutcome::for_pc(0));
        }

        let pc_rva = pc.wrapping_sub(self.image_base).wrapping_sub(pc_adjustment);
        let mut scratch = *regs;

        let Some(function) = self.runtime_functions.find(pc_rva).copied() else {
            trace!("rva {pc_rva:#x} is in a leaf function");
            pop_return_address(process_memory, &mut scratch)?;
            *regs = scratch;
            return Ok(StepOutcome::for_pc(regs.pc()));
        };

        let prolog_size = self
            .unwind_infos
            .get(&self.file_memory, function.unwind_info_rva)?
            .prolog_size;
        let offset_in_function = pc_rva - u64::from(function.start_rva);

        // a return address follows a call and cannot be in the middle of an epilog
        if pc_adjustment == 0 && offset_in_function > u64::from(prolog_size) {
            let in_epilog = self.epilog.detect_and_handle_epilog(
                &self.file_memory,
                u64::from(function.start_rva),
                u64::from(function.end_rva),
                offset_in_function,
                process_memory,
                &mut scratch,
            )?;
            if in_epilog {
                debug!("unwound rva {pc_rva:#x} from inside an epilog");
                *regs = scratch;
                return Ok(StepOutcome::for_pc(regs.pc()));
            }
        }

        evaluate_chain(
            &mut self.unwind_infos,
            &self.file_memory,
            function.unwind_info_rva,
            offset_in_function,
            process_memory,
            &mut scratch,
        )?;
        pop_return_address(process_memory, &mut scratch)?;

        *regs = scratch;
        Ok(StepOutcome::for_pc(regs.pc()))
    }

    /// Looks up the exception table entry of `pc_rva`
    pub fn find_runtime_function(&self, pc_rva: u64) -> Option<&RuntimeFunction> {
        self.runtime_functions.find(pc_rva)
    }

    pub fn runtime_functions(&self) -> &RuntimeFunctions {
        &self.runtime_functions
    }

    /// Returns the parsed unwind info at `unwind_info_rva`
    ///
    /// # Errors
    ///
    /// See [`UnwindInfoStore::get`].
    pub fn unwind_info(&mut self, unwind_info_rva: u32) -> Result<&UnwindInfo> {
        record(
            &mut self.last_error,
            self.unwind_infos.get(&self.file_memory, unwind_info_rva),
        )
    }

    pub fn file_memory(&self) -> &M {
        &self.file_memory
    }

    pub fn sections(&self) -> &[Section] {
        self.unwind_infos.sections()
    }

    pub fn image_base(&self) -> u64 {
        self.image_base
    }

    pub fn epilog_detector(&self) -> &EpilogDetector {
        &self.epilog
    }

    pub fn last_error(&self) -> ErrorData {
        self.last_error
    }
}

fn pop_return_address(process_memory: &dyn Memory, regs: &mut Registers) -> Result<()> {
    let return_address = process_memory.read_u64(regs.sp())?;
    regs.set_pc(return_address);
    regs.set_sp(regs.sp().wrapping_add(8));
    Ok(())
}

impl<M: Memory> std::fmt::Debug for PeCoffUnwinder<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeCoffUnwinder")
            .field("image_base", &crate::addr::Addr::from(self.image_base))
            .field("runtime_functions", &self.runtime_functions.len())
            .field("cached_unwind_infos", &self.unwind_infos.len())
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::addr::Addr;
    use crate::coff::{IMAGE_SCN_CNT_CODE, IMAGE_SCN_MEM_EXECUTE};
    use crate::errors::{ErrorCode, UnwindError};
    use crate::memory::{BufferMemory, SparseMemory};
    use crate::registers::Reg;
    use crate::unwind_info::{UnwindCode, UnwindOp, UNW_FLAG_CHAININFO};

    const IMAGE_BASE: u64 = 0x1_4000_0000;
    const TEXT_RVA: u32 = 0x1000;
    const TEXT_OFFSET: u32 = 0x400;
    const XDATA_RVA: u32 = 0x4000;
    const XDATA_OFFSET: u32 = 0x1400;
    const PDATA_OFFSET: u64 = 0x1800;
    const FILE_SIZE: usize = 0x1a00;

    /// Assembles a file image with a text section, unwind info and an exception table
    struct Fixture {
        bytes: Vec<u8>,
        functions: Vec<RuntimeFunction>,
        xdata_used: u32,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                bytes: vec![0xcc; FILE_SIZE],
                functions: Vec::new(),
                xdata_used: 0,
            }
        }

        fn add_info(&mut self, info: &UnwindInfo) -> u32 {
            let raw = info.to_bytes();
            let offset = (XDATA_OFFSET + self.xdata_used) as usize;
            self.bytes[offset..offset + raw.len()].copy_from_slice(&raw);
            let rva = XDATA_RVA + self.xdata_used;
            self.xdata_used += (raw.len() as u32 + 3) & !3;
            rva
        }

        fn add_function(&mut self, start_rva: u32, end_rva: u32, unwind_info_rva: u32) {
            self.functions.push(RuntimeFunction {
                start_rva,
                end_rva,
                unwind_info_rva,
            });
        }

        fn set_code(&mut self, rva: u32, code: &[u8]) {
            let offset = (rva - TEXT_RVA + TEXT_OFFSET) as usize;
            let end = offset + code.len();
            self.bytes[offset..end].copy_from_slice(code);
        }

        fn build(mut self) -> PeCoffUnwinder<BufferMemory> {
            self.functions.sort_by_key(|f| f.start_rva);
            let mut offset = PDATA_OFFSET as usize;
            for function in &self.functions {
                let raw = function.to_bytes();
                self.bytes[offset..offset + 12].copy_from_slice(&raw);
                offset += 12;
            }
            let sections = vec![
                Section {
                    name: ".text".to_string(),
                    vmsize: 0x1000,
                    vmaddr: TEXT_RVA,
                    size: 0x1000,
                    offset: TEXT_OFFSET,
                    flags: IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE,
                },
                Section {
                    name: ".xdata".to_string(),
                    vmsize: 0x400,
                    vmaddr: XDATA_RVA,
                    size: 0x400,
                    offset: XDATA_OFFSET,
                    flags: 0,
                },
            ];
            PeCoffUnwinder::new(
                BufferMemory::new(self.bytes),
                IMAGE_BASE,
                PDATA_OFFSET,
                offset as u64,
                sections,
            )
            .unwrap()
        }
    }

    fn op(code_offset: u8, op: UnwindOp, info: u8) -> UnwindCode {
        UnwindCode::new(code_offset, op as u8, info)
    }

    fn info_with(prolog_size: u8, codes: Vec<UnwindCode>) -> UnwindInfo {
        UnwindInfo {
            version: 1,
            prolog_size,
            num_codes: codes.len() as u8,
            codes,
            ..Default::default()
        }
    }

    fn words_at(addr: u64, words: &[u64]) -> SparseMemory {
        let mut mem = SparseMemory::new();
        for (idx, word) in words.iter().enumerate() {
            mem.set_u64(addr + idx as u64 * 8, *word);
        }
        mem
    }

    #[test]
    fn test_leaf_function() {
        let mut unwinder = Fixture::new().build();
        let mut regs = Registers {
            rsp: 0x1000,
            ..Default::default()
        };
        let mem = words_at(0x1000, &[0x7fff_0040]);
        let outcome = unwinder.step(0x2000, 0, &mut regs, &mem).unwrap();
        assert_eq!(regs.sp(), 0x1008);
        assert_eq!(regs.pc(), 0x7fff_0040);
        assert!(!outcome.finished);
        assert!(!outcome.is_signal_frame);
    }

    #[test]
    fn test_single_push() {
        let mut fixture = Fixture::new();
        let push_rbx = info_with(1, vec![op(1, UnwindOp::PushNonvol, Reg::Rbx as u8)]);
        let info = fixture.add_info(&push_rbx);
        fixture.add_function(0x100, 0x200, info);
        let mut unwinder = fixture.build();

        let mut regs = Registers {
            rsp: 0x2000,
            rip: 0x1000 + 0x110,
            ..Default::default()
        };
        let mem = words_at(0x2000, &[0x300, 0x1234]);
        let pc = IMAGE_BASE + 0x110;
        let outcome = unwinder.step(pc, 1, &mut regs, &mem).unwrap();
        assert_eq!(regs.rbx, 0x300);
        assert_eq!(regs.pc(), 0x1234);
        assert_eq!(regs.sp(), 0x2010);
        assert!(!outcome.finished);
    }

    #[test]
    fn test_frame_pointer() {
        let mut fixture = Fixture::new();
        let mut record = info_with(
            0x40,
            vec![
                op(8, UnwindOp::SetFpreg, 0),
                op(4, UnwindOp::PushNonvol, Reg::R12 as u8),
                op(2, UnwindOp::PushNonvol, Reg::Rdi as u8),
            ],
        );
        record.frame_register = Reg::Rbp as u8;
        record.frame_offset_scaled = 2;
        let info = fixture.add_info(&record);
        fixture.add_function(0x1200, 0x1300, info);
        let mut unwinder = fixture.build();

        let mut regs = Registers {
            rbp: 0x3020,
            rsp: 0x2000,
            ..Default::default()
        };
        let mem = words_at(0x3000, &[0x1212, 0xd1d1, 0x5555]);
        let pc = IMAGE_BASE + 0x1280;
        unwinder.step(pc, 1, &mut regs, &mem).unwrap();
        assert_eq!(regs.r12, 0x1212);
        assert_eq!(regs.rdi, 0xd1d1);
        assert_eq!(regs.pc(), 0x5555);
        assert_eq!(regs.sp(), 0x3020 - 32 + 16 + 8);
    }

    #[test]
    fn test_innermost_frame_in_epilog() {
        let mut fixture = Fixture::new();
        let info = fixture.add_info(&info_with(4, vec![op(4, UnwindOp::AllocSmall, 4)]));
        fixture.add_function(0x1100, 0x1120, info);
        fixture.set_code(0x1110, &[0x48, 0x83, 0xc4, 0x28, 0xc3]);
        let mut unwinder = fixture.build();

        let mut words = vec![0u64; 5];
        words.push(0xdead);
        let mem = words_at(0x8000, &words);
        let mut regs = Registers {
            rsp: 0x8000,
            ..Default::default()
        };
        let pc = IMAGE_BASE + 0x1110;
        let outcome = unwinder.step(pc, 0, &mut regs, &mem).unwrap();
        assert_eq!(regs.sp(), 0x8030);
        assert_eq!(regs.pc(), 0xdead);
        assert!(!outcome.finished);
        assert_eq!(unwinder.epilog_detector().cached_pcs(), 0);
    }

    #[test]
    fn test_epilog_lookalike_falls_back_to_unwind_codes() {
        let mut fixture = Fixture::new();
        // sub rsp, 0x28 in the prolog
        let info = fixture.add_info(&info_with(4, vec![op(4, UnwindOp::AllocSmall, 4)]));
        fixture.add_function(0x1100, 0x1120, info);
        fixture.set_code(0x1110, &[0x48, 0x83, 0xc1, 0x07, 0xc3]);
        let mut unwinder = fixture.build();

        let mut words = vec![0u64; 5];
        words.push(0xbeef);
        let mem = words_at(0x8000, &words);
        let mut regs = Registers {
            rsp: 0x8000,
            rcx: 0x10,
            ..Default::default()
        };
        let pc = IMAGE_BASE + 0x1110;
        unwinder.step(pc, 0, &mut regs, &mem).unwrap();
        assert_eq!(regs.rcx, 0x10);
        assert_eq!(regs.sp(), 0x8030);
        assert_eq!(regs.pc(), 0xbeef);
        assert_eq!(unwinder.epilog_detector().cached_pcs(), 1);
    }

    #[test]
    fn test_epilog_check_only_for_innermost_frame_after_prolog() {
        let mut fixture = Fixture::new();
        // function outside of all sections, the epilog detector would refuse it
        let push_rbx = info_with(8, vec![op(1, UnwindOp::PushNonvol, Reg::Rbx as u8)]);
        let info = fixture.add_info(&push_rbx);
        fixture.add_function(0x100, 0x200, info);
        let mut unwinder = fixture.build();
        let mem = words_at(0x8000, &[0xb, 0x1234]);
        let fresh = Registers {
            rsp: 0x8000,
            ..Default::default()
        };

        // inside the prolog
        let mut regs = fresh;
        let in_prolog = IMAGE_BASE + 0x108;
        unwinder.step(in_prolog, 0, &mut regs, &mem).unwrap();
        assert_eq!(regs.pc(), 0x1234);

        // an outer frame past the prolog
        let past_prolog = IMAGE_BASE + 0x150;
        let mut regs = fresh;
        unwinder.step(past_prolog, 1, &mut regs, &mem).unwrap();
        assert_eq!(regs.pc(), 0x1234);

        // the innermost frame past the prolog goes through the detector
        let mut regs = fresh;
        let err = unwinder.step(past_prolog, 0, &mut regs, &mem).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCoff);
        assert_eq!(regs, fresh);
    }

    #[test]
    fn test_chained_unwind_info() {
        let mut fixture = Fixture::new();
        let inner = fixture.add_info(&info_with(
            6,
            vec![
                op(6, UnwindOp::AllocSmall, 7),
                op(2, UnwindOp::PushNonvol, Reg::Rsi as u8),
                op(1, UnwindOp::PushNonvol, Reg::Rdi as u8),
            ],
        ));
        let outer = fixture.add_info(&UnwindInfo {
            version: 1,
            flags: UNW_FLAG_CHAININFO,
            chained_info: Some(RuntimeFunction {
                start_rva: 0x1400,
                end_rva: 0x1480,
                unwind_info_rva: inner,
            }),
            ..Default::default()
        });
        fixture.add_function(0x1400, 0x1480, inner);
        fixture.add_function(0x1480, 0x1500, outer);
        let mut unwinder = fixture.build();

        let mut words = vec![0u64; 8];
        words.extend([0x5151, 0xd1d1, 0xca11]);
        let mem = words_at(0x9000, &words);
        let mut regs = Registers {
            rsp: 0x9000,
            ..Default::default()
        };
        let pc = IMAGE_BASE + 0x1490;
        unwinder.step(pc, 1, &mut regs, &mem).unwrap();
        assert_eq!(regs.sp(), 0x9000 + 0x40 + 16 + 8);
        assert_eq!(regs.rsi, 0x5151);
        assert_eq!(regs.rdi, 0xd1d1);
        assert_eq!(regs.pc(), 0xca11);
    }

    #[test]
    fn test_zero_pc_is_finished() {
        let mut unwinder = Fixture::new().build();
        let mut regs = Registers {
            rsp: 0x1000,
            rbx: 3,
            ..Default::default()
        };
        let before = regs;
        let mem = SparseMemory::new();
        let outcome = unwinder.step(0, 0, &mut regs, &mem).unwrap();
        assert!(outcome.finished);
        assert_eq!(regs, before);
    }

    #[test]
    fn test_zero_return_address_finishes() {
        let mut unwinder = Fixture::new().build();
        let mut regs = Registers {
            rsp: 0x1000,
            ..Default::default()
        };
        let mem = words_at(0x1000, &[0]);
        let pc = IMAGE_BASE + 0x1000;
        let outcome = unwinder.step(pc, 0, &mut regs, &mem).unwrap();
        assert!(outcome.finished);
        assert_eq!(regs.sp(), 0x1008);
    }

    #[test]
    fn test_failed_steps_leave_registers_untouched() {
        let mut fixture = Fixture::new();
        let push_rbx = info_with(1, vec![op(1, UnwindOp::PushNonvol, Reg::Rbx as u8)]);
        let push = fixture.add_info(&push_rbx);
        let bad_version = fixture.add_info(&UnwindInfo {
            version: 1,
            ..Default::default()
        });
        fixture.add_function(0x1100, 0x1200, push);
        fixture.add_function(0x1200, 0x1300, bad_version);
        let unwinder = fixture.build();
        // corrupt the version of the second record after it was laid out
        let mut bytes = unwinder.file_memory().bytes().to_vec();
        bytes[(bad_version - XDATA_RVA + XDATA_OFFSET) as usize] = 0x03;
        let sections = unwinder.sections().to_vec();
        let end = PDATA_OFFSET + 24;
        let file = BufferMemory::new(bytes);
        let mut unwinder =
            PeCoffUnwinder::new(file, IMAGE_BASE, PDATA_OFFSET, end, sections).unwrap();

        let fresh = Registers {
            rsp: 0x8000,
            rbx: 0x99,
            rip: 0x42,
            ..Default::default()
        };

        // the pop works, the return address is missing
        let mut regs = fresh;
        let err = unwinder
            .step(IMAGE_BASE + 0x1150, 1, &mut regs, &words_at(0x8000, &[0x1]))
            .unwrap_err();
        assert_eq!(err, UnwindError::MemoryInvalid(Addr::from(0x8008u64)));
        assert_eq!(regs, fresh);
        assert_eq!(unwinder.last_error().code, ErrorCode::MemoryInvalid);
        assert_eq!(unwinder.last_error().address, Addr::from(0x8008u64));

        // leaf with an unreadable stack
        let mut regs = fresh;
        let empty = SparseMemory::new();
        let leaf = IMAGE_BASE + 0x1800;
        assert!(unwinder.step(leaf, 0, &mut regs, &empty).is_err());
        assert_eq!(regs, fresh);

        // unknown unwind info version
        let mut regs = fresh;
        let mem = words_at(0x8000, &[0x1, 0x2]);
        let err = unwinder
            .step(IMAGE_BASE + 0x1250, 1, &mut regs, &mem)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCoff);
        assert_eq!(regs, fresh);

        // success resets the error record
        let mut regs = fresh;
        let pc = IMAGE_BASE + 0x1150;
        unwinder.step(pc, 1, &mut regs, &mem).unwrap();
        assert_eq!(unwinder.last_error(), ErrorData::NONE);
    }

    #[test]
    fn test_unwind_info_is_parsed_once() {
        let mut fixture = Fixture::new();
        let info = fixture.add_info(&info_with(1, vec![op(1, UnwindOp::AllocSmall, 0)]));
        fixture.add_function(0x1100, 0x1200, info);
        let mut unwinder = fixture.build();
        let mem = words_at(0x8000, &[0, 0x1, 0, 0x2]);

        for _ in 0..3 {
            let mut regs = Registers {
                rsp: 0x8000,
                ..Default::default()
            };
            let pc = IMAGE_BASE + 0x1101;
            unwinder.step(pc, 0, &mut regs, &mem).unwrap();
            assert_eq!(regs.pc(), 0x1);
        }
        assert_eq!(unwinder.unwind_infos.len(), 1);
        assert_eq!(unwinder.unwind_info(info).unwrap().codes.len(), 1);
    }
}
