//! # Epilog Module
//!
//! Detection of PCs inside a function epilog, and unwinding from there.
//!
//! Unwind codes describe the prolog only. Once a function has started to tear down its frame,
//! applying the codes would undo work that has already been undone, so the innermost frame has
//! to be checked against the shapes an x64 epilog may legally take:
//!
//! ```text
//! [lea rsp, [reg + disp] | add rsp, imm]   optional, first instruction only
//! pop reg64                                any number of times
//! ret | retf | jmp qword [mem]             exactly one terminator
//! ```
//!
//! The instructions are decoded with iced-x86 and emulated on a copy of the registers. The copy
//! is published only if the terminator is reached.
//!
//! Source: <https://learn.microsoft.com/en-us/cpp/build/prolog-and-epilog#epilog-code>

use std::collections::HashSet;

use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};
use tracing::{debug, trace};

use crate::coff::{map_rva_to_file_offset, Section};
use crate::errors::{record, ErrorData, Result, UnwindError};
use crate::memory::Memory;
use crate::registers::{Reg, Registers};

const CODE_BITNESS: u32 = 64;

/// Immediate operand kinds of `add rsp, imm`
const ADD_IMMEDIATES: [OpKind; 4] = [
    OpKind::Immediate8,
    OpKind::Immediate32,
    OpKind::Immediate8to64,
    OpKind::Immediate32to64,
];

/// Legacy prefixes that may precede the opcode, REX comes on top of these
const LEGACY_PREFIXES: [u8; 11] = [
    0x26, 0x2e, 0x36, 0x3e, 0x64, 0x65, 0x66, 0x67, 0xf0, 0xf2, 0xf3,
];

/// Recognizes epilogs and remembers PCs that are known not to be in one
#[derive(Debug, Default)]
pub struct EpilogDetector {
    sections: Vec<Section>,
    /// RVAs that were disassembled and found to not be part of an epilog
    not_in_epilog: HashSet<u64>,
    last_error: ErrorData,
}

/// What the emulation of one instruction led to
enum Emulated {
    Continue,
    Terminated,
    NotAnEpilog,
}

impl EpilogDetector {
    pub fn new(sections: Vec<Section>) -> Self {
        Self {
            sections,
            not_in_epilog: HashSet::new(),
            last_error: ErrorData::NONE,
        }
    }

    /// Checks whether the PC is inside an epilog and, if so, unwinds the frame
    ///
    /// On `Ok(true)` the registers hold the state of the caller: the frame was torn down and the
    /// return address was popped into the program counter. On `Ok(false)` and on errors the
    /// registers are untouched.
    ///
    /// # Parameters
    ///
    /// * `file_memory` - The object file memory, the code is read from here
    /// * `function_start_rva` - Start of the function containing the PC
    /// * `function_end_rva` - Exclusive end of that function
    /// * `pc_offset` - Offset of the PC from `function_start_rva`
    /// * `process_memory` - Memory of the traced process, for the stack
    /// * `regs` - The register bank of the frame
    ///
    /// # Errors
    ///
    /// * [`UnwindError::InvalidCoff`] if the function range is empty, the PC is not inside it,
    ///   or the function is outside of all sections
    /// * [`UnwindError::MemoryInvalid`] if the code or a stack slot cannot be read
    /// * [`UnwindError::Unsupported`] if the code cannot be disassembled
    pub fn detect_and_handle_epilog<M: Memory + ?Sized>(
        &mut self,
        file_memory: &M,
        function_start_rva: u64,
        function_end_rva: u64,
        pc_offset: u64,
        process_memory: &dyn Memory,
        regs: &mut Registers,
    ) -> Result<bool> {
        self.last_error = ErrorData::NONE;
        let result = self.detect(
            file_memory,
            function_start_rva,
            function_end_rva,
            pc_offset,
            process_memory,
            regs,
        );
        record(&mut self.last_error, result)
    }

    fn detect<M: Memory + ?Sized>(
        &mut self,
        file_memory: &M,
        function_start_rva: u64,
        function_end_rva: u64,
        pc_offset: u64,
        process_memory: &dyn Memory,
        regs: &mut Registers,
    ) -> Result<bool> {
        if function_end_rva <= function_start_rva {
            return Err(UnwindError::InvalidCoff("function ends before it starts"));
        }
        let pc_rva = function_start_rva
            .checked_add(pc_offset)
            .filter(|pc| *pc < function_end_rva)
            .ok_or(UnwindError::InvalidCoff("pc is not inside the function"))?;
        let sections = &self.sections;
        if !sections.iter().any(|s| s.contains_rva(function_start_rva)) {
            return Err(UnwindError::InvalidCoff("function is outside of all sections"));
        }

        if self.not_in_epilog.contains(&pc_rva) {
            return Ok(false);
        }

        let file_offset = map_rva_to_file_offset(&self.sections, pc_rva)
            .ok_or(UnwindError::InvalidCoff("pc is outside of all sections"))?;
        let code = file_memory.read_vec(file_offset, (function_end_rva - pc_rva) as usize)?;

        let mut scratch = *regs;
        let mut decoder = Decoder::with_ip(CODE_BITNESS, &code, pc_rva, DecoderOptions::NONE);
        let mut instruction = Instruction::default();
        let mut first = true;

        while decoder.can_decode() {
            let position = decoder.position();
            decoder.decode_out(&mut instruction);
            if instruction.is_invalid() {
                let ip = instruction.ip();
                debug!("could not disassemble the instruction at rva {ip:#x}");
                return Err(UnwindError::Unsupported("failed to disassemble instruction"));
            }
            let raw = &code[position..position + instruction.len()];

            match emulate(&instruction, raw, first, process_memory, &mut scratch)? {
                Emulated::Continue => first = false,
                Emulated::Terminated => {
                    trace!("rva {pc_rva:#x} is inside an epilog");
                    *regs = scratch;
                    return Ok(true);
                }
                Emulated::NotAnEpilog => break,
            }
        }

        trace!("rva {pc_rva:#x} is not inside an epilog");
        self.not_in_epilog.insert(pc_rva);
        Ok(false)
    }

    /// Number of PCs known to be outside of an epilog
    pub fn cached_pcs(&self) -> usize {
        self.not_in_epilog.len()
    }

    pub fn last_error(&self) -> ErrorData {
        self.last_error
    }
}

fn emulate(
    instruction: &Instruction,
    raw: &[u8],
    first: bool,
    process_memory: &dyn Memory,
    regs: &mut Registers,
) -> Result<Emulated> {
    let accepted = match instruction.mnemonic() {
        Mnemonic::Lea if first => emulate_lea(instruction, regs),
        Mnemonic::Add if first => emulate_add(instruction, regs),
        Mnemonic::Pop => {
            let reg = (instruction.op_count() == 1 && instruction.op0_kind() == OpKind::Register)
                .then(|| instruction.op0_register())
                .filter(|r| r.is_gpr64())
                .and_then(Reg::from_iced);
            match reg {
                Some(reg) => {
                    let value = process_memory.read_u64(regs.sp())?;
                    regs.set_sp(regs.sp().wrapping_add(8));
                    regs[reg] = value;
                    true
                }
                None => false,
            }
        }
        // the immediate of `ret imm16` releases the caller's arguments, not part of this frame
        Mnemonic::Ret | Mnemonic::Retf => return pop_return_address(process_memory, regs),
        Mnemonic::Jmp => {
            if instruction.op_count() == 1
                && instruction.op0_kind() == OpKind::Memory
                && modrm_mod(raw) == Some(0)
            {
                // a tail call, the return address on the stack belongs to our caller
                return pop_return_address(process_memory, regs);
            }
            false
        }
        _ => false,
    };

    Ok(if accepted {
        Emulated::Continue
    } else {
        Emulated::NotAnEpilog
    })
}

fn pop_return_address(process_memory: &dyn Memory, regs: &mut Registers) -> Result<Emulated> {
    let return_address = process_memory.read_u64(regs.sp())?;
    regs.set_pc(return_address);
    regs.set_sp(regs.sp().wrapping_add(8));
    Ok(Emulated::Terminated)
}

fn writes_rsp(instruction: &Instruction) -> bool {
    instruction.op_count() == 2
        && instruction.op0_kind() == OpKind::Register
        && instruction.op0_register() == Register::RSP
}

/// `lea rsp, [reg + disp]`
fn emulate_lea(instruction: &Instruction, regs: &mut Registers) -> bool {
    if !writes_rsp(instruction)
        || instruction.op1_kind() != OpKind::Memory
        || instruction.memory_index() != Register::None
        || instruction.segment_prefix() != Register::None
    {
        return false;
    }
    let Some(base) = Reg::from_iced(instruction.memory_base()) else {
        return false;
    };
    regs.set_sp(regs[base].wrapping_add(instruction.memory_displacement64()));
    true
}

/// `add rsp, imm`
fn emulate_add(instruction: &Instruction, regs: &mut Registers) -> bool {
    if !writes_rsp(instruction) || !ADD_IMMEDIATES.contains(&instruction.op1_kind()) {
        return false;
    }
    let imm = instruction.immediate(1);
    if (imm as i64) < 0 {
        return false;
    }
    regs.set_sp(regs.sp().wrapping_add(imm));
    true
}

/// Extracts the `mod` field of the ModRM byte of an `FF /r` instruction
fn modrm_mod(raw: &[u8]) -> Option<u8> {
    let is_prefix = |b: u8| LEGACY_PREFIXES.contains(&b) || (0x40..=0x4f).contains(&b);
    let opcode = raw.iter().position(|&b| !is_prefix(b))?;
    if raw[opcode] != 0xff {
        return None;
    }
    raw.get(opcode + 1).map(|modrm| modrm >> 6)
}
