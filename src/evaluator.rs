//! # Evaluator Module
//!
//! Reverses the effects of a function prolog by interpreting its unwind codes.
//!
//! The codes are stored latest prolog action first, so walking them in stored order undoes the
//! prolog instruction by instruction. Each code names the prolog offset just past the
//! instruction it describes; codes whose instruction has not executed yet at the current PC are
//! skipped, which is how a PC in the middle of a prolog is unwound.
//!
//! Nothing is written to the caller's registers unless the whole evaluation succeeds.

use tracing::{error, trace};

use crate::errors::{Result, UnwindError};
use crate::memory::Memory;
use crate::registers::{Reg, Registers};
use crate::unwind_info::{UnwindCode, UnwindInfo, UnwindInfoStore, UnwindOp};

/// Maximum number of chained records followed for one function
///
/// Deeper chains, including cyclic ones, are rejected as invalid.
pub const MAX_CHAIN_DEPTH: usize = 64;

/// Number of slots taken by an operation, validated against the record version
fn slot_count(op: UnwindOp, info: u8, version: u8) -> Result<usize> {
    Ok(match op {
        UnwindOp::PushNonvol | UnwindOp::AllocSmall | UnwindOp::SetFpreg => 1,
        UnwindOp::PushMachframe => 1,
        UnwindOp::AllocLarge => match info {
            0 => 2,
            1 => 3,
            _ => return Err(UnwindError::InvalidCoff("invalid op info for UWOP_ALLOC_LARGE")),
        },
        UnwindOp::SaveNonvol | UnwindOp::SaveXmm128 => 2,
        UnwindOp::SaveNonvolFar | UnwindOp::SaveXmm128Far => 3,
        UnwindOp::Epilog => {
            if version < 2 {
                return Err(UnwindError::InvalidCoff("UWOP_EPILOG in a version 1 record"));
            }
            2
        }
        UnwindOp::SpareCode => return Err(UnwindError::InvalidCoff("spare unwind op")),
    })
}

fn register(number: u8) -> Result<Reg> {
    Reg::from_unwind_code(number).ok_or(UnwindError::InvalidCoff("invalid register number"))
}

fn wide_operand(codes: &[UnwindCode], idx: usize) -> u64 {
    u64::from(codes[idx + 1].frame_offset()) | (u64::from(codes[idx + 2].frame_offset()) << 16)
}

/// Applies the codes of a single record to `regs` in place
///
/// Chained info is not followed. `regs` may be partially updated when an error is returned.
fn apply_codes(
    info: &UnwindInfo,
    current_code_offset: u64,
    process_memory: &dyn Memory,
    regs: &mut Registers,
) -> Result<()> {
    if usize::from(info.num_codes) != info.codes.len() {
        error!(
            "unwind info announces {} codes but holds {}",
            info.num_codes,
            info.codes.len()
        );
        return Err(UnwindError::InvalidCoff("number of unwind codes does not match"));
    }

    let codes = &info.codes;
    let mut idx = 0;
    while idx < codes.len() {
        let code = codes[idx];
        let Some(op) = UnwindOp::from_code(code.op()) else {
            return Err(UnwindError::InvalidCoff("unknown unwind op"));
        };
        let slots = slot_count(op, code.info(), info.version)?;
        if idx + slots > codes.len() {
            return Err(UnwindError::InvalidCoff("unwind code is missing operand slots"));
        }

        if u64::from(code.code_offset()) > current_code_offset {
            trace!("skipping {code:?}, not executed at prolog offset {current_code_offset:#x}");
            idx += slots;
            continue;
        }

        match op {
            UnwindOp::PushNonvol => {
                let reg = register(code.info())?;
                let value = process_memory.read_u64(regs.sp())?;
                regs[reg] = value;
                regs.set_sp(regs.sp().wrapping_add(8));
            }
            UnwindOp::AllocLarge => {
                let size = if code.info() == 0 {
                    u64::from(codes[idx + 1].frame_offset()) * 8
                } else {
                    wide_operand(codes, idx)
                };
                regs.set_sp(regs.sp().wrapping_add(size));
            }
            UnwindOp::AllocSmall => {
                regs.set_sp(regs.sp().wrapping_add(u64::from(code.info()) * 8 + 8));
            }
            UnwindOp::SetFpreg => {
                let Some(frame_reg) = info.frame_pointer() else {
                    return Err(UnwindError::InvalidCoff("UWOP_SET_FPREG without a frame register"));
                };
                let sp = regs[frame_reg]
                    .checked_sub(info.frame_offset())
                    .ok_or(UnwindError::InvalidCoff("frame pointer below the frame offset"))?;
                regs.set_sp(sp);
            }
            UnwindOp::SaveNonvol | UnwindOp::SaveNonvolFar => {
                let reg = register(code.info())?;
                let offset = if op == UnwindOp::SaveNonvol {
                    u64::from(codes[idx + 1].frame_offset()) * 8
                } else {
                    wide_operand(codes, idx)
                };
                regs[reg] = process_memory.read_u64(regs.sp().wrapping_add(offset))?;
            }
            // epilog locations are found by disassembly, xmm registers are not tracked
            UnwindOp::Epilog | UnwindOp::SaveXmm128 | UnwindOp::SaveXmm128Far => {}
            UnwindOp::PushMachframe => {
                return Err(UnwindError::Unsupported("UWOP_PUSH_MACHFRAME"));
            }
            UnwindOp::SpareCode => return Err(UnwindError::InvalidCoff("spare unwind op")),
        }
        idx += slots;
    }
    Ok(())
}

/// Evaluates the codes of one record, without following chained info
///
/// # Parameters
///
/// * `info` - The record to evaluate
/// * `current_code_offset` - Offset of the PC from the function start; codes describing
///   instructions at or beyond it are skipped
/// * `process_memory` - Memory of the traced process, for restoring pushed and saved registers
/// * `regs` - The register bank, updated only on success
///
/// # Errors
///
/// * [`UnwindError::InvalidCoff`] for malformed codes
/// * [`UnwindError::Unsupported`] for `UWOP_PUSH_MACHFRAME`
/// * [`UnwindError::MemoryInvalid`] if a stack slot cannot be read
pub fn evaluate(
    info: &UnwindInfo,
    current_code_offset: u64,
    process_memory: &dyn Memory,
    regs: &mut Registers,
) -> Result<()> {
    let mut scratch = *regs;
    apply_codes(info, current_code_offset, process_memory, &mut scratch)?;
    *regs = scratch;
    Ok(())
}

/// Evaluates the record at `unwind_info_rva` and every record chained to it
///
/// Chained records are always evaluated completely, only the first record honors
/// `current_code_offset`. The records are fetched through `store`, so repeated unwinds of the
/// same function parse nothing.
///
/// # Errors
///
/// Same as [`evaluate`]. Additionally fails with [`UnwindError::InvalidCoff`] if a record cannot
/// be located or the chain is longer than [`MAX_CHAIN_DEPTH`].
pub fn evaluate_chain<M: Memory + ?Sized>(
    store: &mut UnwindInfoStore,
    file_memory: &M,
    unwind_info_rva: u32,
    current_code_offset: u64,
    process_memory: &dyn Memory,
    regs: &mut Registers,
) -> Result<()> {
    let mut scratch = *regs;
    let mut next = Some(unwind_info_rva);
    let mut code_offset = current_code_offset;
    let mut depth = 0;

    while let Some(rva) = next {
        if depth > MAX_CHAIN_DEPTH {
            error!("unwind info chain at {unwind_info_rva:#x} exceeds {MAX_CHAIN_DEPTH} records");
            return Err(UnwindError::InvalidCoff("unwind info chain too long"));
        }
        let info = store.get(file_memory, rva)?;
        apply_codes(info, code_offset, process_memory, &mut scratch)?;

        next = if info.has_chained_info() {
            info.chained_info.map(|chained| chained.unwind_info_rva)
        } else {
            None
        };
        code_offset = u64::MAX;
        depth += 1;
    }

    *regs = scratch;
    Ok(())
}
