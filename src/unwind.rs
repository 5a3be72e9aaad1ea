//! # Unwind Module
//!
//! Walks a whole stack of one module by stepping frame after frame.
//!
//! The unwinder itself works in the address space the module was linked for. A module that was
//! loaded somewhere else is handled here: every PC is moved from the load address to the image
//! base before stepping, and the frames report both views.

use std::fmt::Display;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::addr::Addr;
use crate::coff::PeCoff;
use crate::errors::ErrorData;
use crate::memory::Memory;
use crate::registers::Registers;
use crate::runtime_function::RuntimeFunction;

/// Default limit for the number of frames of one backtrace
pub const DEFAULT_MAX_FRAMES: usize = 256;

/// Why a backtrace ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// The outermost frame returned to address zero
    Finished,
    /// A PC left the module, its caller belongs to code this unwinder knows nothing about
    OutsideModule,
    MaxFrames,
    /// A step failed
    Error(ErrorData),
}

/// A stack trace together with the register state of every frame
#[derive(Debug, Clone, Serialize)]
pub struct Backtrace {
    pub frames: Vec<BacktraceFrame>,
    pub stop: StopReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktraceFrame {
    /// The PC as seen by the process
    pub addr: Addr,
    /// The PC relative to the image base, `None` if it is outside the module
    pub rva: Option<u64>,
    /// The function the PC belongs to, `None` for leaf functions and foreign code
    pub function: Option<RuntimeFunction>,
    pub registers: Registers,
}

impl Backtrace {
    fn new(frames: Vec<BacktraceFrame>, stop: StopReason) -> Self {
        Self { frames, stop }
    }

    /// Returns `true` if the stack was walked down to the end
    pub fn is_complete(&self) -> bool {
        self.stop == StopReason::Finished
    }
}

/// Unwinds the stack described by `regs` until it ends or cannot be unwound further
///
/// The first frame is unwound with a PC adjustment of 0, every following frame with 1.
///
/// # Parameters
///
/// * `pecoff` - The module the stack belongs to
/// * `regs` - Registers of the innermost frame, with the PC as seen by the process
/// * `process_memory` - Memory of the traced process
/// * `load_address` - Address the module is loaded at by the process
/// * `max_frames` - Upper bound for the number of frames
///
/// # Returns
///
/// The frames gathered so far, never an error: a failing step ends the trace with
/// [`StopReason::Error`].
pub fn unwind<M: Memory + Clone>(
    pecoff: &mut PeCoff<M>,
    regs: Registers,
    process_memory: &dyn Memory,
    load_address: u64,
    max_frames: usize,
) -> Backtrace {
    let image_base = pecoff.load_bias();
    let mut regs = regs;
    let mut frames: Vec<BacktraceFrame> = Vec::new();

    loop {
        if frames.len() >= max_frames {
            warn!("stopping the backtrace after {max_frames} frames");
            return Backtrace::new(frames, StopReason::MaxFrames);
        }

        let pc_adjustment = u64::from(!frames.is_empty());
        let pc = regs.pc();
        let linked_pc = pc.wrapping_sub(load_address).wrapping_add(image_base);
        let inside = pecoff.contains_pc(linked_pc);
        let rva = inside.then(|| linked_pc - image_base);
        let function = rva.and_then(|rva| {
            pecoff
                .unwinder()
                .find_runtime_function(rva.wrapping_sub(pc_adjustment))
                .copied()
        });
        frames.push(BacktraceFrame {
            addr: regs.pc().into(),
            rva,
            function,
            registers: regs,
        });

        if !inside {
            debug!("pc {} is outside of the module", Addr::from(regs.pc()));
            return Backtrace::new(frames, StopReason::OutsideModule);
        }

        let mut caller = regs;
        match pecoff.step(linked_pc, pc_adjustment, &mut caller, process_memory) {
            Ok(outcome) if outcome.finished => {
                info!("unwound {} frames", frames.len());
                return Backtrace::new(frames, StopReason::Finished);
            }
            Ok(_) => regs = caller,
            Err(e) => {
                warn!("unwinding frame {} failed: {e}", frames.len() - 1);
                return Backtrace::new(frames, StopReason::Error(e.data()));
            }
        }
    }
}

impl Display for BacktraceFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.addr)?;
        match (self.rva, self.function) {
            (Some(rva), Some(function)) => write!(
                f,
                "  rva {rva:#010x}  in {:#010x}..{:#010x}+{:#x}",
                function.start_rva,
                function.end_rva,
                rva.saturating_sub(u64::from(function.start_rva))
            ),
            (Some(rva), None) => write!(f, "  rva {rva:#010x}  (leaf)"),
            (None, _) => write!(f, "  ??"),
        }
    }
}

impl Display for Backtrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (idx, frame) in self.frames.iter().enumerate() {
            writeln!(f, "#{idx:<3} {frame}")?;
        }
        match self.stop {
            StopReason::Finished => write!(f, "end of stack"),
            StopReason::OutsideModule => write!(f, "left the module"),
            StopReason::MaxFrames => write!(f, "frame limit reached"),
            StopReason::Error(data) => {
                write!(f, "unwinding failed: {:?} at {}", data.code, data.address)
            }
        }
    }
}
