//! A native stack unwinder for x86-64 PE/COFF modules.
//!
//! Given the register state of a thread, the memory of its process and the image of the module
//! its PC is in, [`PeCoffUnwinder::step`] computes the register state of the caller. It follows
//! the Windows x64 exception-handling ABI: the exception table (`.pdata`) locates the function,
//! its unwind info (`.xdata`) describes how to undo the prolog, and a small disassembler catches
//! PCs that are already inside an epilog.
//!
//! ```no_run
//! use pecoff_unwind::coff::PeCoff;
//! use pecoff_unwind::memory::BufferMemory;
//! use pecoff_unwind::snapshot::Snapshot;
//!
//! let mut pecoff = PeCoff::parse(BufferMemory::from_file("app.exe").unwrap()).unwrap();
//! let snapshot = Snapshot::from_json(&std::fs::read_to_string("thread.json").unwrap()).unwrap();
//! let mut regs = snapshot.registers;
//! let memory = snapshot.process_memory();
//!
//! let outcome = pecoff.step(regs.pc(), 0, &mut regs, &memory).unwrap();
//! println!("caller at {:#x}, finished: {}", regs.pc(), outcome.finished);
//! ```

pub mod addr;
pub mod coff;
pub mod disassemble;
pub mod epilog;
pub mod errors;
pub mod evaluator;
pub mod memory;
pub mod registers;
pub mod runtime_function;
pub mod snapshot;
pub mod unwind;
pub mod unwind_info;
pub mod unwinder;

pub use addr::Addr;
pub use errors::{ErrorCode, ErrorData, Result, UnwindError};
pub use unwinder::{PeCoffUnwinder, StepOutcome};
