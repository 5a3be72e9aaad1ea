//! # Registers Module
//!
//! The register bank the unwinder operates on: the sixteen x86-64 general purpose registers and
//! the program counter. XMM registers are not tracked.
//!
//! [`Reg`] uses the numbering of the x64 unwind-code format (`RAX = 0, RCX = 1, ..., R15 = 15`),
//! which is also the hardware encoding order. It is the one place where foreign register
//! numberings are translated: [`Reg::from_unwind_code`] for unwind codes and [`Reg::from_iced`]
//! for the disassembler.

use std::fmt::Display;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

/// A general purpose register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    pub const ALL: [Reg; 16] = [
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rbx,
        Reg::Rsp,
        Reg::Rbp,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ];

    /// Translates the 4-bit register number used by unwind codes and the frame register field
    #[inline]
    #[must_use]
    pub fn from_unwind_code(number: u8) -> Option<Reg> {
        Self::ALL.get(number as usize).copied()
    }

    /// Translates a 64-bit general purpose register of the disassembler
    #[must_use]
    pub fn from_iced(register: iced_x86::Register) -> Option<Reg> {
        use iced_x86::Register as R;
        Some(match register {
            R::RAX => Reg::Rax,
            R::RCX => Reg::Rcx,
            R::RDX => Reg::Rdx,
            R::RBX => Reg::Rbx,
            R::RSP => Reg::Rsp,
            R::RBP => Reg::Rbp,
            R::RSI => Reg::Rsi,
            R::RDI => Reg::Rdi,
            R::R8 => Reg::R8,
            R::R9 => Reg::R9,
            R::R10 => Reg::R10,
            R::R11 => Reg::R11,
            R::R12 => Reg::R12,
            R::R13 => Reg::R13,
            R::R14 => Reg::R14,
            R::R15 => Reg::R15,
            _ => return None,
        })
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Reg::Rax => "rax",
            Reg::Rcx => "rcx",
            Reg::Rdx => "rdx",
            Reg::Rbx => "rbx",
            Reg::Rsp => "rsp",
            Reg::Rbp => "rbp",
            Reg::Rsi => "rsi",
            Reg::Rdi => "rdi",
            Reg::R8 => "r8",
            Reg::R9 => "r9",
            Reg::R10 => "r10",
            Reg::R11 => "r11",
            Reg::R12 => "r12",
            Reg::R13 => "r13",
            Reg::R14 => "r14",
            Reg::R15 => "r15",
        };
        write!(f, "{name}")
    }
}

/// The register state of one frame
///
/// Only the stack pointer and the program counter have dedicated accessors, every other
/// register is reached by indexing with a [`Reg`]:
///
/// ```
/// use pecoff_unwind::registers::{Reg, Registers};
///
/// let mut regs = Registers::default();
/// regs.set_sp(0x1000);
/// regs[Reg::Rbx] = 0x42;
/// assert_eq!(regs[Reg::Rsp], 0x1000);
/// assert_eq!(regs[Reg::Rbx], 0x42);
/// ```
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Registers {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl Index<Reg> for Registers {
    type Output = u64;

    fn index(&self, reg: Reg) -> &u64 {
        match reg {
            Reg::Rax => &self.rax,
            Reg::Rcx => &self.rcx,
            Reg::Rdx => &self.rdx,
            Reg::Rbx => &self.rbx,
            Reg::Rsp => &self.rsp,
            Reg::Rbp => &self.rbp,
            Reg::Rsi => &self.rsi,
            Reg::Rdi => &self.rdi,
            Reg::R8 => &self.r8,
            Reg::R9 => &self.r9,
            Reg::R10 => &self.r10,
            Reg::R11 => &self.r11,
            Reg::R12 => &self.r12,
            Reg::R13 => &self.r13,
            Reg::R14 => &self.r14,
            Reg::R15 => &self.r15,
        }
    }
}

impl IndexMut<Reg> for Registers {
    fn index_mut(&mut self, reg: Reg) -> &mut u64 {
        match reg {
            Reg::Rax => &mut self.rax,
            Reg::Rcx => &mut self.rcx,
            Reg::Rdx => &mut self.rdx,
            Reg::Rbx => &mut self.rbx,
            Reg::Rsp => &mut self.rsp,
            Reg::Rbp => &mut self.rbp,
            Reg::Rsi => &mut self.rsi,
            Reg::Rdi => &mut self.rdi,
            Reg::R8 => &mut self.r8,
            Reg::R9 => &mut self.r9,
            Reg::R10 => &mut self.r10,
            Reg::R11 => &mut self.r11,
            Reg::R12 => &mut self.r12,
            Reg::R13 => &mut self.r13,
            Reg::R14 => &mut self.r14,
            Reg::R15 => &mut self.r15,
        }
    }
}

impl Registers {
    /// Get the value of the program counter
    #[inline]
    pub fn pc(&self) -> u64 {
        self.rip
    }

    #[inline]
    pub fn set_pc(&mut self, value: u64) {
        self.rip = value;
    }

    /// Get the value of the stack pointer
    #[inline]
    pub fn sp(&self) -> u64 {
        self.rsp
    }

    #[inline]
    pub fn set_sp(&mut self, value: u64) {
        self.rsp = value;
    }
}

impl Display for Registers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for reg in Reg::ALL {
            writeln!(f, "{:<4}{:#018x}", reg.to_string(), self[reg])?;
        }
        write!(f, "{:<4}{:#018x}", "rip", self.rip)
    }
}
