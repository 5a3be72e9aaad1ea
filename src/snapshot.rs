//! # Snapshot Module
//!
//! Captured thread state for unwinding offline.
//!
//! A snapshot is a JSON document holding the registers of the innermost frame and the memory
//! regions copied from the process, usually the top of the stack:
//!
//! ```json
//! {
//!   "registers": { "rsp": 140737488347136, "rip": 5368713488 },
//!   "memory": [
//!     { "address": 140737488347136, "words": [5368713760, 0] }
//!   ]
//! }
//! ```
//!
//! Registers that are not listed are zero. Memory outside the listed regions is unreadable.

use serde::{Deserialize, Serialize};

use crate::memory::SparseMemory;
use crate::registers::Registers;

/// A contiguous range of captured 8-byte words
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub address: u64,
    pub words: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub registers: Registers,
    #[serde(default)]
    pub memory: Vec<MemoryRegion>,
}

impl Snapshot {
    /// Parses a snapshot from its JSON text
    ///
    /// # Errors
    ///
    /// Fails if the text is not a valid snapshot document.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Builds the process memory described by the captured regions
    ///
    /// Later regions overwrite earlier ones where they overlap.
    #[must_use]
    pub fn process_memory(&self) -> SparseMemory {
        let mut memory = SparseMemory::new();
        for region in &self.memory {
            for (idx, word) in region.words.iter().enumerate() {
                memory.set_u64(region.address.wrapping_add(idx as u64 * 8), *word);
            }
        }
        memory
    }
}
