//! # Error Module
//!
//! Error types of the unwinder.
//!
//! Every fallible operation returns a [`Result`] carrying an [`UnwindError`]. Callers that need
//! the stable `{code, address}` record (for example to correlate a failed read with their own
//! memory map) can convert any error with [`UnwindError::data`].

use serde::Serialize;
use thiserror::Error;

use crate::addr::Addr;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, UnwindError>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindError {
    /// An expected read from process or module-file memory failed at the given address
    #[error("Invalid memory access at {0}")]
    MemoryInvalid(Addr),
    /// The bytes do not conform to PE/COFF or the x64 unwind-info format
    #[error("Invalid PE/COFF data: {0}")]
    InvalidCoff(&'static str),
    /// The input is well-formed but uses something this unwinder does not handle
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),
}

/// The error taxonomy surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ErrorCode {
    #[default]
    None,
    MemoryInvalid,
    InvalidCoff,
    Unsupported,
}

/// An error record: `address` is only meaningful for [`ErrorCode::MemoryInvalid`] and is zero
/// otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub address: Addr,
}

impl ErrorData {
    pub const NONE: ErrorData = ErrorData {
        code: ErrorCode::None,
        address: Addr::NULL,
    };
}

impl UnwindError {
    /// Returns the `{code, address}` record for this error
    #[must_use]
    pub fn data(&self) -> ErrorData {
        match self {
            UnwindError::MemoryInvalid(addr) => ErrorData {
                code: ErrorCode::MemoryInvalid,
                address: *addr,
            },
            UnwindError::InvalidCoff(_) => ErrorData {
                code: ErrorCode::InvalidCoff,
                address: Addr::NULL,
            },
            UnwindError::Unsupported(_) => ErrorData {
                code: ErrorCode::Unsupported,
                address: Addr::NULL,
            },
        }
    }

    #[inline]
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.data().code
    }
}

impl From<UnwindError> for ErrorData {
    fn from(value: UnwindError) -> Self {
        value.data()
    }
}

/// Remembers the outcome of the last call of a stateful entry point
pub(crate) fn record<T>(last_error: &mut ErrorData, result: Result<T>) -> Result<T> {
    *last_error = match &result {
        Ok(_) => ErrorData::NONE,
        Err(e) => e.data(),
    };
    result
}
