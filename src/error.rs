//! Unified error taxonomy for the TianShan firmware.
//!
//! Two layers:
//!
//! - [`Error`]: the internal failure kind every core subsystem returns.
//!   `Copy`, allocation-free, one variant per primary kind.
//! - [`ResultCode`]: the closed wire set carried in every result
//!   envelope.  Each `Error` maps onto exactly one code.
//!
//! ```text
//!   subsystem ──Err(Error)──▶ dispatcher ──code()──▶ {success, code, message?}
//! ```

use core::fmt;

// ---------------------------------------------------------------------------
// Wire result codes
// ---------------------------------------------------------------------------

/// Result codes visible on every external surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Ok,
    InvalidArg,
    NotFound,
    NoPermission,
    Busy,
    Timeout,
    NoMem,
    Internal,
    NotSupported,
    Hardware,
}

impl ResultCode {
    /// Canonical upper-case name used in the `code` field.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::InvalidArg => "INVALID_ARG",
            Self::NotFound => "NOT_FOUND",
            Self::NoPermission => "NO_PERMISSION",
            Self::Busy => "BUSY",
            Self::Timeout => "TIMEOUT",
            Self::NoMem => "NO_MEM",
            Self::Internal => "INTERNAL",
            Self::NotSupported => "NOT_SUPPORTED",
            Self::Hardware => "HARDWARE",
        }
    }

    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Core error kind
// ---------------------------------------------------------------------------

/// Every fallible core operation funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// A parameter failed validation.
    InvalidArg,
    /// The object is not in a state that permits the call.
    InvalidState,
    /// A payload exceeds a fixed store or buffer limit.
    InvalidSize,
    NotFound,
    NoPermission,
    /// A bounded queue or resource is momentarily exhausted.
    Busy,
    Timeout,
    /// A fixed-capacity table is full.
    NoMem,
    Internal,
    NotSupported,
    /// A peripheral reported a failure.
    Hardware,
}

impl Error {
    /// Wire code for this failure kind.
    pub const fn code(self) -> ResultCode {
        match self {
            Self::InvalidArg | Self::InvalidSize => ResultCode::InvalidArg,
            Self::InvalidState | Self::Busy => ResultCode::Busy,
            Self::NotFound => ResultCode::NotFound,
            Self::NoPermission => ResultCode::NoPermission,
            Self::Timeout => ResultCode::Timeout,
            Self::NoMem => ResultCode::NoMem,
            Self::Internal => ResultCode::Internal,
            Self::NotSupported => ResultCode::NotSupported,
            Self::Hardware => ResultCode::Hardware,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArg => write!(f, "invalid argument"),
            Self::InvalidState => write!(f, "invalid state"),
            Self::InvalidSize => write!(f, "invalid size"),
            Self::NotFound => write!(f, "not found"),
            Self::NoPermission => write!(f, "permission denied"),
            Self::Busy => write!(f, "busy"),
            Self::Timeout => write!(f, "timed out"),
            Self::NoMem => write!(f, "out of memory"),
            Self::Internal => write!(f, "internal error"),
            Self::NotSupported => write!(f, "not supported"),
            Self::Hardware => write!(f, "hardware failure"),
        }
    }
}

impl core::error::Error for Error {}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Firmware-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;

/// Recover the guard from a poisoned lock.  A panicking handler must not
/// take the whole registry down with it.
pub(crate) fn relock<T>(
    r: core::result::Result<T, std::sync::PoisonError<T>>,
) -> T {
    r.unwrap_or_else(std::sync::PoisonError::into_inner)
}
