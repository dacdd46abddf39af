//! Error types shared by every rust-mx crate.
//!
//! `MxError` is the single error type that crosses module boundaries in the
//! core: registry setup, record construction, field dispatch and handle
//! resolution all return [`MxResult`]. Each variant has a stable numeric
//! status code (see [`MxError::code`]) so the server can put the failure on
//! the wire and a client can rebuild an equivalent error on the other side.
//!
//! ## Error Categories
//!
//! - **Structural**: `NullArgument`, `CorruptDataStructure`, `NotFound`,
//!   `IllegalArgument`, `WouldExceedLimit`. Raised by registry, record and
//!   handle bookkeeping.
//! - **Capability**: `Unsupported`, `PermissionDenied`. The operation exists
//!   but this driver, field or client may not perform it.
//! - **Hardware/OS**: `DeviceIo`, `OperatingSystem`. Surfaced unmodified from
//!   a process function's device call.
//! - **Startup**: `VerificationFailed` aggregates every failing driver found
//!   by [`crate::registry::DriverRegistry::verify_all`].

use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the core error type.
pub type MxResult<T> = std::result::Result<T, MxError>;

/// Primary error type for rust-mx.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MxError {
    /// A required argument was missing or empty.
    #[error("Null argument: {0}")]
    NullArgument(String),

    /// Internal bookkeeping is inconsistent (e.g. a driver names a class
    /// that does not belong to its superclass).
    #[error("Corrupt data structure: {0}")]
    CorruptDataStructure(String),

    /// Unknown handle, name or type id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A counter, table or buffer would grow past its limit.
    #[error("Would exceed limit: {0}")]
    WouldExceedLimit(String),

    /// The argument is well formed but not acceptable here.
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    /// The driver or field does not implement the requested operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The caller is not allowed to perform the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Communication with the (possibly simulated) device failed.
    #[error("Device I/O error: {0}")]
    DeviceIo(String),

    /// An operating system call failed.
    #[error("Operating system error: {0}")]
    OperatingSystem(String),

    /// A peer sent a malformed or oversized message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// One or more drivers failed structural verification.
    #[error("Driver verification failed for {} problem(s): {}", .0.len(), format_failures(.0))]
    VerificationFailed(Vec<VerifyFailure>),
}

impl From<std::io::Error> for MxError {
    fn from(err: std::io::Error) -> Self {
        MxError::OperatingSystem(err.to_string())
    }
}

// =============================================================================
// Wire status codes
// =============================================================================

/// Status code sent for a successful request.
pub const STATUS_SUCCESS: u32 = 0;

impl MxError {
    /// Stable numeric status code for this error kind.
    pub fn code(&self) -> u32 {
        match self {
            MxError::NullArgument(_) => 1,
            MxError::CorruptDataStructure(_) => 2,
            MxError::NotFound(_) => 3,
            MxError::WouldExceedLimit(_) => 4,
            MxError::IllegalArgument(_) => 5,
            MxError::Unsupported(_) => 6,
            MxError::PermissionDenied(_) => 7,
            MxError::DeviceIo(_) => 8,
            MxError::OperatingSystem(_) => 9,
            MxError::Protocol(_) => 10,
            MxError::VerificationFailed(_) => 11,
        }
    }

    /// Rebuild an error from a status code and message received off the wire.
    ///
    /// Returns `None` for [`STATUS_SUCCESS`]. Unknown codes map to
    /// `Protocol` so a newer server never panics an older client.
    pub fn from_code(code: u32, message: impl Into<String>) -> Option<Self> {
        let message = message.into();
        let err = match code {
            STATUS_SUCCESS => return None,
            1 => MxError::NullArgument(message),
            2 => MxError::CorruptDataStructure(message),
            3 => MxError::NotFound(message),
            4 => MxError::WouldExceedLimit(message),
            5 => MxError::IllegalArgument(message),
            6 => MxError::Unsupported(message),
            7 => MxError::PermissionDenied(message),
            8 => MxError::DeviceIo(message),
            9 => MxError::OperatingSystem(message),
            // Aggregated verification detail does not survive the wire.
            11 => MxError::CorruptDataStructure(message),
            other => MxError::Protocol(format!("status {}: {}", other, message)),
        };
        Some(err)
    }

    /// Short machine-friendly name of the error kind.
    pub fn kind_name(&self) -> &'static str {
        match self {
            MxError::NullArgument(_) => "null_argument",
            MxError::CorruptDataStructure(_) => "corrupt_data_structure",
            MxError::NotFound(_) => "not_found",
            MxError::WouldExceedLimit(_) => "would_exceed_limit",
            MxError::IllegalArgument(_) => "illegal_argument",
            MxError::Unsupported(_) => "unsupported",
            MxError::PermissionDenied(_) => "permission_denied",
            MxError::DeviceIo(_) => "device_io",
            MxError::OperatingSystem(_) => "operating_system",
            MxError::Protocol(_) => "protocol",
            MxError::VerificationFailed(_) => "verification_failed",
        }
    }
}

// =============================================================================
// Driver verification failures
// =============================================================================

/// What a structural driver check found wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyProblem {
    /// The driver has no construction capability.
    MissingConstructor,
    /// The driver declares fewer fields than the standard record header.
    TooFewFields {
        /// Number of declared fields.
        found: usize,
        /// Minimum number required.
        required: usize,
    },
    /// Two fields map to the same storage location.
    DuplicateStorage {
        /// Name of the field seen first.
        first: String,
        /// Name of the conflicting field.
        second: String,
        /// Human readable storage location.
        location: String,
    },
}

impl fmt::Display for VerifyProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyProblem::MissingConstructor => write!(f, "no construction capability"),
            VerifyProblem::TooFewFields { found, required } => write!(
                f,
                "declares {} field(s), at least {} standard fields are required",
                found, required
            ),
            VerifyProblem::DuplicateStorage {
                first,
                second,
                location,
            } => write!(
                f,
                "fields '{}' and '{}' share storage location {}",
                first, second, location
            ),
        }
    }
}

/// A single failed check for a named driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyFailure {
    /// Driver name.
    pub driver: String,
    /// What was wrong.
    pub problem: VerifyProblem,
}

impl fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "driver '{}': {}", self.driver, self.problem)
    }
}

fn format_failures(failures: &[VerifyFailure]) -> String {
    failures
        .iter()
        .map(|failure| failure.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
