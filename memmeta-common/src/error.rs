//! # Client Errors
//!
//! Purpose: One error type for every failure a meta-protocol call can
//! surface, split into protocol statuses (the server answered) and
//! transport faults (the connection can no longer be trusted).
//!
//! ## Design Principles
//! 1. **Status vs Fault**: Protocol statuses leave the pipeline intact;
//!    transport faults always retire the connection.
//! 2. **Diagnostics Kept**: Unrecognized headers carry their raw text.
//! 3. **Cancellation Is Distinct**: A canceled wait is never reported as a
//!    protocol error.

use std::fmt;

/// Result type used across the memmeta crates.
pub type ClientResult<T> = Result<T, ClientError>;

/// Response status taxonomy, numbered after the matching HTTP codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// `HD`, `VA` or `MN`.
    Ok,
    /// `EN` or `NF`.
    NotFound,
    /// `EX`: the supplied CAS did not match.
    PreconditionFailed,
    /// Any header the command does not recognize.
    InternalServerError,
    /// `NS`: the item was not stored.
    ServiceUnavailable,
}

impl Status {
    /// Numeric status code.
    pub const fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::NotFound => 404,
            Status::PreconditionFailed => 412,
            Status::InternalServerError => 500,
            Status::ServiceUnavailable => 503,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Ok => "ok",
            Status::NotFound => "not found",
            Status::PreconditionFailed => "precondition failed",
            Status::InternalServerError => "internal server error",
            Status::ServiceUnavailable => "service unavailable",
        };
        write!(f, "{} ({})", text, self.code())
    }
}

/// Errors surfaced by the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    // === Protocol statuses ===
    #[error("not found")]
    NotFound,

    #[error("precondition failed")]
    PreconditionFailed,

    #[error("service unavailable")]
    ServiceUnavailable,

    #[error("internal server error: {header}")]
    InternalServerError { header: String },

    // === Transport faults ===
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("end of the data stream has been reached")]
    EndOfStream,

    #[error("protocol error: {0}")]
    Protocol(String),

    // === Caller-side ===
    #[error("operation canceled")]
    Canceled,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl ClientError {
    /// Returns the protocol status carried by this error, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            ClientError::NotFound => Some(Status::NotFound),
            ClientError::PreconditionFailed => Some(Status::PreconditionFailed),
            ClientError::ServiceUnavailable => Some(Status::ServiceUnavailable),
            ClientError::InternalServerError { .. } => Some(Status::InternalServerError),
            _ => None,
        }
    }

    /// Returns true for failures that leave the byte stream out of sync.
    ///
    /// A connection that produced one of these is retired.
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::EndOfStream | ClientError::Protocol(_)
        )
    }

    /// Returns true when the caller's wait was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self, ClientError::Canceled)
    }
}
