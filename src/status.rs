//! # Structured operation status
//!
//! Every public operation of the engine and of the networking layer returns a
//! [Status] on failure. It is backend agnostic: whether the failure comes from
//! `vmrun`, from the vmrest daemon or from a descriptor file, callers only see
//! a [Code] and a human readable reason.
use std::fmt;

/// Result type returned by engine and driver operations
pub type Result<T, E = Status> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// Unknown VM, template or network
    NotFound,
    /// Duplicate name or existing descriptor path
    AlreadyExists,
    /// Malformed request, e.g. a port forward without a known owner
    InvalidArgument,
    /// Operation invalid in the current state, e.g. delete while powered
    FailedPrecondition,
    /// Transient backend failure
    Unavailable,
    /// A bounded wait ran out of time
    DeadlineExceeded,
    /// A wait was abandoned by its caller
    Cancelled,
    /// Tool invocation failure or unexpected output
    Internal,
    /// Not supported by the selected backend or platform
    Unimplemented,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::NotFound => "NotFound",
            Code::AlreadyExists => "AlreadyExists",
            Code::InvalidArgument => "InvalidArgument",
            Code::FailedPrecondition => "FailedPrecondition",
            Code::Unavailable => "Unavailable",
            Code::DeadlineExceeded => "DeadlineExceeded",
            Code::Cancelled => "Cancelled",
            Code::Internal => "Internal",
            Code::Unimplemented => "Unimplemented",
        };
        f.write_str(name)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("code = {code}, reason = {reason}")]
pub struct Status {
    code: Code,
    reason: String,
}

impl Status {
    pub fn new(code: Code, reason: impl Into<String>) -> Status {
        Status {
            code,
            reason: reason.into(),
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Status {
        Status::new(Code::NotFound, reason)
    }

    pub fn already_exists(reason: impl Into<String>) -> Status {
        Status::new(Code::AlreadyExists, reason)
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Status {
        Status::new(Code::InvalidArgument, reason)
    }

    pub fn failed_precondition(reason: impl Into<String>) -> Status {
        Status::new(Code::FailedPrecondition, reason)
    }

    pub fn unavailable(reason: impl Into<String>) -> Status {
        Status::new(Code::Unavailable, reason)
    }

    pub fn deadline_exceeded(reason: impl Into<String>) -> Status {
        Status::new(Code::DeadlineExceeded, reason)
    }

    pub fn cancelled(reason: impl Into<String>) -> Status {
        Status::new(Code::Cancelled, reason)
    }

    pub fn internal(reason: impl Into<String>) -> Status {
        Status::new(Code::Internal, reason)
    }

    pub fn unimplemented(reason: impl Into<String>) -> Status {
        Status::new(Code::Unimplemented, reason)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Prefix the reason with some context, keeping the code
    pub fn context(self, context: impl fmt::Display) -> Status {
        Status {
            code: self.code,
            reason: format!("{}: {}", context, self.reason),
        }
    }
}
