use std::time::Duration;

use thiserror::Error;

use crate::handle::Handle;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Coarse classification of [`Error`], stable across the C boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Initialization,
    InvalidRuntime,
    InvalidChannel,
    RuntimeUnavailable,
    Timeout,
    MalformedEnvelope,
    NotFound,
    InvalidArgument,
    QueueFull,
    Cancelled,
    Execution,
    Logging,
}

impl ErrorKind {
    /// Kinds that can only be produced by a bug inside the bridge itself.
    #[must_use]
    pub const fn is_internal(self) -> bool {
        matches!(self, Self::MalformedEnvelope)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialization => "initialization",
            Self::InvalidRuntime => "invalid_runtime",
            Self::InvalidChannel => "invalid_channel",
            Self::RuntimeUnavailable => "runtime_unavailable",
            Self::Timeout => "timeout",
            Self::MalformedEnvelope => "malformed_envelope",
            Self::NotFound => "not_found",
            Self::InvalidArgument => "invalid_argument",
            Self::QueueFull => "queue_full",
            Self::Cancelled => "cancelled",
            Self::Execution => "execution",
            Self::Logging => "logging",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The runtime (threads, handler state, handle slot) could not be built.
    #[error("runtime initialization failed: {0}")]
    Initialization(String),

    #[error("invalid runtime handle: {0}")]
    InvalidRuntime(Handle),

    #[error("invalid channel handle: {0}")]
    InvalidChannel(Handle),

    /// The runtime was destroyed or is shutting down.
    #[error("runtime {0} is unavailable")]
    RuntimeUnavailable(Handle),

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// An envelope carried neither a payload nor an error, or both.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(&'static str),

    /// The handle was already destroyed or closed.
    #[error("handle not found: {0}")]
    NotFound(Handle),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("queue is full ({0} pending)")]
    QueueFull(usize),

    #[error("receive cancelled")]
    Cancelled,

    /// The handler failed (or panicked) while processing a request.
    #[error("execution failed: {0}")]
    Execution(String),

    #[error("logging error: {0}")]
    Logging(String),
}

impl Error {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Initialization(_) => ErrorKind::Initialization,
            Self::InvalidRuntime(_) => ErrorKind::InvalidRuntime,
            Self::InvalidChannel(_) => ErrorKind::InvalidChannel,
            Self::RuntimeUnavailable(_) => ErrorKind::RuntimeUnavailable,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::MalformedEnvelope(_) => ErrorKind::MalformedEnvelope,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::QueueFull(_) => ErrorKind::QueueFull,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Execution(_) => ErrorKind::Execution,
            Self::Logging(_) => ErrorKind::Logging,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArgument(format!("invalid configuration: {err}"))
    }
}
