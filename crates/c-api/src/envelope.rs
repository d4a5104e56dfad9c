//! Result shapes returned by every fallible entry point.
//!
//! A result carries a value and a code. On success the code is `Ok` and the
//! error pointer is null; on failure the value is its null sentinel and
//! `error` points at the thread's last-error message.

use std::{ffi::c_char, ptr};

use conduit::{Handle, Message};

use crate::error::{ErrorCode, Result, fail};

pub(crate) trait Failure {
    fn failure(code: ErrorCode, error: *const c_char) -> Self;
}

/// An owned message. Release it with `conduit_message_destroy`.
pub struct ConduitMessage(pub(crate) Message);

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ConduitStatus {
    pub code: ErrorCode,
    pub error: *const c_char,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ConduitRuntimeResult {
    /// `0` on failure.
    pub runtime: u64,
    pub code: ErrorCode,
    pub error: *const c_char,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ConduitChannelResult {
    /// `0` on failure.
    pub channel: u64,
    pub code: ErrorCode,
    pub error: *const c_char,
}

#[repr(C)]
#[derive(Debug)]
pub struct ConduitMessageResult {
    /// Null on failure.
    pub message: *mut ConduitMessage,
    pub code: ErrorCode,
    pub error: *const c_char,
}

impl ConduitStatus {
    pub(crate) const OK: Self = Self {
        code: ErrorCode::Ok,
        error: ptr::null(),
    };
}

impl Failure for ConduitStatus {
    fn failure(code: ErrorCode, error: *const c_char) -> Self {
        Self { code, error }
    }
}

impl Failure for ConduitRuntimeResult {
    fn failure(code: ErrorCode, error: *const c_char) -> Self {
        Self {
            runtime: Handle::NULL.into_raw(),
            code,
            error,
        }
    }
}

impl Failure for ConduitChannelResult {
    fn failure(code: ErrorCode, error: *const c_char) -> Self {
        Self {
            channel: Handle::NULL.into_raw(),
            code,
            error,
        }
    }
}

impl Failure for ConduitMessageResult {
    fn failure(code: ErrorCode, error: *const c_char) -> Self {
        Self {
            message: ptr::null_mut(),
            code,
            error,
        }
    }
}

impl From<Result<()>> for ConduitStatus {
    fn from(result: Result<()>) -> Self {
        result.map_or_else(fail, |()| Self::OK)
    }
}

impl From<Result<Handle>> for ConduitRuntimeResult {
    fn from(result: Result<Handle>) -> Self {
        match result {
            Ok(runtime) => Self {
                runtime: runtime.into_raw(),
                code: ErrorCode::Ok,
                error: ptr::null(),
            },
            Err(err) => fail(err),
        }
    }
}

impl From<Result<Handle>> for ConduitChannelResult {
    fn from(result: Result<Handle>) -> Self {
        match result {
            Ok(channel) => Self {
                channel: channel.into_raw(),
                code: ErrorCode::Ok,
                error: ptr::null(),
            },
            Err(err) => fail(err),
        }
    }
}

impl From<Result<Message>> for ConduitMessageResult {
    fn from(result: Result<Message>) -> Self {
        match result {
            Ok(message) => Self {
                message: Box::into_raw(Box::new(ConduitMessage(message))),
                code: ErrorCode::Ok,
                error: ptr::null(),
            },
            Err(err) => fail(err),
        }
    }
}

impl ConduitMessageResult {
    /// Checks that exactly one of message and error is present.
    pub(crate) fn check(&self) -> Result<()> {
        match (self.message.is_null(), self.code == ErrorCode::Ok) {
            (true, true) => Err(conduit::Error::MalformedEnvelope(
                "neither message nor error is set",
            )
            .into()),
            (false, false) => Err(conduit::Error::MalformedEnvelope(
                "both message and error are set",
            )
            .into()),
            _ => Ok(()),
        }
    }
}
