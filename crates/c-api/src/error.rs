use std::{
    borrow::Cow,
    cell::RefCell,
    ffi::{CStr, CString, c_char},
};

use conduit::ErrorKind;

use crate::envelope::Failure;

thread_local! {
    static LAST_ERROR: RefCell<Option<Error>> = const { RefCell::new(None) };
}

/// Message of the last error raised on this thread, or null if none was.
///
/// The pointer stays valid until the next failing call on the same thread.
#[unsafe(no_mangle)]
pub extern "C" fn conduit_last_error() -> *const c_char {
    last_error_ptr()
}

/// Code of the last error raised on this thread, or `Ok` if none was.
#[unsafe(no_mangle)]
pub extern "C" fn conduit_last_error_code() -> ErrorCode {
    LAST_ERROR.with(|slot| slot.borrow().as_ref().map_or(ErrorCode::Ok, ErrorCode::from))
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Bridge(#[from] conduit::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("C Error")]
    C(ErrorCode, Cow<'static, CStr>),
}

pub type Result<T> = std::result::Result<T, Error>;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok = 0,
    Initialization = 1,
    InvalidRuntime = 2,
    InvalidChannel = 3,
    RuntimeUnavailable = 4,
    Timeout = 5,
    MalformedEnvelope = 6,
    NotFound = 7,
    InvalidArgument = 8,
    QueueFull = 9,
    Cancelled = 10,
    Execution = 11,
    Logging = 12,
}

impl From<ErrorKind> for ErrorCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Initialization => Self::Initialization,
            ErrorKind::InvalidRuntime => Self::InvalidRuntime,
            ErrorKind::InvalidChannel => Self::InvalidChannel,
            ErrorKind::RuntimeUnavailable => Self::RuntimeUnavailable,
            ErrorKind::Timeout => Self::Timeout,
            ErrorKind::MalformedEnvelope => Self::MalformedEnvelope,
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::InvalidArgument => Self::InvalidArgument,
            ErrorKind::QueueFull => Self::QueueFull,
            ErrorKind::Cancelled => Self::Cancelled,
            ErrorKind::Execution => Self::Execution,
            ErrorKind::Logging => Self::Logging,
        }
    }
}

impl From<&Error> for ErrorCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::Bridge(err) => err.kind().into(),
            Error::InvalidArgument(_) => Self::InvalidArgument,
            Error::C(code, _) => *code,
        }
    }
}

fn into_cstr(msg: String) -> Cow<'static, CStr> {
    CString::new(msg).map_or_else(|_| c"error message contains NUL".into(), Into::into)
}

impl Error {
    fn c_error(&mut self) -> *const c_char {
        if let Self::C(_, msg) = self {
            return msg.as_ptr();
        }
        let code = ErrorCode::from(&*self);
        *self = Self::C(code, into_cstr(self.to_string()));
        self.c_error()
    }
}

fn last_error_ptr() -> *const c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow_mut()
            .as_mut()
            .map_or(std::ptr::null(), Error::c_error)
    })
}

pub fn set_last_error(err: Error) {
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = Some(err);
    });
}

/// Records `err` as this thread's last error and wraps it in the envelope
/// the caller returns.
pub(crate) fn fail<T: Failure>(err: impl Into<Error>) -> T {
    let err = err.into();
    let code = ErrorCode::from(&err);
    set_last_error(err);
    T::failure(code, last_error_ptr())
}
