use crate::error::{Error, Result};

/// Tagged result handed across the boundary: a payload or an error.
///
/// Envelopes built by the bridge always come from a [`Result`], so exactly one
/// side is set. [`Envelope::from_parts`] exists for envelopes reconstructed
/// from foreign memory; [`Envelope::into_result`] reports any other shape as
/// [`Error::MalformedEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<T> {
    payload: Option<T>,
    error: Option<Error>,
}

impl<T> Envelope<T> {
    #[must_use]
    pub const fn ok(payload: T) -> Self {
        Self {
            payload: Some(payload),
            error: None,
        }
    }

    #[must_use]
    pub const fn err(error: Error) -> Self {
        Self {
            payload: None,
            error: Some(error),
        }
    }

    #[must_use]
    pub const fn from_parts(payload: Option<T>, error: Option<Error>) -> Self {
        Self { payload, error }
    }

    #[must_use]
    pub const fn is_malformed(&self) -> bool {
        self.payload.is_some() == self.error.is_some()
    }

    #[must_use]
    pub const fn payload(&self) -> Option<&T> {
        self.payload.as_ref()
    }

    #[must_use]
    pub const fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn into_result(self) -> Result<T> {
        match (self.payload, self.error) {
            (Some(payload), None) => Ok(payload),
            (None, Some(error)) => Err(error),
            (None, None) => Err(Error::MalformedEnvelope("neither payload nor error is set")),
            (Some(_), Some(_)) => Err(Error::MalformedEnvelope("both payload and error are set")),
        }
    }
}

impl<T> From<Result<T>> for Envelope<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(payload) => Self::ok(payload),
            Err(error) => Self::err(error),
        }
    }
}
