use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{handle::Handle, mailbox::Mailbox};

/// How long `receive` may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Until a message arrives, the wait is interrupted, or the runtime goes
    /// away.
    Forever,
    /// Check once without waiting.
    Poll,
    After(Duration),
}

impl Timeout {
    /// C convention: negative waits forever, zero polls.
    #[must_use]
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            i64::MIN..=-1 => Self::Forever,
            0 => Self::Poll,
            millis => Self::After(Duration::from_millis(millis.unsigned_abs())),
        }
    }

    pub(crate) fn deadline(self, now: Instant) -> Option<Instant> {
        match self {
            Self::Forever => None,
            Self::Poll => Some(now),
            Self::After(duration) => now.checked_add(duration),
        }
    }

    pub(crate) const fn duration(self) -> Duration {
        match self {
            Self::Forever => Duration::MAX,
            Self::Poll => Duration::ZERO,
            Self::After(duration) => duration,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            Self::Poll
        } else {
            Self::After(duration)
        }
    }
}

/// A client endpoint. It names its runtime by handle and re-resolves it on
/// every operation; it never keeps the runtime alive.
pub(crate) struct Channel {
    pub(crate) runtime: Handle,
    pub(crate) mailbox: Arc<Mailbox>,
}
