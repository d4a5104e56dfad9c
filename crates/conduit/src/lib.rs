//! Host-side bridge to embedded runtimes.
//!
//! A [`Bridge`] owns every runtime and channel a host creates. Runtimes wrap
//! a [`Handler`] (the embedded language) and are driven either by their own
//! worker threads or cooperatively by the threads that call [`Bridge::step`]
//! and [`Bridge::receive`]. Channels are the host's
//! endpoints into a runtime: requests go in, responses and events come out,
//! and every fallible result is reported as a value, never a panic.

mod bridge;
mod channel;
pub mod config;
mod dispatcher;
pub mod envelope;
pub mod error;
pub mod handle;
pub mod handler;
mod mailbox;
pub mod message;
mod runtime;

pub use bridge::Bridge;
pub use channel::Timeout;
pub use config::{BridgeConfig, RuntimeConfig, RuntimeMode};
pub use envelope::Envelope;
pub use error::{Error, ErrorKind, Result};
pub use handle::{Handle, HandleKind, HandleTable, Reservation};
pub use handler::{BoxError, Echo, Events, Handler};
pub use message::{Message, MessageKind, Topic};
pub use runtime::RuntimeInfo;
