//! C interface to the conduit bridge.
//!
//! Runtimes and channels are addressed by 64-bit handles; `0` is never a
//! valid handle. Every fallible call returns a result struct whose `code` is
//! `Ok` on success, and whose `error` otherwise points at a message owned by
//! the calling thread (see [`conduit_last_error`]).

use std::{
    ffi::{CStr, c_char, c_void},
    ptr,
    sync::OnceLock,
};

use bytes::Bytes;
use conduit::{
    Bridge, BridgeConfig, Handle, Message, MessageKind, RuntimeConfig, Timeout, Topic,
};

pub use crate::{
    envelope::{
        ConduitChannelResult, ConduitMessage, ConduitMessageResult, ConduitRuntimeResult,
        ConduitStatus,
    },
    error::{ErrorCode, conduit_last_error, conduit_last_error_code},
    logging::{
        ConduitLoggingConfig, LogCallback, LogFormat, LogLevel, LogTime,
        conduit_logging_configure,
    },
};
use crate::error::{Error, Result, fail};

mod envelope;
mod error;
mod logging;

macro_rules! c_try {
    ($expr:expr) => {
        match $expr {
            Ok(val) => val,
            Err(e) => return $crate::error::fail(e),
        }
    };
}

static BRIDGE: OnceLock<Bridge> = OnceLock::new();

/// The process-wide bridge, created from the environment on first use when
/// `conduit_init` was not called. It lives for the rest of the process so
/// that handles are never reused.
fn bridge() -> &'static Bridge {
    BRIDGE.get_or_init(|| Bridge::new(BridgeConfig::from_env()))
}

unsafe fn optional_str<'a>(ptr: *const c_char) -> Result<Option<&'a str>> {
    if ptr.is_null() {
        return Ok(None);
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map(Some)
        .map_err(|_| Error::InvalidArgument("string is not valid UTF-8"))
}

unsafe fn payload(data: *const u8, len: usize) -> Result<Bytes> {
    if len == 0 {
        return Ok(Bytes::new());
    }
    if data.is_null() {
        return Err(Error::InvalidArgument("null data pointer"));
    }
    Ok(Bytes::copy_from_slice(unsafe {
        std::slice::from_raw_parts(data, len)
    }))
}

/// Event topic that ends every subscription of the channel it reaches.
pub const CONDUIT_TOPIC_KILL: u16 = Topic::KILL.0;

/// Negative selects every topic.
fn topic_filter(topic: i32) -> Result<Option<Topic>> {
    if topic < 0 {
        return Ok(None);
    }
    u16::try_from(topic)
        .map(|topic| Some(Topic(topic)))
        .map_err(|_| Error::InvalidArgument("topic out of range"))
}

unsafe fn write_out<T>(out: *mut T, value: T) {
    if !out.is_null() {
        unsafe { out.write(value) };
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConduitMessageKind {
    Request = 0,
    Response = 1,
    Event = 2,
}

impl From<ConduitMessageKind> for MessageKind {
    fn from(kind: ConduitMessageKind) -> Self {
        match kind {
            ConduitMessageKind::Request => Self::Request,
            ConduitMessageKind::Response => Self::Response,
            ConduitMessageKind::Event => Self::Event,
        }
    }
}

impl From<MessageKind> for ConduitMessageKind {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Request => Self::Request,
            MessageKind::Response => Self::Response,
            MessageKind::Event => Self::Event,
        }
    }
}

/// Initializes the process-wide bridge from a JSON configuration, or from
/// `CONDUIT_*` environment variables when `config_json` is null. Must be
/// called before any other entry point; afterwards it fails with
/// `Initialization`.
///
/// # Safety
///
/// `config_json` must be null or a valid, null-terminated C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn conduit_init(config_json: *const c_char) -> ConduitStatus {
    let json = c_try!(unsafe { optional_str(config_json) });
    let config = c_try!(json.map_or_else(|| Ok(BridgeConfig::from_env()), BridgeConfig::from_json));

    if BRIDGE.set(Bridge::new(config)).is_err() {
        return fail(conduit::Error::Initialization(
            "bridge is already initialized".to_string(),
        ));
    }
    ConduitStatus::OK
}

/// Destroys every runtime and closes every channel. The bridge stays usable
/// and every handle issued so far stays invalid.
#[unsafe(no_mangle)]
pub extern "C" fn conduit_shutdown() -> ConduitStatus {
    if let Some(bridge) = BRIDGE.get() {
        bridge.shutdown();
    }
    ConduitStatus::OK
}

/// Creates a runtime with the bridge's default configuration.
#[unsafe(no_mangle)]
pub extern "C" fn conduit_runtime_create() -> ConduitRuntimeResult {
    bridge().create_runtime().map_err(Error::from).into()
}

/// Creates a runtime from a JSON `RuntimeConfig`.
///
/// # Safety
///
/// `config_json` must be a valid, null-terminated C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn conduit_runtime_create_with_config(
    config_json: *const c_char,
) -> ConduitRuntimeResult {
    let json = c_try!(
        unsafe { optional_str(config_json) }
            .and_then(|json| json.ok_or(Error::InvalidArgument("null configuration")))
    );
    let config = c_try!(RuntimeConfig::from_json(json));
    bridge()
        .create_runtime_with_config(config)
        .map_err(Error::from)
        .into()
}

#[unsafe(no_mangle)]
pub extern "C" fn conduit_runtime_destroy(runtime: u64) -> ConduitStatus {
    bridge()
        .destroy_runtime(Handle::from_raw(runtime))
        .map_err(Error::from)
        .into()
}

/// Processes up to `max` pending messages of a cooperative runtime on the
/// calling thread.
///
/// # Safety
///
/// `processed` must be null or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn conduit_runtime_step(
    runtime: u64,
    max: usize,
    processed: *mut usize,
) -> ConduitStatus {
    let count = c_try!(bridge().step(Handle::from_raw(runtime), max));
    unsafe { write_out(processed, count) };
    ConduitStatus::OK
}

/// Broadcasts an event on `topic` to every channel bound to `runtime`.
///
/// # Safety
///
/// `data` must point to `len` readable bytes (it may be null when `len` is
/// 0), and `id` must be null or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn conduit_runtime_publish(
    runtime: u64,
    topic: u16,
    data: *const u8,
    len: usize,
    id: *mut u64,
) -> ConduitStatus {
    let payload = c_try!(unsafe { payload(data, len) });
    let event = c_try!(bridge().publish_on(Handle::from_raw(runtime), Topic(topic), payload));
    unsafe { write_out(id, event) };
    ConduitStatus::OK
}

#[unsafe(no_mangle)]
pub extern "C" fn conduit_client_create(runtime: u64) -> ConduitChannelResult {
    bridge()
        .create_client(Handle::from_raw(runtime))
        .map_err(Error::from)
        .into()
}

/// Enqueues a request or event. The id written to `id` is echoed by the
/// response to a request.
///
/// # Safety
///
/// `data` must point to `len` readable bytes (it may be null when `len` is
/// 0), and `id` must be null or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn conduit_client_send(
    channel: u64,
    kind: ConduitMessageKind,
    data: *const u8,
    len: usize,
    id: *mut u64,
) -> ConduitStatus {
    let payload = c_try!(unsafe { payload(data, len) });
    let sent = c_try!(bridge().send(Handle::from_raw(channel), kind.into(), payload));
    unsafe { write_out(id, sent) };
    ConduitStatus::OK
}

/// Sends an event on `topic` to the runtime's handler.
///
/// # Safety
///
/// Same as [`conduit_client_send`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn conduit_client_send_event(
    channel: u64,
    topic: u16,
    data: *const u8,
    len: usize,
    id: *mut u64,
) -> ConduitStatus {
    let payload = c_try!(unsafe { payload(data, len) });
    let sent = c_try!(bridge().send_event(Handle::from_raw(channel), Topic(topic), payload));
    unsafe { write_out(id, sent) };
    ConduitStatus::OK
}

/// Waits for the next message on `channel`. A negative `timeout_ms` waits
/// forever, `0` only checks. The returned message must be released with
/// [`conduit_message_destroy`].
#[unsafe(no_mangle)]
pub extern "C" fn conduit_client_receive(channel: u64, timeout_ms: i64) -> ConduitMessageResult {
    bridge()
        .receive(Handle::from_raw(channel), Timeout::from_millis(timeout_ms))
        .into_result()
        .map_err(Error::from)
        .into()
}

/// Wakes every thread blocked in `conduit_client_receive` on `channel`.
#[unsafe(no_mangle)]
pub extern "C" fn conduit_client_interrupt(channel: u64) -> ConduitStatus {
    bridge()
        .interrupt(Handle::from_raw(channel))
        .map_err(Error::from)
        .into()
}

pub type EventCallbackFn = extern "C" fn(*const ConduitMessage, *mut c_void);

#[derive(Clone, Copy)]
struct EventCallback {
    callback: EventCallbackFn,
    user_data: *mut c_void,
}

unsafe impl Send for EventCallback {}
unsafe impl Sync for EventCallback {}

impl EventCallback {
    fn call(self, message: Message) {
        let message = ConduitMessage(message);
        (self.callback)(&raw const message, self.user_data);
    }
}

/// Delivers events for `channel` on `topic` (every topic when negative) to
/// `callback` instead of queueing them, and writes the subscription id to
/// `subscription`. Callbacks run on the runtime's dispatcher; the message
/// pointer is only valid during the call. An event on
/// [`CONDUIT_TOPIC_KILL`] ends every subscription of the channel.
///
/// # Safety
///
/// `callback` must be safe to call from the runtime's threads until the
/// subscription ends, and `user_data` must stay valid that long.
/// `subscription` must be null or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn conduit_client_subscribe(
    channel: u64,
    topic: i32,
    callback: Option<EventCallbackFn>,
    user_data: *mut c_void,
    subscription: *mut u64,
) -> ConduitStatus {
    let Some(callback) = callback else {
        return fail(Error::InvalidArgument("null event callback"));
    };
    let topic = c_try!(topic_filter(topic));
    let callback = EventCallback {
        callback,
        user_data,
    };
    let id = c_try!(
        bridge().subscribe(Handle::from_raw(channel), topic, move |message| {
            callback.call(message);
        })
    );
    unsafe { write_out(subscription, id) };
    ConduitStatus::OK
}

/// Ends a subscription. Unless called from a callback, a callback of the
/// subscription that is running has returned by the time this returns.
#[unsafe(no_mangle)]
pub extern "C" fn conduit_client_unsubscribe(channel: u64, subscription: u64) -> ConduitStatus {
    bridge()
        .unsubscribe(Handle::from_raw(channel), subscription)
        .map_err(Error::from)
        .into()
}

#[unsafe(no_mangle)]
pub extern "C" fn conduit_client_close(channel: u64) -> ConduitStatus {
    bridge()
        .close(Handle::from_raw(channel))
        .map_err(Error::from)
        .into()
}

#[unsafe(no_mangle)]
pub extern "C" fn conduit_message_kind(message: &ConduitMessage) -> ConduitMessageKind {
    message.0.kind().into()
}

#[unsafe(no_mangle)]
pub extern "C" fn conduit_message_id(message: &ConduitMessage) -> u64 {
    message.0.id()
}

/// Topic of an event; 0 for requests and responses.
#[unsafe(no_mangle)]
pub extern "C" fn conduit_message_topic(message: &ConduitMessage) -> u16 {
    message.0.topic().0
}

/// Returns the payload and writes its length to `len`. The bytes live as
/// long as the message.
///
/// # Safety
///
/// `len` must be null or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn conduit_message_data(
    message: &ConduitMessage,
    len: *mut usize,
) -> *const u8 {
    let payload = message.0.payload();
    unsafe { write_out(len, payload.len()) };
    if payload.is_empty() {
        ptr::null()
    } else {
        payload.as_ptr()
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn conduit_message_destroy(_message: Option<Box<ConduitMessage>>) {}

/// Checks that a message result carries exactly one of a message and an
/// error. Returns `MalformedEnvelope` otherwise.
///
/// # Safety
///
/// `result` must be null or point to a valid `ConduitMessageResult`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn conduit_message_result_validate(
    result: *const ConduitMessageResult,
) -> ConduitStatus {
    let Some(result) = (unsafe { result.as_ref() }) else {
        return fail(Error::InvalidArgument("null result"));
    };
    result.check().into()
}
