//! Forwards `tracing` output to a host callback.
//!
//! Every event is formatted by a `tracing-subscriber` fmt layer into a
//! per-event buffer, which is handed to the callback once formatting is done.

use std::{ffi::c_void, io};

use tracing::{Level, Metadata, Subscriber, level_filters::LevelFilter};
use tracing_subscriber::{
    Layer, Registry,
    fmt::{
        MakeWriter,
        time::{FormatTime, SystemTime, Uptime},
    },
    layer::{Layered, SubscriberExt},
    registry::LookupSpan,
};

use crate::{
    envelope::ConduitStatus,
    error::{Error, fail},
};

type Base = Layered<LevelFilter, Registry>;

pub type LogCallback = extern "C" fn(LogLevel, *const u8, usize, *mut c_void);

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Full = 0,
    Compact = 1,
    Pretty = 2,
    Json = 3,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTime {
    None = 0,
    /// Wall-clock time.
    System = 1,
    /// Time since logging was configured.
    Uptime = 2,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ConduitLoggingConfig {
    /// Least severe level forwarded.
    pub level: LogLevel,
    pub format: LogFormat,
    pub time: LogTime,
    pub show_level: bool,
    /// Include the module path an event was emitted from.
    pub show_target: bool,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

impl From<&Level> for LogLevel {
    fn from(level: &Level) -> Self {
        match *level {
            Level::TRACE => Self::Trace,
            Level::DEBUG => Self::Debug,
            Level::INFO => Self::Info,
            Level::WARN => Self::Warn,
            _ => Self::Error,
        }
    }
}

#[derive(Clone, Copy)]
struct Sink {
    callback: LogCallback,
    user_data: *mut c_void,
}

unsafe impl Send for Sink {}
unsafe impl Sync for Sink {}

impl<'a> MakeWriter<'a> for Sink {
    type Writer = EventWriter;

    fn make_writer(&'a self) -> Self::Writer {
        EventWriter::new(*self, LogLevel::Info)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        EventWriter::new(*self, meta.level().into())
    }
}

/// Collects one formatted event and delivers it on drop.
struct EventWriter {
    sink: Sink,
    level: LogLevel,
    buf: Vec<u8>,
}

impl EventWriter {
    const fn new(sink: Sink, level: LogLevel) -> Self {
        Self {
            sink,
            level,
            buf: Vec::new(),
        }
    }
}

impl io::Write for EventWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EventWriter {
    fn drop(&mut self) {
        let line = self.buf.strip_suffix(b"\n").unwrap_or(&self.buf);
        if !line.is_empty() {
            (self.sink.callback)(self.level, line.as_ptr(), line.len(), self.sink.user_data);
        }
    }
}

fn fmt_layer<S, T>(
    config: &ConduitLoggingConfig,
    sink: Sink,
    timer: T,
) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    T: FormatTime + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_level(config.show_level)
        .with_target(config.show_target)
        .with_timer(timer)
        .with_writer(sink);
    match config.format {
        LogFormat::Full => Box::new(layer),
        LogFormat::Compact => Box::new(layer.compact()),
        LogFormat::Pretty => Box::new(layer.pretty()),
        LogFormat::Json => Box::new(layer.json()),
    }
}

fn subscriber(
    config: &ConduitLoggingConfig,
    callback: LogCallback,
    user_data: *mut c_void,
) -> impl Subscriber + Send + Sync + 'static {
    let sink = Sink {
        callback,
        user_data,
    };
    let layer = match config.time {
        LogTime::None => fmt_layer::<Base, _>(config, sink, ()),
        LogTime::System => fmt_layer::<Base, _>(config, sink, SystemTime),
        LogTime::Uptime => fmt_layer::<Base, _>(config, sink, Uptime::default()),
    };
    Registry::default()
        .with(LevelFilter::from(config.level))
        .with(layer)
}

/// Installs the process-wide logger. Each formatted event is passed to
/// `callback` together with `user_data`; the bytes are only valid for the
/// duration of the call. Can be done once per process.
///
/// # Safety
///
/// `callback` must be safe to call from any thread, concurrently, for as
/// long as the process runs, and `user_data` must stay valid that long.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn conduit_logging_configure(
    config: ConduitLoggingConfig,
    callback: Option<LogCallback>,
    user_data: *mut c_void,
) -> ConduitStatus {
    let Some(callback) = callback else {
        return fail(Error::InvalidArgument("null logging callback"));
    };
    match tracing::subscriber::set_global_default(subscriber(&config, callback, user_data)) {
        Ok(()) => ConduitStatus::OK,
        Err(err) => fail(conduit::Error::Logging(err.to_string())),
    }
}
