use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

const DEFAULT_WORKER_THREADS: usize = 2;
const DEFAULT_THREAD_NAME: &str = "conduit-runtime";
const DEFAULT_INBOUND_CAPACITY: usize = 1024;
const DEFAULT_EVENT_BACKLOG: usize = 1024;
const DEFAULT_RESPONSE_BACKLOG: usize = 1024;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 1000;

/// How a runtime's handler gets CPU time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    /// A dedicated worker pool runs the dispatcher loop.
    #[default]
    Threaded,
    /// No threads of its own; callers drive it through `step` and `receive`.
    Cooperative,
}

impl RuntimeMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Threaded => "threaded",
            Self::Cooperative => "cooperative",
        }
    }
}

impl FromStr for RuntimeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "threaded" => Ok(Self::Threaded),
            "cooperative" => Ok(Self::Cooperative),
            other => Err(Error::InvalidArgument(format!("unknown runtime mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub mode: RuntimeMode,
    /// Worker threads in threaded mode. Ignored in cooperative mode.
    pub worker_threads: usize,
    pub thread_name: String,
    /// Messages that may wait in the inbound queue before `send` reports
    /// `QueueFull`.
    pub inbound_capacity: usize,
    /// Undelivered events kept per channel; the oldest is dropped beyond this.
    pub event_backlog: usize,
    /// Requests per channel whose response has not been received yet; `send`
    /// reports `QueueFull` beyond this.
    pub response_backlog: usize,
    /// Grace period for background tasks when the runtime is destroyed.
    pub shutdown_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::default(),
            worker_threads: DEFAULT_WORKER_THREADS,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            event_backlog: DEFAULT_EVENT_BACKLOG,
            response_backlog: DEFAULT_RESPONSE_BACKLOG,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn cooperative() -> Self {
        Self {
            mode: RuntimeMode::Cooperative,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mode == RuntimeMode::Threaded && self.worker_threads == 0 {
            return Err(Error::InvalidArgument(
                "worker_threads must be at least 1 in threaded mode".to_string(),
            ));
        }
        if self.inbound_capacity == 0 {
            return Err(Error::InvalidArgument(
                "inbound_capacity must be at least 1".to_string(),
            ));
        }
        if self.event_backlog == 0 {
            return Err(Error::InvalidArgument(
                "event_backlog must be at least 1".to_string(),
            ));
        }
        if self.response_backlog == 0 {
            return Err(Error::InvalidArgument(
                "response_backlog must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Upper bound on simultaneously live runtimes.
    pub max_runtimes: Option<usize>,
    /// Configuration used by `create_runtime` when none is given.
    pub runtime: RuntimeConfig,
}

impl BridgeConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.runtime.validate()?;
        Ok(config)
    }

    /// Reads `CONDUIT_*` variables from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`BridgeConfig::from_env`] with an injectable variable source.
    /// Invalid values fall back to the defaults.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = RuntimeConfig::default();

        let (mode, mode_source) = parse_var(&lookup, "CONDUIT_MODE", defaults.mode);
        let (worker_threads, worker_threads_source) =
            parse_var(&lookup, "CONDUIT_WORKER_THREADS", defaults.worker_threads);
        let (inbound_capacity, inbound_capacity_source) =
            parse_var(&lookup, "CONDUIT_INBOUND_CAPACITY", defaults.inbound_capacity);
        let (max_runtimes, max_runtimes_source) = match lookup("CONDUIT_MAX_RUNTIMES") {
            None => (None, "default"),
            Some(raw) => match raw.parse::<usize>() {
                Ok(0) => (None, "env_unlimited"),
                Ok(parsed) => (Some(parsed), "env"),
                Err(err) => {
                    warn!(%raw, ?err, "Invalid CONDUIT_MAX_RUNTIMES; falling back to default");
                    (None, "default_invalid_env")
                }
            },
        };

        let mut runtime = RuntimeConfig {
            mode,
            worker_threads,
            inbound_capacity,
            ..defaults
        };
        if let Err(err) = runtime.validate() {
            warn!(%err, "Environment produced an invalid runtime configuration; using defaults");
            runtime = RuntimeConfig::default();
        }

        info!(
            mode = runtime.mode.as_str(),
            mode_source,
            worker_threads = runtime.worker_threads,
            worker_threads_source,
            inbound_capacity = runtime.inbound_capacity,
            inbound_capacity_source,
            max_runtimes = max_runtimes.unwrap_or(0),
            max_runtimes_source,
            "Resolved bridge configuration"
        );

        Self {
            max_runtimes,
            runtime,
        }
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> (T, &'static str)
where
    T: FromStr,
    T::Err: std::fmt::Debug,
{
    let Some(raw) = lookup(name) else {
        return (default, "default");
    };
    match raw.parse::<T>() {
        Ok(parsed) => (parsed, "env"),
        Err(err) => {
            warn!(%raw, ?err, variable = name, "Invalid value; falling back to default");
            (default, "default_invalid_env")
        }
    }
}
