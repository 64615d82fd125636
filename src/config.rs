//! Event loop configuration.
//!
//! [`LoopConfig`] resolves in layers: built-in defaults, then environment
//! overrides ([`LoopConfig::from_env`]), then an optional TOML file with the
//! `config-file` feature. Every layer ends in [`LoopConfig::validate`].
//!
//! | Setting | Default | Env | TOML key |
//! |---------|---------|-----|----------|
//! | poll interval | 1s | `MUXLOOP_POLL_INTERVAL_MS` | `poll_interval_ms` |
//! | max events per poll | 1024 | `MUXLOOP_MAX_EVENTS` | `max_events` |
//! | backend probe order | epoll, kqueue, select | `MUXLOOP_BACKENDS` | `backends` |

use crate::error::{Error, Result};
use crate::reactor::BackendKind;
use std::time::Duration;

/// Environment variable holding a comma-separated backend list.
pub const ENV_BACKENDS: &str = "MUXLOOP_BACKENDS";
/// Environment variable holding the poll interval in milliseconds.
pub const ENV_POLL_INTERVAL_MS: &str = "MUXLOOP_POLL_INTERVAL_MS";
/// Environment variable holding the per-poll event capacity.
pub const ENV_MAX_EVENTS: &str = "MUXLOOP_MAX_EVENTS";

const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60 * 60);
const MAX_EVENTS_LIMIT: usize = 65_536;

/// Tuning for an [`EventLoop`](crate::EventLoop).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Poll timeout used by `run` for every cycle.
    ///
    /// Bounds how long the loop takes to notice an empty reference set when
    /// no I/O arrives.
    pub poll_interval: Duration,
    /// Capacity of the native event buffer.
    pub max_events: usize,
    /// Backends to try, in order. Empty means no facility is usable.
    pub backends: Vec<BackendKind>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_events: 1024,
            backends: BackendKind::PROBE_ORDER.to_vec(),
        }
    }
}

impl LoopConfig {
    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the event buffer capacity.
    #[must_use]
    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    /// Replaces the backend probe order.
    #[must_use]
    pub fn with_backends(mut self, backends: impl Into<Vec<BackendKind>>) -> Self {
        self.backends = backends.into();
        self
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "poll_interval must be greater than zero".to_owned(),
            ));
        }
        if self.poll_interval > MAX_POLL_INTERVAL {
            return Err(Error::InvalidConfig(format!(
                "poll_interval {:?} exceeds {:?}",
                self.poll_interval, MAX_POLL_INTERVAL
            )));
        }
        if self.max_events == 0 || self.max_events > MAX_EVENTS_LIMIT {
            return Err(Error::InvalidConfig(format!(
                "max_events must be in 1..={MAX_EVENTS_LIMIT}, got {}",
                self.max_events
            )));
        }
        Ok(())
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self> {
        Self::default().apply_env_with(|key| std::env::var(key).ok())
    }

    /// Overlays values found through `lookup`, keyed by the `MUXLOOP_*`
    /// variable names.
    pub fn apply_env_with<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_BACKENDS) {
            self.backends = parse_backends(&value)?;
        }
        if let Some(value) = lookup(ENV_POLL_INTERVAL_MS) {
            self.poll_interval = Duration::from_millis(parse_u64(&value, ENV_POLL_INTERVAL_MS)?);
        }
        if let Some(value) = lookup(ENV_MAX_EVENTS) {
            self.max_events = parse_usize(&value, ENV_MAX_EVENTS)?;
        }
        self.validate()?;
        Ok(self)
    }
}

fn parse_backends(value: &str) -> Result<Vec<BackendKind>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::parse)
        .collect()
}

fn parse_u64(value: &str, key: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::InvalidConfig(format!("invalid u64 for {key}: {value}")))
}

fn parse_usize(value: &str, key: &str) -> Result<usize> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| Error::InvalidConfig(format!("invalid usize for {key}: {value}")))
}

#[cfg(feature = "config-file")]
mod file {
    use super::{Error, LoopConfig, Result};
    use crate::reactor::BackendKind;
    use serde::Deserialize;
    use std::path::Path;
    use std::time::Duration;

    #[derive(Debug, Default, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    struct FileConfig {
        poll_interval_ms: Option<u64>,
        max_events: Option<usize>,
        backends: Option<Vec<BackendKind>>,
    }

    impl LoopConfig {
        /// Parses a TOML document; absent keys keep their defaults.
        ///
        /// ```toml
        /// poll_interval_ms = 250
        /// max_events = 512
        /// backends = ["epoll", "select"]
        /// ```
        pub fn from_toml_str(contents: &str) -> Result<Self> {
            let file: FileConfig = toml::from_str(contents)
                .map_err(|err| Error::InvalidConfig(format!("config file: {err}")))?;
            let mut config = Self::default();
            if let Some(ms) = file.poll_interval_ms {
                config.poll_interval = Duration::from_millis(ms);
            }
            if let Some(max_events) = file.max_events {
                config.max_events = max_events;
            }
            if let Some(backends) = file.backends {
                config.backends = backends;
            }
            config.validate()?;
            Ok(config)
        }

        /// Reads and parses a TOML file.
        pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
            let contents = std::fs::read_to_string(path)?;
            Self::from_toml_str(&contents)
        }
    }
}
