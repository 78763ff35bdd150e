//! Typed configuration from environment variables.
//!
//! Loaded once at startup and carried inside the [`Juggler`](crate::Juggler)
//! context. Every variable is optional; malformed values fail fast.

use std::time::{Duration, TryFromFloatSecsError};

use crate::error::{Error, Result};

/// Default queue server address.
pub const DEFAULT_SERVER: &str = "localhost:11300";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Queue server address, `host:port`.
    pub server: String,
    /// How long shutdown waits for in-flight jobs.
    pub shutdown_grace: Duration,
    /// How often shutdown checks whether runners have drained.
    pub shutdown_poll_interval: Duration,
    /// How often runners re-check running jobs' deadlines.
    pub timeout_poll_interval: Duration,
    /// Pause before reserving again after a reservation error.
    pub reserve_retry_delay: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            shutdown_grace: Duration::from_secs(2),
            shutdown_poll_interval: Duration::from_millis(100),
            timeout_poll_interval: Duration::from_millis(500),
            reserve_retry_delay: Duration::from_secs(1),
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for
    /// anything unset.
    ///
    /// | variable                      | field                   |
    /// |-------------------------------|-------------------------|
    /// | `JUGGLER_SERVER`              | `server`                |
    /// | `JUGGLER_SHUTDOWN_GRACE_SECS` | `shutdown_grace`        |
    /// | `JUGGLER_TIMEOUT_POLL_MS`     | `timeout_poll_interval` |
    /// | `JUGGLER_RESERVE_RETRY_MS`    | `reserve_retry_delay`   |
    /// | `OTEL_ENDPOINT`               | `otel_endpoint`         |
    /// | `LOG_LEVEL`                   | `log_level`             |
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let server = match lookup("JUGGLER_SERVER") {
            Some(server) => parse_server(&server)?,
            None => defaults.server,
        };

        Ok(Self {
            server,
            shutdown_grace: duration_var(&lookup, "JUGGLER_SHUTDOWN_GRACE_SECS", Duration::try_from_secs_f64)?
                .unwrap_or(defaults.shutdown_grace),
            shutdown_poll_interval: defaults.shutdown_poll_interval,
            timeout_poll_interval: duration_var(&lookup, "JUGGLER_TIMEOUT_POLL_MS", millis)?
                .unwrap_or(defaults.timeout_poll_interval),
            reserve_retry_delay: duration_var(&lookup, "JUGGLER_RESERVE_RETRY_MS", millis)?
                .unwrap_or(defaults.reserve_retry_delay),
            otel_endpoint: lookup("OTEL_ENDPOINT").filter(|e| !e.is_empty()),
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }
}

fn millis(value: f64) -> std::result::Result<Duration, TryFromFloatSecsError> {
    Duration::try_from_secs_f64(value / 1000.0)
}

fn duration_var(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    unit: fn(f64) -> std::result::Result<Duration, TryFromFloatSecsError>,
) -> Result<Option<Duration>> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let value = match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => value,
        _ => {
            return Err(Error::Config(format!(
                "{name} must be a positive number, got {raw:?}"
            )));
        }
    };
    unit(value)
        .map(Some)
        .map_err(|e| Error::Config(format!("{name} is out of range ({raw:?}): {e}")))
}

/// Accepts `host:port`, optionally prefixed with `beanstalk://`.
fn parse_server(raw: &str) -> Result<String> {
    let address = raw.trim().trim_start_matches("beanstalk://");
    let valid = address
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
    if valid {
        Ok(address.to_string())
    } else {
        Err(Error::Config(format!(
            "JUGGLER_SERVER must be host:port, got {raw:?}"
        )))
    }
}
