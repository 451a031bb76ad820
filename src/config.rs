//! Configuration module for shepai.
//!
//! Settings come from environment variables with validated defaults. The
//! CLI `--port` flag overrides `SHEPAI_PORT` after loading.

use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::collector::CollectorTiming;
use crate::hub::DEFAULT_WRITE_TIMEOUT;
use crate::runtime::DEFAULT_DOCKER_HOST;
use crate::server::ServerConfig;

/// Default preferred port
pub const DEFAULT_PORT: u16 = 4040;

/// Default bind address, loopback only
const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Default number of ports tried after the preferred one
const DEFAULT_PORT_SEARCH_WINDOW: u16 = 100;

/// Maximum port search window
const MAX_PORT_SEARCH_WINDOW: u16 = 1000;

/// Default file poll interval in milliseconds
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Poll interval bounds in milliseconds
const MIN_POLL_INTERVAL_MS: u64 = 10;
const MAX_POLL_INTERVAL_MS: u64 = 10_000;

/// Default reconnect backoff bounds in seconds
const DEFAULT_RECONNECT_INITIAL_SECS: u64 = 2;
const DEFAULT_RECONNECT_MAX_SECS: u64 = 30;

/// Default keepalive timing in seconds
const DEFAULT_PING_INTERVAL_SECS: u64 = 54;
const DEFAULT_READ_DEADLINE_SECS: u64 = 60;

/// Default shutdown grace window in seconds
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Configuration for the shepai process.
///
/// All settings can be configured via environment variables:
/// - `SHEPAI_PORT`: preferred port (default: 4040)
/// - `SHEPAI_HOST`: bind address (default: 127.0.0.1)
/// - `SHEPAI_PORT_SEARCH_WINDOW`: ports tried past the preferred one (default: 100)
/// - `SHEPAI_POLL_INTERVAL_MS`: file poll interval (default: 100)
/// - `SHEPAI_RECONNECT_INITIAL_SECS` / `SHEPAI_RECONNECT_MAX_SECS`: backoff bounds (default: 2 / 30)
/// - `SHEPAI_PING_INTERVAL_SECS` / `SHEPAI_READ_DEADLINE_SECS`: reader keepalive (default: 54 / 60)
/// - `SHEPAI_SHUTDOWN_GRACE_SECS`: listener drain window (default: 5)
/// - `DOCKER_HOST`: container runtime endpoint (default: unix:///var/run/docker.sock)
#[derive(Debug, Clone)]
pub struct Config {
    /// Port tried first
    pub port: u16,

    /// Address the listener binds to
    pub host: IpAddr,

    /// How many ports above `port` may be tried when it is busy
    pub port_search_window: u16,

    /// File poll cadence while caught up
    pub poll_interval: Duration,

    /// First reconnect delay
    pub reconnect_initial: Duration,

    /// Reconnect delay ceiling
    pub reconnect_max: Duration,

    /// Keepalive ping cadence per reader
    pub ping_interval: Duration,

    /// Silence tolerated from a reader before it is dropped
    pub read_deadline: Duration,

    /// Time allowed for listeners to drain on shutdown
    pub shutdown_grace: Duration,

    /// Container runtime endpoint
    pub docker_host: String,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a variable is set but is not a valid value
    /// or lies outside its allowed range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = parse_ranged(&lookup, "SHEPAI_PORT", DEFAULT_PORT as u64, 1, u16::MAX as u64)? as u16;

        let host = match lookup("SHEPAI_HOST") {
            Some(value) => value.trim().parse::<IpAddr>().map_err(|_| {
                ConfigError::for_var("SHEPAI_HOST", format!("'{}' is not an IP address", value))
            })?,
            None => DEFAULT_HOST,
        };

        let port_search_window = parse_ranged(
            &lookup,
            "SHEPAI_PORT_SEARCH_WINDOW",
            DEFAULT_PORT_SEARCH_WINDOW as u64,
            0,
            MAX_PORT_SEARCH_WINDOW as u64,
        )? as u16;

        let poll_interval = Duration::from_millis(parse_ranged(
            &lookup,
            "SHEPAI_POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL_MS,
            MIN_POLL_INTERVAL_MS,
            MAX_POLL_INTERVAL_MS,
        )?);

        let reconnect_initial = Duration::from_secs(parse_ranged(
            &lookup,
            "SHEPAI_RECONNECT_INITIAL_SECS",
            DEFAULT_RECONNECT_INITIAL_SECS,
            1,
            3600,
        )?);
        let reconnect_max = Duration::from_secs(parse_ranged(
            &lookup,
            "SHEPAI_RECONNECT_MAX_SECS",
            DEFAULT_RECONNECT_MAX_SECS,
            1,
            3600,
        )?);
        if reconnect_max < reconnect_initial {
            return Err(ConfigError::for_var(
                "SHEPAI_RECONNECT_MAX_SECS",
                "reconnect ceiling must not be below the initial delay",
            ));
        }

        let ping_interval = Duration::from_secs(parse_ranged(
            &lookup,
            "SHEPAI_PING_INTERVAL_SECS",
            DEFAULT_PING_INTERVAL_SECS,
            1,
            3600,
        )?);
        let read_deadline = Duration::from_secs(parse_ranged(
            &lookup,
            "SHEPAI_READ_DEADLINE_SECS",
            DEFAULT_READ_DEADLINE_SECS,
            1,
            3600,
        )?);
        if ping_interval >= read_deadline {
            return Err(ConfigError::for_var(
                "SHEPAI_PING_INTERVAL_SECS",
                format!(
                    "ping interval {}s must be shorter than the read deadline {}s",
                    ping_interval.as_secs(),
                    read_deadline.as_secs()
                ),
            ));
        }

        let shutdown_grace = Duration::from_secs(parse_ranged(
            &lookup,
            "SHEPAI_SHUTDOWN_GRACE_SECS",
            DEFAULT_SHUTDOWN_GRACE_SECS,
            1,
            300,
        )?);

        let docker_host = lookup("DOCKER_HOST")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_DOCKER_HOST.to_string());

        Ok(Self {
            port,
            host,
            port_search_window,
            poll_interval,
            reconnect_initial,
            reconnect_max,
            ping_interval,
            read_deadline,
            shutdown_grace,
            docker_host,
        })
    }

    pub fn collector_timing(&self) -> CollectorTiming {
        CollectorTiming {
            poll_interval: self.poll_interval,
            reconnect_initial: self.reconnect_initial,
            reconnect_max: self.reconnect_max,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            ping_interval: self.ping_interval,
            read_deadline: self.read_deadline,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            shutdown_grace: self.shutdown_grace,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: DEFAULT_HOST,
            port_search_window: DEFAULT_PORT_SEARCH_WINDOW,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            reconnect_initial: Duration::from_secs(DEFAULT_RECONNECT_INITIAL_SECS),
            reconnect_max: Duration::from_secs(DEFAULT_RECONNECT_MAX_SECS),
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            read_deadline: Duration::from_secs(DEFAULT_READ_DEADLINE_SECS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            docker_host: DEFAULT_DOCKER_HOST.to_string(),
        }
    }
}

/// Parse an optional integer variable and check it against `[min, max]`.
fn parse_ranged<F>(lookup: &F, env_var: &str, default: u64, min: u64, max: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(env_var) else {
        return Ok(default);
    };

    let parsed: u64 = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::for_var(env_var, format!("'{}' is not a valid number", value)))?;

    if parsed < min {
        return Err(ConfigError::for_var(
            env_var,
            format!("{} is below minimum ({})", parsed, min),
        ));
    }
    if parsed > max {
        return Err(ConfigError::for_var(
            env_var,
            format!("{} exceeds maximum ({})", parsed, max),
        ));
    }
    Ok(parsed)
}
