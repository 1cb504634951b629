use crate::config::{get_namespaced_bool, get_namespaced_u64, get_namespaced_usize, optional};
use crate::error::Error;
use ::config::Config;
use std::time::Duration;

/// Per-session buffer, handshake and closing settings.
///
/// # Configuration Keys
///
/// - `min_in_buffer_capacity` (default 2048)
/// - `max_in_buffer_capacity` (default 65536)
/// - `min_out_buffer_capacity` (default 2048)
/// - `optimize_copying` (default false)
/// - `handshake_loops_threshold` (default 500)
/// - `handshake_timeout_ms` (default: none)
/// - `wait_for_inbound_close` (default false)
/// - `quickly_close_engine_on_failure` (default false)
/// - `max_datagram_size` (default 65507)
/// - `throughput_interval_ms` (default 1000)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub min_in_buffer_capacity: usize,
    pub max_in_buffer_capacity: usize,
    pub min_out_buffer_capacity: usize,
    /// Take ownership of caller buffers instead of copying them, when the
    /// allocator releases buffers.
    pub optimize_copying: bool,
    pub handshake_loops_threshold: usize,
    pub handshake_timeout: Option<Duration>,
    /// After sending the engine's close message, wait for the peer's before
    /// closing the channel.
    pub wait_for_inbound_close: bool,
    /// Skip flushing a pending alert when an engine failure is fired.
    pub quickly_close_engine_on_failure: bool,
    pub max_datagram_size: usize,
    pub throughput_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_in_buffer_capacity: 2048,
            max_in_buffer_capacity: 65536,
            min_out_buffer_capacity: 2048,
            optimize_copying: false,
            handshake_loops_threshold: 500,
            handshake_timeout: None,
            wait_for_inbound_close: false,
            quickly_close_engine_on_failure: false,
            max_datagram_size: 65507,
            throughput_interval: Duration::from_millis(1000),
        }
    }
}

impl SessionConfig {
    /// Reads the session settings with configuration namespacing.
    ///
    /// Lookup order is `{name}.{key}`, then `{key}`, then the default.
    pub fn from_config(config: &Config, name: &str) -> Result<Self, Error> {
        let defaults = Self::default();
        let handshake_timeout =
            optional(get_namespaced_u64(config, name, "handshake_timeout_ms"))?
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis);
        let throughput_interval =
            optional(get_namespaced_u64(config, name, "throughput_interval_ms"))?
                .map(Duration::from_millis)
                .unwrap_or(defaults.throughput_interval);

        let session_config = Self {
            min_in_buffer_capacity: optional(get_namespaced_usize(
                config,
                name,
                "min_in_buffer_capacity",
            ))?
            .unwrap_or(defaults.min_in_buffer_capacity),
            max_in_buffer_capacity: optional(get_namespaced_usize(
                config,
                name,
                "max_in_buffer_capacity",
            ))?
            .unwrap_or(defaults.max_in_buffer_capacity),
            min_out_buffer_capacity: optional(get_namespaced_usize(
                config,
                name,
                "min_out_buffer_capacity",
            ))?
            .unwrap_or(defaults.min_out_buffer_capacity),
            optimize_copying: optional(get_namespaced_bool(config, name, "optimize_copying"))?
                .unwrap_or(defaults.optimize_copying),
            handshake_loops_threshold: optional(get_namespaced_usize(
                config,
                name,
                "handshake_loops_threshold",
            ))?
            .unwrap_or(defaults.handshake_loops_threshold),
            handshake_timeout,
            wait_for_inbound_close: optional(get_namespaced_bool(
                config,
                name,
                "wait_for_inbound_close",
            ))?
            .unwrap_or(defaults.wait_for_inbound_close),
            quickly_close_engine_on_failure: optional(get_namespaced_bool(
                config,
                name,
                "quickly_close_engine_on_failure",
            ))?
            .unwrap_or(defaults.quickly_close_engine_on_failure),
            max_datagram_size: optional(get_namespaced_usize(config, name, "max_datagram_size"))?
                .unwrap_or(defaults.max_datagram_size),
            throughput_interval,
        };
        session_config.validate()?;
        Ok(session_config)
    }

    /// Checks the buffer and handshake limits for consistency.
    pub fn validate(&self) -> Result<(), Error> {
        if self.min_in_buffer_capacity == 0 {
            return Err(invalid("min_in_buffer_capacity", "must be positive"));
        }
        if self.max_in_buffer_capacity < self.min_in_buffer_capacity {
            return Err(invalid(
                "max_in_buffer_capacity",
                "must not be below min_in_buffer_capacity",
            ));
        }
        if self.min_out_buffer_capacity == 0 {
            return Err(invalid("min_out_buffer_capacity", "must be positive"));
        }
        if self.handshake_loops_threshold == 0 {
            return Err(invalid("handshake_loops_threshold", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> Error {
    Error::InvalidConfig {
        key: key.to_string(),
        message: message.to_string(),
    }
}
