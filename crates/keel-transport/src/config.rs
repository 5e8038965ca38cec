use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Endpoint configuration as read from TOML. Every field is optional and
/// falls back to [`EndpointConfig::default`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EndpointConfigInput {
    pub ping_interval_ms: Option<u64>,
    pub connection_timeout_ms: Option<u64>,
    pub max_connections: Option<usize>,
    pub initial_ack_wait_ms: Option<u64>,
    pub pool_capacity: Option<usize>,
}

/// Resolved endpoint configuration. Fixed for the lifetime of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Minimum spacing between pings to one peer.
    pub ping_interval: Duration,
    /// Silence after which a peer is considered gone.
    pub connection_timeout: Duration,
    /// Server only.
    pub max_connections: usize,
    /// Retransmission wait before the first RTT estimate arrives.
    pub initial_ack_wait: Duration,
    /// Idle buffers kept by the endpoint's arena.
    pub pool_capacity: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(10),
            max_connections: 64,
            initial_ack_wait: Duration::from_millis(10),
            pool_capacity: 256,
        }
    }
}

impl EndpointConfigInput {
    pub fn resolve(self) -> Result<EndpointConfig> {
        let defaults = EndpointConfig::default();
        let config = EndpointConfig {
            ping_interval: self
                .ping_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.ping_interval),
            connection_timeout: self
                .connection_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.connection_timeout),
            max_connections: self.max_connections.unwrap_or(defaults.max_connections),
            initial_ack_wait: self
                .initial_ack_wait_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_ack_wait),
            pool_capacity: self.pool_capacity.unwrap_or(defaults.pool_capacity),
        };

        if config.ping_interval.is_zero() {
            return Err(Error::Config("ping_interval_ms must be > 0".into()));
        }
        if config.connection_timeout.is_zero() {
            return Err(Error::Config("connection_timeout_ms must be > 0".into()));
        }
        if config.max_connections == 0 {
            return Err(Error::Config("max_connections must be > 0".into()));
        }
        Ok(config)
    }
}

impl EndpointConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(EndpointConfig::default());
        }
        let parsed: EndpointConfigInput = toml::from_str(input)
            .map_err(|e| Error::Config(format!("invalid config TOML: {e}")))?;
        parsed.resolve()
    }
}
