use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_TLS_PORT: u16 = 8883;
pub const DEFAULT_TCP_PORT: u16 = 1883;

/// The `[broker]` section.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    /// `ssl://host:port`, `mqtts://host:port`, `tcp://host:port` or a bare host.
    pub address: String,
    /// Protocol keepalive; `0` disables it. Independent of the heartbeat.
    pub keep_alive_secs: u64,
    pub connection_timeout_secs: u64,
    pub clean_session: bool,
    pub auto_reconnect: bool,
    pub offline_buffer: usize,
    pub max_inflight: u16,
    /// Must hold a full offline buffer flush plus the resubscriptions.
    pub request_channel_capacity: usize,
    /// Upper bound for tearing down a session in `disconnect()` / `close()`.
    pub teardown_timeout_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            keep_alive_secs: 30,
            connection_timeout_secs: 10,
            clean_session: true,
            auto_reconnect: true,
            offline_buffer: 200,
            max_inflight: 20,
            request_channel_capacity: 512,
            teardown_timeout_ms: 2000,
        }
    }
}

impl MqttConfig {
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

/// Everything a [`ConnectionManager`](super::mqtt_handler::ConnectionManager) needs besides its identity.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ManagerSettings {
    pub mqtt: MqttConfig,
    pub heartbeat: HeartbeatConfig,
    pub backoff: BackoffConfig,
}

/// The `[heartbeat]` section.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Overrides `{client_id}/ping`.
    pub topic: Option<String>,
    pub payload: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 15_000,
            topic: None,
            payload: "alive".to_string(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// The `[backoff]` section.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1000,
            max_ms: 60_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Ssl,
    Tcp,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Broker address is empty")]
    Empty,

    #[error("Unsupported broker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid broker port: {0}")]
    InvalidPort(String),
}

/// Parsed broker endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerAddress {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    /// A bare host means `ssl://{host}:8883`. `mqtts://` is an alias of `ssl://`.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AddressError::Empty);
        }

        let (scheme, rest) = match input.split_once("://") {
            Some(("ssl" | "mqtts", rest)) => (Scheme::Ssl, rest),
            Some(("tcp" | "mqtt", rest)) => (Scheme::Tcp, rest),
            Some((other, _)) => return Err(AddressError::UnsupportedScheme(other.to_string())),
            None => (Scheme::Ssl, input),
        };

        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| AddressError::InvalidPort(port.to_string()))?;
                (host, port)
            }
            None => (rest, scheme.default_port()),
        };

        if host.is_empty() {
            return Err(AddressError::Empty);
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Ssl
    }
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Ssl => DEFAULT_TLS_PORT,
            Scheme::Tcp => DEFAULT_TCP_PORT,
        }
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Ssl => "ssl",
            Scheme::Tcp => "tcp",
        };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}
