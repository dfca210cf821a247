//! Hub configuration

use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SynapseError};

/// Default network endpoint.
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 1976;

/// How a client-role hub reaches its upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectMode {
    /// Real socket connection (default).
    #[default]
    Netsocket,
    /// Same-process shortcut against a root hub.
    Direct,
    /// Forked child exchanging envelopes over the process control channel.
    Child,
}

/// Configuration for one hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Hub name; used in HELLO and as the namespace for emitted events.
    pub name: String,

    /// Endpoint host.
    pub host: String,

    /// Endpoint port.
    pub port: u16,

    /// Transport selection for client-role connections.
    #[serde(default)]
    pub mode: ConnectMode,

    /// Prefer the same-process shortcut when the endpoint is served locally.
    #[serde(default)]
    pub local: bool,

    /// Reconnect automatically after an unexpected connection loss.
    pub reconnect: bool,

    /// Interval of the listener garbage collector that notifies the
    /// upstream about event types no longer listened to.
    #[serde(with = "humantime_serde")]
    pub gc_interval: Duration,

    /// Base delay of the reconnect backoff; attempt `k` waits `base * k²`.
    #[serde(with = "humantime_serde")]
    pub reconnect_base_delay: Duration,

    /// Capacity of each session's inbound message channel.
    pub inbound_capacity: usize,

    /// Capacity of each connection's outbound channel.
    pub outbound_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            name: "no-name".to_string(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            mode: ConnectMode::default(),
            local: false,
            reconnect: true,
            gc_interval: Duration::from_secs(60),
            reconnect_base_delay: Duration::from_millis(10),
            inbound_capacity: 64,
            outbound_capacity: 64,
        }
    }
}

impl HubConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// The configured endpoint as `host:port`.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Load configuration from defaults, an optional TOML file and
    /// `SYNAPSE_`-prefixed environment variables, in that precedence.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("SYNAPSE_"))
            .extract()
            .map_err(|e| SynapseError::Configuration(e.to_string()))
    }
}
