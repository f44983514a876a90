//! Configuration management for Gatehouse.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{GatehouseError, Result};
use crate::mqtt::BrokerAddr;

/// Main configuration for the Gatehouse service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatehouseConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// MQTT broker and gate configuration
    pub mqtt: MqttConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP server binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Upper bound on handling a single request, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Grace period for in-flight requests on shutdown, in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8001))
}

fn default_request_timeout() -> u64 {
    10
}

fn default_shutdown_timeout() -> u64 {
    30
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Maximum requests admitted per client within the window
    #[serde(default = "default_quota")]
    pub quota: usize,

    /// Sliding window length in seconds
    #[serde(default = "default_window")]
    pub window_secs: u64,

    /// How often dormant clients are evicted, in seconds (0 disables)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            quota: default_quota(),
            window_secs: default_window(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_quota() -> usize {
    10
}

fn default_window() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    300
}

/// MQTT broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker address, e.g. `tcp://localhost:1883`
    #[serde(default)]
    pub broker: String,

    /// MQTT client identifier
    #[serde(default)]
    pub client_id: String,

    /// Username; empty means no authentication
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Quality of service for published messages (0, 1 or 2)
    #[serde(default)]
    pub qos: u8,

    /// Whether published messages are retained by the broker
    #[serde(default)]
    pub retain: bool,

    /// Seconds to wait for the initial broker connection
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// MQTT keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Gate name to topic/payload mapping
    #[serde(default)]
    pub gates: BTreeMap<String, GateConfig>,
}

impl MqttConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_keep_alive() -> u64 {
    30
}

/// Shortest keep-alive the MQTT client accepts.
const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// Topic and payload published when a gate is triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    pub topic: String,
    pub payload: String,
}

impl GatehouseConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatehouseConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatehouseError::Config(format!("failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// How long a request handler waits on a single publish.
    ///
    /// Capped at half the request timeout so a stalled broker is reported
    /// and answered before the request itself times out.
    pub fn publish_timeout(&self) -> Duration {
        self.mqtt
            .connect_timeout()
            .min(self.server.request_timeout() / 2)
    }

    /// Check required fields and value ranges.
    pub fn validate(&self) -> Result<()> {
        let mqtt = &self.mqtt;
        if mqtt.broker.trim().is_empty() {
            return Err(GatehouseError::Config("mqtt.broker is required".to_string()));
        }
        BrokerAddr::parse(&mqtt.broker)?;
        if mqtt.client_id.trim().is_empty() {
            return Err(GatehouseError::Config("mqtt.client_id is required".to_string()));
        }
        if mqtt.gates.is_empty() {
            return Err(GatehouseError::Config("mqtt.gates is required".to_string()));
        }
        for (name, gate) in &mqtt.gates {
            if gate.topic.is_empty() {
                return Err(GatehouseError::Config(format!(
                    "mqtt.gates.{}.topic is required",
                    name
                )));
            }
        }
        crate::mqtt::qos_from_level(mqtt.qos)?;
        if mqtt.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(GatehouseError::InvalidConfiguration(format!(
                "mqtt.keep_alive_secs must be at least {}, got {}",
                MIN_KEEP_ALIVE_SECS, mqtt.keep_alive_secs
            )));
        }

        if self.rate_limiting.quota == 0 {
            return Err(GatehouseError::InvalidConfiguration(
                "rate_limiting.quota must be greater than zero".to_string(),
            ));
        }
        if self.rate_limiting.window_secs == 0 {
            return Err(GatehouseError::InvalidConfiguration(
                "rate_limiting.window_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
