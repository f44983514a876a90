//! Broker address parsing.

use std::fmt;

use crate::error::{GatehouseError, Result};

/// Port used when the broker address does not name one.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// A plain-TCP MQTT broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddr {
    pub host: String,
    pub port: u16,
}

impl BrokerAddr {
    /// Parse `tcp://host:port`, `mqtt://host:port` or bare `host[:port]`.
    ///
    /// IPv6 hosts must be bracketed when a port is given (`[::1]:1883`).
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let rest = match trimmed.split_once("://") {
            Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
                "tcp" | "mqtt" => rest,
                other => {
                    return Err(GatehouseError::Config(format!(
                        "unsupported broker scheme '{}' in '{}'",
                        other, raw
                    )))
                }
            },
            None => trimmed,
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed.split_once(']').ok_or_else(|| {
                GatehouseError::Config(format!("unterminated IPv6 host in '{}'", raw))
            })?;
            let port = match after.strip_prefix(':') {
                Some(p) => Some(p),
                None if after.is_empty() => None,
                None => {
                    return Err(GatehouseError::Config(format!(
                        "unexpected text after IPv6 host in '{}'",
                        raw
                    )))
                }
            };
            (host, port)
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(GatehouseError::Config(format!(
                "broker address '{}' has no host",
                raw
            )));
        }

        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| {
                GatehouseError::Config(format!("invalid broker port '{}' in '{}'", p, raw))
            })?,
            None => DEFAULT_MQTT_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BrokerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "tcp://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "tcp://{}:{}", self.host, self.port)
        }
    }
}
