//! Error types for the Gatehouse service.

use thiserror::Error;

/// Main error type for Gatehouse operations.
#[derive(Error, Debug)]
pub enum GatehouseError {
    /// Configuration file could not be parsed or is missing required fields
    #[error("Configuration error: {0}")]
    Config(String),

    /// A numeric setting is out of range (zero quota, zero window, bad QoS)
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Requested gate is not present in the configuration
    #[error("invalid gate value: {0}")]
    InvalidGate(String),

    /// MQTT client errors
    #[error("MQTT error: {0}")]
    Mqtt(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gatehouse operations.
pub type Result<T> = std::result::Result<T, GatehouseError>;
