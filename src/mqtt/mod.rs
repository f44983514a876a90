//! MQTT client wrapper and gate configuration lookup.

mod broker;
mod gates;
mod publisher;

pub use broker::{BrokerAddr, DEFAULT_MQTT_PORT};
pub use gates::GateRegistry;
pub use publisher::{qos_from_level, GatePublisher, MqttPublisher};
