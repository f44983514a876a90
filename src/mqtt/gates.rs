//! Gate name to MQTT message lookup.

use std::collections::BTreeMap;

use crate::config::GateConfig;
use crate::error::{GatehouseError, Result};

/// Configured gates, keyed by the name used in the `gate` query parameter.
#[derive(Debug, Clone, Default)]
pub struct GateRegistry {
    gates: BTreeMap<String, GateConfig>,
}

impl GateRegistry {
    pub fn new(gates: BTreeMap<String, GateConfig>) -> Self {
        Self { gates }
    }

    /// Topic and payload for `gate`, or [`GatehouseError::InvalidGate`].
    pub fn get(&self, gate: &str) -> Result<&GateConfig> {
        self.gates
            .get(gate)
            .ok_or_else(|| GatehouseError::InvalidGate(gate.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.gates.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}
