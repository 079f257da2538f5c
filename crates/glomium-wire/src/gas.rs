//! Gas configuration and usage descriptors.

use serde::{Deserialize, Serialize};

/// Gas settings used to seed a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasConfig {
    /// Execution budget of the context.
    pub gas_limit: u64,
    /// Gas charged per allocated byte.
    pub mem_cost_per_byte: u64,
}

impl GasConfig {
    /// Create a gas configuration.
    #[must_use]
    pub fn new(gas_limit: u64, mem_cost_per_byte: u64) -> Self {
        Self {
            gas_limit,
            mem_cost_per_byte,
        }
    }
}

/// Full gas state of a context: settings plus current usage.
///
/// Passed to `setGas` (which may also reset `used`) and returned by `getGas`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasDescriptor {
    /// Execution budget.
    pub limit: u64,
    /// Gas charged per allocated byte.
    pub memory_byte_cost: u64,
    /// Gas consumed so far.
    pub used: u64,
}

impl GasDescriptor {
    /// The settings part of this descriptor.
    #[must_use]
    pub fn config(&self) -> GasConfig {
        GasConfig::new(self.limit, self.memory_byte_cost)
    }
}

/// Gas state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasSnapshot {
    /// Execution budget.
    pub gas_limit: u64,
    /// Gas consumed so far.
    pub gas_used: u64,
    /// Gas charged per allocated byte.
    #[serde(default)]
    pub mem_cost_per_byte: u64,
}

impl GasSnapshot {
    /// Whether the budget is spent.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.gas_used >= self.gas_limit
    }
}

impl From<GasSnapshot> for GasDescriptor {
    fn from(snapshot: GasSnapshot) -> Self {
        Self {
            limit: snapshot.gas_limit,
            memory_byte_cost: snapshot.mem_cost_per_byte,
            used: snapshot.gas_used,
        }
    }
}
