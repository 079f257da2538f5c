//! Gas meter for the toy interpreter.

use glomium_wire::{GasConfig, GasDescriptor, GasSnapshot};

/// Raised when a charge reaches the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfGas;

/// Counts gas for one heap.
///
/// Unlike a pre-checked meter, a charge that reaches the limit is still
/// recorded: usage is pinned at or above the limit so the fault report
/// always satisfies `used >= limit`, and stays there until the meter is
/// reset through `setGas` or a flush.
#[derive(Debug, Clone)]
pub struct GasMeter {
    limit: u64,
    used: u64,
    mem_cost_per_byte: u64,
}

impl GasMeter {
    /// A fresh meter with nothing used.
    #[must_use]
    pub fn new(config: GasConfig) -> Self {
        Self {
            limit: config.gas_limit,
            used: 0,
            mem_cost_per_byte: config.mem_cost_per_byte,
        }
    }

    /// A meter restored from a full gas state.
    #[must_use]
    pub fn from_descriptor(gas: GasDescriptor) -> Self {
        Self {
            limit: gas.limit,
            used: gas.used,
            mem_cost_per_byte: gas.memory_byte_cost,
        }
    }

    /// Charge `amount` gas.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfGas`] once usage reaches the limit.
    pub fn charge(&mut self, amount: u64) -> Result<(), OutOfGas> {
        self.used = self.used.saturating_add(amount);
        if self.used >= self.limit {
            self.used = self.used.max(self.limit);
            return Err(OutOfGas);
        }
        Ok(())
    }

    /// Charge for `bytes` of allocated memory.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfGas`] once usage reaches the limit.
    pub fn charge_bytes(&mut self, bytes: usize) -> Result<(), OutOfGas> {
        let bytes = u64::try_from(bytes).unwrap_or(u64::MAX);
        self.charge(bytes.saturating_mul(self.mem_cost_per_byte))
    }

    /// Whether the budget is spent.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }

    /// Gas used so far.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Current state, as reported to the host.
    #[must_use]
    pub fn snapshot(&self) -> GasSnapshot {
        GasSnapshot {
            gas_limit: self.limit,
            gas_used: self.used,
            mem_cost_per_byte: self.mem_cost_per_byte,
        }
    }
}
