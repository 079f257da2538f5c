//! Test fixtures for common types.

use std::sync::Once;

use glomium_wire::{GasConfig, GasDescriptor};
use tracing_subscriber::EnvFilter;

/// Gas limit generous enough for any ordinary test script.
pub const TEST_GAS_LIMIT: u64 = 1_000_000;

/// Create a test gas config with a generous limit.
#[must_use]
pub fn test_gas_config() -> GasConfig {
    GasConfig::new(TEST_GAS_LIMIT, 1)
}

/// Create a gas config that a short loop exhausts quickly.
#[must_use]
pub fn tiny_gas_config() -> GasConfig {
    GasConfig::new(2_000, 1)
}

/// Create a gas descriptor with nothing used.
#[must_use]
pub fn test_gas_descriptor(limit: u64) -> GasDescriptor {
    GasDescriptor {
        limit,
        memory_byte_cost: 1,
        used: 0,
    }
}

/// Install a test-writer subscriber once per process.
///
/// Honors `RUST_LOG`; silent by default.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
