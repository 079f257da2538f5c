//! Glomium Bridge - host-side bridge to a gas-metered script sandbox.
//!
//! The interpreter itself is a collaborator behind the
//! [`Engine`](glomium_wire::Engine) trait. This crate owns the protocol
//! around it:
//!
//! - [`Bridge`]: `set`, `get`, `run`, `clear`, `set_gas`, `get_gas`, each a
//!   single awaitable round trip.
//! - [`codec`]: native [`Value`]s to and from wire values, including host
//!   functions (by registry handle) and sandbox functions (by heap pointer).
//! - [`registry`]: per-context table of host functions exposed to script.
//! - Call correlation, event routing and context lifecycle, internal to
//!   [`Bridge`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use glomium_bridge::{Bridge, GasConfig, HostFunction, Value};
//!
//! let bridge = Bridge::new(Arc::new(engine), GasConfig::new(20_000_000, 1))?;
//! bridge.set("x", 5).await?;
//! assert_eq!(bridge.run("x + 1").await?, Value::from(6));
//!
//! let double = HostFunction::from_sync("double", |args| {
//!     Ok(Value::from(args[0].as_f64().unwrap_or(0.0) * 2.0))
//! });
//! bridge.set("double", double).await?;
//! assert_eq!(bridge.run("double(21)").await?, Value::from(42));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod bridge;
pub mod codec;
pub mod config;
mod context;
mod correlator;
pub mod error;
pub mod registry;
mod router;
pub mod telemetry;
pub mod value;

#[cfg(test)]
mod testing;

pub use bridge::Bridge;
pub use codec::BoundContext;
pub use config::{BridgeConfig, ConfigError, ConfigResult};
pub use error::{BridgeError, BridgeResult};
pub use registry::FunctionRegistry;
pub use router::SANDBOX_LOG_TARGET;
pub use telemetry::{LogConfig, LogFormat, TelemetryError, TelemetryResult, setup_logging};
pub use value::{Function, HostFunction, HostFuture, Object, SandboxFunction, Value};

pub use glomium_wire::{
    ContextHandle, Engine, EngineError, EventSink, ExecutionToken, FunctionHandle, GasConfig,
    GasDescriptor, GasSnapshot, HeapPointer, ProtocolError,
};
