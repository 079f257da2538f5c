//! Bridge error taxonomy.

use glomium_wire::{EngineError, FunctionHandle, GasSnapshot, ProtocolError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::value::Value;

/// Errors surfaced by bridge operations.
///
/// Every variant rejects only the call that provoked it; none of them
/// affects other pending calls or the bridge itself.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A wire payload could not be read or written.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A function handle does not resolve in the current registry.
    #[error("unknown function handle {handle}")]
    UnknownFunctionHandle {
        /// The stale or invalid handle.
        handle: FunctionHandle,
    },

    /// Running script raised an error nothing caught.
    #[error("uncaught error in sandbox: {error}")]
    SandboxRuntime {
        /// The thrown value.
        error: Value,
    },

    /// A host function called from the host side failed.
    #[error("host function failed: {error}")]
    HostFunction {
        /// The value the function failed with.
        error: Value,
    },

    /// The gas budget was spent.
    #[error("out of gas: used {} of {}", snapshot.gas_used, snapshot.gas_limit)]
    OutOfGas {
        /// Gas state at the time of the fault.
        snapshot: GasSnapshot,
    },

    /// The engine aborted the call for a reason other than gas.
    #[error("engine fault (gas used {} of {})", snapshot.gas_used, snapshot.gas_limit)]
    EngineFault {
        /// Gas state at the time of the fault.
        snapshot: GasSnapshot,
    },

    /// The call targeted a context that `clear` has since replaced.
    #[error("context was superseded by clear()")]
    ContextSuperseded,

    /// The bridge was torn down before the call settled.
    #[error("bridge is closed")]
    BridgeClosed,

    /// The bridge was constructed outside a tokio runtime.
    #[error("bridge requires a tokio runtime")]
    NoRuntime,

    /// The engine refused a synchronous operation.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Bridge configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// The gas snapshot attached to gas and fault rejections.
    #[must_use]
    pub fn gas_snapshot(&self) -> Option<&GasSnapshot> {
        match self {
            Self::OutOfGas { snapshot } | Self::EngineFault { snapshot } => Some(snapshot),
            _ => None,
        }
    }

    /// The thrown value carried by a sandbox or host function failure.
    #[must_use]
    pub fn thrown(&self) -> Option<&Value> {
        match self {
            Self::SandboxRuntime { error } | Self::HostFunction { error } => Some(error),
            _ => None,
        }
    }
}

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;
