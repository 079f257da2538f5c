//! Context lifecycle manager.
//!
//! Owns the bridge's reference to its engine context together with the
//! function registry of that context. `clear` replaces both at once: the
//! engine flushes to a fresh heap seeded with the current gas settings,
//! the bridge swaps its handle, and the registry starts over under the next
//! generation.

use std::sync::{Mutex, MutexGuard, PoisonError};

use glomium_wire::{
    ContextHandle, Engine, EventSink, FunctionHandle, GasConfig, GasDescriptor, GasSnapshot,
    ProtocolError, Request, WireValue,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::bridge::BridgeInner;
use crate::error::{BridgeError, BridgeResult};
use crate::registry::FunctionRegistry;
use crate::value::HostFunction;

/// The context currently serving requests.
#[derive(Debug)]
pub(crate) struct ActiveContext {
    pub(crate) handle: ContextHandle,
    pub(crate) generation: u64,
    pub(crate) registry: FunctionRegistry,
}

/// Holds the active context and serializes replacements of it.
pub(crate) struct ContextManager {
    /// `None` before the first context opens and after teardown.
    active: Mutex<Option<ActiveContext>>,
    gas: Mutex<GasConfig>,
    lifecycle: AsyncMutex<()>,
}

impl ContextManager {
    /// Create a manager with no context yet.
    pub(crate) fn new(gas: GasConfig) -> Self {
        Self {
            active: Mutex::new(None),
            gas: Mutex::new(gas),
            lifecycle: AsyncMutex::new(()),
        }
    }

    /// Create the first context on `engine`, wired to `events`.
    pub(crate) fn open(&self, engine: &dyn Engine, events: EventSink) -> BridgeResult<()> {
        let gas = self.gas();
        let handle = engine.create_context(gas, events)?;
        debug!(context = %handle, gas_limit = gas.gas_limit, "Created sandbox context");
        *self.lock() = Some(ActiveContext {
            handle,
            generation: 0,
            registry: FunctionRegistry::new(0),
        });
        Ok(())
    }

    /// Lock the active context. A poisoned lock is recovered: the state is
    /// a plain handle plus an append-only registry.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Option<ActiveContext>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current generation, or `None` after teardown.
    pub(crate) fn generation(&self) -> Option<u64> {
        self.lock().as_ref().map(|active| active.generation)
    }

    /// Resolve a host function handle against the active registry.
    pub(crate) fn resolve(&self, handle: FunctionHandle) -> Option<HostFunction> {
        self.lock().as_ref()?.registry.resolve(handle)
    }

    /// Number of host functions registered in the active context.
    pub(crate) fn registered_functions(&self) -> usize {
        self.lock().as_ref().map_or(0, |active| active.registry.len())
    }

    /// Gas settings a flush will seed the next context with.
    pub(crate) fn gas(&self) -> GasConfig {
        *self.gas.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remember_gas(&self, gas: GasConfig) {
        *self.gas.lock().unwrap_or_else(PoisonError::into_inner) = gas;
    }

    /// Install `new` in place of the active context and return the new
    /// generation.
    pub(crate) fn swap(&self, engine: &dyn Engine, new: ContextHandle) -> BridgeResult<u64> {
        let mut guard = self.lock();
        let active = guard.as_mut().ok_or(BridgeError::BridgeClosed)?;
        let handle = engine.replace_context(active.handle, new);
        let generation = active.generation.saturating_add(1);
        debug!(
            old = %active.handle,
            new = %handle,
            generation,
            "Swapped sandbox context"
        );
        *active = ActiveContext {
            handle,
            generation,
            registry: FunctionRegistry::new(generation),
        };
        Ok(generation)
    }

    /// Detach the active context so nothing more is sent to it.
    pub(crate) fn take(&self) -> Option<ActiveContext> {
        self.lock().take()
    }
}

impl BridgeInner {
    /// Flush the active context and install its replacement.
    ///
    /// Calls still pending against the old context are rejected with
    /// [`BridgeError::ContextSuperseded`].
    pub(crate) async fn reset(&self) -> BridgeResult<u64> {
        let _lifecycle = self.contexts().lifecycle.lock().await;
        let gas = self.contexts().gas();
        let (result, _) = self
            .round_trip(|call_id, _, _| {
                Ok(Request::FlushContext {
                    call_id,
                    new_gas: gas,
                })
            })
            .await?;

        // The engine has already built the fresh context at this point. An
        // unreadable handle leaves it with no owner to replace or destroy it.
        let new = context_handle(&result).inspect_err(|e| {
            warn!(
                error = %e,
                "Engine flushed the context without naming a usable handle; the fresh context is orphaned"
            );
        })?;
        let generation = self.contexts().swap(self.engine().as_ref(), new)?;
        let superseded = self.correlator().supersede_before(generation);
        if superseded > 0 {
            debug!(generation, superseded, "Rejected calls pending on the old context");
        }
        Ok(generation)
    }

    /// Read the engine's gas state.
    pub(crate) async fn get_gas(&self) -> BridgeResult<GasDescriptor> {
        let (result, _) = self
            .round_trip(|call_id, _, _| Ok(Request::GetGas { call_id }))
            .await?;
        Ok(gas_snapshot("getGas", &result)?.into())
    }

    /// Overwrite the engine's gas state. Later flushes reuse these settings.
    pub(crate) async fn set_gas(&self, gas: GasDescriptor) -> BridgeResult<GasDescriptor> {
        let (result, _) = self
            .round_trip(|call_id, _, _| {
                Ok(Request::SetGas {
                    call_id,
                    gas_data: gas,
                })
            })
            .await?;
        let snapshot: GasDescriptor = gas_snapshot("setGas", &result)?.into();
        self.contexts().remember_gas(snapshot.config());
        Ok(snapshot)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn context_handle(result: &WireValue) -> Result<ContextHandle, ProtocolError> {
    match result {
        WireValue::Number(n) if n.fract() == 0.0 && *n >= 0.0 => Ok(ContextHandle(*n as u64)),
        other => Err(unexpected("flushContext", other)),
    }
}

fn gas_snapshot(operation: &'static str, result: &WireValue) -> Result<GasSnapshot, ProtocolError> {
    let json = result
        .to_json()
        .ok_or_else(|| unexpected(operation, result))?;
    serde_json::from_value(json).map_err(|_| unexpected(operation, result))
}

fn unexpected(operation: &'static str, found: &WireValue) -> ProtocolError {
    ProtocolError::UnexpectedResult {
        operation,
        found: serde_json::to_string(found).unwrap_or_else(|_| format!("{found:?}")),
    }
}
