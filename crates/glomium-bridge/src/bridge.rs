//! The bridge facade.

use std::fmt;
use std::sync::{Arc, Weak};

use glomium_wire::{
    CallId, Engine, FunctionHandle, GasConfig, GasDescriptor, HeapPointer, Request, WireValue,
};
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::codec::{self, BoundContext};
use crate::config::BridgeConfig;
use crate::context::ContextManager;
use crate::correlator::{CallCorrelator, Rejection};
use crate::error::{BridgeError, BridgeResult};
use crate::registry::FunctionRegistry;
use crate::router::EventRouter;
use crate::value::{HostFunction, Value};

/// Host-side handle to one sandbox context.
///
/// Every operation is a single awaitable round trip through the engine.
/// Operations may be issued concurrently; each is correlated by its own
/// call id and settles exactly once.
///
/// Cloning yields another handle to the same context. When the last handle
/// is dropped the engine context is destroyed.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

/// Shared state behind a [`Bridge`].
///
/// The engine's event sink and every sandbox function proxy hold this
/// weakly, so dropping the last [`Bridge`] tears everything down.
pub(crate) struct BridgeInner {
    this: Weak<BridgeInner>,
    engine: Arc<dyn Engine>,
    correlator: CallCorrelator,
    contexts: ContextManager,
    runtime: Handle,
}

impl Bridge {
    /// Create a bridge with a fresh engine context.
    ///
    /// Must be called from within a tokio runtime; host functions invoked
    /// by the sandbox are run on that runtime.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::NoRuntime`] outside a tokio runtime.
    /// - [`BridgeError::Engine`] if the engine cannot create a context.
    pub fn new(engine: Arc<dyn Engine>, gas: GasConfig) -> BridgeResult<Self> {
        let runtime = Handle::try_current().map_err(|_| BridgeError::NoRuntime)?;
        let inner = Arc::new_cyclic(|this| BridgeInner {
            this: this.clone(),
            engine,
            correlator: CallCorrelator::new(),
            contexts: ContextManager::new(gas),
            runtime,
        });

        // The router must be wired before any script runs.
        let sink = EventRouter::new(Arc::downgrade(&inner)).into_sink();
        inner.contexts.open(inner.engine.as_ref(), sink)?;
        Ok(Self { inner })
    }

    /// Create a bridge from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if the configuration is invalid, or
    /// any error of [`Bridge::new`].
    pub fn from_config(engine: Arc<dyn Engine>, config: &BridgeConfig) -> BridgeResult<Self> {
        config.validate()?;
        Self::new(engine, config.gas_config())
    }

    /// Bind a global in the sandbox.
    ///
    /// Functions inside `value` are registered and become callable from
    /// script.
    ///
    /// # Errors
    ///
    /// Rejects as described on [`Bridge::run`].
    pub async fn set(&self, name: &str, value: impl Into<Value>) -> BridgeResult<()> {
        let value = value.into();
        self.inner
            .round_trip(|call_id, registry, owner| {
                Ok(Request::SetGlobal {
                    call_id,
                    global_name: name.to_owned(),
                    global_value: codec::encode(&value, registry, owner),
                })
            })
            .await?;
        Ok(())
    }

    /// Read a global from the sandbox.
    ///
    /// A script function comes back as a callable
    /// [`SandboxFunction`](crate::SandboxFunction) proxy.
    ///
    /// # Errors
    ///
    /// Rejects as described on [`Bridge::run`]; reading a missing global is
    /// whatever error the engine raises for it.
    pub async fn get(&self, name: &str) -> BridgeResult<Value> {
        let (result, generation) = self
            .inner
            .round_trip(|call_id, _, _| {
                Ok(Request::GetGlobal {
                    call_id,
                    global_name: name.to_owned(),
                })
            })
            .await?;
        Ok(self.inner.decode(result, generation))
    }

    /// Evaluate `code` and return the value of its last statement.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::SandboxRuntime`] when the script throws.
    /// - [`BridgeError::OutOfGas`] when it exhausts its gas budget.
    /// - [`BridgeError::EngineFault`] when the engine aborts it otherwise.
    /// - [`BridgeError::ContextSuperseded`] when a concurrent
    ///   [`Bridge::clear`] replaces the context first.
    pub async fn run(&self, code: &str) -> BridgeResult<Value> {
        let (result, generation) = self
            .inner
            .round_trip(|call_id, _, _| {
                Ok(Request::Eval {
                    call_id,
                    code: code.to_owned(),
                })
            })
            .await?;
        Ok(self.inner.decode(result, generation))
    }

    /// Replace the context with a fresh one.
    ///
    /// Globals and registered host functions are discarded; gas settings
    /// carry over. Calls still pending on the old context are rejected with
    /// [`BridgeError::ContextSuperseded`].
    ///
    /// # Errors
    ///
    /// Fails if the engine cannot flush the context.
    pub async fn clear(&self) -> BridgeResult<&Self> {
        self.inner.reset().await?;
        Ok(self)
    }

    /// Overwrite the gas state, including the gas used so far.
    ///
    /// Returns the gas state the engine reports afterwards.
    ///
    /// # Errors
    ///
    /// Fails if the engine reply is not a gas state.
    pub async fn set_gas(&self, gas: GasDescriptor) -> BridgeResult<GasDescriptor> {
        self.inner.set_gas(gas).await
    }

    /// Read the gas state.
    ///
    /// # Errors
    ///
    /// Fails if the engine reply is not a gas state.
    pub async fn get_gas(&self) -> BridgeResult<GasDescriptor> {
        self.inner.get_gas().await
    }

    /// Number of calls awaiting settlement.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.correlator.len()
    }

    /// Number of host functions registered in the current context.
    #[must_use]
    pub fn registered_functions(&self) -> usize {
        self.inner.contexts.registered_functions()
    }

    /// How many times the context has been cleared.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.contexts.generation().unwrap_or_default()
    }

    /// Gas settings the next [`Bridge::clear`] will use.
    #[must_use]
    pub fn gas_config(&self) -> GasConfig {
        self.inner.contexts.gas()
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("generation", &self.generation())
            .field("pending_calls", &self.pending_calls())
            .field("registered_functions", &self.registered_functions())
            .finish_non_exhaustive()
    }
}

impl BridgeInner {
    pub(crate) fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub(crate) fn correlator(&self) -> &CallCorrelator {
        &self.correlator
    }

    pub(crate) fn contexts(&self) -> &ContextManager {
        &self.contexts
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) fn resolve_function(&self, handle: FunctionHandle) -> Option<HostFunction> {
        self.contexts.resolve(handle)
    }

    pub(crate) fn bound_context(&self, generation: u64) -> BoundContext {
        BoundContext::new(self.this.clone(), generation)
    }

    fn decode(&self, wire: WireValue, generation: u64) -> Value {
        codec::decode(wire, &self.bound_context(generation))
    }

    /// Encode against the active registry.
    pub(crate) fn encode_current(&self, value: &Value) -> WireValue {
        let mut guard = self.contexts.lock();
        match guard.as_mut() {
            Some(active) => {
                let owner = self.bound_context(active.generation);
                codec::encode(value, &mut active.registry, &owner)
            },
            None => codec::encode(
                value,
                &mut FunctionRegistry::new(u64::MAX),
                &BoundContext::detached(u64::MAX),
            ),
        }
    }

    /// Send one request to the active context and wait for its settlement.
    ///
    /// `build` runs under the context lock so the payload is encoded
    /// against the same registry generation the request is sent to, and
    /// is handed the [`BoundContext`] of that generation. The settled value
    /// is returned with that generation.
    pub(crate) async fn round_trip<F>(&self, build: F) -> BridgeResult<(WireValue, u64)>
    where
        F: FnOnce(CallId, &mut FunctionRegistry, &BoundContext) -> BridgeResult<Request>,
    {
        let (pending, context, generation, text, kind) = {
            let mut guard = self.contexts.lock();
            let active = guard.as_mut().ok_or(BridgeError::BridgeClosed)?;
            let pending = self.correlator.allocate(active.generation);
            let owner = self.bound_context(active.generation);
            let request = build(pending.id().clone(), &mut active.registry, &owner)?;
            let text = request.to_wire()?;
            (
                pending,
                active.handle,
                active.generation,
                text,
                request.kind(),
            )
        };

        trace!(call_id = %pending.id(), kind, %context, "Dispatching request");
        self.engine.dispatch(context, text);

        match pending.settled().await {
            Ok(value) => Ok((value, generation)),
            Err(rejection) => Err(self.rejection_error(rejection, generation)),
        }
    }

    fn rejection_error(&self, rejection: Rejection, generation: u64) -> BridgeError {
        match rejection {
            Rejection::Thrown(error) => BridgeError::SandboxRuntime {
                error: self.decode(error, generation),
            },
            Rejection::OutOfGas(snapshot) => BridgeError::OutOfGas { snapshot },
            Rejection::EngineFault(snapshot) => BridgeError::EngineFault { snapshot },
            Rejection::Protocol(e) => BridgeError::Protocol(e),
            Rejection::ContextSuperseded => BridgeError::ContextSuperseded,
            Rejection::BridgeClosed => BridgeError::BridgeClosed,
        }
    }

    /// Call a sandbox function by heap pointer.
    pub(crate) async fn call_pointer(
        &self,
        pointer: HeapPointer,
        generation: u64,
        args: Vec<Value>,
    ) -> BridgeResult<Value> {
        let (result, generation) = self
            .round_trip(|call_id, registry, owner| {
                if owner.generation() != generation {
                    return Err(BridgeError::ContextSuperseded);
                }
                Ok(Request::CallFunctionByPointer {
                    call_id,
                    pointer,
                    args: args
                        .iter()
                        .map(|arg| codec::encode(arg, registry, owner))
                        .collect(),
                })
            })
            .await?;
        Ok(self.decode(result, generation))
    }
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        if let Some(active) = self.contexts.take() {
            debug!(
                context = %active.handle,
                generation = active.generation,
                "Destroying sandbox context"
            );
            self.engine.destroy_context(active.handle);
        }
        let closed = self.correlator.close();
        if closed > 0 {
            debug!(closed, "Rejected calls pending at teardown");
        }
    }
}
