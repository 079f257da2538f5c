//! The interpreter collaborator, consumed through a narrow interface.

use std::sync::Arc;

use thiserror::Error;

use crate::gas::GasConfig;
use crate::ids::{ContextHandle, ExecutionToken};

/// Receives serialized [`Event`](crate::Event)s from the engine.
///
/// The engine may call the sink from any thread at any time, including
/// while no request is outstanding. Implementations must not block.
pub type EventSink = Arc<dyn Fn(String) + Send + Sync>;

/// Errors reported synchronously by an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine could not allocate a context.
    #[error("failed to create context: {0}")]
    CreateContext(String),

    /// The engine is shut down or otherwise unusable.
    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

/// A sandboxed script interpreter.
///
/// Every call is fire-and-forget apart from [`Engine::create_context`]:
/// answers arrive later through the context's [`EventSink`].
pub trait Engine: Send + Sync + 'static {
    /// Allocate a fresh context wired to `events`.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the context cannot be created.
    fn create_context(&self, gas: GasConfig, events: EventSink)
    -> Result<ContextHandle, EngineError>;

    /// Send an encoded [`Request`](crate::Request) to a context.
    fn dispatch(&self, context: ContextHandle, request: String);

    /// Resume a sandbox call suspended on a host function with an encoded
    /// [`InvocationResponse`](crate::InvocationResponse).
    fn notify_pending_invocation(&self, token: ExecutionToken, response: String);

    /// Atomically move the event wiring of `old` onto `new` (produced by a
    /// `flushContext` request) and return the handle to use from now on.
    fn replace_context(&self, old: ContextHandle, new: ContextHandle) -> ContextHandle;

    /// Tear a context down. Suspended invocations are abandoned.
    fn destroy_context(&self, context: ContextHandle);
}
