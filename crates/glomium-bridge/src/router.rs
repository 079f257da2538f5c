//! Event router for notifications coming out of the engine.
//!
//! The engine calls the [`EventSink`] this module builds, from any thread,
//! at any time. Each event is parsed once into the closed [`Event`] enum
//! and handled here:
//!
//! - `invokeFunction` runs a registered host function on the bridge's
//!   runtime and answers the suspended sandbox call through
//!   [`Engine::notify_pending_invocation`](glomium_wire::Engine).
//! - `callFinished` and `fatalError` settle the matching pending call.
//! - `log` is forwarded to `tracing` under the `glomium::sandbox` target.
//!
//! Nothing here returns an error to the engine. Every branch ends in a
//! settlement, a response to the sandbox, or a log line. An event that
//! fails to parse still rejects the call or invocation its header names.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use glomium_wire::{
    CallId, Engine, Event, EventHeader, EventSink, ExecutionToken, FunctionHandle, GasSnapshot,
    InvocationResponse, LogLevel, ProtocolError, WireValue,
};
use tracing::{debug, error, info, trace, warn};

use crate::bridge::BridgeInner;
use crate::codec;
use crate::correlator::Rejection;
use crate::error::BridgeError;

/// Tracing target sandbox log lines are forwarded under.
pub const SANDBOX_LOG_TARGET: &str = "glomium::sandbox";

/// Routes engine events to the bridge that owns the context.
///
/// Holds the bridge weakly: the engine owns the sink, and the bridge owns
/// the engine context, so a strong link would keep both alive forever.
#[derive(Clone)]
pub(crate) struct EventRouter {
    bridge: Weak<BridgeInner>,
}

impl EventRouter {
    pub(crate) fn new(bridge: Weak<BridgeInner>) -> Self {
        Self { bridge }
    }

    /// Wrap the router as the sink handed to the engine.
    pub(crate) fn into_sink(self) -> EventSink {
        Arc::new(move |text: String| self.route(&text))
    }

    /// Parse and handle one raw event.
    pub(crate) fn route(&self, text: &str) {
        let event = match Event::from_wire(text) {
            Ok(event) => event,
            Err(e) => {
                self.unreadable(text, e);
                return;
            },
        };

        match event {
            Event::Log { level, message } => forward_log(level, &message),
            Event::InvokeFunction {
                handle,
                args,
                token,
            } => {
                if let Some(bridge) = self.upgrade() {
                    invoke(&bridge, handle, args, token);
                }
            },
            Event::CallFinished {
                call_id,
                result,
                error,
            } => {
                if let Some(bridge) = self.upgrade() {
                    finish(&bridge, &call_id, result, error);
                }
            },
            Event::FatalError { call_id, gas_info } => {
                if let Some(bridge) = self.upgrade() {
                    fatal(&bridge, &call_id, gas_info);
                }
            },
        }
    }

    fn upgrade(&self) -> Option<Arc<BridgeInner>> {
        let bridge = self.bridge.upgrade();
        if bridge.is_none() {
            debug!("Engine event arrived after the bridge was dropped");
        }
        bridge
    }

    /// An event that failed to parse still settles whatever it was meant
    /// for, as long as its header names it.
    fn unreadable(&self, text: &str, error: ProtocolError) {
        let header = EventHeader::peek(text);
        let target = header.as_ref().map(|h| (&h.call_id, h.token));
        match target {
            Some((Some(call_id), _)) => {
                warn!(%call_id, error = %error, "Rejecting call with an unreadable settlement");
                if let Some(bridge) = self.upgrade() {
                    bridge.correlator().reject(call_id, Rejection::Protocol(error));
                }
            },
            Some((None, Some(token))) => {
                warn!(%token, error = %error, "Rejecting unreadable host function invocation");
                if let Some(bridge) = self.upgrade() {
                    respond(
                        bridge.engine().as_ref(),
                        token,
                        &InvocationResponse::Rejected(WireValue::from(error.to_string())),
                    );
                }
            },
            _ => warn!(error = %error, "Discarding unreadable engine event"),
        }
    }
}

fn invoke(
    bridge: &Arc<BridgeInner>,
    handle: FunctionHandle,
    args: Vec<WireValue>,
    token: ExecutionToken,
) {
    let engine = Arc::clone(bridge.engine());
    let Some(function) = bridge.resolve_function(handle) else {
        let e = BridgeError::UnknownFunctionHandle { handle };
        warn!(%handle, %token, "Sandbox invoked an unknown host function");
        respond(
            engine.as_ref(),
            token,
            &InvocationResponse::Rejected(WireValue::from(e.to_string())),
        );
        return;
    };

    debug!(%handle, %token, name = function.name(), "Invoking host function");
    let context = bridge.bound_context(handle.generation);
    let weak = Arc::downgrade(bridge);
    bridge.runtime().spawn(async move {
        let args = args
            .into_iter()
            .map(|arg| codec::decode(arg, &context))
            .collect();
        let outcome = AssertUnwindSafe(async { function.invoke(args).await })
            .catch_unwind()
            .await;

        let Some(bridge) = weak.upgrade() else {
            debug!(%token, "Bridge dropped while a host function was running");
            return;
        };
        let response = match outcome {
            Ok(Ok(value)) => InvocationResponse::Resolved(bridge.encode_current(&value)),
            Ok(Err(thrown)) => {
                trace!(%token, name = function.name(), "Host function rejected");
                InvocationResponse::Rejected(bridge.encode_current(&thrown))
            },
            Err(_) => {
                warn!(%token, name = function.name(), "Host function panicked");
                InvocationResponse::Rejected(WireValue::from(format!(
                    "host function '{}' panicked",
                    function.name()
                )))
            },
        };
        respond(engine.as_ref(), token, &response);
    });
}

fn respond(engine: &dyn Engine, token: ExecutionToken, response: &InvocationResponse) {
    match response.to_wire() {
        Ok(text) => engine.notify_pending_invocation(token, text),
        Err(e) => {
            warn!(%token, error = %e, "Failed to encode invocation response");
            let fallback = InvocationResponse::Rejected(WireValue::from(e.to_string()));
            if let Ok(text) = fallback.to_wire() {
                engine.notify_pending_invocation(token, text);
            }
        },
    }
}

fn finish(
    bridge: &BridgeInner,
    call_id: &CallId,
    result: Option<WireValue>,
    error: Option<WireValue>,
) {
    match error {
        Some(error) if result.as_ref().is_none_or(WireValue::is_falsy) => {
            trace!(%call_id, "Call finished with an uncaught error");
            bridge.correlator().reject(call_id, Rejection::Thrown(error));
        },
        _ => {
            bridge
                .correlator()
                .resolve(call_id, result.unwrap_or_else(WireValue::undefined));
        },
    }
}

fn fatal(bridge: &BridgeInner, call_id: &CallId, gas: GasSnapshot) {
    let rejection = if gas.is_exhausted() {
        debug!(%call_id, used = gas.gas_used, limit = gas.gas_limit, "Call ran out of gas");
        Rejection::OutOfGas(gas)
    } else {
        warn!(
            %call_id,
            used = gas.gas_used,
            limit = gas.gas_limit,
            "Engine aborted a call without exhausting gas"
        );
        Rejection::EngineFault(gas)
    };
    bridge.correlator().reject(call_id, rejection);
}

fn forward_log(level: LogLevel, message: &str) {
    match level {
        LogLevel::Trace => trace!(target: SANDBOX_LOG_TARGET, "{message}"),
        LogLevel::Debug => debug!(target: SANDBOX_LOG_TARGET, "{message}"),
        LogLevel::Info => info!(target: SANDBOX_LOG_TARGET, "{message}"),
        LogLevel::Warn => warn!(target: SANDBOX_LOG_TARGET, "{message}"),
        LogLevel::Error => error!(target: SANDBOX_LOG_TARGET, "{message}"),
    }
}
