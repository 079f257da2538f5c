//! Value codec: native [`Value`]s to and from [`WireValue`]s.
//!
//! Encoding registers host functions into the active context's
//! [`FunctionRegistry`]; decoding binds sandbox function proxies to the
//! bridge and context generation they arrived under.

use std::sync::Weak;

use glomium_wire::{Escape, FunctionHandle, ProtocolResult, WireObject, WireValue};
use tracing::{debug, warn};

use crate::bridge::BridgeInner;
use crate::registry::FunctionRegistry;
use crate::value::{Function, HostFunction, Object, SandboxFunction, Value};

/// What decoded values are bound to: the owning bridge and the context
/// generation the wire value was produced under.
#[derive(Debug, Clone)]
pub struct BoundContext {
    bridge: Weak<BridgeInner>,
    generation: u64,
}

impl BoundContext {
    pub(crate) fn new(bridge: Weak<BridgeInner>, generation: u64) -> Self {
        Self { bridge, generation }
    }

    /// A context bound to no bridge.
    ///
    /// Sandbox function proxies decoded here fail with
    /// [`BridgeError::BridgeClosed`](crate::BridgeError::BridgeClosed) when
    /// called, and host function references decode to `undefined`.
    #[must_use]
    pub fn detached(generation: u64) -> Self {
        Self::new(Weak::new(), generation)
    }

    /// Generation decoded values are bound to.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn resolve_host(&self, handle: FunctionHandle) -> Option<HostFunction> {
        self.bridge.upgrade()?.resolve_function(handle)
    }

    /// Whether `function` was decoded under this bridge and generation.
    fn binds(&self, function: &SandboxFunction) -> bool {
        function.generation() == self.generation && function.is_from(&self.bridge)
    }
}

/// Encode a value, registering any host functions it contains.
///
/// `owner` is the bridge and generation the encoded value is sent to. A
/// sandbox function proxy is encoded by pointer only when it was decoded
/// under that same bridge and generation; any other proxy refers to a heap
/// the receiving context cannot address and encodes as `undefined`.
#[must_use]
pub fn encode(value: &Value, registry: &mut FunctionRegistry, owner: &BoundContext) -> WireValue {
    match value {
        Value::Undefined => WireValue::undefined(),
        Value::Null => WireValue::Null,
        Value::Bool(b) => WireValue::Bool(*b),
        Value::Number(n) => WireValue::Number(*n),
        Value::String(s) => WireValue::String(s.clone()),
        Value::Array(items) => {
            WireValue::Array(
                items
                    .iter()
                    .map(|item| encode(item, registry, owner))
                    .collect(),
            )
        },
        Value::Object(object) => WireValue::Escape(Escape::Object(
            object
                .iter()
                .map(|(k, v)| (k.to_owned(), encode(v, registry, owner)))
                .collect::<WireObject>(),
        )),
        Value::Function(Function::Host(function)) => {
            let name = function.name().to_owned();
            let handle = registry.register(function.clone());
            WireValue::Escape(Escape::HostFunction { handle, name })
        },
        Value::Function(Function::Sandbox(function)) => {
            if owner.binds(function) {
                WireValue::Escape(Escape::SandboxFunction {
                    pointer: function.pointer(),
                })
            } else {
                debug!(
                    pointer = %function.pointer(),
                    generation = function.generation(),
                    current = owner.generation,
                    "Sandbox function from another context encoded as undefined"
                );
                WireValue::undefined()
            }
        },
    }
}

/// Encode a value to wire text.
///
/// # Errors
///
/// Returns a [`ProtocolError`](glomium_wire::ProtocolError) if the value
/// cannot be serialized.
pub fn encode_text(
    value: &Value,
    registry: &mut FunctionRegistry,
    owner: &BoundContext,
) -> ProtocolResult<String> {
    Ok(serde_json::to_string(&encode(value, registry, owner))?)
}

/// Decode a wire value.
#[must_use]
pub fn decode(wire: WireValue, context: &BoundContext) -> Value {
    match wire {
        WireValue::Null => Value::Null,
        WireValue::Bool(b) => Value::Bool(b),
        WireValue::Number(n) => Value::Number(n),
        WireValue::String(s) => Value::String(s),
        WireValue::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| decode(item, context))
                .collect(),
        ),
        WireValue::Escape(Escape::Object(object)) => Value::Object(
            object
                .into_iter()
                .map(|(k, v)| (k, decode(v, context)))
                .collect::<Object>(),
        ),
        WireValue::Escape(Escape::Undefined {}) => Value::Undefined,
        WireValue::Escape(Escape::SandboxFunction { pointer }) => Value::Function(
            Function::Sandbox(SandboxFunction::new(
                pointer,
                context.generation,
                context.bridge.clone(),
            )),
        ),
        WireValue::Escape(Escape::HostFunction { handle, name }) => {
            match context.resolve_host(handle) {
                Some(function) => Value::Function(Function::Host(function)),
                None => {
                    debug!(%handle, name, "Host function reference no longer resolves");
                    Value::Undefined
                },
            }
        },
        WireValue::Unrecognized(map) => {
            warn!(
                keys = ?map.keys().collect::<Vec<_>>(),
                "Unrecognized escape on the wire, passing through as a plain object"
            );
            Value::from(serde_json::Value::Object(map))
        },
    }
}

/// Decode wire text.
///
/// # Errors
///
/// Returns a [`ProtocolError`](glomium_wire::ProtocolError) if the text is
/// not valid JSON.
pub fn decode_text(text: &str, context: &BoundContext) -> ProtocolResult<Value> {
    let wire: WireValue = serde_json::from_str(text)?;
    Ok(decode(wire, context))
}
