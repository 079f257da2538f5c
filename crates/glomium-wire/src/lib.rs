//! Glomium Wire - the JSON protocol spoken across the host/sandbox boundary.
//!
//! This crate provides:
//! - [`WireValue`], the JSON-safe projection of a script value
//! - [`Request`], sent by the host bridge to the engine
//! - [`Event`], emitted by the engine back to the host bridge
//! - [`InvocationResponse`], the reply to a host function invocation
//! - Gas descriptors and the opaque identifiers used for correlation
//! - The [`Engine`] trait through which the host drives an interpreter
//!
//! # Escapes
//!
//! JSON cannot carry functions or `undefined`. Instead of smuggling a
//! reserved marker field through ordinary objects, every JSON object on the
//! wire is a single-key tagged envelope ([`Escape`]). Plain objects travel
//! under the `object` tag, so user data can never be mistaken for an escape.
//!
//! ```rust
//! use glomium_wire::{Escape, WireObject, WireValue};
//!
//! let mut object = WireObject::new();
//! object.insert("kind", WireValue::from("function"));
//! let value = WireValue::Escape(Escape::Object(object));
//!
//! let text = serde_json::to_string(&value).unwrap();
//! assert_eq!(text, r#"{"object":{"kind":"function"}}"#);
//! assert_eq!(serde_json::from_str::<WireValue>(&text).unwrap(), value);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod engine;
mod error;
mod gas;
mod ids;
mod message;
mod value;

pub use engine::{Engine, EngineError, EventSink};
pub use error::{ProtocolError, ProtocolResult};
pub use gas::{GasConfig, GasDescriptor, GasSnapshot};
pub use ids::{CallId, ContextHandle, ExecutionToken, FunctionHandle, HeapPointer};
pub use message::{Event, EventHeader, InvocationResponse, LogLevel, Request};
pub use value::{Escape, MAX_VALUE_DEPTH, WireObject, WireValue};
