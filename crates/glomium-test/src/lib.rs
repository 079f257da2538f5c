//! Glomium Test - Shared test utilities for the Glomium sandbox bridge.
//!
//! This crate provides a working in-process [`Engine`](glomium_wire::Engine)
//! and test helpers that can be used across Glomium crates as a
//! dev-dependency.
//!
//! [`ToyEngine`] interprets a tiny expression language with globals,
//! closures, host calls, `throw`, `loop` and `print`, metered by
//! [`GasMeter`]. It is enough to drive every request and event of the
//! protocol end to end.
//!
//! # Usage
//!
//! ```rust,ignore
//! use glomium_bridge::Bridge;
//! use glomium_test::{ToyEngine, test_gas_config};
//!
//! #[tokio::test]
//! async fn test_eval() {
//!     let bridge = Bridge::new(ToyEngine::new(), test_gas_config()).unwrap();
//!     bridge.set("x", 5).await.unwrap();
//!     assert_eq!(bridge.run("x + 1").await.unwrap().as_f64(), Some(6.0));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod capture;
pub mod engine;
pub mod fixtures;
pub mod gas;
mod interp;
mod script;

pub use capture::{CapturedLog, LogCapture};
pub use engine::ToyEngine;
pub use fixtures::*;
pub use gas::{GasMeter, OutOfGas};
pub use interp::MAX_CALL_DEPTH;
