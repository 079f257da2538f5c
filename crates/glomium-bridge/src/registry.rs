//! Host function registry.
//!
//! Host functions cross the boundary as handles into this registry. A
//! registry belongs to one context generation; `clear` discards it along
//! with the context, so handles minted before a clear stop resolving.

use glomium_wire::FunctionHandle;
use tracing::trace;

use crate::value::HostFunction;

/// Append-only table of host functions for one context generation.
///
/// Handles are never reused within a generation, and registering the same
/// function twice yields two distinct handles.
#[derive(Debug)]
pub struct FunctionRegistry {
    generation: u64,
    slots: Vec<HostFunction>,
}

impl FunctionRegistry {
    /// Create an empty registry for `generation`.
    #[must_use]
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            slots: Vec::new(),
        }
    }

    /// The generation this registry mints handles for.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Register a function and return its handle.
    pub fn register(&mut self, function: HostFunction) -> FunctionHandle {
        let index = u64::try_from(self.slots.len()).unwrap_or(u64::MAX);
        trace!(
            name = function.name(),
            generation = self.generation,
            index,
            "Registered host function"
        );
        self.slots.push(function);
        FunctionHandle::new(self.generation, index)
    }

    /// Resolve a handle minted by this registry.
    ///
    /// Handles from another generation or past the end return `None`.
    #[must_use]
    pub fn resolve(&self, handle: FunctionHandle) -> Option<HostFunction> {
        if handle.generation != self.generation {
            return None;
        }
        let index = usize::try_from(handle.index).ok()?;
        self.slots.get(index).cloned()
    }

    /// Number of registered functions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
