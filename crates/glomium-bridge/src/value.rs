//! Native host-side values.
//!
//! [`Value`] mirrors what a script can hold: JSON-like data plus
//! `undefined` and functions. Functions come from either side of the
//! boundary: a [`HostFunction`] is a native closure the sandbox may call,
//! a [`SandboxFunction`] is a proxy for a script function the host may call.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use glomium_wire::HeapPointer;

use crate::bridge::BridgeInner;
use crate::error::{BridgeError, BridgeResult};

/// A value exchanged with the sandbox.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    /// The absent value.
    #[default]
    Undefined,
    /// `null`.
    Null,
    /// A boolean.
    Bool(bool),
    /// A number (always a double, as in script).
    Number(f64),
    /// A string.
    String(String),
    /// An array.
    Array(Vec<Value>),
    /// A plain object.
    Object(Object),
    /// A callable.
    Function(Function),
}

impl Value {
    /// Whether this is `undefined`.
    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    /// Whether this is `null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The boolean, if this is one.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The number, if this is one.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The string, if this is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The elements, if this is an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// The object, if this is one.
    #[must_use]
    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }

    /// The function, if this is one.
    #[must_use]
    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Self::Function(function) => Some(function),
            _ => None,
        }
    }

    /// Convert to plain JSON.
    ///
    /// Returns `None` for `undefined` and functions. Nested inside arrays
    /// they become `null`; nested inside objects the key is omitted.
    #[must_use]
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Self::Undefined | Self::Function(_) => None,
            Self::Null => Some(serde_json::Value::Null),
            Self::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Self::Number(n) => Some(number_to_json(*n)),
            Self::String(s) => Some(serde_json::Value::String(s.clone())),
            Self::Array(items) => Some(serde_json::Value::Array(
                items
                    .iter()
                    .map(|item| item.to_json().unwrap_or(serde_json::Value::Null))
                    .collect(),
            )),
            Self::Object(object) => Some(serde_json::Value::Object(
                object
                    .iter()
                    .filter_map(|(k, v)| v.to_json().map(|v| (k.to_owned(), v)))
                    .collect(),
            )),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => f.write_str(&format_number(*n)),
            Self::String(s) => f.write_str(s),
            Self::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            },
            Self::Object(_) => match self.to_json() {
                Some(json) => write!(f, "{json}"),
                None => f.write_str("[object Object]"),
            },
            Self::Function(function) => write!(f, "[function {}]", function.name()),
        }
    }
}

/// Render a double the way script does: no trailing `.0` on integers.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_owned()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_owned()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i128)
    } else {
        format!("{n}")
    }
}

#[allow(clippy::cast_possible_truncation)]
fn number_to_json(n: f64) -> serde_json::Value {
    // 2^53: beyond this integral doubles stop being exact.
    if n.fract() == 0.0 && n.abs() <= 9_007_199_254_740_992.0 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(serde_json::Value::Null, serde_json::Value::Number)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from).collect())
            },
            serde_json::Value::Object(map) => Self::Object(
                map.into_iter().map(|(k, v)| (k, Self::from(v))).collect(),
            ),
        }
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Self::Undefined
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<i64> for Value {
    #[allow(clippy::cast_precision_loss)]
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

impl From<Object> for Value {
    fn from(object: Object) -> Self {
        Self::Object(object)
    }
}

impl From<Function> for Value {
    fn from(function: Function) -> Self {
        Self::Function(function)
    }
}

impl From<HostFunction> for Value {
    fn from(function: HostFunction) -> Self {
        Self::Function(Function::Host(function))
    }
}

impl From<SandboxFunction> for Value {
    fn from(function: SandboxFunction) -> Self {
        Self::Function(Function::Sandbox(function))
    }
}

/// Insertion-ordered plain object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Object {
    entries: Vec<(String, Value)>,
}

impl Object {
    /// Create an empty object.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key, replacing an existing value in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Builder-style [`Object::insert`].
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Look up a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Remove a key, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the object has no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterate keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

impl FromIterator<(String, Value)> for Object {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut object = Self::new();
        for (key, value) in iter {
            object.insert(key, value);
        }
        object
    }
}

impl IntoIterator for Object {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Something callable.
#[derive(Clone, PartialEq)]
pub enum Function {
    /// A native closure exposed to the sandbox.
    Host(HostFunction),
    /// A proxy for a function living in the sandbox.
    Sandbox(SandboxFunction),
}

impl Function {
    /// Declared name. Sandbox proxies are anonymous.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Host(function) => function.name(),
            Self::Sandbox(_) => "",
        }
    }

    /// Call the function from the host.
    ///
    /// # Errors
    ///
    /// A host function failing yields [`BridgeError::HostFunction`]; a
    /// sandbox proxy fails as described on [`SandboxFunction::call`].
    pub async fn call(&self, args: Vec<Value>) -> BridgeResult<Value> {
        match self {
            Self::Host(function) => function
                .invoke(args)
                .await
                .map_err(|error| BridgeError::HostFunction { error }),
            Self::Sandbox(function) => function.call(args).await,
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host(function) => function.fmt(f),
            Self::Sandbox(function) => function.fmt(f),
        }
    }
}

/// The future a host function returns. `Err` carries the thrown value.
pub type HostFuture = Pin<Box<dyn Future<Output = Result<Value, Value>> + Send + 'static>>;

type HostFn = dyn Fn(Vec<Value>) -> HostFuture + Send + Sync;

/// A native function the sandbox may call.
///
/// Cheap to clone; clones share identity.
#[derive(Clone)]
pub struct HostFunction {
    name: Arc<str>,
    func: Arc<HostFn>,
}

impl HostFunction {
    /// Wrap an async closure.
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Value>> + Send + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            func: Arc::new(move |args| Box::pin(func(args)) as HostFuture),
        }
    }

    /// Wrap a synchronous closure.
    pub fn from_sync<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, Value> + Send + Sync + 'static,
    {
        Self::new(name, move |args| std::future::ready(func(args)))
    }

    /// Declared name, empty when anonymous.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start a call.
    #[must_use]
    pub fn invoke(&self, args: Vec<Value>) -> HostFuture {
        (self.func)(args)
    }
}

impl PartialEq for HostFunction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostFunction").field(&self.name).finish()
    }
}

/// Host-side proxy for a function that lives in the sandbox.
///
/// Calling it is a full round trip through the bridge that produced it.
#[derive(Clone)]
pub struct SandboxFunction {
    pointer: HeapPointer,
    generation: u64,
    bridge: Weak<BridgeInner>,
}

impl SandboxFunction {
    pub(crate) fn new(pointer: HeapPointer, generation: u64, bridge: Weak<BridgeInner>) -> Self {
        Self {
            pointer,
            generation,
            bridge,
        }
    }

    /// Opaque interpreter reference.
    #[must_use]
    pub fn pointer(&self) -> HeapPointer {
        self.pointer
    }

    /// Generation of the context the proxy was decoded under.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn is_from(&self, bridge: &Weak<BridgeInner>) -> bool {
        Weak::ptr_eq(&self.bridge, bridge)
    }

    /// Call the sandbox function.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::BridgeClosed`] if the owning bridge was dropped.
    /// - [`BridgeError::ContextSuperseded`] if the bridge was cleared since
    ///   the proxy was obtained.
    /// - Whatever the call itself rejects with (see [`crate::Bridge::run`]).
    pub async fn call(&self, args: Vec<Value>) -> BridgeResult<Value> {
        let bridge = self.bridge.upgrade().ok_or(BridgeError::BridgeClosed)?;
        bridge.call_pointer(self.pointer, self.generation, args).await
    }
}

impl PartialEq for SandboxFunction {
    fn eq(&self, other: &Self) -> bool {
        self.pointer == other.pointer
            && self.generation == other.generation
            && Weak::ptr_eq(&self.bridge, &other.bridge)
    }
}

impl fmt::Debug for SandboxFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxFunction")
            .field("pointer", &self.pointer)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}
