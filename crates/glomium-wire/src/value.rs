//! JSON-safe projection of script values.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{FunctionHandle, HeapPointer};

/// Largest magnitude below which every integer is exactly representable.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Deepest JSON nesting a single value may have on the wire.
///
/// Message framing adds at most two levels on top, which keeps every
/// message under the JSON parser's own nesting limit of 128. Requests and
/// responses deeper than this are refused before they are sent, and
/// messages carrying deeper values fail to parse.
pub const MAX_VALUE_DEPTH: usize = 100;

/// A value as it travels across the boundary.
///
/// Scalars and arrays are plain JSON. Every JSON object is an [`Escape`]
/// envelope; any other object shape lands in [`WireValue::Unrecognized`]
/// so newer peers can add escape kinds without breaking older ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireValue {
    /// JSON `null`.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON number, always carried as a double.
    Number(#[serde(serialize_with = "serialize_number")] f64),
    /// JSON string.
    String(String),
    /// JSON array.
    Array(Vec<WireValue>),
    /// A tagged envelope.
    Escape(Escape),
    /// An object that is not a known envelope.
    Unrecognized(serde_json::Map<String, serde_json::Value>),
}

/// Tagged envelopes for values plain JSON cannot express.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Escape {
    /// A plain object. Keys are user data and never interpreted.
    Object(WireObject),
    /// The absent value.
    Undefined {},
    /// Host function exposed to the sandbox, addressed by registry handle.
    HostFunction {
        /// Registry handle.
        handle: FunctionHandle,
        /// Declared name, empty when anonymous.
        name: String,
    },
    /// Sandbox function exposed to the host, addressed by heap pointer.
    SandboxFunction {
        /// Opaque interpreter reference.
        pointer: HeapPointer,
    },
}

impl WireValue {
    /// The `undefined` envelope.
    #[must_use]
    pub fn undefined() -> Self {
        Self::Escape(Escape::Undefined {})
    }

    /// Whether this is the `undefined` envelope.
    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Escape(Escape::Undefined {}))
    }

    /// Script truthiness: `false` for null, undefined, `false`, zero, NaN
    /// and the empty string.
    #[must_use]
    pub fn is_falsy(&self) -> bool {
        match self {
            Self::Null | Self::Escape(Escape::Undefined {}) => true,
            Self::Bool(b) => !b,
            Self::Number(n) => *n == 0.0 || n.is_nan(),
            Self::String(s) => s.is_empty(),
            _ => false,
        }
    }

    /// JSON nesting depth of the serialized value. Scalars are 0; each
    /// array adds one level and each envelope adds two.
    #[must_use]
    pub fn depth(&self) -> usize {
        match self {
            Self::Null | Self::Bool(_) | Self::Number(_) | Self::String(_) => 0,
            Self::Array(items) => nested(items.iter().map(Self::depth), 1),
            Self::Escape(Escape::Object(object)) => {
                nested(object.iter().map(|(_, v)| v.depth()), 2)
            },
            Self::Escape(Escape::Undefined {} | Escape::SandboxFunction { .. }) => 2,
            Self::Escape(Escape::HostFunction { .. }) => 3,
            Self::Unrecognized(map) => nested(map.values().map(json_depth), 1),
        }
    }

    /// Check the value against [`MAX_VALUE_DEPTH`].
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TooDeep`] when the value nests deeper.
    pub fn check_depth(&self) -> ProtocolResult<()> {
        let depth = self.depth();
        if depth > MAX_VALUE_DEPTH {
            return Err(ProtocolError::TooDeep {
                depth,
                limit: MAX_VALUE_DEPTH,
            });
        }
        Ok(())
    }

    /// Project plain JSON onto the wire, wrapping objects in envelopes.
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from_json).collect())
            },
            serde_json::Value::Object(map) => Self::Escape(Escape::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            )),
        }
    }

    /// Convert back to plain JSON.
    ///
    /// Returns `None` for values JSON cannot express (functions and
    /// `undefined`). Inside arrays those become `null`; inside objects the
    /// key is omitted.
    #[must_use]
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
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
            Self::Escape(Escape::Object(object)) => Some(serde_json::Value::Object(
                object
                    .iter()
                    .filter_map(|(k, v)| v.to_json().map(|v| (k.to_owned(), v)))
                    .collect(),
            )),
            Self::Escape(_) => None,
            Self::Unrecognized(map) => Some(serde_json::Value::Object(map.clone())),
        }
    }
}

fn nested(children: impl Iterator<Item = usize>, own: usize) -> usize {
    children.max().unwrap_or(0).saturating_add(own)
}

fn json_depth(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Array(items) => nested(items.iter().map(json_depth), 1),
        serde_json::Value::Object(map) => nested(map.values().map(json_depth), 1),
        _ => 0,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(serde_json::Value::Null, serde_json::Value::Number)
    }
}

/// Integral doubles are written without a fractional part, matching how a
/// script engine prints them.
#[allow(clippy::cast_possible_truncation, clippy::trivially_copy_pass_by_ref)]
fn serialize_number<S: Serializer>(n: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        serializer.serialize_i64(*n as i64)
    } else {
        serializer.serialize_f64(*n)
    }
}

impl From<bool> for WireValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for WireValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for WireValue {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<&str> for WireValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for WireValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<WireValue>> for WireValue {
    fn from(items: Vec<WireValue>) -> Self {
        Self::Array(items)
    }
}

impl From<WireObject> for WireValue {
    fn from(object: WireObject) -> Self {
        Self::Escape(Escape::Object(object))
    }
}

/// Insertion-ordered object body.
///
/// Serialized as a JSON object whose key order follows insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireObject {
    entries: Vec<(String, WireValue)>,
}

impl WireObject {
    /// Create an empty object.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key, replacing an existing value in place.
    pub fn insert(&mut self, key: impl Into<String>, value: WireValue) {
        let key = key.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Look up a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&WireValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
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
    pub fn iter(&self) -> impl Iterator<Item = (&str, &WireValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, WireValue)> for WireObject {
    fn from_iter<I: IntoIterator<Item = (String, WireValue)>>(iter: I) -> Self {
        let mut object = Self::new();
        for (key, value) in iter {
            object.insert(key, value);
        }
        object
    }
}

impl IntoIterator for WireObject {
    type Item = (String, WireValue);
    type IntoIter = std::vec::IntoIter<(String, WireValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl Serialize for WireObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for WireObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ObjectVisitor;

        impl<'de> Visitor<'de> for ObjectVisitor {
            type Value = WireObject;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<WireObject, A::Error> {
                let mut object = WireObject::new();
                while let Some((key, value)) = access.next_entry::<String, WireValue>()? {
                    object.insert(key, value);
                }
                Ok(object)
            }
        }

        deserializer.deserialize_map(ObjectVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> WireValue {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn scalars_are_plain_json() {
        assert_eq!(parse("null"), WireValue::Null);
        assert_eq!(parse("true"), WireValue::Bool(true));
        assert_eq!(parse("5"), WireValue::Number(5.0));
        assert_eq!(parse("2.5"), WireValue::Number(2.5));
        assert_eq!(parse(r#""hi""#), WireValue::from("hi"));
    }

    #[test]
    fn integral_numbers_print_without_fraction() {
        assert_eq!(serde_json::to_string(&WireValue::Number(6.0)).unwrap(), "6");
        assert_eq!(serde_json::to_string(&WireValue::Number(-1.5)).unwrap(), "-1.5");
    }

    #[test]
    fn undefined_envelope() {
        let text = serde_json::to_string(&WireValue::undefined()).unwrap();
        assert_eq!(text, r#"{"undefined":{}}"#);
        assert!(parse(&text).is_undefined());
    }

    #[test]
    fn host_function_envelope() {
        let value = WireValue::Escape(Escape::HostFunction {
            handle: FunctionHandle::new(0, 3),
            name: "wait".into(),
        });
        let text = serde_json::to_string(&value).unwrap();
        assert_eq!(
            text,
            r#"{"host_function":{"handle":{"generation":0,"index":3},"name":"wait"}}"#
        );
        assert_eq!(parse(&text), value);
    }

    #[test]
    fn sandbox_function_envelope() {
        let value = parse(r#"{"sandbox_function":{"pointer":140234}}"#);
        assert_eq!(
            value,
            WireValue::Escape(Escape::SandboxFunction {
                pointer: HeapPointer(140_234)
            })
        );
    }

    #[test]
    fn marker_shaped_user_data_stays_data() {
        let text = r#"{"object":{"engine-internal properties":{"object":{"kind":"function"}},"undefined":{"object":{}}}}"#;
        let WireValue::Escape(Escape::Object(object)) = parse(text) else {
            panic!("expected object envelope");
        };
        assert_eq!(object.len(), 2);
        assert!(matches!(
            object.get("undefined"),
            Some(WireValue::Escape(Escape::Object(inner))) if inner.is_empty()
        ));
        assert_eq!(
            serde_json::to_string(&WireValue::from(object)).unwrap(),
            text
        );
    }

    #[test]
    fn unknown_envelope_is_preserved() {
        let value = parse(r#"{"symbol":{"description":"x"}}"#);
        let WireValue::Unrecognized(map) = value else {
            panic!("expected unrecognized");
        };
        assert!(map.contains_key("symbol"));
    }

    #[test]
    fn object_key_order_is_preserved() {
        let WireValue::Escape(Escape::Object(object)) =
            parse(r#"{"object":{"z":1,"a":2,"m":3}}"#)
        else {
            panic!("expected object envelope");
        };
        let keys: Vec<&str> = object.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["z", "a", "m"]);
    }

    #[test]
    fn json_projection_round_trip() {
        let json = serde_json::json!({"a": [1, "two", null, {"b": false}], "c": 2.5});
        let wire = WireValue::from_json(json.clone());
        assert_eq!(wire.to_json(), Some(json));
    }

    #[test]
    fn to_json_drops_inexpressible_values() {
        let mut object = WireObject::new();
        object.insert("gone", WireValue::undefined());
        object.insert("kept", WireValue::from(1));
        let wire = WireValue::Array(vec![WireValue::from(object), WireValue::undefined()]);
        assert_eq!(
            wire.to_json(),
            Some(serde_json::json!([{"kept": 1}, null]))
        );
    }

    #[test]
    fn falsiness() {
        assert!(WireValue::Bool(false).is_falsy());
        assert!(WireValue::Number(0.0).is_falsy());
        assert!(WireValue::from("").is_falsy());
        assert!(WireValue::undefined().is_falsy());
        assert!(!WireValue::from("0").is_falsy());
        assert!(!WireValue::Array(vec![]).is_falsy());
    }

    fn nest_arrays(levels: usize) -> WireValue {
        (0..levels).fold(WireValue::from(1), |inner, _| WireValue::Array(vec![inner]))
    }

    #[test]
    fn depth_counts_json_levels() {
        assert_eq!(WireValue::from("x").depth(), 0);
        assert_eq!(WireValue::Array(vec![]).depth(), 1);
        assert_eq!(WireValue::undefined().depth(), 2);

        let mut inner = WireObject::new();
        inner.insert("a", WireValue::Array(vec![WireValue::from(1)]));
        let object = WireValue::from(inner);
        assert_eq!(object.depth(), 3);
        let text = serde_json::to_string(&object).unwrap();
        assert_eq!(text, r#"{"object":{"a":[1]}}"#);
    }

    #[test]
    fn values_past_the_cap_are_refused() {
        assert!(nest_arrays(MAX_VALUE_DEPTH).check_depth().is_ok());
        assert!(matches!(
            nest_arrays(MAX_VALUE_DEPTH + 1).check_depth(),
            Err(ProtocolError::TooDeep { depth, limit: MAX_VALUE_DEPTH }) if depth == MAX_VALUE_DEPTH + 1
        ));
    }
}
