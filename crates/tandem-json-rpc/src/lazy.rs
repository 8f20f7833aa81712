//! Decode-once storage for params and result payloads.
//!
//! Inbound messages keep their `params`/`result` fields as raw JSON text and
//! only materialize a typed value when a consumer actually asks for one. The
//! first access decodes and memoizes; later accesses return the cached tree.

use std::fmt;
use std::sync::OnceLock;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::value::RawValue;

/// Opaque JSON text with a thread-safe decode-once cell.
///
/// Serializes as its raw text, so a value that was never materialized is
/// forwarded byte-for-byte.
pub struct LazyValue {
    raw: Box<RawValue>,
    cached: OnceLock<Value>,
}

impl LazyValue {
    /// Wrap already-isolated JSON text. Fails if the text is not a single
    /// well-formed JSON value.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        Ok(Self {
            raw: RawValue::from_string(text.to_string())?,
            cached: OnceLock::new(),
        })
    }

    /// Build from an already-decoded tree. The cache is seeded so no decode
    /// ever runs.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let raw = RawValue::from_string(serde_json::to_string(&value)?)?;
        let cached = OnceLock::new();
        let _ = cached.set(value);
        Ok(Self { raw, cached })
    }

    /// The raw JSON text, untouched.
    pub fn raw(&self) -> &str {
        self.raw.get()
    }

    /// Materialize the value tree, decoding on first access only.
    pub fn value(&self) -> Result<&Value, serde_json::Error> {
        if let Some(value) = self.cached.get() {
            return Ok(value);
        }
        // A concurrent first access may decode twice; only one result wins
        // the cell and both callers observe the same cached tree.
        let decoded: Value = serde_json::from_str(self.raw.get())?;
        Ok(self.cached.get_or_init(|| decoded))
    }

    /// Decode into a concrete type, via the memoized tree.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(self.value()?)
    }
}

impl Clone for LazyValue {
    fn clone(&self) -> Self {
        let cached = OnceLock::new();
        if let Some(value) = self.cached.get() {
            let _ = cached.set(value.clone());
        }
        Self {
            raw: self.raw.clone(),
            cached,
        }
    }
}

impl fmt::Debug for LazyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LazyValue").field(&self.raw.get()).finish()
    }
}

impl PartialEq for LazyValue {
    fn eq(&self, other: &Self) -> bool {
        if self.raw.get() == other.raw.get() {
            return true;
        }
        // Fall back to structural comparison so key order and whitespace
        // differences do not matter.
        match (self.value(), other.value()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl Serialize for LazyValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LazyValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = Box::<RawValue>::deserialize(deserializer)?;
        Ok(Self {
            raw,
            cached: OnceLock::new(),
        })
    }
}

impl From<Value> for LazyValue {
    fn from(value: Value) -> Self {
        // Serializing a Value back to text cannot fail.
        LazyValue::from_value(value).unwrap_or_else(|_| LazyValue {
            raw: RawValue::from_string("null".to_string()).unwrap(),
            cached: OnceLock::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_once_memoizes() {
        let lazy = LazyValue::from_text(r#"{"custom":"hello"}"#).unwrap();
        let first = lazy.value().unwrap() as *const Value;
        let second = lazy.value().unwrap() as *const Value;
        assert_eq!(first, second);
    }

    #[test]
    fn test_typed_decode() {
        #[derive(Deserialize, PartialEq, Debug)]
        struct Params {
            custom: String,
        }

        let lazy = LazyValue::from_text(r#"{"custom":"hello"}"#).unwrap();
        let params: Params = lazy.decode().unwrap();
        assert_eq!(params.custom, "hello");

        assert!(lazy.decode::<i64>().is_err());
    }

    #[test]
    fn test_serializes_as_raw_text() {
        let lazy = LazyValue::from_text(r#"{"a":1}"#).unwrap();
        assert_eq!(serde_json::to_string(&lazy).unwrap(), r#"{"a":1}"#);
    }

    #[test]
    fn test_structural_equality() {
        let a = LazyValue::from_text(r#"{"a":1,"b":2}"#).unwrap();
        let b = LazyValue::from_text(r#"{ "b": 2, "a": 1 }"#).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_from_value_seeds_cache() {
        let lazy = LazyValue::from_value(json!([1, 2, 3])).unwrap();
        assert_eq!(lazy.value().unwrap(), &json!([1, 2, 3]));
        assert_eq!(lazy.raw(), "[1,2,3]");
    }

    #[test]
    fn test_rejects_malformed_text() {
        assert!(LazyValue::from_text("{not json").is_err());
    }
}
