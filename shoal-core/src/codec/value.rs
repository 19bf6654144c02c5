//! In-memory representation of encodable values.

use std::collections::BTreeMap;

use bytes::Bytes;

/// A canonical codec value.
///
/// Maps are backed by a `BTreeMap`, so keys are unique and iterate in
/// ascending raw byte order regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Bytes(Bytes),
    List(Vec<Value>),
    Map(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Creates a byte string value from UTF-8 text.
    pub fn string(text: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Builds a map from `(key, value)` pairs; later duplicates replace earlier ones.
    pub fn map<K, I>(entries: I) -> Self
    where
        K: AsRef<[u8]>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(key, value)| (Bytes::copy_from_slice(key.as_ref()), value))
                .collect(),
        )
    }

    /// Encodes this value into its canonical byte form.
    pub fn encode(&self) -> Vec<u8> {
        super::encode(self)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the byte string as UTF-8 text, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes()
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Looks up `key` when this value is a map.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_map()?.get(key)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::string(text)
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Bytes(Bytes::from(text.into_bytes()))
    }
}

impl From<Bytes> for Value {
    fn from(bytes: Bytes) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(bytes))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<Bytes, Value>> for Value {
    fn from(map: BTreeMap<Bytes, Value>) -> Self {
        Value::Map(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors_match_variant() {
        let value = Value::map([
            ("count", Value::Integer(3)),
            ("name", Value::from("shoal")),
            ("items", Value::List(vec![Value::Integer(1)])),
        ]);

        assert_eq!(value.get(b"count").and_then(Value::as_integer), Some(3));
        assert_eq!(value.get(b"name").and_then(Value::as_str), Some("shoal"));
        assert_eq!(value.get(b"items").and_then(Value::as_list).map(<[Value]>::len), Some(1));
        assert!(value.get(b"missing").is_none());
        assert!(Value::Integer(1).get(b"count").is_none());
    }

    #[test]
    fn test_invalid_utf8_is_not_a_str() {
        let value = Value::from(vec![0xff, 0xfe]);
        assert!(value.as_str().is_none());
        assert_eq!(value.as_bytes().map(|b| b.len()), Some(2));
    }
}
