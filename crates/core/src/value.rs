//! Generic tagged value
//!
//! The self-describing value type carried over the streaming connection.
//! The ETF codec in [`crate::etf`] converts between this and the compact
//! binary wire format; the event-dispatch layer maps it into typed payloads.

/// A generic tagged value decoded from (or encoded to) the wire
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    /// Unsigned integer, up to 64 bits
    Uint(u64),
    /// Signed integer, up to 64 bits
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    /// Key/value pairs in insertion order
    Map(Vec<(String, Value)>),
}

impl Value {
    /// Empty map, ready for `insert`
    pub fn map() -> Self {
        Value::Map(Vec::new())
    }

    /// Insert a key/value pair; replaces an existing key in place
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        if let Value::Map(pairs) = self {
            let key = key.into();
            if let Some(pair) = pairs.iter_mut().find(|(k, _)| *k == key) {
                pair.1 = value;
            } else {
                pairs.push((key, value));
            }
        }
    }

    /// Look up a key in a map value
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(pairs) => pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            Value::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Uint(v) if *v <= i64::MAX as u64 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Equality is numeric across the signed/unsigned split: `Int(5)` equals
/// `Uint(5)`. The wire format stores non-negative integers unsigned, so a
/// signed value that happens to be non-negative round-trips as `Uint`.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Uint(a), Value::Uint(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Uint(a), Value::Int(b)) | (Value::Int(b), Value::Uint(a)) => {
                *b >= 0 && *a == *b as u64
            }
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_insert_preserves_order() {
        let mut map = Value::map();
        map.insert("op", Value::Uint(2));
        map.insert("d", Value::Null);
        map.insert("s", Value::Int(42));

        if let Value::Map(pairs) = &map {
            let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
            assert_eq!(keys, vec!["op", "d", "s"]);
        } else {
            panic!("Expected a map");
        }
    }

    #[test]
    fn test_map_insert_replaces_in_place() {
        let mut map = Value::map();
        map.insert("op", Value::Uint(2));
        map.insert("d", Value::Null);
        map.insert("op", Value::Uint(6));

        assert_eq!(map.get("op"), Some(&Value::Uint(6)));
        if let Value::Map(pairs) = &map {
            assert_eq!(pairs.len(), 2);
            assert_eq!(pairs[0].0, "op");
        }
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::Uint(7).as_u64(), Some(7));
        assert_eq!(Value::Int(-7).as_i64(), Some(-7));
        assert_eq!(Value::Int(7).as_u64(), Some(7));
        assert_eq!(Value::Int(-7).as_u64(), None);
        assert_eq!(Value::from("hey").as_str(), Some("hey"));
        assert!(Value::Null.is_null());
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
    }
}
