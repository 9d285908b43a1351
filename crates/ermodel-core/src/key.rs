//! Hashable primary-key tuples.

use crate::value::Value;
use std::hash::{Hash, Hasher};

/// An ordered tuple of primary-key values usable as a map key.
///
/// Equality follows [`Value::sql_eq`], so an `Int(1)` and a `BigInt(1)`
/// identify the same row. Floating point components compare bitwise.
#[derive(Debug, Clone, Default)]
pub struct PrimaryKey(Vec<Value>);

impl PrimaryKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// A key with a NULL component cannot identify a row yet.
    pub fn is_complete(&self) -> bool {
        !self.0.is_empty() && !self.0.iter().any(Value::is_null)
    }
}

impl From<Vec<Value>> for PrimaryKey {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl PartialEq for PrimaryKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self.0.iter().zip(&other.0).all(|(a, b)| match (a, b) {
                (Value::Double(x), Value::Double(y)) => x.to_bits() == y.to_bits(),
                (Value::Float(x), Value::Float(y)) => x.to_bits() == y.to_bits(),
                _ => a.sql_eq(b),
            })
    }
}

impl Eq for PrimaryKey {}

impl Hash for PrimaryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for value in &self.0 {
            hash_single_value(value, state);
        }
    }
}

/// Hash a single Value into the hasher. Integer widths share one tag.
fn hash_single_value(v: &Value, hasher: &mut impl Hasher) {
    match v {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::TinyInt(_) | Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) => {
            2u8.hash(hasher);
            v.as_i64().hash(hasher);
        }
        Value::Float(f) => {
            3u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        Value::Double(f) => {
            4u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        Value::Decimal(s) => {
            5u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Text(s) => {
            6u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Bytes(b) => {
            7u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Date(d) => {
            8u8.hash(hasher);
            d.hash(hasher);
        }
        Value::Time(t) => {
            9u8.hash(hasher);
            t.hash(hasher);
        }
        Value::Timestamp(t) => {
            10u8.hash(hasher);
            t.hash(hasher);
        }
        Value::Interval(t) => {
            11u8.hash(hasher);
            t.hash(hasher);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn integer_widths_identify_the_same_row() {
        let mut map = HashMap::new();
        map.insert(PrimaryKey::new(vec![Value::BigInt(1)]), "node");
        assert_eq!(map.get(&PrimaryKey::new(vec![Value::Int(1)])), Some(&"node"));
        assert_eq!(map.get(&PrimaryKey::new(vec![Value::Int(2)])), None);
    }

    #[test]
    fn composite_keys_are_ordered() {
        let a = PrimaryKey::new(vec![Value::BigInt(1), Value::BigInt(2)]);
        let b = PrimaryKey::new(vec![Value::BigInt(2), Value::BigInt(1)]);
        assert_ne!(a, b);
    }

    #[test]
    fn null_component_is_incomplete() {
        assert!(!PrimaryKey::new(vec![Value::Null]).is_complete());
        assert!(!PrimaryKey::default().is_complete());
        assert!(PrimaryKey::new(vec![Value::from("x")]).is_complete());
    }
}
