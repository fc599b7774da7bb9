//! # Shard Key Domain
//!
//! Values used to order and bound snapshot splits.
//!
//! A split bound is either one of the two sentinels or a concrete key row:
//!
//! ```text
//! Min  <  Key([..])  <  Key([..])  <  ...  <  Max
//! ```
//!
//! Key rows compare lexicographically, field by field, in key schema order.
//! Values of different types compare by type rank (`Null < Bool < Int < String`),
//! so a collection with mixed-type keys still has a total order.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of a shard key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    Bool,
    Int,
    String,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Bool => "bool",
            KeyType::Int => "int",
            KeyType::String => "string",
        }
    }
}

/// A single shard key value.
///
/// Variant order is the cross-type sort order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyValue {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
}

impl KeyValue {
    /// Check if this value is admissible for a field of the given type.
    ///
    /// `Null` is admissible for every type.
    pub fn matches(&self, key_type: KeyType) -> bool {
        matches!(
            (self, key_type),
            (KeyValue::Null, _)
                | (KeyValue::Bool(_), KeyType::Bool)
                | (KeyValue::Int(_), KeyType::Int)
                | (KeyValue::String(_), KeyType::String)
        )
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<i32> for KeyValue {
    fn from(v: i32) -> Self {
        KeyValue::Int(v as i64)
    }
}

impl From<bool> for KeyValue {
    fn from(v: bool) -> Self {
        KeyValue::Bool(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::String(v.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(v: String) -> Self {
        KeyValue::String(v)
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Null => write!(f, "null"),
            KeyValue::Bool(v) => write!(f, "{}", v),
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::String(v) => write!(f, "'{}'", v),
        }
    }
}

/// A named, typed field of the shard key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyField {
    pub name: String,
    pub key_type: KeyType,
}

impl KeyField {
    pub fn new(name: impl Into<String>, key_type: KeyType) -> Self {
        Self {
            name: name.into(),
            key_type,
        }
    }
}

/// Ordered shard key fields used to order and bound splits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeySchema(Vec<KeyField>);

impl KeySchema {
    pub fn new(fields: Vec<KeyField>) -> Self {
        Self(fields)
    }

    /// Single-field shard key.
    pub fn single(name: impl Into<String>, key_type: KeyType) -> Self {
        Self(vec![KeyField::new(name, key_type)])
    }

    pub fn fields(&self) -> &[KeyField] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Field names in key order.
    pub fn field_names(&self) -> Vec<&str> {
        self.0.iter().map(|f| f.name.as_str()).collect()
    }

    /// Check that a key row has one admissible value per field.
    pub fn accepts(&self, row: &[KeyValue]) -> bool {
        row.len() == self.0.len()
            && row
                .iter()
                .zip(&self.0)
                .all(|(value, field)| value.matches(field.key_type))
    }
}

/// Bound of a split in the key domain.
///
/// `Min` and `Max` are the open-ended sentinels used by the first and
/// last split of a collection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyBound {
    Min,
    Key(Vec<KeyValue>),
    Max,
}

impl KeyBound {
    /// Bound from a single key value.
    pub fn value(v: impl Into<KeyValue>) -> Self {
        KeyBound::Key(vec![v.into()])
    }

    pub fn is_min(&self) -> bool {
        matches!(self, KeyBound::Min)
    }

    pub fn is_max(&self) -> bool {
        matches!(self, KeyBound::Max)
    }

    /// Concrete key row, if this bound is not a sentinel.
    pub fn as_row(&self) -> Option<&[KeyValue]> {
        match self {
            KeyBound::Key(row) => Some(row),
            _ => None,
        }
    }
}

impl fmt::Display for KeyBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyBound::Min => write!(f, "MIN"),
            KeyBound::Max => write!(f, "MAX"),
            KeyBound::Key(row) if row.len() == 1 => write!(f, "{}", row[0]),
            KeyBound::Key(row) => {
                write!(f, "(")?;
                for (i, v) in row.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_bracket_every_key() {
        let keys = [
            KeyBound::value(KeyValue::Null),
            KeyBound::value(i64::MIN),
            KeyBound::value(i64::MAX),
            KeyBound::value("zzz"),
        ];
        for key in &keys {
            assert!(KeyBound::Min < *key);
            assert!(*key < KeyBound::Max);
        }
    }

    #[test]
    fn test_cross_type_order() {
        assert!(KeyValue::Null < KeyValue::Bool(false));
        assert!(KeyValue::Bool(true) < KeyValue::Int(-5));
        assert!(KeyValue::Int(i64::MAX) < KeyValue::from("a"));
    }

    #[test]
    fn test_composite_keys_compare_lexicographically() {
        let a = KeyBound::Key(vec![1.into(), "b".into()]);
        let b = KeyBound::Key(vec![1.into(), "c".into()]);
        let c = KeyBound::Key(vec![2.into(), "a".into()]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_key_schema_accepts() {
        let schema = KeySchema::new(vec![
            KeyField::new("tenant", KeyType::String),
            KeyField::new("id", KeyType::Int),
        ]);
        assert!(schema.accepts(&["acme".into(), 7.into()]));
        assert!(schema.accepts(&[KeyValue::Null, 7.into()]));
        assert!(!schema.accepts(&[7.into(), "acme".into()]));
        assert!(!schema.accepts(&["acme".into()]));
        assert_eq!(schema.field_names(), vec!["tenant", "id"]);
    }

    #[test]
    fn test_bound_display() {
        assert_eq!(KeyBound::Min.to_string(), "MIN");
        assert_eq!(KeyBound::value(250).to_string(), "250");
        assert_eq!(
            KeyBound::Key(vec!["a".into(), 1.into()]).to_string(),
            "('a', 1)"
        );
    }
}
