use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::schema::ColumnType;

/// A column value in its portable form.
///
/// Fragments and indexes are JSON documents, so a value is one of the JSON
/// scalars. Types without a faithful JSON representation (numerics, dates,
/// times, timestamps) travel as strings and are interpreted through the
/// column's declared [`ColumnType`] when compared.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// A full row tuple, ordered by column ordinal.
pub type Row = Vec<Value>;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::Str(_) => 4,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Compare two non-null values as members of a column with the given
    /// declared type. `None` means the values cannot be interpreted as that
    /// type, in which case index checks fall back to "satisfiable".
    pub fn cmp_typed(&self, other: &Value, col_type: ColumnType) -> Option<Ordering> {
        match col_type {
            ColumnType::Integer => Some(self.as_i64()?.cmp(&other.as_i64()?)),
            ColumnType::Real | ColumnType::Numeric => {
                Some(self.as_f64()?.total_cmp(&other.as_f64()?))
            }
            // ISO-8601 renderings sort lexicographically.
            ColumnType::Text | ColumnType::Date | ColumnType::Time | ColumnType::Timestamp => {
                Some(self.as_str()?.cmp(other.as_str()?))
            }
            ColumnType::Boolean | ColumnType::Json => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => f.write_str(s),
        }
    }
}

// Total equality: floats compare by bit pattern so rows can key hash maps.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Str(s) => s.hash(state),
        }
    }
}

// Rank-then-value order; gives staging tables a deterministic iteration
// order even for untyped (mixed) key tuples.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
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

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering::*;

    #[test]
    fn typed_comparison_casts_strings_back() {
        // Numerics and dates are serialized to strings for portability.
        let a = Value::Str("10.5".into());
        let b = Value::Str("9.25".into());
        assert_eq!(a.cmp_typed(&b, ColumnType::Numeric), Some(Greater));
        // As text, "10.5" < "9.25".
        assert_eq!(a.cmp_typed(&b, ColumnType::Text), Some(Less));

        let d1 = Value::Str("2024-01-31".into());
        let d2 = Value::Str("2024-02-01".into());
        assert_eq!(d1.cmp_typed(&d2, ColumnType::Date), Some(Less));
    }

    #[test]
    fn unparseable_values_do_not_compare() {
        let v = Value::Str("not a number".into());
        assert_eq!(v.cmp_typed(&Value::Int(3), ColumnType::Integer), None);
    }

    #[test]
    fn json_round_trip_is_untagged() {
        let row: Row = vec![
            Value::Int(1),
            Value::Str("a".into()),
            Value::Null,
            Value::Bool(true),
        ];
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"[1,"a",null,true]"#);
        let back: Row = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }
}
