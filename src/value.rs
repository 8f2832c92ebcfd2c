//! Host-side values and their SQL-facing types.
//!
//! `Value` is what constants, placeholders and materialized rows carry.
//! `DataType` is the static type attached to columns and bound expressions.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};

/// Static type of a column, parameter or bound expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int,
    Float,
    Text,
    DateTime,
    /// An enum persisted as its underlying integer.
    Enum(String),
    /// A domain object type known to the type descriptor service.
    Object(String),
    Nullable(Box<DataType>),
    Unknown,
}

impl DataType {
    pub fn nullable(inner: DataType) -> Self {
        match inner {
            DataType::Nullable(_) | DataType::Text | DataType::Object(_) | DataType::Unknown => {
                inner
            }
            other => DataType::Nullable(Box::new(other)),
        }
    }

    /// Strips one `Nullable` wrapper, if any.
    pub fn unwrap_nullable(&self) -> &DataType {
        match self {
            DataType::Nullable(inner) => inner,
            other => other,
        }
    }

    /// Whether a NULL is a legal value of this type.
    pub fn is_nullable(&self) -> bool {
        matches!(
            self,
            DataType::Nullable(_) | DataType::Text | DataType::Object(_) | DataType::Unknown
        )
    }

    pub fn is_enum(&self) -> bool {
        matches!(self.unwrap_nullable(), DataType::Enum(_))
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self.unwrap_nullable(), DataType::Int | DataType::Float)
    }

    /// The type the value is stored as. Enums persist as integers.
    pub fn underlying(&self) -> DataType {
        match self {
            DataType::Enum(_) => DataType::Int,
            DataType::Nullable(inner) => DataType::nullable(inner.underlying()),
            other => other.clone(),
        }
    }

    /// The value a default-constructed instance of this type has.
    pub fn default_value(&self) -> Value {
        match self {
            DataType::Bool => Value::Bool(false),
            DataType::Int => Value::Int(0),
            DataType::Float => Value::Float(0.0),
            DataType::Enum(name) => Value::Enum {
                type_name: name.clone(),
                value: 0,
            },
            _ => Value::Null,
        }
    }

    /// The additive identity, used when summing an empty sequence.
    pub fn zero_value(&self) -> Value {
        match self.unwrap_nullable() {
            DataType::Float => Value::Float(0.0),
            _ => Value::Int(0),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Bool => write!(f, "bool"),
            DataType::Int => write!(f, "int"),
            DataType::Float => write!(f, "float"),
            DataType::Text => write!(f, "text"),
            DataType::DateTime => write!(f, "datetime"),
            DataType::Enum(name) => write!(f, "enum {}", name),
            DataType::Object(name) => write!(f, "{}", name),
            DataType::Nullable(inner) => write!(f, "{}?", inner),
            DataType::Unknown => write!(f, "unknown"),
        }
    }
}

/// A dynamically typed host value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    DateTime(NaiveDateTime),
    Enum { type_name: String, value: i64 },
    List(Vec<Value>),
    /// An anonymous record, fields in declaration order.
    Record(Vec<(String, Value)>),
    /// A domain object. Deflated references only carry their key fields.
    Object {
        type_name: String,
        fields: Vec<(String, Value)>,
    },
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Best-effort static type of this value.
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Null => DataType::Unknown,
            Value::Bool(_) => DataType::Bool,
            Value::Int(_) => DataType::Int,
            Value::Float(_) => DataType::Float,
            Value::Text(_) => DataType::Text,
            Value::DateTime(_) => DataType::DateTime,
            Value::Enum { type_name, .. } => DataType::Enum(type_name.clone()),
            Value::Object { type_name, .. } => DataType::Object(type_name.clone()),
            Value::List(_) | Value::Record(_) => DataType::Unknown,
        }
    }

    /// Looks up a field on a record or object value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Record(fields) | Value::Object { fields, .. } => {
                fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Enum { value, .. } => Some(*value),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Coerces a raw row value to the column's declared type.
    pub fn coerce(self, data_type: &DataType) -> Value {
        match (self, data_type.unwrap_nullable()) {
            (Value::Null, _) => Value::Null,
            (Value::Int(i), DataType::Enum(name)) => Value::Enum {
                type_name: name.clone(),
                value: i,
            },
            (Value::Int(i), DataType::Bool) => Value::Bool(i != 0),
            (Value::Int(i), DataType::Float) => Value::Float(i as f64),
            (Value::Text(s), DataType::DateTime) => match parse_datetime(&s) {
                Some(dt) => Value::DateTime(dt),
                None => Value::Text(s),
            },
            (other, _) => other,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::DateTime(_) => "datetime",
            Value::Enum { .. } => "enum",
            Value::List(_) => "list",
            Value::Record(_) => "record",
            Value::Object { .. } => "object",
        }
    }
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "'{}'", s),
            Value::DateTime(dt) => write!(f, "{}", dt),
            Value::Enum { type_name, value } => write!(f, "{}({})", type_name, value),
            Value::List(items) => {
                let items: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Value::Record(fields) | Value::Object { fields, .. } => {
                let fields: Vec<String> =
                    fields.iter().map(|(n, v)| format!("{}: {}", n, v)).collect();
                write!(f, "{{{}}}", fields.join(", "))
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
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
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

/// Conversion from a materialized `Value` into a Rust type.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

fn mismatch<T>(expected: &'static str, found: &Value) -> Result<T> {
    Err(QueryError::Conversion {
        expected,
        found: found.kind(),
    })
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self> {
        match value.as_i64() {
            Some(i) => Ok(i),
            None => mismatch("int", &value),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: Value) -> Result<Self> {
        let wide = i64::from_value(value)?;
        i32::try_from(wide).map_err(|_| QueryError::Conversion {
            expected: "i32",
            found: "out of range int",
        })
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self> {
        match value.as_f64() {
            Some(f) => Ok(f),
            None => mismatch("float", &value),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        match value.as_bool() {
            Some(b) => Ok(b),
            None => mismatch("bool", &value),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s),
            other => mismatch("text", &other),
        }
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::DateTime(dt) => Ok(dt),
            Value::Text(ref s) => match parse_datetime(s) {
                Some(dt) => Ok(dt),
                None => mismatch("datetime", &value),
            },
            other => mismatch("datetime", &other),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nullable_wraps_once() {
        let t = DataType::nullable(DataType::nullable(DataType::Int));
        assert_eq!(t, DataType::Nullable(Box::new(DataType::Int)));
        assert_eq!(DataType::nullable(DataType::Text), DataType::Text);
    }

    #[test]
    fn test_enum_underlying_type() {
        let t = DataType::Enum("Color".into());
        assert_eq!(t.underlying(), DataType::Int);
        assert!(t.is_enum());
        assert!(!t.is_nullable());
    }

    #[test]
    fn test_coerce_enum_column() {
        let v = Value::Int(2).coerce(&DataType::Enum("Color".into()));
        assert_eq!(
            v,
            Value::Enum {
                type_name: "Color".into(),
                value: 2
            }
        );
    }

    #[test]
    fn test_coerce_sqlite_datetime_text() {
        let v = Value::Text("2024-03-01 10:30:00".into()).coerce(&DataType::DateTime);
        assert!(matches!(v, Value::DateTime(_)));
    }

    #[test]
    fn test_from_value_option() {
        assert_eq!(Option::<i64>::from_value(Value::Null).unwrap(), None);
        assert_eq!(Option::<i64>::from_value(Value::Int(4)).unwrap(), Some(4));
    }

    #[test]
    fn test_from_value_mismatch() {
        let err = String::from_value(Value::Int(1)).unwrap_err();
        assert!(err.to_string().contains("text"));
    }

    #[test]
    fn test_default_and_zero_values() {
        assert_eq!(DataType::Int.default_value(), Value::Int(0));
        assert_eq!(DataType::Text.default_value(), Value::Null);
        assert_eq!(
            DataType::nullable(DataType::Float).zero_value(),
            Value::Float(0.0)
        );
    }
}
