// Record values and their SQLite representation
//
// Records are column-indexed JSON maps; rows travel between layers in this
// form and never need a dedicated struct.

use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{json, Map, Number};

use crate::error::{Co3Error, Result};

pub use serde_json::Value;

/// Column name → value
pub type Record = Map<String, Value>;

/// Convert a JSON value into an owned SQLite value
pub fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(u) = n.as_u64() {
                // beyond i64 range; REAL is the closest SQLite storage class
                SqlValue::Real(u as f64)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        // nested structures are stored as JSON text
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// Convert a borrowed SQLite value into JSON
pub fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Array(b.iter().map(|byte| json!(byte)).collect()),
    }
}

/// Read every column of a row into a record, keyed by the given labels
pub fn row_to_record(row: &rusqlite::Row<'_>, columns: &[String]) -> rusqlite::Result<Record> {
    let mut record = Record::new();
    for (idx, name) in columns.iter().enumerate() {
        record.insert(name.clone(), from_sql(row.get_ref(idx)?));
    }
    Ok(record)
}

/// Hashable string form of a value, used for grouping
///
/// Strings are kept as-is unless their text would read back as some other
/// JSON value (`"1"`, `"true"`), in which case they are quoted. Everything
/// else uses its JSON encoding, so `"1"` and `1` land in different groups.
pub fn group_key(value: &Value) -> String {
    match value {
        Value::String(s) if serde_json::from_str::<Value>(s).is_err() => s.clone(),
        other => other.to_string(),
    }
}

/// Identifiers are interpolated into SQL, so only plain names are accepted
pub fn check_identifier(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let valid_head = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    if valid_head && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(Co3Error::InvalidIdentifier(name.to_string()))
    }
}

/// Build a record from `(key, value)` pairs
pub fn record<K, I>(pairs: I) -> Record
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
