//! Type tags and the value model shared by all backends.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::DbError;

/// Column type tag driving value formatting on write and coercion on read.
///
/// The same tag set has a fixed meaning across every backend. `Geometry` and
/// `Geometry4326` are MySQL-only; other backends reject them as unsupported.
/// `LargeObjectStream` marks columns read through a backend's large-object
/// path and written through `stream_long_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbType {
    AsIs,
    Number,
    String,
    Date,
    DateTime,
    Geometry,
    Geometry4326,
    LargeObjectStream,
}

/// A value bound to a query parameter or read from a result column.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
}

impl DbValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }

    /// Render the value as plain text (no SQL quoting).
    pub fn as_text(&self) -> String {
        match self {
            DbValue::Null => String::new(),
            DbValue::Int(n) => n.to_string(),
            DbValue::Float(f) => f.to_string(),
            DbValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            DbValue::Text(s) => s.clone(),
            DbValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            DbValue::Int(n) => Some(*n),
            DbValue::Float(f) => Some(*f as i64),
            DbValue::Text(s) => s.trim().parse().ok(),
            DbValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Convert to a JSON value. Bytes degrade to lossy UTF-8 text since JSON
    /// has no binary representation.
    pub fn to_json(&self) -> JsonValue {
        match self {
            DbValue::Null => JsonValue::Null,
            DbValue::Int(n) => JsonValue::from(*n),
            DbValue::Float(f) => {
                serde_json::Number::from_f64(*f).map_or(JsonValue::Null, JsonValue::Number)
            }
            DbValue::Bool(b) => JsonValue::Bool(*b),
            DbValue::Text(s) => JsonValue::String(s.clone()),
            DbValue::Bytes(b) => JsonValue::String(String::from_utf8_lossy(b).into_owned()),
        }
    }

    pub fn from_json(value: &JsonValue) -> DbValue {
        match value {
            JsonValue::Null => DbValue::Null,
            JsonValue::Bool(b) => DbValue::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    DbValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    DbValue::Int(u as i64)
                } else {
                    DbValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => DbValue::Text(s.clone()),
            other => DbValue::Text(other.to_string()),
        }
    }
}

impl From<&str> for DbValue {
    fn from(s: &str) -> Self {
        DbValue::Text(s.to_string())
    }
}

impl From<String> for DbValue {
    fn from(s: String) -> Self {
        DbValue::Text(s)
    }
}

impl From<i64> for DbValue {
    fn from(n: i64) -> Self {
        DbValue::Int(n)
    }
}

impl From<i32> for DbValue {
    fn from(n: i32) -> Self {
        DbValue::Int(n.into())
    }
}

impl From<f64> for DbValue {
    fn from(f: f64) -> Self {
        DbValue::Float(f)
    }
}

impl From<bool> for DbValue {
    fn from(b: bool) -> Self {
        DbValue::Bool(b)
    }
}

impl From<Vec<u8>> for DbValue {
    fn from(b: Vec<u8>) -> Self {
        DbValue::Bytes(b)
    }
}

impl<T> From<Option<T>> for DbValue
where
    T: Into<DbValue>,
{
    fn from(v: Option<T>) -> Self {
        v.map_or(DbValue::Null, Into::into)
    }
}

/// Coerce a raw column value according to its declared type tag.
///
/// Timestamp text is converted to Unix time for `Date` and `DateTime`
/// columns; numeric text is parsed for `Number` columns. Everything else
/// passes through unchanged.
pub fn coerce_read_value(value: DbValue, value_type: DbType) -> Result<DbValue, DbError> {
    match value_type {
        DbType::Date | DbType::DateTime => match value {
            DbValue::Null => Ok(DbValue::Null),
            DbValue::Int(n) => Ok(DbValue::Int(n)),
            DbValue::Text(s) if s.trim().is_empty() => Ok(DbValue::Null),
            DbValue::Text(s) => parse_timestamp(s.trim()).map(DbValue::Int),
            other => Err(DbError::DataFormat(format!(
                "cannot interpret {other:?} as a date/datetime"
            ))),
        },
        DbType::Number => match value {
            DbValue::Text(s) if s.trim().is_empty() => Ok(DbValue::Null),
            DbValue::Text(s) => {
                let trimmed = s.trim();
                if let Ok(i) = trimmed.parse::<i64>() {
                    Ok(DbValue::Int(i))
                } else if let Ok(f) = trimmed.parse::<f64>() {
                    Ok(DbValue::Float(f))
                } else {
                    Err(DbError::DataFormat(format!("'{trimmed}' is not numeric")))
                }
            }
            other => Ok(other),
        },
        _ => Ok(value),
    }
}

/// Parse a timestamp string to Unix seconds. Accepts the date and datetime
/// shapes the backends emit, with or without fractional seconds.
fn parse_timestamp(text: &str) -> Result<i64, DbError> {
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(dt.and_utc().timestamp());
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Ok(d
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or_default());
    }
    // Some drivers hand back an epoch value as text already.
    text.parse::<i64>()
        .map_err(|_| DbError::DataFormat(format!("'{text}' is not a date/datetime")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datetime_text_coerces_to_unix_time() {
        let v = coerce_read_value(DbValue::Text("1970-01-02 00:00:00".into()), DbType::DateTime);
        assert!(matches!(v, Ok(DbValue::Int(86400))));
    }

    #[test]
    fn date_text_coerces_to_unix_time() {
        let v = coerce_read_value(DbValue::Text("1970-01-03".into()), DbType::Date);
        assert!(matches!(v, Ok(DbValue::Int(172800))));
    }

    #[test]
    fn fractional_seconds_are_accepted() {
        let v = coerce_read_value(
            DbValue::Text("1970-01-01 00:00:01.500".into()),
            DbType::DateTime,
        );
        assert!(matches!(v, Ok(DbValue::Int(1))));
    }

    #[test]
    fn numeric_text_parses_or_fails() {
        assert!(matches!(
            coerce_read_value(DbValue::Text("42".into()), DbType::Number),
            Ok(DbValue::Int(42))
        ));
        assert!(matches!(
            coerce_read_value(DbValue::Text("abc".into()), DbType::Number),
            Err(DbError::DataFormat(_))
        ));
    }

    #[test]
    fn as_is_passes_through() {
        let v = coerce_read_value(DbValue::Text("raw".into()), DbType::AsIs);
        assert!(matches!(v, Ok(DbValue::Text(s)) if s == "raw"));
    }
}
