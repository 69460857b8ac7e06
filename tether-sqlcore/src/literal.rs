use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;

use crate::bind::BindError;
use crate::param::{SqlParam, TypedParam};
use crate::temporal::format_datetime;

/// Standard SQL string literal: wrapped in single quotes, embedded quotes doubled.
pub fn quote_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' {
            out.push('\'');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Renders parameters as SQL literals for drivers that cannot bind them.
///
/// The defaults produce ANSI SQL. Backends override the hooks whose syntax differs.
pub trait LiteralFormatter: Send + Sync {
    fn boolean(&self, value: bool) -> String {
        (if value { "TRUE" } else { "FALSE" }).to_string()
    }

    fn binary(&self, bytes: &[u8]) -> String {
        format!("X'{}'", hex::encode_upper(bytes))
    }

    fn date(&self, value: &str) -> String {
        format!("DATE {}", quote_string(value))
    }

    fn time(&self, value: &str) -> String {
        format!("TIME {}", quote_string(value))
    }

    fn timestamp(&self, value: &str) -> String {
        format!("TIMESTAMP {}", quote_string(value))
    }

    fn literal(&self, param: &SqlParam) -> Result<String, BindError> {
        Ok(match param {
            SqlParam::Null => "NULL".to_string(),
            SqlParam::Bool(b) => self.boolean(*b),
            SqlParam::Int(i) => i.to_string(),
            SqlParam::Float(f) if f.is_finite() => f.to_string(),
            SqlParam::Float(_) => "NULL".to_string(),
            SqlParam::Text(s) => quote_string(s),
            SqlParam::Bytes(bytes) => self.binary(bytes),
            SqlParam::Json(v) => quote_string(&v.to_string()),
            SqlParam::Typed(typed) => self.typed(typed)?,
        })
    }

    fn typed(&self, typed: &TypedParam) -> Result<String, BindError> {
        let value = typed.value.as_ref();
        if value.is_null() {
            return Ok("NULL".to_string());
        }

        match TypeFamily::of(&typed.data_type) {
            TypeFamily::Text => {
                let text = text_of(value);
                let text = match typed.max_len {
                    Some(max) => text.chars().take(max).collect(),
                    None => text,
                };
                Ok(quote_string(&text))
            }
            TypeFamily::Integer => integer_of(value)
                .map(|i| i.to_string())
                .ok_or_else(|| invalid(typed)),
            TypeFamily::Decimal => {
                let number = float_of(value).ok_or_else(|| invalid(typed))?;
                Ok(match typed.scale {
                    Some(scale) => format!("{:.*}", scale as usize, number),
                    None => number.to_string(),
                })
            }
            TypeFamily::Boolean => match value {
                SqlParam::Bool(b) => Ok(self.boolean(*b)),
                SqlParam::Int(i) => Ok(self.boolean(*i != 0)),
                SqlParam::Text(s) => Ok(self.boolean(matches!(s.as_str(), "1" | "true" | "TRUE"))),
                _ => Err(invalid(typed)),
            },
            TypeFamily::Date => Ok(self.date(&text_of(value))),
            TypeFamily::Time => Ok(self.time(&text_of(value))),
            TypeFamily::Timestamp => Ok(self.timestamp(&normalize_timestamp(&text_of(value)))),
            TypeFamily::Binary => match value {
                SqlParam::Bytes(bytes) => Ok(self.binary(bytes)),
                _ => Err(invalid(typed)),
            },
            TypeFamily::Unknown => self.literal(value),
        }
    }
}

/// Plain ANSI literals.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnsiLiterals;

impl LiteralFormatter for AnsiLiterals {}

/// ODBC escape-clause literals (`{d '..'}`, `{t '..'}`, `{ts '..'}`), understood by every
/// ODBC driver regardless of its native dialect.
#[derive(Debug, Default, Clone, Copy)]
pub struct OdbcEscapeLiterals;

impl LiteralFormatter for OdbcEscapeLiterals {
    fn boolean(&self, value: bool) -> String {
        (if value { "1" } else { "0" }).to_string()
    }

    fn date(&self, value: &str) -> String {
        format!("{{d {}}}", quote_string(value))
    }

    fn time(&self, value: &str) -> String {
        format!("{{t {}}}", quote_string(value))
    }

    fn timestamp(&self, value: &str) -> String {
        format!("{{ts {}}}", quote_string(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeFamily {
    Text,
    Integer,
    Decimal,
    Boolean,
    Date,
    Time,
    Timestamp,
    Binary,
    Unknown,
}

impl TypeFamily {
    fn of(data_type: &str) -> Self {
        match data_type.trim().to_ascii_lowercase().as_str() {
            "char" | "nchar" | "varchar" | "nvarchar" | "varchar2" | "nvarchar2" | "text"
            | "ntext" | "string" | "clob" | "nclob" => Self::Text,
            "int" | "integer" | "smallint" | "tinyint" | "bigint" | "long" => Self::Integer,
            "decimal" | "numeric" | "number" | "float" | "double" | "real" | "money"
            | "currency" => Self::Decimal,
            "bool" | "boolean" | "bit" => Self::Boolean,
            "date" => Self::Date,
            "time" => Self::Time,
            "datetime" | "datetime2" | "smalldatetime" | "timestamp" => Self::Timestamp,
            "binary" | "varbinary" | "blob" | "image" | "bytes" | "raw" => Self::Binary,
            _ => Self::Unknown,
        }
    }
}

fn invalid(typed: &TypedParam) -> BindError {
    BindError::InvalidValue {
        data_type: typed.data_type.clone(),
    }
}

fn text_of(value: &SqlParam) -> String {
    match value {
        SqlParam::Text(s) => s.clone(),
        SqlParam::Int(i) => i.to_string(),
        SqlParam::Float(f) => f.to_string(),
        SqlParam::Bool(b) => b.to_string(),
        SqlParam::Json(Value::String(s)) => s.clone(),
        SqlParam::Json(v) => v.to_string(),
        SqlParam::Typed(typed) => text_of(&typed.value),
        SqlParam::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        SqlParam::Null => String::new(),
    }
}

fn integer_of(value: &SqlParam) -> Option<i64> {
    match value {
        SqlParam::Int(i) => Some(*i),
        SqlParam::Float(f) if f.fract() == 0.0 => Some(*f as i64),
        SqlParam::Bool(b) => Some(i64::from(*b)),
        SqlParam::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn float_of(value: &SqlParam) -> Option<f64> {
    match value {
        SqlParam::Int(i) => Some(*i as f64),
        SqlParam::Float(f) if f.is_finite() => Some(*f),
        SqlParam::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// ISO-8601 instants become `YYYY-MM-DD HH:MM:SS.mmm` in UTC; anything else is kept.
fn normalize_timestamp(value: &str) -> String {
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return format_datetime(instant.naive_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return format_datetime(naive);
    }
    value.to_string()
}
