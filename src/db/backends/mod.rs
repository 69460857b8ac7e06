//! Backend adapters: the seam between the broker and concrete database drivers.
//!
//! An adapter builds pools, a pool hands out connections, and connections run statements and
//! return normalized [`ResultSet`]s. Every adapter produces the same value shapes:
//! numbers as JSON numbers, binary as tagged buffers, temporal values as fixed-format text.

mod mysql;
mod odbc;
mod oracle;
mod postgres;
mod sqlite;
mod sqlserver;

pub(crate) use mysql::MySqlAdapter;
pub(crate) use odbc::OdbcAdapter;
pub(crate) use oracle::OracleAdapter;
pub(crate) use postgres::PostgresAdapter;
pub(crate) use sqlite::SqliteAdapter;
pub(crate) use sqlserver::SqlServerAdapter;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tether_schema::{ColumnRow, ForeignKeyRow, PrimaryKeyRow, ResultSet, SchemaOptions, TableRow};
use tether_sqlcore::{AnsiLiterals, LiteralFormatter, SqlParam};

use super::{BackendKind, Catalog};
use crate::error::TetherError;

/// One statement to run on a connection.
#[derive(Debug, Clone, Copy)]
pub struct Statement<'a> {
    pub sql: &'a str,
    pub params: &'a [SqlParam],
    /// A transaction is open on the logical connection.
    pub in_transaction: bool,
    /// The peer asked for the generated `counter` column of an insert.
    pub returning_counter: bool,
}

impl<'a> Statement<'a> {
    pub fn new(sql: &'a str, params: &'a [SqlParam]) -> Self {
        Self {
            sql,
            params,
            in_transaction: false,
            returning_counter: false,
        }
    }
}

#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Literal syntax used when parameters have to be substituted into the SQL text.
    fn literals(&self) -> &dyn LiteralFormatter {
        &AnsiLiterals
    }

    /// How schema introspection is answered.
    fn catalog(&self) -> Catalog;

    /// Whether parameter and transaction support must be discovered at runtime.
    fn probes_capabilities(&self) -> bool {
        false
    }

    async fn init_pool(&self, options: &Value) -> Result<Arc<dyn BackendPool>, TetherError>;
}

#[async_trait]
pub trait BackendPool: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn BackendConnection>, TetherError>;

    /// The pool hit an error it cannot recover from and must be rebuilt.
    fn is_broken(&self) -> bool {
        false
    }

    async fn close(&self) {}
}

#[async_trait]
pub trait BackendConnection: Send {
    async fn execute(&mut self, stmt: Statement<'_>) -> Result<ResultSet, TetherError>;

    async fn begin(&mut self) -> Result<(), TetherError>;

    async fn commit(&mut self) -> Result<(), TetherError>;

    async fn rollback(&mut self) -> Result<(), TetherError>;

    // Native catalog access, used when the adapter's catalog is `Catalog::Native`.

    async fn list_tables(&mut self, _options: &SchemaOptions) -> Result<Vec<TableRow>, TetherError> {
        Err(TetherError::UnsupportedCommand("listTables".to_string()))
    }

    async fn list_table_columns(
        &mut self,
        _options: &SchemaOptions,
    ) -> Result<Vec<ColumnRow>, TetherError> {
        Err(TetherError::UnsupportedCommand("listTableColumns".to_string()))
    }

    async fn list_table_primary_keys(
        &mut self,
        _options: &SchemaOptions,
    ) -> Result<Vec<PrimaryKeyRow>, TetherError> {
        Err(TetherError::UnsupportedCommand("listTablePrimaryKeys".to_string()))
    }

    async fn list_table_foreign_keys(
        &mut self,
        _options: &SchemaOptions,
    ) -> Result<Vec<ForeignKeyRow>, TetherError> {
        Err(TetherError::UnsupportedCommand("listTableForeignKeys".to_string()))
    }

    /// Releases the physical connection. Later calls are no-ops.
    async fn close(&mut self) -> Result<(), TetherError>;
}

/// Parses `connectionOptions` into a backend's option struct.
pub(crate) fn parse_options<T>(kind: BackendKind, options: &Value) -> Result<T, TetherError>
where
    T: serde::de::DeserializeOwned + Default,
{
    if options.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(options.clone())
        .map_err(|e| TetherError::Config(format!("invalid {kind} connectionOptions: {e}")))
}

/// Index of the `counter` column (any case), used for generated-key reporting.
pub(crate) fn counter_column(cols: &[String]) -> Option<usize> {
    cols.iter().position(|c| c.eq_ignore_ascii_case("counter"))
}

/// JSON number for a float, falling back to its text when not finite.
pub(crate) fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(f.to_string()))
}

/// Decimal text as a JSON number when it survives the round trip, text otherwise.
pub(crate) fn decimal_value(text: &str) -> Value {
    if let Ok(i) = text.parse::<i64>() {
        return Value::from(i);
    }
    match text.parse::<f64>() {
        Ok(f) if f.is_finite() => float_value(f),
        _ => Value::String(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counter_column_matches_any_case() {
        let cols = vec!["id".to_string(), "Counter".to_string()];
        assert_eq!(counter_column(&cols), Some(1));
        assert_eq!(counter_column(&["x".to_string()]), None);
    }

    #[test]
    fn decimal_text_becomes_number_when_exact() {
        assert_eq!(decimal_value("12"), json!(12));
        assert_eq!(decimal_value("1.25"), json!(1.25));
        assert_eq!(decimal_value("abc"), json!("abc"));
    }

    #[test]
    fn null_options_use_defaults() {
        #[derive(serde::Deserialize, Default, Debug, PartialEq)]
        struct Opts {
            #[serde(default)]
            max: Option<u32>,
        }
        let parsed: Opts = parse_options(BackendKind::Sqlite, &Value::Null).unwrap();
        assert_eq!(parsed, Opts::default());
        let err = parse_options::<Opts>(BackendKind::Sqlite, &json!({ "max": "x" })).unwrap_err();
        assert!(err.to_string().contains("SQLite"));
    }
}
