//! ODBC data sources. Built only with the `odbc` feature; otherwise opening a pool reports the
//! missing driver.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tether_sqlcore::{LiteralFormatter, OdbcEscapeLiterals};

use super::{BackendAdapter, BackendPool};
use crate::db::{BackendKind, Catalog};
use crate::error::TetherError;

#[cfg(feature = "odbc")]
pub(crate) use driver::OdbcAdapter;

#[cfg(not(feature = "odbc"))]
pub(crate) struct OdbcAdapter;

#[cfg(not(feature = "odbc"))]
#[async_trait]
impl BackendAdapter for OdbcAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Odbc
    }

    fn literals(&self) -> &dyn LiteralFormatter {
        &OdbcEscapeLiterals
    }

    fn catalog(&self) -> Catalog {
        Catalog::Native
    }

    fn probes_capabilities(&self) -> bool {
        true
    }

    async fn init_pool(&self, _options: &Value) -> Result<Arc<dyn BackendPool>, TetherError> {
        Err(TetherError::DriverMissing {
            class: BackendKind::Odbc.class_name(),
            feature: "odbc",
        })
    }
}

#[cfg(feature = "odbc")]
mod driver {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use odbc_api::buffers::TextRowSet;
    use odbc_api::parameter::InputParameter;
    use odbc_api::{
        Bit, Connection, ConnectionOptions, Cursor, DataType, Environment, IntoParameter,
        ResultSetMetadata,
    };
    use serde::Deserialize;
    use tether_schema::{ColumnRow, ForeignKeyRow, PrimaryKeyRow, ResultSet, SchemaOptions, TableRow};
    use tether_sqlcore::temporal::{format_date, format_datetime, format_time};
    use tether_sqlcore::{SqlParam, StatementKind, buffer_value};

    use crate::db::backends::{BackendConnection, Statement, decimal_value, float_value, parse_options};

    type Env = &'static Environment;

    #[derive(Debug, Default, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    struct OdbcOptions {
        connection_string: Option<String>,
        dsn: Option<String>,
        user: Option<String>,
        password: Option<String>,
        login_timeout_sec: Option<u32>,
    }

    impl OdbcOptions {
        fn connection_string(&self) -> Result<String, TetherError> {
            if let Some(cs) = &self.connection_string {
                return Ok(cs.clone());
            }
            let dsn = self.dsn.as_deref().ok_or_else(|| {
                TetherError::Config("ODBC connectionOptions need connectionString or dsn".into())
            })?;
            let mut cs = format!("DSN={dsn};");
            if let Some(user) = &self.user {
                cs.push_str(&format!("UID={user};"));
            }
            if let Some(password) = &self.password {
                cs.push_str(&format!("PWD={password};"));
            }
            Ok(cs)
        }
    }

    pub(crate) struct OdbcAdapter {
        env: Result<Env, String>,
    }

    impl OdbcAdapter {
        pub(crate) fn new(env: Result<Env, String>) -> Self {
            Self { env }
        }
    }

    #[async_trait]
    impl BackendAdapter for OdbcAdapter {
        fn kind(&self) -> BackendKind {
            BackendKind::Odbc
        }

        fn literals(&self) -> &dyn LiteralFormatter {
            &OdbcEscapeLiterals
        }

        fn catalog(&self) -> Catalog {
            Catalog::Native
        }

        fn probes_capabilities(&self) -> bool {
            true
        }

        async fn init_pool(&self, options: &Value) -> Result<Arc<dyn BackendPool>, TetherError> {
            let env = self
                .env
                .clone()
                .map_err(|e| TetherError::Config(format!("ODBC driver manager unavailable: {e}")))?;
            let opts: OdbcOptions = parse_options(BackendKind::Odbc, options)?;
            Ok(Arc::new(OdbcPool {
                env,
                connection_string: opts.connection_string()?,
                login_timeout_sec: opts.login_timeout_sec,
            }))
        }
    }

    /// ODBC drivers pool on their own; each logical connection gets its own handle.
    struct OdbcPool {
        env: Env,
        connection_string: String,
        login_timeout_sec: Option<u32>,
    }

    #[async_trait]
    impl BackendPool for OdbcPool {
        async fn acquire(&self) -> Result<Box<dyn BackendConnection>, TetherError> {
            let env = self.env;
            let connection_string = self.connection_string.clone();
            let options = ConnectionOptions {
                login_timeout_sec: self.login_timeout_sec,
                ..Default::default()
            };
            let conn = tokio::task::spawn_blocking(move || {
                env.connect_with_connection_string(&connection_string, options)
            })
            .await
            .map_err(|e| TetherError::UnexpectedError(format!("ODBC connect task failed: {e}")))??;
            Ok(Box::new(OdbcConnection { conn: Some(conn) }))
        }
    }

    struct OdbcConnection {
        conn: Option<Connection<'static>>,
    }

    impl OdbcConnection {
        /// Runs `f` on the blocking pool with the connection moved in and back out.
        async fn blocking<T, F>(&mut self, f: F) -> Result<T, TetherError>
        where
            T: Send + 'static,
            F: FnOnce(&mut Connection<'static>) -> Result<T, TetherError> + Send + 'static,
        {
            let mut conn = self.conn.take().ok_or(TetherError::ConnectionClosed)?;
            let (conn, result) = tokio::task::spawn_blocking(move || {
                let result = f(&mut conn);
                (conn, result)
            })
            .await
            .map_err(|e| TetherError::UnexpectedError(format!("ODBC worker failed: {e}")))?;
            self.conn = Some(conn);
            result
        }
    }

    fn input_parameter(param: &SqlParam) -> Box<dyn InputParameter> {
        match param.bindable() {
            SqlParam::Null | SqlParam::Typed(_) => Box::new(None::<String>.into_parameter()),
            SqlParam::Bool(b) => Box::new(Bit::from_bool(*b)),
            SqlParam::Int(i) => Box::new(*i),
            SqlParam::Float(f) => Box::new(*f),
            SqlParam::Text(s) => Box::new(s.clone().into_parameter()),
            SqlParam::Bytes(bytes) => Box::new(bytes.clone().into_parameter()),
            SqlParam::Json(v) => Box::new(v.to_string().into_parameter()),
        }
    }

    fn convert(data_type: DataType, text: &[u8]) -> Value {
        let text = String::from_utf8_lossy(text);
        match data_type {
            DataType::TinyInt | DataType::SmallInt | DataType::Integer | DataType::BigInt => text
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(text.into_owned())),
            DataType::Real | DataType::Float { .. } | DataType::Double => text
                .trim()
                .parse::<f64>()
                .map(float_value)
                .unwrap_or_else(|_| Value::String(text.into_owned())),
            DataType::Numeric { .. } | DataType::Decimal { .. } => decimal_value(text.trim()),
            DataType::Bit => Value::Bool(text.trim() == "1"),
            DataType::Date => NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                .map(|d| Value::String(format_date(d)))
                .unwrap_or_else(|_| Value::String(text.into_owned())),
            DataType::Time { .. } => NaiveTime::parse_from_str(&text, "%H:%M:%S%.f")
                .map(|t| Value::String(format_time(t)))
                .unwrap_or_else(|_| Value::String(text.into_owned())),
            DataType::Timestamp { .. } => NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f")
                .map(|dt| Value::String(format_datetime(dt)))
                .unwrap_or_else(|_| Value::String(text.into_owned())),
            _ => Value::String(text.into_owned()),
        }
    }

    fn is_binary(data_type: DataType) -> bool {
        matches!(
            data_type,
            DataType::Binary { .. } | DataType::Varbinary { .. } | DataType::LongVarbinary { .. }
        )
    }

    /// Reads every row of `cursor` into a result set.
    fn drain(mut cursor: impl Cursor) -> Result<ResultSet, TetherError> {
        let count = cursor.num_result_cols()?;
        let count = u16::try_from(count).unwrap_or_default();
        let mut rs = ResultSet::default();
        let mut types = Vec::with_capacity(usize::from(count));
        for col in 1..=count {
            rs.cols.push(cursor.col_name(col)?);
            types.push(cursor.col_data_type(col)?);
        }

        let mut buf = Vec::new();
        while let Some(mut row) = cursor.next_row()? {
            let mut values = Vec::with_capacity(types.len());
            for (col, data_type) in (1..=count).zip(types.iter().copied()) {
                buf.clear();
                let present = if is_binary(data_type) {
                    row.get_binary(col, &mut buf)?
                } else {
                    row.get_text(col, &mut buf)?
                };
                values.push(match (present, is_binary(data_type)) {
                    (false, _) => Value::Null,
                    (true, true) => buffer_value(&buf),
                    (true, false) => convert(data_type, &buf),
                });
            }
            rs.rows.push(values);
        }
        Ok(rs)
    }

    /// Catalog cursors read as text rows, keyed by position.
    fn catalog_rows(cursor: impl Cursor) -> Result<Vec<Vec<Option<String>>>, TetherError> {
        let mut cursor = cursor;
        let mut rows = Vec::new();
        let mut buffers = TextRowSet::for_cursor(256, &mut cursor, Some(4096))?;
        let mut bound = cursor.bind_buffer(&mut buffers)?;
        while let Some(batch) = bound.fetch()? {
            for r in 0..batch.num_rows() {
                rows.push(
                    (0..batch.num_cols())
                        .map(|c| batch.at_as_str(c, r).ok().flatten().map(str::to_string))
                        .collect(),
                );
            }
        }
        Ok(rows)
    }

    fn text(row: &[Option<String>], index: usize) -> Option<String> {
        row.get(index).cloned().flatten()
    }

    fn number(row: &[Option<String>], index: usize) -> Option<i64> {
        text(row, index).and_then(|v| v.trim().parse().ok())
    }

    #[async_trait]
    impl BackendConnection for OdbcConnection {
        async fn execute(&mut self, stmt: Statement<'_>) -> Result<ResultSet, TetherError> {
            let sql = stmt.sql.to_string();
            let params: Vec<SqlParam> = stmt.params.to_vec();
            let kind = StatementKind::classify(&sql);
            self.blocking(move |conn| {
                let inputs: Vec<Box<dyn InputParameter>> = params.iter().map(input_parameter).collect();
                let mut prepared = conn.preallocate()?;
                let cursor = prepared.execute(&sql, inputs.as_slice())?;
                let mut rs = match cursor {
                    Some(cursor) => drain(cursor)?,
                    None => ResultSet::default(),
                };
                if kind.is_dml() {
                    rs.rows_affected = prepared
                        .row_count()?
                        .map(|n| u64::try_from(n).unwrap_or_default());
                }
                Ok(rs)
            })
            .await
        }

        async fn begin(&mut self) -> Result<(), TetherError> {
            self.blocking(|conn| Ok(conn.set_autocommit(false)?)).await
        }

        async fn commit(&mut self) -> Result<(), TetherError> {
            self.blocking(|conn| {
                conn.commit()?;
                Ok(conn.set_autocommit(true)?)
            })
            .await
        }

        async fn rollback(&mut self) -> Result<(), TetherError> {
            self.blocking(|conn| {
                conn.rollback()?;
                Ok(conn.set_autocommit(true)?)
            })
            .await
        }

        async fn list_tables(&mut self, options: &SchemaOptions) -> Result<Vec<TableRow>, TetherError> {
            let schema = options.schema.clone().unwrap_or_default();
            let table = options.filter.clone().unwrap_or_else(|| "%".to_string());
            let table_type = match options.table_type.as_deref() {
                Some(t) if t.eq_ignore_ascii_case("view") => "VIEW",
                Some(_) => "TABLE",
                None => "TABLE,VIEW",
            };
            self.blocking(move |conn| {
                let rows = catalog_rows(conn.tables("", &schema, &table, table_type)?)?;
                Ok(rows
                    .iter()
                    .map(|r| TableRow {
                        table_cat: text(r, 0),
                        table_schem: text(r, 1),
                        table_name: text(r, 2).unwrap_or_default(),
                        table_type: text(r, 3),
                        remarks: text(r, 4),
                    })
                    .collect())
            })
            .await
        }

        async fn list_table_columns(
            &mut self,
            options: &SchemaOptions,
        ) -> Result<Vec<ColumnRow>, TetherError> {
            let schema = options.schema.clone().unwrap_or_default();
            let table = options.table.clone().unwrap_or_else(|| "%".to_string());
            self.blocking(move |conn| {
                let rows = catalog_rows(conn.columns("", &schema, &table, "%")?)?;
                Ok(rows
                    .iter()
                    .map(|r| ColumnRow {
                        table_cat: text(r, 0),
                        table_schem: text(r, 1),
                        table_name: text(r, 2).unwrap_or_default(),
                        column_name: text(r, 3).unwrap_or_default(),
                        type_name: text(r, 5),
                        column_size: number(r, 6),
                        decimal_digits: number(r, 8),
                        is_nullable: text(r, 17),
                        ordinal_position: number(r, 16),
                    })
                    .collect())
            })
            .await
        }

        async fn list_table_primary_keys(
            &mut self,
            options: &SchemaOptions,
        ) -> Result<Vec<PrimaryKeyRow>, TetherError> {
            let schema = options.schema.clone();
            let table = options.table.clone().unwrap_or_default();
            self.blocking(move |conn| {
                let mut prepared = conn.preallocate()?;
                let cursor = prepared.primary_keys(None, schema.as_deref(), &table)?;
                let rows = catalog_rows(cursor)?;
                Ok(rows
                    .iter()
                    .map(|r| PrimaryKeyRow {
                        table_cat: text(r, 0),
                        table_schem: text(r, 1),
                        table_name: text(r, 2).unwrap_or_default(),
                        column_name: text(r, 3).unwrap_or_default(),
                        key_seq: number(r, 4),
                        pk_name: text(r, 5),
                    })
                    .collect())
            })
            .await
        }

        async fn list_table_foreign_keys(
            &mut self,
            options: &SchemaOptions,
        ) -> Result<Vec<ForeignKeyRow>, TetherError> {
            let schema = options.schema.clone().unwrap_or_default();
            let table = options.table.clone().unwrap_or_default();
            self.blocking(move |conn| {
                let mut prepared = conn.preallocate()?;
                let cursor = prepared.foreign_keys("", "", "", "", &schema, &table)?;
                let rows = catalog_rows(cursor)?;
                Ok(rows
                    .iter()
                    .map(|r| ForeignKeyRow {
                        pktable_schem: text(r, 1),
                        pktable_name: text(r, 2).unwrap_or_default(),
                        pkcolumn_name: text(r, 3).unwrap_or_default(),
                        fktable_schem: text(r, 5),
                        fktable_name: text(r, 6).unwrap_or_default(),
                        fkcolumn_name: text(r, 7).unwrap_or_default(),
                        key_seq: number(r, 8),
                        fk_name: text(r, 11),
                    })
                    .collect())
            })
            .await
        }

        async fn close(&mut self) -> Result<(), TetherError> {
            if let Some(conn) = self.conn.take() {
                tokio::task::spawn_blocking(move || drop(conn))
                    .await
                    .map_err(|e| TetherError::UnexpectedError(format!("ODBC close failed: {e}")))?;
            }
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn dsn_options_build_connection_string() {
            let opts = OdbcOptions {
                dsn: Some("Sales".into()),
                user: Some("app".into()),
                password: Some("pw".into()),
                ..Default::default()
            };
            assert_eq!(opts.connection_string().unwrap(), "DSN=Sales;UID=app;PWD=pw;");
            assert!(OdbcOptions::default().connection_string().is_err());
        }

        #[test]
        fn text_cells_convert_by_column_type() {
            assert_eq!(convert(DataType::Integer, b" 42"), Value::from(42));
            assert_eq!(convert(DataType::Bit, b"1"), Value::Bool(true));
            assert_eq!(
                convert(DataType::Timestamp { precision: 3 }, b"2024-03-01 10:20:30.5"),
                Value::String("2024-03-01 10:20:30.500".into())
            );
        }
    }
}

#[cfg(all(test, not(feature = "odbc")))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_feature_names_the_driver() {
        let err = OdbcAdapter.init_pool(&Value::Null).await.err().unwrap();
        assert!(err.to_string().starts_with("ODBC driver not found"));
    }
}
