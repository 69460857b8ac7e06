//! Oracle databases through the Oracle client libraries. Built only with the `oracle` feature.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::{BackendAdapter, BackendPool};
use crate::db::{BackendKind, Catalog};
use crate::error::TetherError;

#[cfg(feature = "oracle")]
pub(crate) use driver::OracleAdapter;

fn driver_missing() -> TetherError {
    TetherError::DriverMissing {
        class: BackendKind::Oracle.class_name(),
        feature: "oracle",
    }
}

#[cfg(not(feature = "oracle"))]
pub(crate) struct OracleAdapter;

#[cfg(not(feature = "oracle"))]
impl OracleAdapter {
    pub(crate) fn new(_max_rows: Option<u64>) -> Self {
        Self
    }
}

#[cfg(not(feature = "oracle"))]
#[async_trait]
impl BackendAdapter for OracleAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Oracle
    }

    fn catalog(&self) -> Catalog {
        Catalog::Oracle
    }

    async fn init_pool(&self, _options: &Value) -> Result<Arc<dyn BackendPool>, TetherError> {
        Err(driver_missing())
    }
}

#[cfg(feature = "oracle")]
mod driver {
    use super::*;
    use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone};
    use oracle::pool::{Pool, PoolBuilder};
    use oracle::sql_type::{OracleType, ToSql};
    use oracle::{Connection, SqlValue};
    use serde::Deserialize;
    use tether_schema::ResultSet;
    use tether_sqlcore::temporal::{format_datetime, format_instant_iso, format_local_datetime};
    use tether_sqlcore::{SqlParam, StatementKind, buffer_value};

    use crate::db::backends::{BackendConnection, Statement, decimal_value, float_value, parse_options};

    #[derive(Debug, Default, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    struct OracleOptions {
        user: String,
        password: String,
        connect_string: String,
        pool_max: Option<u32>,
        pool_min: Option<u32>,
    }

    pub(crate) struct OracleAdapter {
        max_rows: Option<u64>,
    }

    impl OracleAdapter {
        pub(crate) fn new(max_rows: Option<u64>) -> Self {
            Self { max_rows }
        }
    }

    fn client_error(err: oracle::Error) -> TetherError {
        // DPI-1047: the Oracle client library could not be loaded.
        if err.to_string().contains("DPI-1047") {
            driver_missing()
        } else {
            err.into()
        }
    }

    async fn blocking<T, F>(f: F) -> Result<T, TetherError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, TetherError> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| TetherError::UnexpectedError(format!("Oracle worker failed: {e}")))?
    }

    #[async_trait]
    impl BackendAdapter for OracleAdapter {
        fn kind(&self) -> BackendKind {
            BackendKind::Oracle
        }

        fn catalog(&self) -> Catalog {
            Catalog::Oracle
        }

        async fn init_pool(&self, options: &Value) -> Result<Arc<dyn BackendPool>, TetherError> {
            let opts: OracleOptions = parse_options(BackendKind::Oracle, options)?;
            let pool = blocking(move || {
                let mut builder = PoolBuilder::new(opts.user, opts.password, opts.connect_string);
                builder.max_connections(opts.pool_max.unwrap_or(10));
                if let Some(min) = opts.pool_min {
                    builder.min_connections(min);
                }
                builder.build().map_err(client_error)
            })
            .await?;
            Ok(Arc::new(OraclePool {
                pool: Arc::new(pool),
                max_rows: self.max_rows,
            }))
        }
    }

    struct OraclePool {
        pool: Arc<Pool>,
        max_rows: Option<u64>,
    }

    #[async_trait]
    impl BackendPool for OraclePool {
        async fn acquire(&self) -> Result<Box<dyn BackendConnection>, TetherError> {
            let pool = self.pool.clone();
            let conn = blocking(move || pool.get().map_err(client_error)).await?;
            Ok(Box::new(OracleConnection {
                conn: Some(Arc::new(conn)),
                max_rows: self.max_rows,
            }))
        }

        async fn close(&self) {
            let pool = self.pool.clone();
            let _ = blocking(move || Ok(pool.close(&oracle::pool::CloseMode::Default)?)).await;
        }
    }

    struct OracleConnection {
        conn: Option<Arc<Connection>>,
        max_rows: Option<u64>,
    }

    impl OracleConnection {
        fn conn(&self) -> Result<Arc<Connection>, TetherError> {
            self.conn.clone().ok_or(TetherError::ConnectionClosed)
        }
    }

    fn to_sql(param: &SqlParam) -> Box<dyn ToSql + Send> {
        match param.bindable() {
            SqlParam::Null | SqlParam::Typed(_) => Box::new(None::<String>),
            SqlParam::Bool(b) => Box::new(i64::from(*b)),
            SqlParam::Int(i) => Box::new(*i),
            SqlParam::Float(f) => Box::new(*f),
            SqlParam::Text(s) => Box::new(s.clone()),
            SqlParam::Bytes(bytes) => Box::new(bytes.clone()),
            SqlParam::Json(v) => Box::new(v.to_string()),
        }
    }

    fn decode_value(value: &SqlValue, oracle_type: &OracleType) -> Result<Value, oracle::Error> {
        if value.is_null()? {
            return Ok(Value::Null);
        }
        Ok(match oracle_type {
            OracleType::Number(precision, scale) if *scale == 0 && *precision > 0 && *precision <= 18 => {
                Value::from(value.get::<i64>()?)
            }
            OracleType::Number(..) | OracleType::Float(_) => decimal_value(&value.get::<String>()?),
            OracleType::BinaryFloat | OracleType::BinaryDouble => float_value(value.get::<f64>()?),
            OracleType::Int64 => Value::from(value.get::<i64>()?),
            OracleType::Date => {
                let naive: NaiveDateTime = value.get()?;
                match Local.from_local_datetime(&naive).earliest() {
                    Some(local) => Value::String(format_local_datetime(local, &Local::now())),
                    None => Value::String(format_datetime(naive)),
                }
            }
            OracleType::Timestamp(_) => Value::String(format_datetime(value.get::<NaiveDateTime>()?)),
            OracleType::TimestampTZ(_) | OracleType::TimestampLTZ(_) => {
                Value::String(format_instant_iso(&value.get::<DateTime<FixedOffset>>()?))
            }
            OracleType::Raw(_) | OracleType::LongRaw | OracleType::BLOB => {
                buffer_value(&value.get::<Vec<u8>>()?)
            }
            _ => Value::String(value.get::<String>()?),
        })
    }

    fn run(
        conn: &Connection,
        sql: &str,
        params: &[SqlParam],
        in_transaction: bool,
        returning_counter: bool,
        max_rows: Option<u64>,
    ) -> Result<ResultSet, TetherError> {
        let kind = StatementKind::classify(sql);
        conn.set_autocommit(!in_transaction);
        let values: Vec<Box<dyn ToSql + Send>> = params.iter().map(to_sql).collect();
        let mut rs = ResultSet::default();

        if kind == StatementKind::Query {
            let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref() as &dyn ToSql).collect();
            let rows = conn.query(sql, &refs)?;
            rs.cols = rows.column_info().iter().map(|c| c.name().to_string()).collect();
            let types: Vec<OracleType> = rows
                .column_info()
                .iter()
                .map(|c| c.oracle_type().clone())
                .collect();
            for row in rows {
                if max_rows.is_some_and(|max| rs.rows.len() as u64 >= max) {
                    break;
                }
                let row = row?;
                let decoded = row
                    .sql_values()
                    .iter()
                    .zip(&types)
                    .map(|(value, oracle_type)| decode_value(value, oracle_type))
                    .collect::<Result<Vec<_>, _>>()?;
                rs.rows.push(decoded);
            }
            return Ok(rs);
        }

        let counter = returning_counter && kind == StatementKind::Insert;
        let sql = if counter {
            format!("{} RETURNING counter INTO :tether_counter", sql.trim_end().trim_end_matches(';'))
        } else {
            sql.to_string()
        };
        let mut stmt = conn.statement(&sql).build()?;
        for (index, value) in values.iter().enumerate() {
            stmt.bind(index + 1, value.as_ref())?;
        }
        if counter {
            stmt.bind("tether_counter", &OracleType::Int64)?;
        }
        stmt.execute(&[])?;

        if kind.is_dml() {
            rs.rows_affected = Some(stmt.row_count()?);
        }
        if counter
            && let Some(id) = stmt
                .returned_values::<_, Option<i64>>("tether_counter")?
                .into_iter()
                .flatten()
                .next()
            && id > 0
        {
            rs.insert_id = Some(Value::from(id));
        }
        Ok(rs)
    }

    #[async_trait]
    impl BackendConnection for OracleConnection {
        async fn execute(&mut self, stmt: Statement<'_>) -> Result<ResultSet, TetherError> {
            let conn = self.conn()?;
            let sql = stmt.sql.to_string();
            let params = stmt.params.to_vec();
            let (in_transaction, returning_counter) = (stmt.in_transaction, stmt.returning_counter);
            let max_rows = self.max_rows;
            blocking(move || run(&conn, &sql, &params, in_transaction, returning_counter, max_rows))
                .await
        }

        async fn begin(&mut self) -> Result<(), TetherError> {
            // Statements run without auto-commit while the broker holds a transaction open.
            self.conn()?;
            Ok(())
        }

        async fn commit(&mut self) -> Result<(), TetherError> {
            let conn = self.conn()?;
            blocking(move || Ok(conn.commit()?)).await
        }

        async fn rollback(&mut self) -> Result<(), TetherError> {
            let conn = self.conn()?;
            blocking(move || Ok(conn.rollback()?)).await
        }

        async fn close(&mut self) -> Result<(), TetherError> {
            if let Some(conn) = self.conn.take() {
                blocking(move || Ok(conn.close()?)).await?;
            }
            Ok(())
        }
    }
}

#[cfg(all(test, not(feature = "oracle")))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_feature_names_the_driver() {
        let err = OracleAdapter::new(None).init_pool(&Value::Null).await.err().unwrap();
        assert!(matches!(err, TetherError::DriverMissing { feature: "oracle", .. }));
    }
}
