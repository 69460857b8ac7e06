use async_trait::async_trait;
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Either, Executor, Row, Sqlite, SqlitePool, TypeInfo, ValueRef};
use std::{str::FromStr, sync::Arc, time::Duration};
use tether_schema::ResultSet;
use tether_sqlcore::{SqlParam, StatementKind, buffer_value};

use super::{BackendAdapter, BackendConnection, BackendPool, Statement, float_value, parse_options};
use crate::db::{BackendKind, Catalog};
use crate::error::TetherError;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SqliteOptions {
    /// Database file, `:memory:` when absent.
    filename: Option<String>,
    max: Option<u32>,
    busy_timeout_millis: Option<u64>,
}

pub(crate) struct SqliteAdapter;

#[async_trait]
impl BackendAdapter for SqliteAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn catalog(&self) -> Catalog {
        Catalog::Sqlite
    }

    async fn init_pool(&self, options: &Value) -> Result<Arc<dyn BackendPool>, TetherError> {
        let opts: SqliteOptions = parse_options(BackendKind::Sqlite, options)?;
        let filename = opts.filename.as_deref().unwrap_or(":memory:");
        let in_memory = filename == ":memory:";

        let connect = SqliteConnectOptions::from_str(&format!("sqlite:{filename}"))
            .map_err(|e| TetherError::Config(format!("invalid SQLite filename: {e}")))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(opts.busy_timeout_millis.unwrap_or(5000)));

        let mut pool = SqlitePoolOptions::new().max_connections(opts.max.unwrap_or(10));
        if in_memory {
            // The shared in-memory database lives as long as one connection does.
            pool = pool.min_connections(1).idle_timeout(None).max_lifetime(None);
        }
        let pool = pool.connect_with(connect).await.map_err(TetherError::from)?;
        Ok(Arc::new(SqlitePoolHandle { pool }))
    }
}

struct SqlitePoolHandle {
    pool: SqlitePool,
}

#[async_trait]
impl BackendPool for SqlitePoolHandle {
    async fn acquire(&self) -> Result<Box<dyn BackendConnection>, TetherError> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(SqliteConnection { conn: Some(conn) }))
    }

    fn is_broken(&self) -> bool {
        self.pool.is_closed()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

struct SqliteConnection {
    conn: Option<PoolConnection<Sqlite>>,
}

impl SqliteConnection {
    fn conn(&mut self) -> Result<&mut PoolConnection<Sqlite>, TetherError> {
        self.conn.as_mut().ok_or(TetherError::ConnectionClosed)
    }

    async fn raw(&mut self, sql: &str) -> Result<(), TetherError> {
        let conn = self.conn()?;
        (&mut **conn).execute(sqlx::raw_sql(sql)).await?;
        Ok(())
    }
}

fn bind_param<'q>(query: SqliteQuery<'q>, param: &SqlParam) -> SqliteQuery<'q> {
    match param.bindable() {
        SqlParam::Null | SqlParam::Typed(_) => query.bind(None::<String>),
        SqlParam::Bool(b) => query.bind(*b),
        SqlParam::Int(i) => query.bind(*i),
        SqlParam::Float(f) => query.bind(*f),
        SqlParam::Text(s) => query.bind(s.clone()),
        SqlParam::Bytes(bytes) => query.bind(bytes.clone()),
        SqlParam::Json(v) => query.bind(v.to_string()),
    }
}

/// Decodes by the storage class of the value, as SQLite types values, not columns.
fn decode_value(row: &SqliteRow, index: usize) -> Result<Value, sqlx::Error> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_ascii_uppercase();
    Ok(match type_name.as_str() {
        "INTEGER" | "INT8" | "BIGINT" => Value::from(row.try_get_unchecked::<i64, _>(index)?),
        "BOOLEAN" => Value::Bool(row.try_get_unchecked::<bool, _>(index)?),
        "REAL" | "NUMERIC" => float_value(row.try_get_unchecked::<f64, _>(index)?),
        "BLOB" => buffer_value(&row.try_get_unchecked::<Vec<u8>, _>(index)?),
        _ => Value::String(row.try_get_unchecked::<String, _>(index)?),
    })
}

#[async_trait]
impl BackendConnection for SqliteConnection {
    async fn execute(&mut self, stmt: Statement<'_>) -> Result<ResultSet, TetherError> {
        let kind = StatementKind::classify(stmt.sql);
        let conn = self.conn()?;

        let mut query = sqlx::query(stmt.sql);
        for param in stmt.params {
            query = bind_param(query, param);
        }

        let mut rs = ResultSet::default();
        let mut rows_affected = 0u64;
        let mut last_insert_id = 0i64;
        {
            let mut stream = (&mut **conn).fetch_many(query);
            while let Some(step) = stream.try_next().await? {
                match step {
                    Either::Left(done) => {
                        rows_affected += done.rows_affected();
                        last_insert_id = done.last_insert_rowid();
                    }
                    Either::Right(row) => {
                        if rs.cols.is_empty() {
                            rs.cols = row.columns().iter().map(|c| c.name().to_string()).collect();
                        }
                        let values = (0..row.len())
                            .map(|i| decode_value(&row, i))
                            .collect::<Result<Vec<_>, _>>()?;
                        rs.rows.push(values);
                    }
                }
            }
        }

        if rs.rows.is_empty() && kind == StatementKind::Query {
            let described = (&mut **conn).describe(stmt.sql).await?;
            rs.cols = described.columns().iter().map(|c| c.name().to_string()).collect();
        }
        if kind.is_dml() {
            rs.rows_affected = Some(rows_affected);
        }
        if kind == StatementKind::Insert && last_insert_id > 0 {
            rs.insert_id = Some(Value::from(last_insert_id));
        }
        Ok(rs)
    }

    async fn begin(&mut self) -> Result<(), TetherError> {
        self.raw("BEGIN").await
    }

    async fn commit(&mut self) -> Result<(), TetherError> {
        self.raw("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), TetherError> {
        self.raw("ROLLBACK").await
    }

    async fn close(&mut self) -> Result<(), TetherError> {
        // Dropping the pooled connection hands it back to the pool.
        self.conn.take();
        Ok(())
    }
}
