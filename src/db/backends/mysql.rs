use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use futures::TryStreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use sqlx::mysql::{MySql, MySqlArguments, MySqlConnectOptions, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::pool::PoolConnection;
use sqlx::{Column, Either, Executor, MySqlPool, Row, TypeInfo, ValueRef};
use std::{str::FromStr, sync::Arc, time::Duration};
use tether_schema::ResultSet;
use tether_sqlcore::temporal::{format_date, format_datetime_compact, format_time};
use tether_sqlcore::{SqlParam, StatementKind, buffer_value};

use super::{
    BackendAdapter, BackendConnection, BackendPool, Statement, decimal_value, float_value,
    parse_options,
};
use crate::db::{BackendKind, Catalog};
use crate::error::TetherError;

type MySqlQuery<'q> = sqlx::query::Query<'q, MySql, MySqlArguments>;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MySqlOptions {
    uri: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    database: Option<String>,
    #[serde(alias = "max")]
    connection_limit: Option<u32>,
    connect_timeout: Option<u64>,
    ssl: Option<bool>,
}

impl MySqlOptions {
    fn connect_options(&self) -> Result<MySqlConnectOptions, TetherError> {
        let mut connect = match self.uri.as_deref() {
            Some(uri) => MySqlConnectOptions::from_str(uri)
                .map_err(|e| TetherError::Config(format!("invalid MySQL uri: {e}")))?,
            None => MySqlConnectOptions::new(),
        };
        if let Some(host) = &self.host {
            connect = connect.host(host);
        }
        if let Some(port) = self.port {
            connect = connect.port(port);
        }
        if let Some(user) = &self.user {
            connect = connect.username(user);
        }
        if let Some(password) = &self.password {
            connect = connect.password(password);
        }
        if let Some(database) = &self.database {
            connect = connect.database(database);
        }
        connect = match self.ssl {
            Some(true) => connect.ssl_mode(MySqlSslMode::Required),
            Some(false) => connect.ssl_mode(MySqlSslMode::Disabled),
            None => connect,
        };
        Ok(connect)
    }
}

pub(crate) struct MySqlAdapter;

#[async_trait]
impl BackendAdapter for MySqlAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::MySql
    }

    fn catalog(&self) -> Catalog {
        Catalog::MySql
    }

    async fn init_pool(&self, options: &Value) -> Result<Arc<dyn BackendPool>, TetherError> {
        let opts: MySqlOptions = parse_options(BackendKind::MySql, options)?;
        let pool = MySqlPoolOptions::new()
            .max_connections(opts.connection_limit.unwrap_or(10))
            .acquire_timeout(Duration::from_millis(opts.connect_timeout.unwrap_or(10_000)))
            .connect_lazy_with(opts.connect_options()?);
        Ok(Arc::new(MySqlPoolHandle { pool }))
    }
}

struct MySqlPoolHandle {
    pool: MySqlPool,
}

#[async_trait]
impl BackendPool for MySqlPoolHandle {
    async fn acquire(&self) -> Result<Box<dyn BackendConnection>, TetherError> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(MySqlConnection { conn: Some(conn) }))
    }

    fn is_broken(&self) -> bool {
        self.pool.is_closed()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

struct MySqlConnection {
    conn: Option<PoolConnection<MySql>>,
}

impl MySqlConnection {
    fn conn(&mut self) -> Result<&mut PoolConnection<MySql>, TetherError> {
        self.conn.as_mut().ok_or(TetherError::ConnectionClosed)
    }

    async fn raw(&mut self, sql: &str) -> Result<(), TetherError> {
        let conn = self.conn()?;
        (&mut **conn).execute(sqlx::raw_sql(sql)).await?;
        Ok(())
    }
}

fn bind_param<'q>(query: MySqlQuery<'q>, param: &SqlParam) -> MySqlQuery<'q> {
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

fn decode_value(row: &MySqlRow, index: usize) -> Result<Value, sqlx::Error> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_string();
    if type_name.ends_with("UNSIGNED") {
        return Ok(Value::from(row.try_get_unchecked::<u64, _>(index)?));
    }
    Ok(match type_name.as_str() {
        "BOOLEAN" => Value::Bool(row.try_get_unchecked::<bool, _>(index)?),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            Value::from(row.try_get_unchecked::<i64, _>(index)?)
        }
        "FLOAT" => float_value(f64::from(row.try_get_unchecked::<f32, _>(index)?)),
        "DOUBLE" => float_value(row.try_get_unchecked::<f64, _>(index)?),
        "DECIMAL" => decimal_value(&row.try_get_unchecked::<Decimal, _>(index)?.to_string()),
        "DATE" => Value::String(format_date(row.try_get_unchecked::<NaiveDate, _>(index)?)),
        "DATETIME" | "TIMESTAMP" => Value::String(format_datetime_compact(
            row.try_get_unchecked::<NaiveDateTime, _>(index)?,
        )),
        // TIME covers intervals beyond a day, which only the text form can hold.
        "TIME" => match row.try_get_unchecked::<NaiveTime, _>(index) {
            Ok(time) => Value::String(format_time(time)),
            Err(_) => Value::String(row.try_get_unchecked::<String, _>(index)?),
        },
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT"
        | "GEOMETRY" => buffer_value(&row.try_get_unchecked::<Vec<u8>, _>(index)?),
        "JSON" => row.try_get_unchecked::<Value, _>(index)?,
        _ => Value::String(row.try_get_unchecked::<String, _>(index)?),
    })
}

#[async_trait]
impl BackendConnection for MySqlConnection {
    async fn execute(&mut self, stmt: Statement<'_>) -> Result<ResultSet, TetherError> {
        let kind = StatementKind::classify(stmt.sql);
        let conn = self.conn()?;

        let mut query = sqlx::query(stmt.sql);
        for param in stmt.params {
            query = bind_param(query, param);
        }

        let mut rs = ResultSet::default();
        let mut rows_affected = 0u64;
        let mut last_insert_id = 0u64;
        {
            let mut stream = (&mut **conn).fetch_many(query);
            while let Some(step) = stream.try_next().await? {
                match step {
                    Either::Left(done) => {
                        rows_affected += done.rows_affected();
                        last_insert_id = done.last_insert_id();
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

        if kind == StatementKind::Query {
            if rs.rows.is_empty() {
                let described = (&mut **conn).describe(stmt.sql).await?;
                rs.cols = described.columns().iter().map(|c| c.name().to_string()).collect();
            }
        } else {
            rs.rows_affected = Some(rows_affected);
            rs.insert_id = Some(Value::from(last_insert_id));
        }
        Ok(rs)
    }

    async fn begin(&mut self) -> Result<(), TetherError> {
        self.raw("START TRANSACTION").await
    }

    async fn commit(&mut self) -> Result<(), TetherError> {
        self.raw("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), TetherError> {
        self.raw("ROLLBACK").await
    }

    async fn close(&mut self) -> Result<(), TetherError> {
        self.conn.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connection_limit_accepts_max_alias() {
        let opts: MySqlOptions =
            parse_options(BackendKind::MySql, &json!({ "host": "db", "max": 3 })).unwrap();
        assert_eq!(opts.connection_limit, Some(3));
        let connect = opts.connect_options().unwrap();
        assert_eq!(connect.get_host(), "db");
    }

    #[test]
    fn uri_is_parsed_before_overrides() {
        let opts: MySqlOptions = parse_options(
            BackendKind::MySql,
            &json!({ "uri": "mysql://app@h1:3307/shop", "database": "other" }),
        )
        .unwrap();
        let connect = opts.connect_options().unwrap();
        assert_eq!(connect.get_port(), 3307);
        assert_eq!(connect.get_database(), Some("other"));
    }
}
