use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Deserialize;
use serde_json::Value;
use std::{
    borrow::Cow,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tether_schema::ResultSet;
use tether_sqlcore::temporal::{format_date, format_datetime, format_instant_iso, format_time};
use tether_sqlcore::{SqlParam, StatementKind, buffer_value};
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, ToSql};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

use super::{
    BackendAdapter, BackendConnection, BackendPool, Statement, decimal_value, float_value,
    parse_options,
};
use crate::db::{BackendKind, Catalog};
use crate::error::{BackendError, TetherError};

type TdsClient = Client<Compat<TcpStream>>;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SqlServerOptions {
    server: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    database: Option<String>,
    options: TdsFlags,
    pool: PoolLimits,
    connection_timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct TdsFlags {
    encrypt: Option<bool>,
    trust_server_certificate: bool,
    instance_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PoolLimits {
    max: Option<usize>,
}

impl SqlServerOptions {
    fn config(&self) -> Config {
        let mut config = Config::new();
        config.host(self.server.as_deref().unwrap_or("localhost"));
        config.port(self.port.unwrap_or(1433));
        if let Some(database) = &self.database {
            config.database(database);
        }
        config.authentication(AuthMethod::sql_server(
            self.user.as_deref().unwrap_or("sa"),
            self.password.as_deref().unwrap_or_default(),
        ));
        match self.options.encrypt {
            Some(true) => config.encryption(EncryptionLevel::Required),
            Some(false) => config.encryption(EncryptionLevel::NotSupported),
            None => {}
        }
        if self.options.trust_server_certificate {
            config.trust_cert();
        }
        if let Some(instance) = &self.options.instance_name {
            config.instance_name(instance);
        }
        config.application_name("tether");
        config
    }
}

pub(crate) struct SqlServerAdapter;

#[async_trait]
impl BackendAdapter for SqlServerAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::SqlServer
    }

    fn catalog(&self) -> Catalog {
        Catalog::SqlServer
    }

    async fn init_pool(&self, options: &Value) -> Result<Arc<dyn BackendPool>, TetherError> {
        let opts: SqlServerOptions = parse_options(BackendKind::SqlServer, options)?;
        let max = opts.pool.max.unwrap_or(10).max(1);
        Ok(Arc::new(SqlServerPool {
            inner: Arc::new(PoolInner {
                config: opts.config(),
                permits: Arc::new(Semaphore::new(max)),
                idle: Mutex::new(Vec::new()),
                broken: AtomicBool::new(false),
                connect_timeout: Duration::from_millis(opts.connection_timeout.unwrap_or(15_000)),
            }),
        }))
    }
}

struct PoolInner {
    config: Config,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<TdsClient>>,
    broken: AtomicBool,
    connect_timeout: Duration,
}

impl PoolInner {
    async fn connect(&self) -> Result<TdsClient, TetherError> {
        let config = self.config.clone();
        let connect = async move {
            let tcp = TcpStream::connect(config.get_addr()).await?;
            tcp.set_nodelay(true)?;
            Ok::<_, TetherError>(Client::connect(config, tcp.compat_write()).await?)
        };
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(client)) => Ok(client),
            Ok(Err(e)) => {
                self.broken.store(true, Ordering::Relaxed);
                Err(e)
            }
            Err(_) => {
                self.broken.store(true, Ordering::Relaxed);
                Err(BackendError::new("Connection timeout").fatal().into())
            }
        }
    }
}

struct SqlServerPool {
    inner: Arc<PoolInner>,
}

#[async_trait]
impl BackendPool for SqlServerPool {
    async fn acquire(&self) -> Result<Box<dyn BackendConnection>, TetherError> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BackendError::new("Connection pool closed").fatal())?;

        let reused = self.inner.idle.lock().await.pop();
        let client = match reused {
            Some(client) => client,
            None => self.inner.connect().await?,
        };
        Ok(Box::new(SqlServerConnection {
            client: Some(client),
            pool: self.inner.clone(),
            _permit: permit,
            poisoned: false,
        }))
    }

    fn is_broken(&self) -> bool {
        self.inner.broken.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        self.inner.permits.close();
        let idle = std::mem::take(&mut *self.inner.idle.lock().await);
        for client in idle {
            let _ = client.close().await;
        }
    }
}

struct SqlServerConnection {
    client: Option<TdsClient>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
    /// A fatal error hit this connection; it must not go back to the pool.
    poisoned: bool,
}

struct TdsParam<'a>(&'a SqlParam);

impl ToSql for TdsParam<'_> {
    fn to_sql(&self) -> ColumnData<'_> {
        match self.0.bindable() {
            SqlParam::Null | SqlParam::Typed(_) => ColumnData::String(None),
            SqlParam::Bool(b) => ColumnData::Bit(Some(*b)),
            SqlParam::Int(i) => ColumnData::I64(Some(*i)),
            SqlParam::Float(f) => ColumnData::F64(Some(*f)),
            SqlParam::Text(s) => ColumnData::String(Some(Cow::Borrowed(s.as_str()))),
            SqlParam::Bytes(bytes) => ColumnData::Binary(Some(Cow::Borrowed(bytes.as_slice()))),
            SqlParam::Json(v) => ColumnData::String(Some(Cow::Owned(v.to_string()))),
        }
    }
}

fn temporal<'a, T: FromSql<'a>>(
    data: &'a ColumnData<'static>,
    format: impl FnOnce(T) -> String,
) -> Result<Value, TetherError> {
    Ok(T::from_sql(data)?.map_or(Value::Null, |v| Value::String(format(v))))
}

fn decode_value(data: &ColumnData<'static>) -> Result<Value, TetherError> {
    Ok(match data {
        ColumnData::U8(v) => v.map_or(Value::Null, Value::from),
        ColumnData::I16(v) => v.map_or(Value::Null, Value::from),
        ColumnData::I32(v) => v.map_or(Value::Null, Value::from),
        ColumnData::I64(v) => v.map_or(Value::Null, Value::from),
        ColumnData::F32(v) => v.map_or(Value::Null, |f| float_value(f64::from(f))),
        ColumnData::F64(v) => v.map_or(Value::Null, float_value),
        ColumnData::Bit(v) => v.map_or(Value::Null, Value::Bool),
        ColumnData::String(v) => v
            .as_ref()
            .map_or(Value::Null, |s| Value::String(s.to_string())),
        ColumnData::Guid(v) => v.map_or(Value::Null, |g| Value::String(g.to_string())),
        ColumnData::Binary(v) => v.as_ref().map_or(Value::Null, |b| buffer_value(b)),
        ColumnData::Numeric(v) => v.map_or(Value::Null, |n| decimal_value(&n.to_string())),
        ColumnData::Xml(v) => v
            .as_ref()
            .map_or(Value::Null, |x| Value::String(x.clone().into_owned().into_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            temporal::<NaiveDateTime>(data, format_datetime)?
        }
        ColumnData::Date(_) => temporal::<NaiveDate>(data, format_date)?,
        ColumnData::Time(_) => temporal::<NaiveTime>(data, format_time)?,
        ColumnData::DateTimeOffset(_) => {
            temporal::<DateTime<FixedOffset>>(data, |v| format_instant_iso(&v))?
        }
    })
}

fn rows_of(rows: Vec<tiberius::Row>) -> Result<Vec<Vec<Value>>, TetherError> {
    rows.into_iter()
        .map(|row| row.into_iter().map(|data| decode_value(&data)).collect())
        .collect()
}

/// The first result set that has rows, or none.
fn first_non_empty<T>(sets: Vec<Vec<T>>) -> Vec<T> {
    sets.into_iter().find(|set| !set.is_empty()).unwrap_or_default()
}

/// Statement with a trailing batch that reports what the statement did.
fn with_report(sql: &str, report: &str) -> String {
    format!("{}; {report}", sql.trim_end().trim_end_matches(';'))
}

impl SqlServerConnection {
    fn client(&mut self) -> Result<&mut TdsClient, TetherError> {
        self.client.as_mut().ok_or(TetherError::ConnectionClosed)
    }

    fn track<T>(&mut self, result: Result<T, TetherError>) -> Result<T, TetherError> {
        if let Err(TetherError::Backend(err)) = &result
            && err.fatal
        {
            self.poisoned = true;
            self.pool.broken.store(true, Ordering::Relaxed);
        }
        result
    }

    async fn run(&mut self, stmt: Statement<'_>) -> Result<ResultSet, TetherError> {
        let kind = StatementKind::classify(stmt.sql);
        let params: Vec<TdsParam<'_>> = stmt.params.iter().map(TdsParam).collect();
        let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
        let client = self.client()?;
        let mut rs = ResultSet::default();

        match kind {
            StatementKind::Query => {
                let mut stream = client.query(stmt.sql, &refs).await?;
                rs.cols = stream
                    .columns()
                    .await?
                    .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
                    .unwrap_or_default();
                rs.rows = rows_of(stream.into_first_result().await?)?;
            }
            StatementKind::Insert | StatementKind::Modify => {
                let report = if kind == StatementKind::Insert {
                    "SELECT @@ROWCOUNT AS RowsAffected, CAST(SCOPE_IDENTITY() AS BIGINT) AS Counter"
                } else {
                    "SELECT @@ROWCOUNT AS RowsAffected"
                };
                let sql = with_report(stmt.sql, report);
                let mut results = client.query(sql, &refs).await?.into_results().await?;
                let summary = results.pop().unwrap_or_default();
                // Result sets ahead of the summary come from OUTPUT clauses.
                if let Some(output) = results.into_iter().next() {
                    if let Some(first) = output.first() {
                        rs.cols = first.columns().iter().map(|c| c.name().to_string()).collect();
                    }
                    rs.rows = rows_of(output)?;
                }
                if let Some(row) = summary.into_iter().next() {
                    let values: Vec<Value> = row
                        .into_iter()
                        .map(|data| decode_value(&data))
                        .collect::<Result<_, _>>()?;
                    rs.rows_affected = values.first().and_then(Value::as_u64);
                    if let Some(id) = values.get(1).filter(|v| !v.is_null()) {
                        rs.insert_id = Some(id.clone());
                    }
                }
            }
            StatementKind::Other => {
                // Procedures and batches may still produce rows.
                let results = client.query(stmt.sql, &refs).await?.into_results().await?;
                let rows = first_non_empty(results);
                if let Some(first) = rows.first() {
                    rs.cols = first.columns().iter().map(|c| c.name().to_string()).collect();
                }
                rs.rows = rows_of(rows)?;
            }
        }
        Ok(rs)
    }

    async fn batch(&mut self, sql: &str) -> Result<(), TetherError> {
        let result = match self.client() {
            Ok(client) => client.execute(sql, &[]).await.map(|_| ()).map_err(TetherError::from),
            Err(e) => Err(e),
        };
        self.track(result)
    }
}

#[async_trait]
impl BackendConnection for SqlServerConnection {
    async fn execute(&mut self, stmt: Statement<'_>) -> Result<ResultSet, TetherError> {
        let result = self.run(stmt).await;
        self.track(result)
    }

    async fn begin(&mut self) -> Result<(), TetherError> {
        self.batch("BEGIN TRAN").await
    }

    async fn commit(&mut self) -> Result<(), TetherError> {
        self.batch("COMMIT TRAN").await
    }

    async fn rollback(&mut self) -> Result<(), TetherError> {
        self.batch("ROLLBACK TRAN").await
    }

    async fn close(&mut self) -> Result<(), TetherError> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        if self.poisoned || self.pool.permits.is_closed() {
            debug!("Dropping SQL Server connection");
            client.close().await?;
        } else {
            self.pool.idle.lock().await.push(client);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn report_batch_replaces_trailing_semicolon() {
        assert_eq!(
            with_report("INSERT INTO t VALUES (1);  ", "SELECT @@ROWCOUNT AS RowsAffected"),
            "INSERT INTO t VALUES (1); SELECT @@ROWCOUNT AS RowsAffected"
        );
    }

    #[test]
    fn options_follow_mssql_layout() {
        let opts: SqlServerOptions = parse_options(
            BackendKind::SqlServer,
            &json!({
                "server": "sql.local",
                "port": 1444,
                "user": "app",
                "password": "pw",
                "database": "erp",
                "options": { "encrypt": false, "trustServerCertificate": true },
                "pool": { "max": 5 }
            }),
        )
        .unwrap();
        assert_eq!(opts.pool.max, Some(5));
        assert!(opts.options.trust_server_certificate);
        assert_eq!(opts.config().get_addr(), "sql.local:1444");
    }

    #[test]
    fn column_data_becomes_wire_values() {
        assert_eq!(decode_value(&ColumnData::I32(Some(7))).unwrap(), json!(7));
        assert_eq!(decode_value(&ColumnData::I32(None)).unwrap(), Value::Null);
        assert_eq!(
            decode_value(&ColumnData::Binary(Some(Cow::Owned(vec![255])))).unwrap(),
            json!({ "type": "buffer", "data": "/w==" })
        );
        assert_eq!(
            decode_value(&ColumnData::String(Some(Cow::Borrowed("x")))).unwrap(),
            json!("x")
        );
    }

    #[test]
    fn procedures_and_batches_return_their_rows() {
        assert_eq!(StatementKind::classify("EXEC sp_who"), StatementKind::Other);
        assert_eq!(
            StatementKind::classify("DECLARE @n INT = 1; SELECT @n AS n"),
            StatementKind::Other
        );
        assert_eq!(first_non_empty(vec![vec![], vec![1, 2], vec![3]]), vec![1, 2]);
        assert!(first_non_empty::<u8>(vec![vec![], vec![]]).is_empty());
    }

    #[test]
    fn typed_params_bind_inner_value() {
        let param = SqlParam::Typed(tether_sqlcore::TypedParam {
            value: Box::new(SqlParam::Int(3)),
            data_type: "int".into(),
            max_len: None,
            scale: None,
        });
        assert!(matches!(TdsParam(&param).to_sql(), ColumnData::I64(Some(3))));
    }
}
