use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::TryStreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::types::{PgInterval, PgMoney, PgTimeTz};
use sqlx::postgres::{
    PgArguments, PgConnectOptions, PgPoolOptions, PgRow, PgSslMode, PgTypeInfo, PgTypeKind,
    Postgres,
};
use sqlx::{Column, Either, Executor, PgPool, Row, Statement as _, TypeInfo, ValueRef};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::{str::FromStr, sync::Arc, time::Duration};
use tether_schema::ResultSet;
use tether_sqlcore::temporal::{
    format_date, format_datetime, format_instant_iso, format_time, parse_date_text,
    parse_datetime_text, parse_instant_text, parse_time_text,
};
use tether_sqlcore::{SqlParam, StatementKind, buffer_value};

use super::{
    BackendAdapter, BackendConnection, BackendPool, Statement, counter_column, decimal_value,
    float_value, parse_options,
};
use crate::db::{BackendKind, Catalog};
use crate::error::TetherError;

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PostgresOptions {
    connection_string: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    database: Option<String>,
    max: Option<u32>,
    idle_timeout_millis: Option<u64>,
    connection_timeout_millis: Option<u64>,
    /// `true` requires TLS, `false` disables it, absent prefers it.
    ssl: Option<bool>,
}

impl PostgresOptions {
    fn connect_options(&self) -> Result<PgConnectOptions, TetherError> {
        let mut connect = match self.connection_string.as_deref() {
            Some(url) => PgConnectOptions::from_str(url)
                .map_err(|e| TetherError::Config(format!("invalid Postgres connectionString: {e}")))?,
            None => PgConnectOptions::new_without_pgpass(),
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
            Some(true) => connect.ssl_mode(PgSslMode::Require),
            Some(false) => connect.ssl_mode(PgSslMode::Disable),
            None => connect,
        };
        Ok(connect.application_name("tether"))
    }
}

pub(crate) struct PostgresAdapter;

#[async_trait]
impl BackendAdapter for PostgresAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn catalog(&self) -> Catalog {
        Catalog::Postgres
    }

    async fn init_pool(&self, options: &Value) -> Result<Arc<dyn BackendPool>, TetherError> {
        let opts: PostgresOptions = parse_options(BackendKind::Postgres, options)?;
        let pool = PgPoolOptions::new()
            .max_connections(opts.max.unwrap_or(10))
            .idle_timeout(Duration::from_millis(opts.idle_timeout_millis.unwrap_or(10_000)))
            .acquire_timeout(Duration::from_millis(
                opts.connection_timeout_millis.unwrap_or(30_000),
            ))
            .connect_lazy_with(opts.connect_options()?);
        Ok(Arc::new(PostgresPool { pool }))
    }
}

struct PostgresPool {
    pool: PgPool,
}

#[async_trait]
impl BackendPool for PostgresPool {
    async fn acquire(&self) -> Result<Box<dyn BackendConnection>, TetherError> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PostgresConnection { conn: Some(conn) }))
    }

    fn is_broken(&self) -> bool {
        self.pool.is_closed()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

struct PostgresConnection {
    conn: Option<PoolConnection<Postgres>>,
}

impl PostgresConnection {
    fn conn(&mut self) -> Result<&mut PoolConnection<Postgres>, TetherError> {
        self.conn.as_mut().ok_or(TetherError::ConnectionClosed)
    }

    async fn raw(&mut self, sql: &str) -> Result<(), TetherError> {
        let conn = self.conn()?;
        (&mut **conn).execute(sqlx::raw_sql(sql)).await?;
        Ok(())
    }
}

/// Untyped NULL, so the server infers the parameter type from context.
struct UntypedNull;

impl sqlx::Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(sqlx::postgres::types::Oid(0))
    }
}

impl<'q> sqlx::Encode<'q, Postgres> for UntypedNull {
    fn encode_by_ref(
        &self,
        _buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        Ok(sqlx::encode::IsNull::Yes)
    }
}

/// Text with no declared type. Its bytes are valid input for text-like and enum placeholders.
struct UntypedText(String);

impl sqlx::Type<Postgres> for UntypedText {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(sqlx::postgres::types::Oid(0))
    }
}

impl<'q> sqlx::Encode<'q, Postgres> for UntypedText {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        buf.extend_from_slice(self.0.as_bytes());
        Ok(sqlx::encode::IsNull::No)
    }
}

/// Text-like types whose binary form is the UTF-8 text itself.
fn is_text_like(type_name: &str) -> bool {
    matches!(
        type_name,
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CITEXT" | "XML" | "UNKNOWN"
    )
}

/// A parameter converted to the type the server inferred for its placeholder.
///
/// Extended-protocol parameters are sent in binary, so text from the wire has to be parsed
/// here the way the server would parse a text-format parameter.
#[derive(Debug, Clone, PartialEq)]
enum PgBind {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Numeric(Decimal),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    Timestamptz(DateTime<Utc>),
    Uuid(uuid::Uuid),
    Json(Value),
    Bytes(Vec<u8>),
    Text(String),
}

fn invalid_input(type_name: &str, text: &str) -> TetherError {
    TetherError::InvalidRequest(format!(
        "invalid input syntax for type {}: \"{text}\"",
        type_name.to_ascii_lowercase()
    ))
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "t" | "true" | "y" | "yes" | "on" | "1" => Some(true),
        "f" | "false" | "n" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_numeric(text: &str) -> Option<Decimal> {
    let text = text.trim();
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}

fn coerce_text(text: &str, type_name: &str) -> Result<PgBind, TetherError> {
    let invalid = || invalid_input(type_name, text);
    let trimmed = text.trim();
    Ok(match type_name {
        "BOOL" => PgBind::Bool(parse_bool(text).ok_or_else(invalid)?),
        "INT2" => PgBind::Int2(trimmed.parse().map_err(|_| invalid())?),
        "INT4" => PgBind::Int4(trimmed.parse().map_err(|_| invalid())?),
        "INT8" => PgBind::Int8(trimmed.parse().map_err(|_| invalid())?),
        "FLOAT4" => PgBind::Float4(trimmed.parse().map_err(|_| invalid())?),
        "FLOAT8" => PgBind::Float8(trimmed.parse().map_err(|_| invalid())?),
        "NUMERIC" => PgBind::Numeric(parse_numeric(text).ok_or_else(invalid)?),
        "DATE" => PgBind::Date(parse_date_text(text).ok_or_else(invalid)?),
        "TIME" => PgBind::Time(parse_time_text(text).ok_or_else(invalid)?),
        "TIMESTAMP" => PgBind::Timestamp(parse_datetime_text(text).ok_or_else(invalid)?),
        "TIMESTAMPTZ" => PgBind::Timestamptz(parse_instant_text(text).ok_or_else(invalid)?),
        "UUID" => PgBind::Uuid(uuid::Uuid::parse_str(trimmed).map_err(|_| invalid())?),
        "JSON" | "JSONB" => PgBind::Json(serde_json::from_str(text).map_err(|_| invalid())?),
        "BYTEA" => PgBind::Bytes(text.as_bytes().to_vec()),
        _ => PgBind::Text(text.to_string()),
    })
}

/// Converts a wire parameter for a placeholder of type `target` (unknown when `None`).
fn coerce(param: &SqlParam, target: Option<&str>) -> Result<PgBind, TetherError> {
    let param = param.bindable();
    let out_of_range = |value: &dyn std::fmt::Display, type_name: &str| {
        TetherError::InvalidRequest(format!(
            "value {value} is out of range for type {}",
            type_name.to_ascii_lowercase()
        ))
    };
    Ok(match (param, target) {
        (SqlParam::Null | SqlParam::Typed(_), _) => PgBind::Null,
        (SqlParam::Text(text), Some(type_name)) => coerce_text(text, type_name)?,
        (SqlParam::Text(text), None) => PgBind::Text(text.clone()),

        (SqlParam::Int(i), Some(t)) if is_text_like(t) => PgBind::Text(i.to_string()),
        (SqlParam::Float(f), Some(t)) if is_text_like(t) => PgBind::Text(f.to_string()),
        #[allow(clippy::cast_possible_truncation)]
        (SqlParam::Float(f), Some(t @ ("INT2" | "INT4" | "INT8"))) => {
            if f.fract() != 0.0 || !f.is_finite() {
                return Err(invalid_input(t, &f.to_string()));
            }
            return coerce(&SqlParam::Int(*f as i64), Some(t));
        }

        (SqlParam::Int(i), Some(t @ "INT2")) => {
            PgBind::Int2(i16::try_from(*i).map_err(|_| out_of_range(i, t))?)
        }
        (SqlParam::Int(i), Some(t @ "INT4")) => {
            PgBind::Int4(i32::try_from(*i).map_err(|_| out_of_range(i, t))?)
        }
        #[allow(clippy::cast_precision_loss)]
        (SqlParam::Int(i), Some("FLOAT4")) => PgBind::Float4(*i as f32),
        #[allow(clippy::cast_precision_loss)]
        (SqlParam::Int(i), Some("FLOAT8")) => PgBind::Float8(*i as f64),
        (SqlParam::Int(i), Some("NUMERIC")) => PgBind::Numeric(Decimal::from(*i)),
        (SqlParam::Int(i), Some("BOOL")) => PgBind::Bool(*i != 0),
        (SqlParam::Int(i), _) => PgBind::Int8(*i),

        #[allow(clippy::cast_possible_truncation)]
        (SqlParam::Float(f), Some("FLOAT4")) => PgBind::Float4(*f as f32),
        (SqlParam::Float(f), Some(t @ "NUMERIC")) => {
            PgBind::Numeric(Decimal::try_from(*f).map_err(|_| out_of_range(f, t))?)
        }
        (SqlParam::Float(f), _) => PgBind::Float8(*f),

        (SqlParam::Bool(b), Some(t)) if is_text_like(t) => PgBind::Text(b.to_string()),
        (SqlParam::Bool(b), _) => PgBind::Bool(*b),
        (SqlParam::Bytes(bytes), _) => PgBind::Bytes(bytes.clone()),
        (SqlParam::Json(v), Some(t)) if is_text_like(t) => PgBind::Text(v.to_string()),
        (SqlParam::Json(v), _) => PgBind::Json(v.clone()),
    })
}

impl PgBind {
    fn bind_to<'q>(self, query: PgQuery<'q>) -> PgQuery<'q> {
        match self {
            Self::Null => query.bind(UntypedNull),
            Self::Bool(b) => query.bind(b),
            Self::Int2(i) => query.bind(i),
            Self::Int4(i) => query.bind(i),
            Self::Int8(i) => query.bind(i),
            Self::Float4(f) => query.bind(f),
            Self::Float8(f) => query.bind(f),
            Self::Numeric(d) => query.bind(d),
            Self::Date(d) => query.bind(d),
            Self::Time(t) => query.bind(t),
            Self::Timestamp(ts) => query.bind(ts),
            Self::Timestamptz(ts) => query.bind(ts),
            Self::Uuid(u) => query.bind(u),
            Self::Json(v) => query.bind(sqlx::types::Json(v)),
            Self::Bytes(bytes) => query.bind(bytes),
            Self::Text(text) => query.bind(UntypedText(text)),
        }
    }
}

/// Postgres text output of a `timetz`, e.g. `10:00:00+02` or `10:00:00.5-03:30`.
fn format_timetz(value: &PgTimeTz<NaiveTime, FixedOffset>) -> String {
    let secs = value.offset.local_minus_utc();
    let sign = if secs < 0 { '-' } else { '+' };
    let (hours, minutes) = (secs.abs() / 3600, secs.abs() % 3600 / 60);
    let mut text = format!("{}{sign}{hours:02}", value.time.format("%H:%M:%S%.f"));
    if minutes != 0 {
        text.push_str(&format!(":{minutes:02}"));
    }
    text
}

/// Postgres text output of an `interval`, e.g. `1 year 2 mons 3 days 04:05:06`.
fn format_interval(value: &PgInterval) -> String {
    fn unit(parts: &mut Vec<String>, n: i64, singular: &str, plural: &str) {
        if n != 0 {
            parts.push(format!("{n} {}", if n == 1 { singular } else { plural }));
        }
    }
    let mut parts = Vec::new();
    unit(&mut parts, i64::from(value.months / 12), "year", "years");
    unit(&mut parts, i64::from(value.months % 12), "mon", "mons");
    unit(&mut parts, i64::from(value.days), "day", "days");

    let micros = value.microseconds;
    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 { "-" } else { "" };
        let total = micros.unsigned_abs();
        let (secs, frac) = (total / 1_000_000, total % 1_000_000);
        let mut time = format!("{sign}{:02}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60);
        if frac != 0 {
            let digits = format!("{frac:06}");
            time.push('.');
            time.push_str(digits.trim_end_matches('0'));
        }
        parts.push(time);
    }
    parts.join(" ")
}

/// Postgres text output of an `inet`/`cidr` from its binary form.
fn format_inet(bytes: &[u8], always_prefix: bool) -> Option<String> {
    let [family, bits, _is_cidr, len, addr @ ..] = bytes else {
        return None;
    };
    let (ip, full) = match (*family, *len, addr) {
        (2, 4, [a, b, c, d]) => (IpAddr::V4(Ipv4Addr::new(*a, *b, *c, *d)), 32),
        (3, 16, octets) => (IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(octets).ok()?)), 128),
        _ => return None,
    };
    Some(if always_prefix || *bits != full {
        format!("{ip}/{bits}")
    } else {
        ip.to_string()
    })
}

fn decode_array<T, F>(row: &PgRow, index: usize, map: F) -> Result<Value, sqlx::Error>
where
    T: for<'r> sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
    Vec<Option<T>>: for<'r> sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
    F: Fn(T) -> Value,
{
    let items: Vec<Option<T>> = row.try_get(index)?;
    Ok(Value::Array(
        items
            .into_iter()
            .map(|item| item.map_or(Value::Null, &map))
            .collect(),
    ))
}

fn decode_value(row: &PgRow, index: usize) -> Result<Value, sqlx::Error> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_string();
    Ok(match type_name.as_str() {
        "BOOL" => Value::Bool(row.try_get(index)?),
        "INT2" => Value::from(row.try_get::<i16, _>(index)?),
        "INT4" => Value::from(row.try_get::<i32, _>(index)?),
        "INT8" => Value::from(row.try_get::<i64, _>(index)?),
        "OID" => Value::from(row.try_get::<sqlx::postgres::types::Oid, _>(index)?.0),
        "FLOAT4" => float_value(f64::from(row.try_get::<f32, _>(index)?)),
        "FLOAT8" => float_value(row.try_get::<f64, _>(index)?),
        "NUMERIC" => decimal_value(&row.try_get::<Decimal, _>(index)?.to_string()),
        "BYTEA" => buffer_value(&row.try_get::<Vec<u8>, _>(index)?),
        "DATE" => Value::String(format_date(row.try_get::<NaiveDate, _>(index)?)),
        "TIME" => Value::String(format_time(row.try_get::<NaiveTime, _>(index)?)),
        "TIMESTAMP" => Value::String(format_datetime(row.try_get::<NaiveDateTime, _>(index)?)),
        "TIMESTAMPTZ" => {
            Value::String(format_instant_iso(&row.try_get::<DateTime<Utc>, _>(index)?))
        }
        "TIMETZ" => Value::String(format_timetz(
            &row.try_get::<PgTimeTz<NaiveTime, FixedOffset>, _>(index)?,
        )),
        "INTERVAL" => Value::String(format_interval(&row.try_get::<PgInterval, _>(index)?)),
        "MONEY" => decimal_value(&row.try_get::<PgMoney, _>(index)?.to_decimal(2).to_string()),
        "INET" | "CIDR" => {
            let bytes = raw_bytes(row, index)?;
            format_inet(bytes, type_name == "CIDR")
                .map_or_else(|| buffer_value(bytes), Value::String)
        }
        "JSON" | "JSONB" => row.try_get::<Value, _>(index)?,
        "UUID" => Value::String(row.try_get::<uuid::Uuid, _>(index)?.to_string()),
        "BOOL[]" => decode_array::<bool, _>(row, index, Value::Bool)?,
        "INT2[]" => decode_array::<i16, _>(row, index, Value::from)?,
        "INT4[]" => decode_array::<i32, _>(row, index, Value::from)?,
        "INT8[]" => decode_array::<i64, _>(row, index, Value::from)?,
        "FLOAT4[]" => decode_array::<f32, _>(row, index, |f| float_value(f64::from(f)))?,
        "FLOAT8[]" => decode_array::<f64, _>(row, index, float_value)?,
        "NUMERIC[]" => decode_array::<Decimal, _>(row, index, |d| decimal_value(&d.to_string()))?,
        "TEXT[]" | "VARCHAR[]" | "BPCHAR[]" | "NAME[]" => {
            decode_array::<String, _>(row, index, Value::String)?
        }
        "UUID[]" => decode_array::<uuid::Uuid, _>(row, index, |u| Value::String(u.to_string()))?,
        "DATE[]" => decode_array::<NaiveDate, _>(row, index, |d| Value::String(format_date(d)))?,
        "TIMESTAMP[]" => {
            decode_array::<NaiveDateTime, _>(row, index, |ts| Value::String(format_datetime(ts)))?
        }
        "TIMESTAMPTZ[]" => decode_array::<DateTime<Utc>, _>(row, index, |ts| {
            Value::String(format_instant_iso(&ts))
        })?,
        "JSON[]" | "JSONB[]" => decode_array::<Value, _>(row, index, |v| v)?,
        name if is_text_like(name) || matches!(raw.type_info().kind(), PgTypeKind::Enum(_)) => {
            Value::String(row.try_get_unchecked::<String, _>(index)?)
        }
        // Binary form of anything else, rather than guessing at a text rendering.
        _ => buffer_value(raw_bytes(row, index)?),
    })
}

fn raw_bytes(row: &PgRow, index: usize) -> Result<&[u8], sqlx::Error> {
    let raw = row.try_get_raw(index)?;
    raw.as_bytes().map_err(sqlx::Error::Decode)
}

#[async_trait]
impl BackendConnection for PostgresConnection {
    async fn execute(&mut self, stmt: Statement<'_>) -> Result<ResultSet, TetherError> {
        let kind = StatementKind::classify(stmt.sql);
        let conn = self.conn()?;

        // The server infers each placeholder's type; parameters are converted to match.
        let param_types: Vec<PgTypeInfo> = if stmt.params.is_empty() {
            Vec::new()
        } else {
            let prepared = (&mut **conn).prepare(stmt.sql).await?;
            match prepared.parameters() {
                Some(Either::Left(types)) => types.to_vec(),
                _ => Vec::new(),
            }
        };

        let mut query = sqlx::query(stmt.sql);
        for (i, param) in stmt.params.iter().enumerate() {
            let target = param_types.get(i).map(TypeInfo::name);
            query = coerce(param, target)?.bind_to(query);
        }

        let mut rs = ResultSet::default();
        let mut rows_affected = 0u64;
        {
            let mut stream = (&mut **conn).fetch_many(query);
            while let Some(step) = stream.try_next().await? {
                match step {
                    Either::Left(done) => rows_affected += done.rows_affected(),
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
        // INSERT .. RETURNING counter of a single row reports the generated key.
        if kind == StatementKind::Insert
            && rs.rows.len() == 1
            && let Some(index) = counter_column(&rs.cols)
            && rs.rows[0][index].as_i64().is_some_and(|id| id > 0)
        {
            rs.insert_id = Some(rs.rows[0][index].clone());
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
        self.conn.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn options_accept_connection_string_and_overrides() {
        let opts: PostgresOptions = parse_options(
            BackendKind::Postgres,
            &json!({
                "connectionString": "postgres://app@db.local:5433/sales",
                "password": "secret",
                "max": 4
            }),
        )
        .unwrap();
        let connect = opts.connect_options().unwrap();
        assert_eq!(connect.get_host(), "db.local");
        assert_eq!(connect.get_port(), 5433);
        assert_eq!(connect.get_database(), Some("sales"));
        assert_eq!(opts.max, Some(4));
    }

    #[test]
    fn bad_connection_string_is_a_config_error() {
        let opts = PostgresOptions {
            connection_string: Some("not a url".into()),
            ..Default::default()
        };
        assert!(matches!(opts.connect_options(), Err(TetherError::Config(_))));
    }

    #[test]
    fn text_parameters_follow_the_inferred_type() {
        let date = SqlParam::Text("2024-01-02".into());
        assert_eq!(
            coerce(&date, Some("DATE")).unwrap(),
            PgBind::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap())
        );
        let ts = SqlParam::Text("2024-01-02 10:11:12".into());
        assert_eq!(
            coerce(&ts, Some("TIMESTAMP")).unwrap(),
            PgBind::Timestamp(
                NaiveDate::from_ymd_opt(2024, 1, 2)
                    .unwrap()
                    .and_hms_opt(10, 11, 12)
                    .unwrap()
            )
        );
        assert_eq!(
            coerce(&SqlParam::Text(" 42 ".into()), Some("INT4")).unwrap(),
            PgBind::Int4(42)
        );
        assert_eq!(
            coerce(&SqlParam::Text("1.50".into()), Some("NUMERIC")).unwrap(),
            PgBind::Numeric(Decimal::new(150, 2))
        );
        assert_eq!(
            coerce(&SqlParam::Text("abc".into()), Some("VARCHAR")).unwrap(),
            PgBind::Text("abc".into())
        );
        assert_eq!(
            coerce(&SqlParam::Text("abc".into()), None).unwrap(),
            PgBind::Text("abc".into())
        );

        let err = coerce(&SqlParam::Text("yesterday-ish".into()), Some("DATE")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid request: invalid input syntax for type date: \"yesterday-ish\""
        );
    }

    #[test]
    fn numbers_narrow_to_the_placeholder_type() {
        assert_eq!(coerce(&SqlParam::Int(7), Some("INT2")).unwrap(), PgBind::Int2(7));
        assert_eq!(coerce(&SqlParam::Int(7), Some("INT8")).unwrap(), PgBind::Int8(7));
        assert_eq!(
            coerce(&SqlParam::Int(7), Some("TEXT")).unwrap(),
            PgBind::Text("7".into())
        );
        assert_eq!(coerce(&SqlParam::Float(3.0), Some("INT4")).unwrap(), PgBind::Int4(3));
        assert!(coerce(&SqlParam::Float(3.5), Some("INT4")).is_err());
        assert!(matches!(
            coerce(&SqlParam::Int(70_000), Some("INT2")),
            Err(TetherError::InvalidRequest(_))
        ));
        assert_eq!(coerce(&SqlParam::Float(1.5), Some("FLOAT4")).unwrap(), PgBind::Float4(1.5));
        assert_eq!(coerce(&SqlParam::Null, Some("DATE")).unwrap(), PgBind::Null);
        assert_eq!(
            coerce(&SqlParam::Bool(true), Some("TEXT")).unwrap(),
            PgBind::Text("true".into())
        );
    }

    #[test]
    fn extended_types_render_as_server_text() {
        let timetz = PgTimeTz {
            time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            offset: FixedOffset::east_opt(2 * 3600).unwrap(),
        };
        assert_eq!(format_timetz(&timetz), "10:00:00+02");
        let timetz = PgTimeTz {
            time: NaiveTime::from_hms_opt(8, 15, 0).unwrap(),
            offset: FixedOffset::west_opt(3 * 3600 + 1800).unwrap(),
        };
        assert_eq!(format_timetz(&timetz), "08:15:00-03:30");

        let day = PgInterval { months: 0, days: 1, microseconds: 0 };
        assert_eq!(format_interval(&day), "1 day");
        let mixed = PgInterval {
            months: 14,
            days: 3,
            microseconds: 4 * 3_600_000_000 + 5 * 60_000_000 + 6_500_000,
        };
        assert_eq!(format_interval(&mixed), "1 year 2 mons 3 days 04:05:06.5");
        let zero = PgInterval { months: 0, days: 0, microseconds: 0 };
        assert_eq!(format_interval(&zero), "00:00:00");

        assert_eq!(format_inet(&[2, 32, 0, 4, 10, 0, 0, 1], false).as_deref(), Some("10.0.0.1"));
        assert_eq!(format_inet(&[2, 24, 1, 4, 10, 0, 0, 0], true).as_deref(), Some("10.0.0.0/24"));
        let mut v6 = vec![3, 128, 0, 16];
        v6.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        assert_eq!(format_inet(&v6, false).as_deref(), Some("::1"));
        assert_eq!(format_inet(&[9, 9], false), None);
    }

    /// Runs against a live server when `TETHER_TEST_POSTGRES_URL` is set.
    #[tokio::test]
    async fn live_server_infers_text_parameters_and_decodes_extended_types() {
        let Ok(url) = std::env::var("TETHER_TEST_POSTGRES_URL") else {
            return;
        };
        let pool = PostgresAdapter
            .init_pool(&json!({ "connectionString": url, "max": 1 }))
            .await
            .unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let run = |sql: &'static str, params: Vec<SqlParam>| (sql, params);

        for (sql, params) in [
            run("CREATE TEMP TABLE tether_dates (d date, ts timestamp)", vec![]),
            run(
                "INSERT INTO tether_dates (d, ts) VALUES ($1, $2)",
                vec![
                    SqlParam::Text("2024-01-02".into()),
                    SqlParam::Text("2024-01-02 10:11:12".into()),
                ],
            ),
        ] {
            conn.execute(Statement {
                sql,
                params: &params,
                in_transaction: false,
                returning_counter: false,
            })
            .await
            .unwrap();
        }

        let params = vec![SqlParam::Text("2000-01-01".into())];
        let rs = conn
            .execute(Statement {
                sql: "SELECT d FROM tether_dates WHERE d > $1",
                params: &params,
                in_transaction: false,
                returning_counter: false,
            })
            .await
            .unwrap();
        assert_eq!(rs.rows, vec![vec![json!("2024-01-02")]]);

        let rs = conn
            .execute(Statement {
                sql: "SELECT '10:00:00+02'::timetz AS t, '1 day'::interval AS i, '1.5'::money AS m",
                params: &[],
                in_transaction: false,
                returning_counter: false,
            })
            .await
            .unwrap();
        assert_eq!(rs.rows, vec![vec![json!("10:00:00+02"), json!("1 day"), json!(1.5)]]);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn pool_creation_is_lazy() {
        let pool = PostgresAdapter
            .init_pool(&json!({ "host": "127.0.0.1", "port": 1, "connectionTimeoutMillis": 200 }))
            .await;
        assert!(pool.is_ok());
    }
}
