//! PostgreSQL connector implementation

use async_trait::async_trait;
use futures::TryStreamExt;
use pgpolicy_core::{ConnectionDescriptor, PluginError, PoolConfig};
use pgpolicy_types::SqlValue;
use rust_decimal::prelude::ToPrimitive;
use sqlx::encode::IsNull;
use sqlx::postgres::types::{Oid, PgInterval, PgTimeTz};
use sqlx::postgres::{
    PgArgumentBuffer, PgArguments, PgConnectOptions, PgConnection, PgPool, PgPoolOptions, PgRow,
    PgTypeInfo,
};
use sqlx::query::Query;
use sqlx::types::ipnetwork::IpNetwork;
use sqlx::types::Json;
use sqlx::{Column, Connection, Encode, Executor, Postgres, Row, Type, TypeInfo};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use super::traits::{Connector, ConnectorFactory, RowSet};

/// PostgreSQL database connector
pub struct PostgresConnector {
    pool: PgPool,
}

impl PostgresConnector {
    /// Create a new PostgreSQL connector with default pool settings
    pub async fn new(descriptor: &ConnectionDescriptor) -> Result<Self, PluginError> {
        Self::with_config(descriptor, &PoolConfig::default()).await
    }

    /// Create a new PostgreSQL connector with custom pool settings.
    ///
    /// A single initial connection is opened first, bounded by the descriptor's
    /// `connect_timeout` (or the pool acquire timeout), so that connect failures carry
    /// their underlying cause instead of a generic pool timeout.
    pub async fn with_config(
        descriptor: &ConnectionDescriptor,
        config: &PoolConfig,
    ) -> Result<Self, PluginError> {
        let options = Self::connect_options(descriptor)?;
        let timeout = descriptor
            .connect_timeout()
            .unwrap_or_else(|| config.acquire_timeout());

        debug!(descriptor = %descriptor, timeout_secs = timeout.as_secs(), "opening initial connection");

        let initial = tokio::time::timeout(timeout, PgConnection::connect_with(&options))
            .await
            .map_err(|_| {
                PluginError::Connect(format!(
                    "PostgreSQL connection timed out after {}s",
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| PluginError::Connect(format!("PostgreSQL connection failed: {}", e)))?;

        if let Err(e) = initial.close().await {
            debug!(error = %e, "initial connection did not close cleanly");
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections())
            .min_connections(config.min_connections())
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(config.idle_timeout())
            .max_lifetime(config.max_lifetime())
            .connect_lazy_with(options);

        Ok(Self { pool })
    }

    /// Build sqlx options for a descriptor.
    ///
    /// Query parameters sqlx does not parse itself are forwarded to the server as
    /// `-c key=value` runtime parameters. `connect_timeout` is applied by `with_config`.
    fn connect_options(descriptor: &ConnectionDescriptor) -> Result<PgConnectOptions, PluginError> {
        let url = url::Url::parse(descriptor.as_str()).map_err(|e| {
            PluginError::Config(format!("invalid connection descriptor {}: {}", descriptor, e))
        })?;
        let (url, runtime_params) = split_parameters(url);

        let options = PgConnectOptions::from_str(url.as_str()).map_err(|e| {
            PluginError::Config(format!("invalid connection descriptor {}: {}", descriptor, e))
        })?;

        if runtime_params.is_empty() {
            Ok(options)
        } else {
            debug!(
                params = ?runtime_params.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
                "forwarding runtime parameters"
            );
            Ok(options.options(runtime_params))
        }
    }

    /// Parameter types the server infers for `statement`
    async fn parameter_types(&self, statement: &str) -> Result<Vec<PgTypeInfo>, PluginError> {
        let description = (&self.pool)
            .describe(statement)
            .await
            .map_err(|e| PluginError::QueryExecution(format!("PostgreSQL query failed: {}", e)))?;

        Ok(description
            .parameters()
            .and_then(|params| params.left())
            .map(|types| types.to_vec())
            .unwrap_or_default())
    }

    /// Decode every column of a row; `types` holds the column type names read once per result set
    fn decode_row(row: &PgRow, columns: &[String], types: &[String]) -> Result<Vec<SqlValue>, PluginError> {
        columns
            .iter()
            .zip(types)
            .enumerate()
            .map(|(idx, (name, type_name))| Self::decode_column(row, idx, name, type_name))
            .collect()
    }

    /// Get a column value as a native SQL value
    fn decode_column(
        row: &PgRow,
        idx: usize,
        name: &str,
        type_name: &str,
    ) -> Result<SqlValue, PluginError> {
        let value = match type_name {
            "BOOL" => row.try_get::<Option<bool>, _>(idx).map(SqlValue::from),
            "INT2" => row
                .try_get::<Option<i16>, _>(idx)
                .map(|v| v.map(i64::from).into()),
            "INT4" => row
                .try_get::<Option<i32>, _>(idx)
                .map(|v| v.map(i64::from).into()),
            "INT8" => row.try_get::<Option<i64>, _>(idx).map(SqlValue::from),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(idx)
                .map(|v| v.map(f64::from).into()),
            "FLOAT8" => row.try_get::<Option<f64>, _>(idx).map(SqlValue::from),
            "NUMERIC" => row
                .try_get::<Option<rust_decimal::Decimal>, _>(idx)
                .map(|v| v.map(decimal_value).unwrap_or(SqlValue::Null)),
            "BYTEA" => row.try_get::<Option<Vec<u8>>, _>(idx).map(SqlValue::from),
            "JSON" | "JSONB" => row
                .try_get::<Option<serde_json::Value>, _>(idx)
                .map(|v| v.map(SqlValue::Json).unwrap_or(SqlValue::Null)),
            "UUID" => row
                .try_get::<Option<uuid::Uuid>, _>(idx)
                .map(|v| v.map(|u| u.to_string()).into()),
            "TIMESTAMPTZ" => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
                .map(|v| v.map(|t| t.to_rfc3339()).into()),
            "TIMESTAMP" => row
                .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
                .map(|v| v.map(|t| t.format("%Y-%m-%dT%H:%M:%S%.f").to_string()).into()),
            "DATE" => row
                .try_get::<Option<chrono::NaiveDate>, _>(idx)
                .map(|v| v.map(|d| d.to_string()).into()),
            "TIME" => row
                .try_get::<Option<chrono::NaiveTime>, _>(idx)
                .map(|v| v.map(|t| t.to_string()).into()),
            "TEXT[]" | "VARCHAR[]" | "BPCHAR[]" | "NAME[]" => row
                .try_get::<Option<Vec<Option<String>>>, _>(idx)
                .map(json_array),
            "INT4[]" => row
                .try_get::<Option<Vec<Option<i32>>>, _>(idx)
                .map(json_array),
            "INT8[]" => row
                .try_get::<Option<Vec<Option<i64>>>, _>(idx)
                .map(json_array),
            "BOOL[]" => row
                .try_get::<Option<Vec<Option<bool>>>, _>(idx)
                .map(json_array),
            "FLOAT8[]" => row
                .try_get::<Option<Vec<Option<f64>>>, _>(idx)
                .map(json_array),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
                row.try_get::<Option<String>, _>(idx).map(SqlValue::from)
            }
            "OID" => row
                .try_get::<Option<Oid>, _>(idx)
                .map(|v| v.map(|oid| i64::from(oid.0)).into()),
            "\"CHAR\"" | "CHAR" => row
                .try_get::<Option<i8>, _>(idx)
                .map(|v| v.map(|c| char::from(c as u8).to_string()).into()),
            "INTERVAL" => row
                .try_get::<Option<PgInterval>, _>(idx)
                .map(|v| v.map(interval_text).into()),
            "TIMETZ" => row
                .try_get::<Option<PgTimeTz<chrono::NaiveTime, chrono::FixedOffset>>, _>(idx)
                .map(|v| v.map(|t| format!("{}{}", t.time, t.offset)).into()),
            "INET" | "CIDR" => row
                .try_get::<Option<IpNetwork>, _>(idx)
                .map(|v| v.map(|net| net.to_string()).into()),
            "INT2[]" => row
                .try_get::<Option<Vec<Option<i16>>>, _>(idx)
                .map(json_array),
            "FLOAT4[]" => row
                .try_get::<Option<Vec<Option<f32>>>, _>(idx)
                .map(json_array),
            "NUMERIC[]" => row
                .try_get::<Option<Vec<Option<rust_decimal::Decimal>>>, _>(idx)
                .map(|v| json_array(map_elements(v, decimal_json))),
            "UUID[]" => row
                .try_get::<Option<Vec<Option<uuid::Uuid>>>, _>(idx)
                .map(|v| json_array(map_elements(v, |u| u.to_string()))),
            "TIMESTAMPTZ[]" => row
                .try_get::<Option<Vec<Option<chrono::DateTime<chrono::Utc>>>>, _>(idx)
                .map(|v| json_array(map_elements(v, |t| t.to_rfc3339()))),
            "JSON[]" | "JSONB[]" => row
                .try_get::<Option<Vec<Option<Json<serde_json::Value>>>>, _>(idx)
                .map(|v| json_array(map_elements(v, |j| j.0))),
            _ => return Self::decode_raw(row, idx, name, type_name),
        };

        value.map_err(|e| {
            PluginError::RowConversion(format!("column '{}' of type {}: {}", name, type_name, e))
        })
    }

    /// Undecoded column: text when the wire value is printable UTF-8 (enums, domains
    /// over text), raw bytes otherwise
    fn decode_raw(
        row: &PgRow,
        idx: usize,
        name: &str,
        type_name: &str,
    ) -> Result<SqlValue, PluginError> {
        let bytes = row.try_get_unchecked::<Option<Vec<u8>>, _>(idx).map_err(|e| {
            PluginError::RowConversion(format!("column '{}' of type {}: {}", name, type_name, e))
        })?;
        Ok(bytes.map(|b| raw_value(&b)).unwrap_or(SqlValue::Null))
    }
}

/// Column types `decode_column` maps to a native value; anything else goes through `decode_raw`
const NATIVE_TYPES: &[&str] = &[
    "BOOL", "INT2", "INT4", "INT8", "FLOAT4", "FLOAT8", "NUMERIC", "BYTEA", "JSON", "JSONB",
    "UUID", "TIMESTAMPTZ", "TIMESTAMP", "DATE", "TIME", "TEXT", "VARCHAR", "BPCHAR", "NAME",
    "TEXT[]", "VARCHAR[]", "BPCHAR[]", "NAME[]", "INT4[]", "INT8[]", "BOOL[]", "FLOAT8[]", "OID",
    "\"CHAR\"", "CHAR", "INTERVAL", "TIMETZ", "INET", "CIDR", "INT2[]", "FLOAT4[]", "NUMERIC[]",
    "UUID[]", "TIMESTAMPTZ[]", "JSON[]", "JSONB[]",
];

/// ISO 8601 duration, e.g. `P1M2DT3.5S`
fn interval_text(interval: PgInterval) -> String {
    format!(
        "P{}M{}DT{}S",
        interval.months,
        interval.days,
        interval.microseconds as f64 / 1_000_000.0
    )
}

fn decimal_json(value: rust_decimal::Decimal) -> serde_json::Value {
    match decimal_value(value) {
        SqlValue::Int(i) => i.into(),
        SqlValue::Float(f) => f.into(),
        _ => serde_json::Value::Null,
    }
}

fn map_elements<T, U>(values: Option<Vec<Option<T>>>, f: impl Fn(T) -> U) -> Option<Vec<Option<U>>> {
    values.map(|values| values.into_iter().map(|v| v.map(&f)).collect())
}

/// Integral decimals that fit `i64` stay integers, everything else becomes a float
fn decimal_value(value: rust_decimal::Decimal) -> SqlValue {
    if value.fract().is_zero() {
        if let Some(i) = value.to_i64() {
            return SqlValue::Int(i);
        }
    }
    value.to_f64().map(SqlValue::Float).unwrap_or(SqlValue::Null)
}

fn raw_value(bytes: &[u8]) -> SqlValue {
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.chars().any(|c| c.is_control() && !c.is_whitespace()) => {
            SqlValue::Text(text.to_string())
        }
        _ => SqlValue::Bytes(bytes.to_vec()),
    }
}

fn json_array<T: Into<serde_json::Value>>(values: Option<Vec<Option<T>>>) -> SqlValue {
    match values {
        Some(values) => SqlValue::Json(serde_json::Value::from(values)),
        None => SqlValue::Null,
    }
}

/// Query parameters `PgConnectOptions` parses itself
const DRIVER_PARAMS: &[&str] = &[
    "sslmode",
    "ssl-mode",
    "sslrootcert",
    "ssl-root-cert",
    "ssl-ca",
    "sslcert",
    "ssl-cert",
    "sslkey",
    "ssl-key",
    "statement-cache-capacity",
    "host",
    "hostaddr",
    "port",
    "dbname",
    "user",
    "password",
    "application_name",
    "options",
];

/// libpq client settings that are not server parameters and would be rejected as `-c`
const CLIENT_ONLY_PARAMS: &[&str] = &[
    "connect_timeout",
    "channel_binding",
    "gssencmode",
    "gsslib",
    "keepalives",
    "keepalives_count",
    "keepalives_idle",
    "keepalives_interval",
    "krbsrvname",
    "load_balance_hosts",
    "passfile",
    "replication",
    "requirepeer",
    "requiressl",
    "service",
    "sslcompression",
    "sslcrl",
    "sslcrldir",
    "sslpassword",
    "sslsni",
    "ssl_max_protocol_version",
    "ssl_min_protocol_version",
    "target_session_attrs",
    "tcp_user_timeout",
];

/// Keep driver parameters in the URL and pull out everything meant for the server
fn split_parameters(mut url: url::Url) -> (url::Url, Vec<(String, String)>) {
    let mut driver = Vec::new();
    let mut runtime = Vec::new();

    for (key, value) in url.query_pairs() {
        let key = key.into_owned();
        if DRIVER_PARAMS.contains(&key.as_str()) {
            driver.push((key, value.into_owned()));
        } else if CLIENT_ONLY_PARAMS.contains(&key.as_str()) {
            if key != "connect_timeout" {
                warn!(param = %key, "ignoring unsupported client connection parameter");
            }
        } else {
            runtime.push((key, value.into_owned()));
        }
    }

    if driver.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(driver);
    }
    (url, runtime)
}

/// NULL parameter whose type the server infers from the statement
struct UntypedNull;

impl Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> IsNull {
        IsNull::Yes
    }
}

/// Bind one argument. Text bound to a parameter the server expects as another type is
/// parsed client-side, since the text type has no implicit casts to most others.
fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    index: usize,
    value: &SqlValue,
    target: Option<&str>,
) -> Result<Query<'q, Postgres, PgArguments>, PluginError> {
    if let (SqlValue::Text(text), Some(target)) = (value, target) {
        return bind_text(query, index, text, target);
    }

    Ok(match value {
        SqlValue::Null => query.bind(UntypedNull),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.clone()),
        SqlValue::Bytes(v) => query.bind(v.clone()),
        SqlValue::Json(v) => query.bind(Json(v.clone())),
    })
}

fn bind_text<'q>(
    query: Query<'q, Postgres, PgArguments>,
    index: usize,
    text: &str,
    target: &str,
) -> Result<Query<'q, Postgres, PgArguments>, PluginError> {
    let invalid = |e: &dyn std::fmt::Display| {
        PluginError::argument(
            index,
            format!("'{}' is not a valid {}: {}", text, target.to_lowercase(), e),
        )
    };

    Ok(match target {
        "UUID" => query.bind(uuid::Uuid::parse_str(text.trim()).map_err(|e| invalid(&e))?),
        "TIMESTAMPTZ" => query.bind(parse_timestamptz(text).map_err(|e| invalid(&e))?),
        "TIMESTAMP" => query.bind(parse_timestamp(text).map_err(|e| invalid(&e))?),
        "DATE" => query.bind(
            chrono::NaiveDate::from_str(text.trim()).map_err(|e| invalid(&e))?,
        ),
        "TIME" => query.bind(
            chrono::NaiveTime::from_str(text.trim()).map_err(|e| invalid(&e))?,
        ),
        "NUMERIC" => query.bind(
            rust_decimal::Decimal::from_str(text.trim()).map_err(|e| invalid(&e))?,
        ),
        "INT2" | "INT4" | "INT8" => query.bind(text.trim().parse::<i64>().map_err(|e| invalid(&e))?),
        "FLOAT4" | "FLOAT8" => query.bind(text.trim().parse::<f64>().map_err(|e| invalid(&e))?),
        "BOOL" => query.bind(text.trim().parse::<bool>().map_err(|e| invalid(&e))?),
        "JSON" | "JSONB" => query.bind(Json(
            serde_json::from_str::<serde_json::Value>(text).map_err(|e| invalid(&e))?,
        )),
        _ => query.bind(text.to_string()),
    })
}

/// RFC 3339, or a zone-less timestamp taken as UTC
fn parse_timestamptz(text: &str) -> Result<chrono::DateTime<chrono::Utc>, chrono::ParseError> {
    let text = text.trim();
    match text.parse::<chrono::DateTime<chrono::FixedOffset>>() {
        Ok(t) => Ok(t.with_timezone(&chrono::Utc)),
        Err(e) => parse_timestamp(text)
            .map(|naive| chrono::TimeZone::from_utc_datetime(&chrono::Utc, &naive))
            .map_err(|_| e),
    }
}

/// `2024-01-02T03:04:05[.f]` or the same with a space separator
fn parse_timestamp(text: &str) -> Result<chrono::NaiveDateTime, chrono::ParseError> {
    let text = text.trim();
    chrono::NaiveDateTime::from_str(text)
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
}

#[async_trait]
impl Connector for PostgresConnector {
    async fn query(&self, statement: &str, args: &[SqlValue]) -> Result<RowSet, PluginError> {
        let targets = if args.iter().any(|arg| matches!(arg, SqlValue::Text(_))) {
            self.parameter_types(statement).await?
        } else {
            Vec::new()
        };

        let mut query = sqlx::query(statement);
        for (index, arg) in args.iter().enumerate() {
            let target = targets.get(index).map(|t| t.name());
            query = bind_value(query, index, arg, target)?;
        }

        let mut stream = query.fetch(&self.pool);
        let mut result = RowSet::default();
        let mut types: Vec<String> = Vec::new();

        while let Some(row) = stream
            .try_next()
            .await
            .map_err(|e| PluginError::QueryExecution(format!("PostgreSQL query failed: {}", e)))?
        {
            if result.columns.is_empty() && result.rows.is_empty() {
                for column in row.columns() {
                    let type_name = column.type_info().name();
                    if !NATIVE_TYPES.contains(&type_name) {
                        warn!(
                            column = column.name(),
                            column_type = type_name,
                            "no native decoding for column type, returning its raw value"
                        );
                    }
                    result.columns.push(column.name().to_string());
                    types.push(type_name.to_string());
                }
            }
            let values = Self::decode_row(&row, &result.columns, &types)?;
            result.rows.push(values);
        }

        Ok(result)
    }

    async fn health_check(&self) -> Result<(), PluginError> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PluginError::Liveness(format!("PostgreSQL health check failed: {}", e)))?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    fn connector_type(&self) -> &'static str {
        "postgres"
    }
}

/// Opens `PostgresConnector`s for the connection manager
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresConnectorFactory;

#[async_trait]
impl ConnectorFactory for PostgresConnectorFactory {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        pool: &PoolConfig,
    ) -> Result<Arc<dyn Connector>, PluginError> {
        let connector = PostgresConnector::with_config(descriptor, pool).await?;
        Ok(Arc::new(connector))
    }
}
