//! JSON configuration payload parser

use pgpolicy_core::{
    ConnectionDescriptor, ConnectionSettings, ConnectionSource, ErrorMode, PluginConfig,
    PluginError, PoolConfig, DEFAULT_NAMESPACE,
};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Parser for the plugin configuration payload supplied by the host
pub struct JsonParser;

/// Raw payload as the host hands it over.
///
/// Unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    connection_string: Option<String>,

    #[serde(default)]
    connection_params: Option<Map<String, Value>>,

    #[serde(default)]
    host: Option<String>,

    #[serde(default, deserialize_with = "number_or_string")]
    port: Option<u64>,

    #[serde(default)]
    database: Option<String>,

    #[serde(default)]
    user: Option<String>,

    #[serde(default)]
    password: Option<String>,

    #[serde(default)]
    ssl_mode: Option<String>,

    #[serde(default, deserialize_with = "number_or_string")]
    connect_timeout_seconds: Option<u64>,

    #[serde(default)]
    application_name: Option<String>,

    #[serde(default)]
    search_path: Option<String>,

    #[serde(default)]
    options: Option<Map<String, Value>>,

    #[serde(default)]
    pool: Option<PoolConfig>,

    #[serde(default)]
    namespace: Option<String>,

    #[serde(default)]
    error_mode: Option<ErrorMode>,
}

/// Host config overrides arrive as strings, JSON files carry numbers
fn number_or_string<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("expected a non-negative integer, got {}", n))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("expected a non-negative integer, got '{}'", s))),
        Some(other) => Err(D::Error::custom(format!(
            "expected a non-negative integer, got {}",
            json_type_name(&other)
        ))),
    }
}

impl JsonParser {
    /// Parse a raw payload
    pub fn parse(bytes: &[u8]) -> Result<PluginConfig, PluginError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| PluginError::Config(format!("error unmarshalling configuration: {}", e)))?;
        Self::parse_value(value)
    }

    /// Parse an already decoded payload
    pub fn parse_value(value: Value) -> Result<PluginConfig, PluginError> {
        let raw: RawConfig = match value {
            Value::Null => RawConfig::default(),
            Value::Object(_) => serde_json::from_value(value)
                .map_err(|e| PluginError::Config(format!("invalid configuration: {}", e)))?,
            other => {
                return Err(PluginError::Config(format!(
                    "configuration must be an object, got {}",
                    json_type_name(&other)
                )))
            }
        };

        Self::convert(raw)
    }

    fn convert(raw: RawConfig) -> Result<PluginConfig, PluginError> {
        // Validate every scalar map up front so a bad value fails even when a
        // higher-precedence source wins.
        let params = match &raw.connection_params {
            Some(map) => normalize_scalars("connection_params", map)?,
            None => BTreeMap::new(),
        };
        let options = match &raw.options {
            Some(map) => normalize_scalars("options", map)?,
            None => BTreeMap::new(),
        };

        let literal = raw
            .connection_string
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        let source = if let Some(literal) = literal {
            ConnectionSource::Descriptor(ConnectionDescriptor::new(literal)?)
        } else if !params.is_empty() {
            ConnectionSource::Params(params)
        } else {
            let port = raw
                .port
                .map(|p| {
                    u16::try_from(p)
                        .map_err(|_| PluginError::Config(format!("port {} is out of range", p)))
                })
                .transpose()?;

            ConnectionSource::Settings(ConnectionSettings {
                host: raw.host,
                port,
                database: raw.database,
                user: raw.user,
                password: raw.password,
                ssl_mode: raw.ssl_mode,
                connect_timeout_seconds: raw.connect_timeout_seconds,
                application_name: raw.application_name,
                search_path: raw.search_path,
                options,
            })
        };

        Ok(PluginConfig {
            source,
            pool: raw.pool.unwrap_or_default(),
            namespace: raw
                .namespace
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            error_mode: raw.error_mode.unwrap_or_default(),
        })
    }
}

/// Normalize a map of scalar driver parameters to text.
///
/// Integral numbers become integer text, other numbers general decimal text,
/// booleans `true`/`false`; nulls are dropped. Arrays and objects are rejected.
pub fn normalize_scalars(
    field: &str,
    map: &Map<String, Value>,
) -> Result<BTreeMap<String, String>, PluginError> {
    let mut normalized = BTreeMap::new();

    for (key, value) in map {
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => number_text(n),
            Value::Bool(b) => b.to_string(),
            Value::Null => continue,
            other => {
                return Err(PluginError::Config(format!(
                    "unsupported value type for {} key '{}': {}. Value must be a string, number, boolean, or null",
                    field,
                    key,
                    json_type_name(other)
                )))
            }
        };
        normalized.insert(key.clone(), text);
    }

    Ok(normalized)
}

fn number_text(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => format!("{}", f as i64),
        Some(f) => format!("{}", f),
        None => n.to_string(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
