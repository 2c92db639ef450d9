//! Plugin configuration model

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::{ConnectionDescriptor, PoolConfig};

/// Namespace the query builtins are registered under when none is configured
pub const DEFAULT_NAMESPACE: &str = "postgres";

/// How query failures are surfaced to policy authors.
///
/// Applies to every query error class and to both builtin names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    /// Fail the evaluation at the call site
    #[default]
    Error,
    /// Print the message on the host's diagnostic channel and yield an undefined result
    Diagnostic,
}

/// Discrete connection settings, used when neither a literal descriptor nor
/// `connection_params` is supplied
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: Option<String>,
    pub connect_timeout_seconds: Option<u64>,
    pub application_name: Option<String>,
    pub search_path: Option<String>,
    /// Extra driver parameters, already normalized to text
    pub options: BTreeMap<String, String>,
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("ssl_mode", &self.ssl_mode)
            .field("connect_timeout_seconds", &self.connect_timeout_seconds)
            .field("application_name", &self.application_name)
            .field("search_path", &self.search_path)
            .field("has_custom_options", &!self.options.is_empty())
            .finish()
    }
}

/// Where the connection descriptor comes from, in precedence order
#[derive(Clone, PartialEq, Eq)]
pub enum ConnectionSource {
    /// A literal descriptor; wins over everything else
    Descriptor(ConnectionDescriptor),
    /// Named driver parameters, normalized to text with nulls dropped
    Params(BTreeMap<String, String>),
    /// Discrete settings with defaults
    Settings(ConnectionSettings),
}

impl fmt::Debug for ConnectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionSource::Descriptor(descriptor) => {
                f.debug_tuple("Descriptor").field(descriptor).finish()
            }
            ConnectionSource::Params(params) => {
                let keys: Vec<&str> = params.keys().map(String::as_str).collect();
                f.debug_tuple("Params").field(&keys).finish()
            }
            ConnectionSource::Settings(settings) => {
                f.debug_tuple("Settings").field(settings).finish()
            }
        }
    }
}

impl Default for ConnectionSource {
    fn default() -> Self {
        ConnectionSource::Settings(ConnectionSettings::default())
    }
}

/// Validated plugin configuration.
///
/// Built once per configuration load or reconfiguration and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginConfig {
    pub source: ConnectionSource,
    pub pool: PoolConfig,
    pub namespace: String,
    pub error_mode: ErrorMode,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            source: ConnectionSource::default(),
            pool: PoolConfig::default(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            error_mode: ErrorMode::default(),
        }
    }
}

impl PluginConfig {
    /// Configuration that connects through a literal descriptor
    pub fn with_descriptor(descriptor: ConnectionDescriptor) -> Self {
        Self {
            source: ConnectionSource::Descriptor(descriptor),
            ..Self::default()
        }
    }

    /// Name of the primary query builtin, e.g. `postgres.query`
    pub fn query_function(&self) -> String {
        format!("{}.query", self.namespace)
    }

    /// Name of the alias builtin, e.g. `postgres.select`
    pub fn select_function(&self) -> String {
        format!("{}.select", self.namespace)
    }
}
