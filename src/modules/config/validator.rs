//! Configuration validation

use once_cell::sync::Lazy;
use pgpolicy_core::{ConnectionSource, PluginConfig, PluginError};
use regex::Regex;

/// Namespaces become the first segment of builtin names, so they must be identifiers
static NAMESPACE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// libpq `sslmode` values
const SSL_MODES: &[&str] = &[
    "disable",
    "allow",
    "prefer",
    "require",
    "verify-ca",
    "verify-full",
];

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate the entire plugin configuration
    pub fn validate(&self, config: &PluginConfig) -> Result<(), PluginError> {
        self.validate_namespace(&config.namespace)?;
        self.validate_pool(config)?;
        self.validate_source(&config.source)?;
        Ok(())
    }

    fn validate_namespace(&self, namespace: &str) -> Result<(), PluginError> {
        if !NAMESPACE_PATTERN.is_match(namespace) {
            return Err(PluginError::Config(format!(
                "Invalid namespace '{}': must be an identifier (letters, digits, underscore)",
                namespace
            )));
        }
        Ok(())
    }

    fn validate_pool(&self, config: &PluginConfig) -> Result<(), PluginError> {
        if config.pool.max_connections() == 0 {
            return Err(PluginError::Config(
                "pool.max_connections must be at least 1".to_string(),
            ));
        }
        if config.pool.acquire_timeout().is_zero() {
            return Err(PluginError::Config(
                "pool.acquire_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_source(&self, source: &ConnectionSource) -> Result<(), PluginError> {
        let settings = match source {
            ConnectionSource::Settings(settings) => settings,
            _ => return Ok(()),
        };

        if let Some(host) = &settings.host {
            if host.trim().is_empty() {
                return Err(PluginError::Config("host must not be empty".to_string()));
            }
        }
        if let Some(database) = &settings.database {
            if database.trim().is_empty() {
                return Err(PluginError::Config("database must not be empty".to_string()));
            }
        }
        if settings.port == Some(0) {
            return Err(PluginError::Config("port must not be 0".to_string()));
        }
        if let Some(mode) = &settings.ssl_mode {
            if !SSL_MODES.contains(&mode.as_str()) {
                return Err(PluginError::Config(format!(
                    "Invalid ssl_mode '{}': expected one of {}",
                    mode,
                    SSL_MODES.join(", ")
                )));
            }
        }

        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JsonParser;
    use serde_json::json;

    fn validate(payload: serde_json::Value) -> Result<(), PluginError> {
        let config = JsonParser::parse_value(payload)?;
        ConfigValidator::new().validate(&config)
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(json!({"host": "db", "ssl_mode": "verify-full"})).is_ok());
        assert!(validate(json!({"connection_string": "postgres://db/x", "namespace": "pg_v2"})).is_ok());
    }

    #[test]
    fn test_invalid_namespace() {
        assert!(validate(json!({"namespace": "my.db"})).is_err());
        assert!(validate(json!({"namespace": "1db"})).is_err());
        assert!(validate(json!({"namespace": ""})).is_err());
    }

    #[test]
    fn test_invalid_ssl_mode() {
        let err = validate(json!({"ssl_mode": "sometimes"})).unwrap_err();
        assert!(err.to_string().contains("sometimes"));
        assert!(err.to_string().contains("verify-full"));
    }

    #[test]
    fn test_invalid_pool() {
        assert!(validate(json!({"pool": {"max_connections": 0}})).is_err());
        assert!(validate(json!({"pool": {"acquire_timeout_secs": 0}})).is_err());
    }

    #[test]
    fn test_empty_host_rejected() {
        assert!(validate(json!({"host": "  "})).is_err());
        assert!(validate(json!({"port": 0})).is_err());
    }

    #[test]
    fn test_literal_source_not_inspected() {
        assert!(validate(json!({"connection_string": "anything", "ssl_mode": "bogus"})).is_ok());
    }
}
