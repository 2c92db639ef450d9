//! Configuration parsing for pgpolicy
//!
//! This crate parses the JSON plugin configuration payload, validates it, and
//! resolves it into a canonical connection descriptor.

pub mod json;
pub mod resolver;
pub mod validator;

pub use json::JsonParser;
pub use resolver::ConfigResolver;
pub use validator::ConfigValidator;

use pgpolicy_core::{ConnectionDescriptor, PluginConfig, PluginError};

/// Parse a configuration file from a path
pub fn parse_file(path: &str) -> Result<PluginConfig, PluginError> {
    let content = std::fs::read(path)
        .map_err(|e| PluginError::Config(format!("Failed to read file '{}': {}", path, e)))?;

    parse_bytes(&content)
}

/// Parse and validate a raw payload
pub fn parse_bytes(content: &[u8]) -> Result<PluginConfig, PluginError> {
    let config = JsonParser::parse(content)?;
    ConfigValidator::new().validate(&config)?;
    Ok(config)
}

/// Parse and validate an already decoded payload
pub fn parse_value(value: serde_json::Value) -> Result<PluginConfig, PluginError> {
    let config = JsonParser::parse_value(value)?;
    ConfigValidator::new().validate(&config)?;
    Ok(config)
}

/// Resolve a configuration into its connection descriptor
pub fn resolve(config: &PluginConfig) -> Result<ConnectionDescriptor, PluginError> {
    ConfigResolver::resolve(config)
}
