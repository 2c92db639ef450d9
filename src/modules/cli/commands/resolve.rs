//! Resolve command implementation

use clap::Args;
use pgpolicy_config::{parse_file, resolve};
use pgpolicy_core::PluginError;
use serde_json::{json, Value};

/// Resolve command arguments
#[derive(Args, Debug)]
pub struct ResolveCommand {
    /// Print only the descriptor
    #[arg(short, long)]
    pub quiet: bool,
}

impl ResolveCommand {
    /// Execute the resolve command
    pub fn execute(&self, config_path: &str) -> Result<(), PluginError> {
        let summary = self.summary(config_path)?;
        if self.quiet {
            println!("{}", summary["descriptor"].as_str().unwrap_or_default());
        } else {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Ok(())
    }

    /// What a configuration file resolves to. The descriptor is redacted.
    pub fn summary(&self, config_path: &str) -> Result<Value, PluginError> {
        let config = parse_file(config_path)?;
        let descriptor = resolve(&config)?;

        Ok(json!({
            "descriptor": descriptor.redacted(),
            "namespace": config.namespace,
            "builtins": [config.query_function(), config.select_function()],
            "error_mode": config.error_mode,
            "pool": {
                "max_connections": config.pool.max_connections(),
                "min_connections": config.pool.min_connections(),
                "acquire_timeout_secs": config.pool.acquire_timeout().as_secs(),
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn config_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_summary_redacts_password() {
        let file = config_file(
            r#"{"host": "db", "user": "opa", "password": "hunter2", "namespace": "authz"}"#,
        );
        let cmd = ResolveCommand { quiet: false };
        let summary = cmd.summary(file.path().to_str().unwrap()).unwrap();

        let descriptor = summary["descriptor"].as_str().unwrap();
        assert!(!descriptor.contains("hunter2"));
        assert!(descriptor.starts_with("postgres://opa:***@db:5432/postgres"));
        assert_eq!(summary["builtins"], json!(["authz.query", "authz.select"]));
        assert_eq!(summary["error_mode"], json!("error"));
    }

    #[test]
    fn test_summary_invalid_config() {
        let file = config_file(r#"{"connection_params": {"host": {"nested": true}}}"#);
        let cmd = ResolveCommand { quiet: true };
        assert!(cmd.summary(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_summary_missing_file() {
        let cmd = ResolveCommand { quiet: true };
        assert!(cmd.summary("/nonexistent/pgpolicy.json").is_err());
    }
}
