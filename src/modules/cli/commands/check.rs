//! Check command implementation

use clap::Args;
use pgpolicy_core::PluginError;
use pgpolicy_runtime::{Factory, LocalHost};
use pgpolicy_types::PluginStatus;
use std::sync::Arc;
use tracing::{debug, info};

use super::read_payload;

/// Check command arguments
#[derive(Args, Debug)]
pub struct CheckCommand {}

impl CheckCommand {
    /// Execute the check command
    pub async fn execute(&self, config_path: &str) -> Result<(), PluginError> {
        let status = self.check(&Factory::new(), config_path).await?;
        println!("{}", status);

        if status.is_ok() {
            Ok(())
        } else {
            Err(PluginError::Lifecycle(format!("plugin status is {}", status.state)))
        }
    }

    /// Start a plugin for the configuration, capture its status, then stop it
    pub async fn check(&self, factory: &Factory, config_path: &str) -> Result<PluginStatus, PluginError> {
        info!("Checking configuration from: {}", config_path);

        let payload = read_payload(config_path)?;
        let host = Arc::new(LocalHost::new());
        let plugin = factory.create_from_payload(host, &payload)?;

        if let Err(e) = plugin.start().await {
            debug!(error = %e, "start failed");
        }
        let status = plugin.status();
        plugin.stop().await;

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgpolicy_runtime::InMemoryFactory;
    use pgpolicy_types::PluginState;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn config_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_check_ok() {
        let file = config_file(r#"{"connection_string": "postgres://db/app"}"#);
        let factory = Factory::with_connectors(Arc::new(InMemoryFactory::new()));

        let status = CheckCommand {}
            .check(&factory, file.path().to_str().unwrap())
            .await
            .unwrap();
        assert!(status.is_ok());
    }

    #[tokio::test]
    async fn test_check_reports_connect_failure() {
        let file = config_file(r#"{"host": "localhost", "port": 5, "database": "d"}"#);
        let connectors = Arc::new(InMemoryFactory::new());
        connectors.set_fail_connect(true);
        let factory = Factory::with_connectors(connectors);

        let status = CheckCommand {}
            .check(&factory, file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(status.state, PluginState::NotReady);
        assert!(status.message.unwrap().contains("localhost:5"));
    }

    #[tokio::test]
    async fn test_check_invalid_payload() {
        let file = config_file("not json");
        let factory = Factory::with_connectors(Arc::new(InMemoryFactory::new()));
        assert!(CheckCommand {}
            .check(&factory, file.path().to_str().unwrap())
            .await
            .is_err());
    }
}
