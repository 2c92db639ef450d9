//! Plugin construction from raw host configuration

use pgpolicy_core::{PluginConfig, PluginError};
use pgpolicy_types::PluginStatus;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::debug;

use super::host::PluginHost;
use super::{PostgresPlugin, PLUGIN_NAME};
use crate::connectors::{ConnectionManager, ConnectorFactory, PostgresConnectorFactory};

/// Validates configuration payloads and builds plugin instances
pub struct Factory {
    connectors: Arc<dyn ConnectorFactory>,
}

impl Factory {
    /// Factory whose plugins connect to PostgreSQL
    pub fn new() -> Self {
        Self::with_connectors(Arc::new(PostgresConnectorFactory))
    }

    pub fn with_connectors(connectors: Arc<dyn ConnectorFactory>) -> Self {
        Self { connectors }
    }

    /// Parse, validate and resolve a raw payload without connecting
    pub fn validate(&self, payload: &[u8]) -> Result<PluginConfig, PluginError> {
        let config = pgpolicy_config::parse_bytes(payload)?;
        let descriptor = pgpolicy_config::resolve(&config)?;
        debug!(
            descriptor = %descriptor,
            namespace = %config.namespace,
            error_mode = ?config.error_mode,
            "validated postgres plugin configuration"
        );
        Ok(config)
    }

    /// Build a plugin on the current tokio runtime. Nothing connects until `start`.
    pub fn create(
        &self,
        host: Arc<dyn PluginHost>,
        config: PluginConfig,
    ) -> Result<PostgresPlugin, PluginError> {
        let runtime = Handle::try_current().map_err(|e| {
            PluginError::Internal(format!("postgres plugin needs a tokio runtime: {}", e))
        })?;
        let manager = Arc::new(ConnectionManager::new(self.connectors.clone()));
        Ok(PostgresPlugin::new(host, manager, config, runtime))
    }

    /// `validate` then `create`; an invalid payload is reported to the host as Err
    pub fn create_from_payload(
        &self,
        host: Arc<dyn PluginHost>,
        payload: &[u8],
    ) -> Result<PostgresPlugin, PluginError> {
        match self.validate(payload) {
            Ok(config) => self.create(host, config),
            Err(e) => {
                host.update_status(PLUGIN_NAME, PluginStatus::err(e.to_string()));
                Err(e)
            }
        }
    }
}

impl Default for Factory {
    fn default() -> Self {
        Self::new()
    }
}
