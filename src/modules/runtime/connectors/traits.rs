//! Connector trait definitions

use async_trait::async_trait;
use pgpolicy_core::{ConnectionDescriptor, PluginError, PoolConfig};
use pgpolicy_types::SqlValue;
use std::sync::Arc;

/// Rows returned by a connector, column names read once per result set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl RowSet {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row; used by connectors and test fixtures
    pub fn with_row(mut self, row: Vec<SqlValue>) -> Self {
        self.rows.push(row);
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A live database handle (always a pool)
///
/// Implementations must tolerate concurrent `query` calls.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Execute a statement with positional arguments and return every row
    async fn query(&self, statement: &str, args: &[SqlValue]) -> Result<RowSet, PluginError>;

    /// Lightweight round trip confirming the connection is usable
    async fn health_check(&self) -> Result<(), PluginError>;

    /// Close the connection and release resources
    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// Get the connector type name
    fn connector_type(&self) -> &'static str;
}

/// Opens connectors for a descriptor
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        pool: &PoolConfig,
    ) -> Result<Arc<dyn Connector>, PluginError>;
}
