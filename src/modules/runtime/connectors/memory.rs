//! In-memory connector serving canned rows

use async_trait::async_trait;
use pgpolicy_core::{ConnectionDescriptor, PluginError, PoolConfig};
use pgpolicy_types::SqlValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::traits::{Connector, ConnectorFactory, RowSet};

/// Connector that answers statements from a fixed table of responses.
///
/// Statements without a registered response return an empty row set. Every executed
/// statement is recorded, and queries against a closed connector fail, which makes it
/// suitable for lifecycle and concurrency tests.
pub struct InMemoryConnector {
    descriptor: String,
    responses: HashMap<String, Result<RowSet, String>>,
    latency: Duration,
    ping_fails: bool,
    closed: AtomicBool,
    executed: Mutex<Vec<(String, Vec<SqlValue>)>>,
}

impl InMemoryConnector {
    pub fn new(descriptor: impl Into<String>) -> Self {
        Self {
            descriptor: descriptor.into(),
            responses: HashMap::new(),
            latency: Duration::ZERO,
            ping_fails: false,
            closed: AtomicBool::new(false),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Serve `rows` for `statement`
    pub fn with_response(mut self, statement: impl Into<String>, rows: RowSet) -> Self {
        self.responses.insert(statement.into(), Ok(rows));
        self
    }

    /// Fail `statement` with a query execution error
    pub fn with_failure(mut self, statement: impl Into<String>, message: impl Into<String>) -> Self {
        self.responses.insert(statement.into(), Err(message.into()));
        self
    }

    /// Simulated round-trip time per query
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Statements executed so far, with their bound arguments
    pub async fn executed(&self) -> Vec<(String, Vec<SqlValue>)> {
        self.executed.lock().await.clone()
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn query(&self, statement: &str, args: &[SqlValue]) -> Result<RowSet, PluginError> {
        if self.is_closed() {
            return Err(PluginError::QueryExecution(
                "connection is closed".to_string(),
            ));
        }

        self.executed
            .lock()
            .await
            .push((statement.to_string(), args.to_vec()));

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        // A lease keeps its connector open until the query returns.
        if self.is_closed() {
            return Err(PluginError::QueryExecution(
                "connection closed while query was running".to_string(),
            ));
        }

        match self.responses.get(statement) {
            Some(Ok(rows)) => Ok(rows.clone()),
            Some(Err(message)) => Err(PluginError::QueryExecution(message.clone())),
            None => Ok(RowSet::default()),
        }
    }

    async fn health_check(&self) -> Result<(), PluginError> {
        if self.ping_fails {
            return Err(PluginError::Liveness(format!(
                "in-memory ping failed for {}",
                self.descriptor
            )));
        }
        if self.is_closed() {
            return Err(PluginError::Liveness("connection is closed".to_string()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn connector_type(&self) -> &'static str {
        "memory"
    }
}

/// Factory producing `InMemoryConnector`s, with switchable connect and ping failures
pub struct InMemoryFactory {
    responses: HashMap<String, RowSet>,
    latency: Duration,
    fail_connect: AtomicBool,
    fail_ping: AtomicBool,
    attempts: AtomicUsize,
    opened: Mutex<Vec<Arc<InMemoryConnector>>>,
}

impl InMemoryFactory {
    pub fn new() -> Self {
        Self {
            responses: HashMap::new(),
            latency: Duration::ZERO,
            fail_connect: AtomicBool::new(false),
            fail_ping: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Every connector opened by this factory serves `rows` for `statement`
    pub fn with_response(mut self, statement: impl Into<String>, rows: RowSet) -> Self {
        self.responses.insert(statement.into(), rows);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make subsequent connect attempts fail
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make subsequently opened connectors fail their liveness check
    pub fn set_fail_ping(&self, fail: bool) {
        self.fail_ping.store(fail, Ordering::SeqCst);
    }

    /// Connect attempts so far, including failed ones
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Connectors successfully opened so far, oldest first
    pub async fn opened(&self) -> Vec<Arc<InMemoryConnector>> {
        self.opened.lock().await.clone()
    }
}

impl Default for InMemoryFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectorFactory for InMemoryFactory {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        _pool: &PoolConfig,
    ) -> Result<Arc<dyn Connector>, PluginError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(PluginError::Connect(format!(
                "in-memory connect refused for {}",
                descriptor
            )));
        }

        let mut connector = InMemoryConnector::new(descriptor.as_str()).with_latency(self.latency);
        for (statement, rows) in &self.responses {
            connector = connector.with_response(statement.clone(), rows.clone());
        }
        connector.ping_fails = self.fail_ping.load(Ordering::SeqCst);

        let connector = Arc::new(connector);
        self.opened.lock().await.push(connector.clone());
        Ok(connector)
    }
}
