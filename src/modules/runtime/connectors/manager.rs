//! Connection manager owning the single live database connection

use pgpolicy_config::ConfigResolver;
use pgpolicy_core::{ConnectionDescriptor, PluginConfig, PluginError};
use pgpolicy_types::{ManagerState, SqlValue};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OwnedRwLockReadGuard, RwLock};
use tracing::{debug, error, info, warn};

use super::postgres::PostgresConnectorFactory;
use super::traits::{Connector, ConnectorFactory, RowSet};

/// A connector together with what it was opened for
struct ManagedConnection {
    connector: Arc<dyn Connector>,
    descriptor: ConnectionDescriptor,
    /// Monotonic counter, incremented for every connection the manager opens
    generation: u64,
    /// Read-held by every lease; the retirer takes it for writing before closing.
    inflight: Arc<RwLock<()>>,
}

/// Borrowed use of the current connection.
///
/// While a lease is alive the connection it points at will not be closed, even if
/// a reconfigure or stop has already replaced it.
pub struct ConnectionLease {
    connection: Arc<ManagedConnection>,
    _inflight: OwnedRwLockReadGuard<()>,
}

impl ConnectionLease {
    pub async fn query(&self, statement: &str, args: &[SqlValue]) -> Result<RowSet, PluginError> {
        self.connection.connector.query(statement, args).await
    }

    pub fn generation(&self) -> u64 {
        self.connection.generation
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.connection.descriptor
    }

    /// Short name of the backing connector, e.g. `postgres`
    pub fn connector_type(&self) -> &'static str {
        self.connection.connector.connector_type()
    }
}

/// Owns at most one live connection and moves it through its lifecycle.
///
/// `start`, `reconfigure` and `stop` are serialized. Reconfigure builds the new
/// connection before touching the old one: on success the old connection is swapped
/// out and closed once its in-flight queries finish, on failure it keeps serving.
pub struct ConnectionManager {
    factory: Arc<dyn ConnectorFactory>,
    lifecycle: Mutex<()>,
    current: RwLock<Option<Arc<ManagedConnection>>>,
    state: watch::Sender<ManagerState>,
    generation: AtomicU64,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn ConnectorFactory>) -> Self {
        let (state, _) = watch::channel(ManagerState::Uninitialized);
        Self {
            factory,
            lifecycle: Mutex::new(()),
            current: RwLock::new(None),
            state,
            generation: AtomicU64::new(0),
        }
    }

    /// Manager backed by sqlx Postgres pools
    pub fn postgres() -> Self {
        Self::new(Arc::new(PostgresConnectorFactory))
    }

    pub fn state(&self) -> ManagerState {
        self.state.borrow().clone()
    }

    /// Receive every state transition
    pub fn subscribe(&self) -> watch::Receiver<ManagerState> {
        self.state.subscribe()
    }

    /// Lease the current connection, or `None` if nothing has been established
    pub async fn current(&self) -> Option<ConnectionLease> {
        let current = self.current.read().await;
        let connection = current.as_ref()?.clone();
        // Taken before the slot lock is released so a swap cannot retire the
        // connection between the lookup and the lease.
        let inflight = connection.inflight.clone().read_owned().await;
        Some(ConnectionLease {
            connection,
            _inflight: inflight,
        })
    }

    /// Whether a connection is currently installed, regardless of state
    pub async fn has_connection(&self) -> bool {
        self.current.read().await.is_some()
    }

    /// Establish the connection described by `config`.
    ///
    /// A no-op when already ready. Retries after a failed start or reconfigure.
    pub async fn start(&self, config: &PluginConfig) -> Result<(), PluginError> {
        let _lifecycle = self.lifecycle.lock().await;

        match self.state() {
            ManagerState::Stopped => {
                return Err(PluginError::Lifecycle(
                    "cannot start a stopped connection manager".to_string(),
                ))
            }
            ManagerState::Ready => {
                debug!("connection manager already started");
                return Ok(());
            }
            _ => {}
        }

        self.transition(ManagerState::Starting);
        self.replace(config).await
    }

    /// Switch to the connection described by `config`.
    ///
    /// On failure the previous connection, if any, stays installed and the state
    /// becomes `Failed` with the cause.
    pub async fn reconfigure(&self, config: &PluginConfig) -> Result<(), PluginError> {
        let _lifecycle = self.lifecycle.lock().await;

        match self.state() {
            ManagerState::Stopped => {
                return Err(PluginError::Lifecycle(
                    "cannot reconfigure a stopped connection manager".to_string(),
                ))
            }
            ManagerState::Uninitialized => self.transition(ManagerState::Starting),
            _ => self.transition(ManagerState::Reconfiguring),
        }

        let result = self.replace(config).await;
        if result.is_err() && self.has_connection().await {
            warn!("reconfigure failed, previous connection keeps serving");
        }
        result
    }

    /// Close the connection and refuse further lifecycle calls. Idempotent.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        if self.state().is_stopped() {
            debug!("connection manager already stopped");
            return;
        }

        let previous = self.swap(None).await;
        self.transition(ManagerState::Stopped);

        if let Some(previous) = previous {
            Self::retire(previous).await;
        }
        info!("connection manager stopped");
    }

    /// Open a connection for `config` and install it, retiring whatever it replaces
    async fn replace(&self, config: &PluginConfig) -> Result<(), PluginError> {
        match self.open(config).await {
            Ok(connection) => {
                let generation = connection.generation;
                let descriptor = connection.descriptor.redacted();
                let connector = connection.connector.connector_type();
                let previous = self.swap(Some(connection)).await;
                self.transition(ManagerState::Ready);
                info!(generation, connector, descriptor = %descriptor, "database connection ready");

                if let Some(previous) = previous {
                    Self::retire(previous).await;
                }
                Ok(())
            }
            Err(e) => {
                error!(phase = e.phase(), error = %e, "failed to establish database connection");
                self.transition(ManagerState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn open(&self, config: &PluginConfig) -> Result<Arc<ManagedConnection>, PluginError> {
        let descriptor = ConfigResolver::resolve(config)?;
        debug!(descriptor = %descriptor, "opening database connection");

        let connector = self.factory.connect(&descriptor, &config.pool).await?;
        if let Err(e) = connector.health_check().await {
            connector.close().await;
            return Err(e);
        }

        Ok(Arc::new(ManagedConnection {
            connector,
            descriptor,
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
            inflight: Arc::new(RwLock::new(())),
        }))
    }

    async fn swap(
        &self,
        next: Option<Arc<ManagedConnection>>,
    ) -> Option<Arc<ManagedConnection>> {
        let mut current = self.current.write().await;
        std::mem::replace(&mut *current, next)
    }

    /// Wait for outstanding leases on `connection`, then close it
    async fn retire(connection: Arc<ManagedConnection>) {
        debug!(generation = connection.generation, "draining previous connection");
        let _drained = connection.inflight.write().await;
        connection.connector.close().await;
        debug!(generation = connection.generation, "previous connection closed");
    }

    fn transition(&self, next: ManagerState) {
        let previous = self.state.send_replace(next.clone());
        if previous != next {
            debug!(from = previous.name(), to = next.name(), "connection manager state changed");
        }
    }
}
