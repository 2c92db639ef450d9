//! Plugin shell driven by the host's lifecycle calls

mod builtin;
mod factory;
mod host;

pub use builtin::QueryFunction;
pub use factory::Factory;
pub use host::{Builtin, BuiltinDecl, LocalHost, PluginHost};

use pgpolicy_core::{PluginConfig, PluginError};
use pgpolicy_types::PluginStatus;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{error, info};

use crate::bridge::QueryBridge;
use crate::connectors::ConnectionManager;

/// Name the plugin reports its status under
pub const PLUGIN_NAME: &str = "postgres";

/// One plugin instance: a connection manager, its query bridge, and the host it
/// reports to.
///
/// Lifecycle failures are reported to the host as status and returned, never
/// panicked on.
pub struct PostgresPlugin {
    host: Arc<dyn PluginHost>,
    manager: Arc<ConnectionManager>,
    bridge: Arc<QueryBridge>,
    config: watch::Sender<PluginConfig>,
    status: watch::Sender<PluginStatus>,
    registered: Mutex<HashSet<String>>,
    runtime: Handle,
}

impl PostgresPlugin {
    pub fn new(
        host: Arc<dyn PluginHost>,
        manager: Arc<ConnectionManager>,
        config: PluginConfig,
        runtime: Handle,
    ) -> Self {
        let (config, _) = watch::channel(config);
        let (status, _) = watch::channel(PluginStatus::not_ready());
        let plugin = Self {
            host,
            bridge: Arc::new(QueryBridge::new(manager.clone())),
            manager,
            config,
            status,
            registered: Mutex::new(HashSet::new()),
            runtime,
        };
        plugin.report(PluginStatus::not_ready());
        plugin
    }

    pub fn config(&self) -> PluginConfig {
        self.config.borrow().clone()
    }

    pub fn status(&self) -> PluginStatus {
        self.status.borrow().clone()
    }

    /// Receive every status the plugin reports
    pub fn subscribe(&self) -> watch::Receiver<PluginStatus> {
        self.status.subscribe()
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn bridge(&self) -> &Arc<QueryBridge> {
        &self.bridge
    }

    /// Connect, register the query builtins and report OK
    pub async fn start(&self) -> Result<(), PluginError> {
        let config = self.config();
        info!(namespace = %config.namespace, "starting postgres plugin");

        match self.manager.start(&config).await {
            Ok(()) => {
                self.register_builtins(&config);
                self.report(PluginStatus::ok());
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "postgres plugin failed to start");
                self.report(Self::failure_status(&e, None));
                Err(e)
            }
        }
    }

    /// Switch to `config`.
    ///
    /// The new error mode and namespace take effect only once the new connection is
    /// up; a failed reconfigure leaves the previous settings in place. A changed
    /// namespace withdraws the old builtin names before registering the new ones.
    /// A failed reconfigure reports NotReady even when the previous connection is
    /// still serving queries.
    pub async fn reconfigure(&self, config: PluginConfig) -> Result<(), PluginError> {
        info!(namespace = %config.namespace, "reconfiguring postgres plugin");

        match self.manager.reconfigure(&config).await {
            Ok(()) => {
                let previous = self.config.send_replace(config.clone());
                if previous.namespace != config.namespace {
                    self.unregister_builtins(&previous);
                }
                self.register_builtins(&config);
                self.report(PluginStatus::ok());
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "postgres plugin failed to reconfigure");
                let note = if self.manager.has_connection().await {
                    Some("previous connection still serving")
                } else {
                    None
                };
                self.report(Self::failure_status(&e, note));
                Err(e)
            }
        }
    }

    /// Close the connection and report NotReady. Idempotent.
    pub async fn stop(&self) {
        info!("stopping postgres plugin");
        self.manager.stop().await;
        self.report(PluginStatus::not_ready());
    }

    fn failure_status(error: &PluginError, note: Option<&str>) -> PluginStatus {
        let message = match note {
            Some(note) => format!("{} ({})", error, note),
            None => error.to_string(),
        };
        match error {
            PluginError::Config(_) | PluginError::Json(_) => PluginStatus::err(message),
            e if e.is_lifecycle() => PluginStatus::not_ready_with(message),
            _ => PluginStatus::err(message),
        }
    }

    fn report(&self, status: PluginStatus) {
        self.status.send_replace(status.clone());
        self.host.update_status(PLUGIN_NAME, status);
    }

    /// Register `<ns>.query` and `<ns>.select`, each name at most once per instance
    fn register_builtins(&self, config: &PluginConfig) {
        let mut registered = self.registered.lock().unwrap_or_else(PoisonError::into_inner);

        for name in [config.query_function(), config.select_function()] {
            if !registered.insert(name.clone()) {
                continue;
            }
            let function = QueryFunction::new(
                name.clone(),
                self.bridge.clone(),
                self.host.clone(),
                self.config.subscribe(),
                self.runtime.clone(),
            );
            self.host
                .register_builtin(BuiltinDecl::query(name), Arc::new(function));
        }
    }

    fn unregister_builtins(&self, config: &PluginConfig) {
        let mut registered = self.registered.lock().unwrap_or_else(PoisonError::into_inner);

        for name in [config.query_function(), config.select_function()] {
            if registered.remove(&name) {
                self.host.unregister_builtin(&name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::EvalContext;
    use crate::connectors::{Connector, InMemoryFactory, RowSet};
    use pgpolicy_core::{ConnectionDescriptor, ErrorMode};
    use pgpolicy_types::{PluginState, SqlValue};
    use serde_json::json;

    fn config(descriptor: &str) -> PluginConfig {
        PluginConfig::with_descriptor(ConnectionDescriptor::new(descriptor).unwrap())
    }

    fn plugin(factory: &Arc<InMemoryFactory>, config: PluginConfig) -> (Arc<LocalHost>, PostgresPlugin) {
        let host = Arc::new(LocalHost::new());
        let manager = Arc::new(ConnectionManager::new(factory.clone()));
        let plugin = PostgresPlugin::new(host.clone(), manager, config, Handle::current());
        (host, plugin)
    }

    #[tokio::test]
    async fn test_new_reports_not_ready() {
        let factory = Arc::new(InMemoryFactory::new());
        let (host, plugin) = plugin(&factory, config("postgres://db/a"));

        assert_eq!(plugin.status().state, PluginState::NotReady);
        assert_eq!(host.status().unwrap().state, PluginState::NotReady);
        assert!(host.declarations().is_empty());
    }

    #[tokio::test]
    async fn test_start_registers_builtins_and_reports_ok() {
        let factory = Arc::new(InMemoryFactory::new());
        let (host, plugin) = plugin(&factory, config("postgres://db/a"));

        plugin.start().await.unwrap();
        assert!(plugin.status().is_ok());
        assert!(host.status().unwrap().is_ok());

        let names: Vec<_> = host.declarations().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["postgres.query", "postgres.select"]);
    }

    #[tokio::test]
    async fn test_custom_namespace() {
        let factory = Arc::new(InMemoryFactory::new());
        let config = PluginConfig {
            namespace: "authz".into(),
            ..config("postgres://db/a")
        };
        let (host, plugin) = plugin(&factory, config);

        plugin.start().await.unwrap();
        let names: Vec<_> = host.declarations().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["authz.query", "authz.select"]);
    }

    #[tokio::test]
    async fn test_failed_start_reports_not_ready_with_cause() {
        let factory = Arc::new(InMemoryFactory::new());
        factory.set_fail_connect(true);
        let (host, plugin) = plugin(&factory, config("postgres://localhost:5/d"));

        let err = plugin.start().await.unwrap_err();
        assert!(matches!(err, PluginError::Connect(_)));

        let status = host.status().unwrap();
        assert_eq!(status.state, PluginState::NotReady);
        assert!(status.message.unwrap().contains("connect refused"));
        assert!(host.declarations().is_empty());

        factory.set_fail_connect(false);
        plugin.start().await.unwrap();
        assert!(plugin.status().is_ok());
    }

    #[tokio::test]
    async fn test_config_error_reports_err() {
        let factory = Arc::new(InMemoryFactory::new());
        let config = PluginConfig {
            source: pgpolicy_core::ConnectionSource::Settings(pgpolicy_core::ConnectionSettings {
                host: Some("bad host".into()),
                ..Default::default()
            }),
            ..PluginConfig::default()
        };
        let (host, plugin) = plugin(&factory, config);

        assert!(plugin.start().await.is_err());
        assert_eq!(host.status().unwrap().state, PluginState::Err);
    }

    #[tokio::test]
    async fn test_reconfigure_failure_reports_not_ready() {
        let factory = Arc::new(InMemoryFactory::new());
        let (host, plugin) = plugin(&factory, config("postgres://db/a"));
        plugin.start().await.unwrap();

        factory.set_fail_connect(true);
        assert!(plugin.reconfigure(config("postgres://db/b")).await.is_err());

        let status = host.status().unwrap();
        assert_eq!(status.state, PluginState::NotReady);
        assert!(status.message.unwrap().contains("previous connection still serving"));
        assert_eq!(plugin.manager().current().await.unwrap().generation(), 1);

        factory.set_fail_connect(false);
        plugin.reconfigure(config("postgres://db/b")).await.unwrap();
        assert!(plugin.status().is_ok());
    }

    #[tokio::test]
    async fn test_builtins_registered_once() {
        let factory = Arc::new(InMemoryFactory::new());
        let (host, plugin) = plugin(&factory, config("postgres://db/a"));

        plugin.start().await.unwrap();
        plugin.reconfigure(config("postgres://db/b")).await.unwrap();
        plugin.reconfigure(config("postgres://db/c")).await.unwrap();
        assert_eq!(host.declarations().len(), 2);
    }

    #[tokio::test]
    async fn test_namespace_change_swaps_builtins() {
        let factory = Arc::new(InMemoryFactory::new());
        let (host, plugin) = plugin(&factory, config("postgres://db/a"));
        plugin.start().await.unwrap();

        let renamed = PluginConfig {
            namespace: "authz".into(),
            ..config("postgres://db/a")
        };
        plugin.reconfigure(renamed).await.unwrap();

        let names: Vec<_> = host.declarations().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["authz.query", "authz.select"]);
        assert!(host.builtin("postgres.query").is_none());
        assert_eq!(plugin.config().namespace, "authz");
    }

    #[tokio::test]
    async fn test_failed_reconfigure_keeps_previous_config() {
        let factory = Arc::new(InMemoryFactory::new());
        let (host, plugin) = plugin(&factory, config("postgres://db/a"));
        plugin.start().await.unwrap();

        factory.set_fail_connect(true);
        let next = PluginConfig {
            namespace: "authz".into(),
            error_mode: ErrorMode::Diagnostic,
            ..config("postgres://db/b")
        };
        assert!(plugin.reconfigure(next).await.is_err());

        let current = plugin.config();
        assert_eq!(current.namespace, "postgres");
        assert_eq!(current.error_mode, ErrorMode::Error);
        let names: Vec<_> = host.declarations().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["postgres.query", "postgres.select"]);
    }

    #[test]
    fn test_failure_status_by_error_class() {
        let status = PostgresPlugin::failure_status(&PluginError::Config("bad".into()), None);
        assert_eq!(status.state, PluginState::Err);

        let status = PostgresPlugin::failure_status(
            &PluginError::Liveness("ping".into()),
            Some("previous connection still serving"),
        );
        assert_eq!(status.state, PluginState::NotReady);
        assert!(status.message.unwrap().ends_with("(previous connection still serving)"));

        let status = PostgresPlugin::failure_status(&PluginError::Internal("bug".into()), None);
        assert_eq!(status.state, PluginState::Err);
    }

    #[tokio::test]
    async fn test_stop_reports_not_ready() {
        let factory = Arc::new(InMemoryFactory::new());
        let (host, plugin) = plugin(&factory, config("postgres://db/a"));

        plugin.start().await.unwrap();
        plugin.stop().await;
        plugin.stop().await;

        assert_eq!(host.status().unwrap().state, PluginState::NotReady);
        assert!(factory.opened().await[0].is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_registered_builtin_runs_query() {
        let rows = RowSet::new(vec!["role".into()]).with_row(vec![SqlValue::Text("admin".into())]);
        let factory = Arc::new(
            InMemoryFactory::new().with_response("SELECT role FROM roles WHERE user_id = $1", rows),
        );
        let (host, plugin) = plugin(&factory, config("postgres://db/a"));
        plugin.start().await.unwrap();

        let result = host
            .call(
                "postgres.select",
                &EvalContext::new(),
                &[json!("SELECT role FROM roles WHERE user_id = $1"), json!([7])],
            )
            .unwrap();
        assert_eq!(result, Some(json!([{"role": "admin"}])));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_error_mode_follows_reconfigure() {
        let factory = Arc::new(InMemoryFactory::new());
        let (host, plugin) = plugin(&factory, config("postgres://db/a"));
        plugin.start().await.unwrap();

        let bad_args = [json!("SELECT $1"), json!([[1]])];
        assert!(host.call("postgres.query", &EvalContext::new(), &bad_args).is_err());

        let diagnostic = PluginConfig {
            error_mode: ErrorMode::Diagnostic,
            ..config("postgres://db/a")
        };
        plugin.reconfigure(diagnostic).await.unwrap();

        let result = host.call("postgres.query", &EvalContext::new(), &bad_args).unwrap();
        assert!(result.is_none());
        assert_eq!(host.printed().len(), 1);
    }
}
