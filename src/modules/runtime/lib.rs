//! Runtime for pgpolicy
//!
//! This crate provides the database connectors, the connection manager, the query
//! bridge that policy builtins call into, and the plugin shell driven by the host.

pub mod bridge;
pub mod connectors;
pub mod plugin;

pub use bridge::{EvalContext, QueryBridge, Row};
pub use connectors::{
    ConnectionLease, ConnectionManager, Connector, ConnectorFactory, PostgresConnector,
    PostgresConnectorFactory, RowSet,
};
#[cfg(any(test, feature = "testing"))]
pub use connectors::{InMemoryConnector, InMemoryFactory};
pub use plugin::{
    Builtin, BuiltinDecl, Factory, LocalHost, PluginHost, PostgresPlugin, QueryFunction,
    PLUGIN_NAME,
};
