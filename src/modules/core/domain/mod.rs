//! Domain models for pgpolicy configuration

mod config;
mod descriptor;
mod types;

pub use config::{
    ConnectionSettings, ConnectionSource, ErrorMode, PluginConfig, DEFAULT_NAMESPACE,
};
pub use descriptor::ConnectionDescriptor;
pub use types::PoolConfig;
