//! Connection pool settings

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection pool configuration for the managed connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool (default: 10)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,

    /// Minimum number of connections to maintain (default: 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_connections: Option<u32>,

    /// Connection acquire timeout in seconds (default: 30)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_timeout_secs: Option<u64>,

    /// Idle connection timeout in seconds (default: 600)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,

    /// Maximum lifetime of a connection in seconds (default: 1800)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lifetime_secs: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: Some(10),
            min_connections: Some(1),
            acquire_timeout_secs: Some(30),
            idle_timeout_secs: Some(600),
            max_lifetime_secs: Some(1800),
        }
    }
}

impl PoolConfig {
    pub fn max_connections(&self) -> u32 {
        self.max_connections.unwrap_or(10)
    }

    /// Never above `max_connections`
    pub fn min_connections(&self) -> u32 {
        self.min_connections.unwrap_or(1).min(self.max_connections())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs.unwrap_or(30))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.unwrap_or(600))
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs.unwrap_or(1800))
    }
}
