//! Plugin status and connection manager state definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Health of the plugin as reported to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginState {
    /// No usable connection (not started, stopped, or connect failed)
    NotReady,
    /// Connected and serving queries
    Ok,
    /// The plugin cannot run with its current configuration
    Err,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginState::NotReady => write!(f, "NOT_READY"),
            PluginState::Ok => write!(f, "OK"),
            PluginState::Err => write!(f, "ERR"),
        }
    }
}

/// Status record reported to the host on every lifecycle transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginStatus {
    pub state: PluginState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PluginStatus {
    pub fn ok() -> Self {
        Self {
            state: PluginState::Ok,
            message: None,
        }
    }

    pub fn not_ready() -> Self {
        Self {
            state: PluginState::NotReady,
            message: None,
        }
    }

    /// Not ready, with the reason attached
    pub fn not_ready_with(message: impl Into<String>) -> Self {
        Self {
            state: PluginState::NotReady,
            message: Some(message.into()),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            state: PluginState::Err,
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.state == PluginState::Ok
    }
}

impl Default for PluginStatus {
    fn default() -> Self {
        Self::not_ready()
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.state, message),
            None => write!(f, "{}", self.state),
        }
    }
}

/// Lifecycle state of a connection manager
///
/// ```text
/// Uninitialized -> Starting -> Ready -> Reconfiguring -> Ready | Failed
/// Ready | Failed -> Stopped
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum ManagerState {
    #[default]
    Uninitialized,
    Starting,
    Ready,
    Reconfiguring,
    /// The last start or reconfigure failed
    Failed(String),
    /// Terminal
    Stopped,
}

impl ManagerState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ManagerState::Ready)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, ManagerState::Stopped)
    }

    /// Short name used in log fields
    pub fn name(&self) -> &'static str {
        match self {
            ManagerState::Uninitialized => "uninitialized",
            ManagerState::Starting => "starting",
            ManagerState::Ready => "ready",
            ManagerState::Reconfiguring => "reconfiguring",
            ManagerState::Failed(_) => "failed",
            ManagerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerState::Failed(message) => write!(f, "failed: {}", message),
            other => write!(f, "{}", other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_state_serde() {
        let json = serde_json::to_string(&PluginState::NotReady).unwrap();
        assert_eq!(json, "\"NOT_READY\"");

        let state: PluginState = serde_json::from_str("\"OK\"").unwrap();
        assert_eq!(state, PluginState::Ok);
    }

    #[test]
    fn test_plugin_status_display() {
        assert_eq!(PluginStatus::ok().to_string(), "OK");
        assert_eq!(
            PluginStatus::not_ready_with("connection refused").to_string(),
            "NOT_READY: connection refused"
        );
    }

    #[test]
    fn test_plugin_status_default_is_not_ready() {
        let status = PluginStatus::default();
        assert_eq!(status.state, PluginState::NotReady);
        assert!(status.message.is_none());
        assert!(!status.is_ok());
    }

    #[test]
    fn test_manager_state_display() {
        assert_eq!(ManagerState::Ready.to_string(), "ready");
        assert_eq!(
            ManagerState::Failed("ping failed".into()).to_string(),
            "failed: ping failed"
        );
        assert!(ManagerState::Stopped.is_stopped());
        assert!(!ManagerState::Starting.is_ready());
    }
}
