//! The `<namespace>.query` and `<namespace>.select` builtins

use pgpolicy_core::{ErrorMode, PluginConfig, PluginError};
use serde_json::Value;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{error, warn};

use super::host::{Builtin, PluginHost};
use super::PLUGIN_NAME;
use crate::bridge::{EvalContext, QueryBridge};

/// Builtin running a query through the bridge.
///
/// Failures are surfaced according to the configured `ErrorMode`, the same way for
/// every error class: either returned to the call site or printed to the host with
/// an undefined result.
pub struct QueryFunction {
    name: String,
    bridge: Arc<QueryBridge>,
    host: Arc<dyn PluginHost>,
    config: watch::Receiver<PluginConfig>,
    runtime: Handle,
}

impl QueryFunction {
    pub fn new(
        name: impl Into<String>,
        bridge: Arc<QueryBridge>,
        host: Arc<dyn PluginHost>,
        config: watch::Receiver<PluginConfig>,
        runtime: Handle,
    ) -> Self {
        Self {
            name: name.into(),
            bridge,
            host,
            config,
            runtime,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn error_mode(&self) -> ErrorMode {
        self.config.borrow().error_mode
    }
}

impl Builtin for QueryFunction {
    fn call(&self, ctx: &EvalContext, operands: &[Value]) -> Result<Option<Value>, PluginError> {
        match self.bridge.call_blocking(&self.runtime, operands, ctx) {
            Ok(rows) => Ok(Some(rows)),
            Err(e) => {
                if e.is_error() {
                    error!(builtin = %self.name, phase = e.phase(), error = %e, "query builtin failed");
                } else {
                    warn!(builtin = %self.name, phase = e.phase(), error = %e, "query builtin failed");
                }
                match self.error_mode() {
                    ErrorMode::Error => Err(e),
                    ErrorMode::Diagnostic => {
                        self.host.print(PLUGIN_NAME, &format!("{}: {}", self.name, e));
                        Ok(None)
                    }
                }
            }
        }
    }
}
