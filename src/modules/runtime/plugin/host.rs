//! Contract between the plugin and the policy engine hosting it

use pgpolicy_core::PluginError;
use pgpolicy_types::PluginStatus;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

use crate::bridge::EvalContext;

/// A function the evaluation engine can call from policy code.
///
/// `Ok(None)` means the call produced no value and the expression is undefined.
pub trait Builtin: Send + Sync {
    fn call(&self, ctx: &EvalContext, operands: &[Value]) -> Result<Option<Value>, PluginError>;
}

/// Declaration registered alongside a builtin
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuiltinDecl {
    pub name: String,
    pub args: Vec<&'static str>,
    pub result: &'static str,
    /// Results may differ between evaluations with identical inputs
    pub nondeterministic: bool,
    /// The host may cache results within one evaluation
    pub memoize: bool,
}

impl BuiltinDecl {
    /// `(query: string, args: array<any>) -> array<object>`
    pub fn query(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: vec!["string", "array<any>"],
            result: "array<object>",
            nondeterministic: true,
            memoize: true,
        }
    }
}

/// Services the host exposes to a plugin
pub trait PluginHost: Send + Sync {
    /// Record the plugin's health
    fn update_status(&self, plugin: &str, status: PluginStatus);

    /// Make `builtin` callable from policy code under `decl.name`
    fn register_builtin(&self, decl: BuiltinDecl, builtin: Arc<dyn Builtin>);

    /// Withdraw a builtin registered under `name`; unknown names are ignored
    fn unregister_builtin(&self, name: &str);

    /// Side channel for runtime messages that are not evaluation failures
    fn print(&self, plugin: &str, message: &str);
}

/// Host that keeps everything in memory and logs through tracing.
///
/// Used by the CLI and by tests.
#[derive(Default)]
pub struct LocalHost {
    statuses: RwLock<Vec<PluginStatus>>,
    builtins: RwLock<HashMap<String, (BuiltinDecl, Arc<dyn Builtin>)>>,
    printed: RwLock<Vec<String>>,
}

impl LocalHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent status, if any was reported
    pub fn status(&self) -> Option<PluginStatus> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    /// Every status reported so far, oldest first
    pub fn statuses(&self) -> Vec<PluginStatus> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Registered builtin declarations, sorted by name
    pub fn declarations(&self) -> Vec<BuiltinDecl> {
        let builtins = self.builtins.read().unwrap_or_else(PoisonError::into_inner);
        let mut decls: Vec<_> = builtins.values().map(|(decl, _)| decl.clone()).collect();
        decls.sort_by(|a, b| a.name.cmp(&b.name));
        decls
    }

    pub fn builtin(&self, name: &str) -> Option<Arc<dyn Builtin>> {
        self.builtins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|(_, builtin)| builtin.clone())
    }

    /// Call a registered builtin by name
    pub fn call(
        &self,
        name: &str,
        ctx: &EvalContext,
        operands: &[Value],
    ) -> Result<Option<Value>, PluginError> {
        let builtin = self
            .builtin(name)
            .ok_or_else(|| PluginError::InvalidInput(format!("unknown builtin '{}'", name)))?;
        builtin.call(ctx, operands)
    }

    /// Messages sent through the print channel
    pub fn printed(&self) -> Vec<String> {
        self.printed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PluginHost for LocalHost {
    fn update_status(&self, plugin: &str, status: PluginStatus) {
        if status.is_ok() {
            info!(plugin, status = %status, "plugin status");
        } else {
            warn!(plugin, status = %status, "plugin status");
        }
        self.statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(status);
    }

    fn register_builtin(&self, decl: BuiltinDecl, builtin: Arc<dyn Builtin>) {
        info!(builtin = %decl.name, "registered builtin");
        self.builtins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(decl.name.clone(), (decl, builtin));
    }

    fn unregister_builtin(&self, name: &str) {
        let removed = self
            .builtins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if removed.is_some() {
            info!(builtin = %name, "unregistered builtin");
        }
    }

    fn print(&self, plugin: &str, message: &str) {
        info!(plugin, "{}", message);
        self.printed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{}: {}", plugin, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl Builtin for Echo {
        fn call(&self, _ctx: &EvalContext, operands: &[Value]) -> Result<Option<Value>, PluginError> {
            Ok(operands.first().cloned())
        }
    }

    #[test]
    fn test_query_declaration() {
        let decl = BuiltinDecl::query("postgres.query");
        assert!(decl.nondeterministic);
        assert!(decl.memoize);
        assert_eq!(decl.args, vec!["string", "array<any>"]);
        assert_eq!(decl.result, "array<object>");
    }

    #[test]
    fn test_local_host_records() {
        let host = LocalHost::new();
        assert!(host.status().is_none());

        host.update_status("postgres", PluginStatus::not_ready());
        host.update_status("postgres", PluginStatus::ok());
        assert_eq!(host.statuses().len(), 2);
        assert!(host.status().unwrap().is_ok());

        host.register_builtin(BuiltinDecl::query("x.query"), Arc::new(Echo));
        let result = host.call("x.query", &EvalContext::new(), &[json!(1)]).unwrap();
        assert_eq!(result, Some(json!(1)));
        assert!(host.call("x.missing", &EvalContext::new(), &[]).is_err());

        host.unregister_builtin("x.query");
        host.unregister_builtin("x.query");
        assert!(host.builtin("x.query").is_none());
        assert!(host.declarations().is_empty());

        host.print("postgres", "hello");
        assert_eq!(host.printed(), vec!["postgres: hello".to_string()]);
    }
}
