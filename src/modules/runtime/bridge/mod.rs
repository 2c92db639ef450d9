//! Query bridge between policy evaluation and the database
//!
//! Looks up the current connection, converts arguments, runs the statement and
//! assembles rows into engine values.

pub mod values;

pub use values::Row;

use pgpolicy_core::PluginError;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connectors::ConnectionManager;

/// Deadline and cancellation carried over from the evaluation that issued a query
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub deadline: Option<Instant>,
    pub cancellation: Option<CancellationToken>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Executes caller-supplied SQL against the manager's current connection.
///
/// Safe to call concurrently; each call leases the connection for its own duration.
pub struct QueryBridge {
    manager: Arc<ConnectionManager>,
}

impl QueryBridge {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Run `statement` with positional `args` and return every row
    pub async fn invoke(
        &self,
        statement: &str,
        args: &[Value],
        ctx: &EvalContext,
    ) -> Result<Vec<Row>, PluginError> {
        let lease = self.manager.current().await.ok_or_else(|| {
            PluginError::NotReady("no database connection has been established".to_string())
        })?;

        let params = values::to_native_args(args)?;

        debug!(
            generation = lease.generation(),
            connector = lease.connector_type(),
            args = params.len(),
            "executing query"
        );
        let rows = with_context(lease.query(statement, &params), ctx).await?;
        drop(lease);

        values::from_rows(rows)
    }

    /// Builtin entry point: `[statement, args]` in, array of row objects out
    pub async fn call(&self, operands: &[Value], ctx: &EvalContext) -> Result<Value, PluginError> {
        let (statement, args) = parse_operands(operands)?;
        let rows = self.invoke(statement, args, ctx).await?;
        Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
    }

    /// `call` for synchronous callers, driven on `runtime`.
    ///
    /// From inside a multi-threaded runtime the current worker is handed over for the
    /// duration of the call. Current-thread runtimes cannot block and are rejected.
    pub fn call_blocking(
        &self,
        runtime: &Handle,
        operands: &[Value],
        ctx: &EvalContext,
    ) -> Result<Value, PluginError> {
        match Handle::try_current() {
            Err(_) => runtime.block_on(self.call(operands, ctx)),
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| runtime.block_on(self.call(operands, ctx)))
            }
            Ok(_) => Err(PluginError::Internal(
                "cannot block on a query from a current-thread runtime".to_string(),
            )),
        }
    }
}

/// Split builtin operands into the statement and its argument list
pub fn parse_operands(operands: &[Value]) -> Result<(&str, &[Value]), PluginError> {
    match operands {
        [Value::String(statement), Value::Array(args)] => Ok((statement.as_str(), args.as_slice())),
        [statement, args] => {
            if !statement.is_string() {
                return Err(PluginError::InvalidInput(format!(
                    "query must be a string, got {}",
                    kind(statement)
                )));
            }
            Err(PluginError::InvalidInput(format!(
                "arguments must be an array, got {}",
                kind(args)
            )))
        }
        _ => Err(PluginError::InvalidInput(format!(
            "expected 2 operands (query, args), got {}",
            operands.len()
        ))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Race `execution` against the context's deadline and cancellation
async fn with_context<T, F>(execution: F, ctx: &EvalContext) -> Result<T, PluginError>
where
    F: Future<Output = Result<T, PluginError>>,
{
    let deadline = async {
        match ctx.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
            None => std::future::pending().await,
        }
    };
    let cancelled = async {
        match &ctx.cancellation {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = execution => result,
        _ = deadline => Err(PluginError::DeadlineExceeded(
            "query did not finish before the evaluation deadline".to_string(),
        )),
        _ = cancelled => Err(PluginError::Cancelled(
            "evaluation was cancelled while the query was running".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{InMemoryFactory, RowSet};
    use pgpolicy_core::{ConnectionDescriptor, PluginConfig};
    use pgpolicy_types::SqlValue;
    use serde_json::json;

    const USERS: &str = "SELECT id, email FROM users WHERE active = $1";

    fn users() -> RowSet {
        RowSet::new(vec!["id".into(), "email".into()])
            .with_row(vec![SqlValue::Int(1), SqlValue::Text("a@x".into())])
            .with_row(vec![SqlValue::Int(2), SqlValue::Null])
    }

    async fn started(factory: InMemoryFactory) -> (Arc<InMemoryFactory>, QueryBridge) {
        let factory = Arc::new(factory);
        let manager = Arc::new(ConnectionManager::new(factory.clone()));
        let config =
            PluginConfig::with_descriptor(ConnectionDescriptor::new("postgres://db/app").unwrap());
        manager.start(&config).await.unwrap();
        (factory, QueryBridge::new(manager))
    }

    #[tokio::test]
    async fn test_not_ready_before_start() {
        let manager = Arc::new(ConnectionManager::new(Arc::new(InMemoryFactory::new())));
        let bridge = QueryBridge::new(manager);

        let err = bridge
            .invoke("SELECT 1", &[], &EvalContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::NotReady(_)));
    }

    #[tokio::test]
    async fn test_invoke_returns_rows() {
        let (factory, bridge) = started(InMemoryFactory::new().with_response(USERS, users())).await;

        let rows = bridge
            .invoke(USERS, &[json!(true)], &EvalContext::new())
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(Value::Object(rows[0].clone()), json!({"id": 1, "email": "a@x"}));
        assert_eq!(Value::Object(rows[1].clone()), json!({"id": 2, "email": null}));

        let executed = factory.opened().await[0].executed().await;
        assert_eq!(executed, vec![(USERS.to_string(), vec![SqlValue::Bool(true)])]);
    }

    #[tokio::test]
    async fn test_conversion_failure_sends_nothing() {
        let (factory, bridge) = started(InMemoryFactory::new()).await;

        let err = bridge
            .invoke(USERS, &[json!(1), json!({"bad": true})], &EvalContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::ArgumentConversion { index: 1, .. }));
        assert!(factory.opened().await[0].executed().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_result() {
        let (_, bridge) = started(InMemoryFactory::new()).await;
        let value = bridge
            .call(&[json!("SELECT 1 WHERE false"), json!([])], &EvalContext::new())
            .await
            .unwrap();
        assert_eq!(value, json!([]));
    }

    #[tokio::test]
    async fn test_call_wraps_rows_in_array() {
        let (_, bridge) = started(InMemoryFactory::new().with_response(USERS, users())).await;
        let value = bridge
            .call(&[json!(USERS), json!([true])], &EvalContext::new())
            .await
            .unwrap();
        assert_eq!(
            value,
            json!([{"id": 1, "email": "a@x"}, {"id": 2, "email": null}])
        );
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let (_, bridge) =
            started(InMemoryFactory::new().with_latency(Duration::from_millis(500))).await;
        let ctx = EvalContext::new().with_timeout(Duration::from_millis(20));

        let err = bridge.invoke("SELECT pg_sleep(1)", &[], &ctx).await.unwrap_err();
        assert!(matches!(err, PluginError::DeadlineExceeded(_)));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let (_, bridge) =
            started(InMemoryFactory::new().with_latency(Duration::from_millis(500))).await;
        let token = CancellationToken::new();
        let ctx = EvalContext::new().with_cancellation(token.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let err = bridge.invoke("SELECT pg_sleep(1)", &[], &ctx).await.unwrap_err();
        assert!(matches!(err, PluginError::Cancelled(_)));
    }

    #[test]
    fn test_parse_operands() {
        let operands = [json!("SELECT $1"), json!([1])];
        let (statement, args) = parse_operands(&operands).unwrap();
        assert_eq!(statement, "SELECT $1");
        assert_eq!(args, &[json!(1)]);

        assert!(parse_operands(&[json!(1), json!([])]).is_err());
        assert!(parse_operands(&[json!("SELECT 1"), json!({})]).is_err());
        assert!(parse_operands(&[json!("SELECT 1")]).is_err());
    }

    #[test]
    fn test_call_blocking_outside_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        let (_, bridge) = runtime.block_on(started(
            InMemoryFactory::new().with_response(USERS, users()),
        ));

        let value = bridge
            .call_blocking(runtime.handle(), &[json!(USERS), json!([true])], &EvalContext::new())
            .unwrap();
        assert_eq!(value.as_array().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_call_blocking_inside_runtime() {
        let (_, bridge) = started(InMemoryFactory::new().with_response(USERS, users())).await;
        let value = bridge
            .call_blocking(&Handle::current(), &[json!(USERS), json!([true])], &EvalContext::new())
            .unwrap();
        assert_eq!(value.as_array().unwrap().len(), 2);
    }
}
