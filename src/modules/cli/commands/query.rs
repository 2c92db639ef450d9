//! Query command implementation

use clap::Args;
use pgpolicy_core::PluginError;
use pgpolicy_runtime::{EvalContext, Factory, LocalHost};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::read_payload;

/// Query command arguments
#[derive(Args, Debug)]
pub struct QueryCommand {
    /// SQL statement, using `$1`, `$2`, ... placeholders
    pub statement: String,

    /// Positional arguments as a JSON array
    #[arg(short, long, default_value = "[]")]
    pub args: String,

    /// Give up on the query after this many milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

impl QueryCommand {
    /// Execute the query command
    pub async fn execute(&self, config_path: &str) -> Result<(), PluginError> {
        let rows = self.run(&Factory::new(), config_path).await?;
        println!("{}", serde_json::to_string_pretty(&rows)?);
        Ok(())
    }

    /// Start a plugin, run the statement through its query bridge and stop it again
    pub async fn run(&self, factory: &Factory, config_path: &str) -> Result<Value, PluginError> {
        let args: Value = serde_json::from_str(&self.args)?;
        if !args.is_array() {
            return Err(PluginError::InvalidInput(
                "--args must be a JSON array".to_string(),
            ));
        }

        let payload = read_payload(config_path)?;
        let host = Arc::new(LocalHost::new());
        let plugin = factory.create_from_payload(host, &payload)?;
        plugin.start().await?;

        let mut ctx = EvalContext::new();
        if let Some(ms) = self.timeout_ms {
            ctx = ctx.with_timeout(Duration::from_millis(ms));
        }

        info!(statement = %self.statement, "running query");
        let result = plugin
            .bridge()
            .call(&[Value::String(self.statement.clone()), args], &ctx)
            .await;
        plugin.stop().await;

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgpolicy_runtime::{InMemoryFactory, RowSet};
    use pgpolicy_types::SqlValue;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const STATEMENT: &str = "SELECT name FROM teams WHERE id = $1";

    fn config_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"{"connection_string": "postgres://db/app"}"#)
            .unwrap();
        file
    }

    fn factory() -> Factory {
        let rows = RowSet::new(vec!["name".into()]).with_row(vec![SqlValue::Text("core".into())]);
        Factory::with_connectors(Arc::new(InMemoryFactory::new().with_response(STATEMENT, rows)))
    }

    fn command(args: &str) -> QueryCommand {
        QueryCommand {
            statement: STATEMENT.to_string(),
            args: args.to_string(),
            timeout_ms: Some(1000),
        }
    }

    #[tokio::test]
    async fn test_query_rows() {
        let file = config_file();
        let rows = command("[3]")
            .run(&factory(), file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(rows, json!([{"name": "core"}]));
    }

    #[tokio::test]
    async fn test_query_args_must_be_array() {
        let file = config_file();
        let err = command(r#"{"id": 3}"#)
            .run(&factory(), file.path().to_str().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_query_bad_argument_position() {
        let file = config_file();
        let err = command(r#"[3, {"x": 1}]"#)
            .run(&factory(), file.path().to_str().unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("position 1"));
    }
}
