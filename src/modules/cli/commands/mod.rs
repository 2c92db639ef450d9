//! CLI commands

mod check;
mod query;
mod resolve;

pub use check::CheckCommand;
pub use query::QueryCommand;
pub use resolve::ResolveCommand;

use clap::{Parser, Subcommand};
use pgpolicy_core::PluginError;

/// pgpolicy - PostgreSQL query builtins for policy evaluation
#[derive(Parser, Debug)]
#[command(name = "pgpolicy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Plugin configuration file (JSON)
    ///
    /// Global, so it can also follow the subcommand, e.g. `pgpolicy check -c db.json`.
    #[arg(
        short = 'c',
        long = "config",
        global = true,
        default_value = "pgpolicy.json"
    )]
    pub config: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the connection descriptor, with the password redacted
    Resolve(ResolveCommand),

    /// Connect and report the plugin status
    Check(CheckCommand),

    /// Run a statement through the query builtin
    Query(QueryCommand),
}

/// Read a raw configuration payload
pub(crate) fn read_payload(path: &str) -> Result<Vec<u8>, PluginError> {
    std::fs::read(path)
        .map_err(|e| PluginError::Config(format!("Failed to read file '{}': {}", path, e)))
}
