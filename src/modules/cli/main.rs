//! pgpolicy CLI
//!
//! Command-line interface for the pgpolicy PostgreSQL builtins.

use clap::Parser;
use pgpolicy_cli::{Cli, Commands};
use pgpolicy_core::PluginError;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), PluginError> {
    let cli = Cli::parse();

    // Logs go to stderr so command output stays machine readable
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Resolve(cmd) => {
            cmd.execute(&cli.config)?;
        }
        Commands::Check(cmd) => {
            cmd.execute(&cli.config).await?;
        }
        Commands::Query(cmd) => {
            cmd.execute(&cli.config).await?;
        }
    }

    Ok(())
}
