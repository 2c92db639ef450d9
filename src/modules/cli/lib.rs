//! pgpolicy CLI
//!
//! Developer commands for trying a plugin configuration outside a policy engine:
//! - resolve: Print the connection descriptor a configuration resolves to
//! - check: Connect, report the plugin status and disconnect
//! - query: Run a statement through the query builtin and print the rows

pub mod commands;

pub use commands::{Cli, Commands};
