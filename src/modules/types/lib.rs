//! Type definitions for pgpolicy
//!
//! This crate contains shared type definitions used across the pgpolicy codebase:
//! native SQL values, plugin status and connection manager states.

pub mod status;
pub mod value;

pub use status::{ManagerState, PluginState, PluginStatus};
pub use value::SqlValue;
