//! Core domain logic for pgpolicy
//!
//! This crate contains the plugin configuration model, the connection descriptor
//! and the error types shared by the config resolver and the runtime.

pub mod domain;
pub mod error;

pub use domain::*;
pub use error::{PluginError, Result};
