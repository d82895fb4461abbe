//! sluice-core — configuration and shared types for the Sluice pooler.
//!
//! Everything here is plain data: the validated [`Config`] loaded from
//! `sluice.toml`, the per-target identity and pool limits derived from it,
//! and the error type reported when a configuration is rejected.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, DatabaseConfig, Settings};
pub use error::{ConfigError, ConfigResult};
pub use types::*;
