//! Stratum Core - shared types for the stratum image builder.
//!
//! Holds the error taxonomy, the build and store configuration, and the
//! ordered environment set that flows from the build description into the
//! image config and finally into the launched process.

pub mod config;
pub mod env;
pub mod error;

// Re-export commonly used types
pub use config::{RecipeConfig, RuntimeFlags, StoreConfig};
pub use env::EnvSet;
pub use error::{Result, StratumError};

/// Stratum version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
