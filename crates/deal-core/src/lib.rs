//! Deal Core - error taxonomy, configuration, and the stage executor seam
//!
//! This crate holds what the workflow engine and the agents both depend on.
//!
//! # Modules
//!
//! - [`config`] - Layered TOML + environment configuration
//! - [`executor`] - The [`StepExecutor`] / [`StageEmitter`] traits agents implement
//! - [`error`] - [`EngineError`] and its classification

#![warn(missing_docs)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

pub mod config;
pub mod error;
pub mod executor;

pub use config::*;
pub use error::*;
pub use executor::*;

/// Result type alias using [`EngineError`]
pub type Result<T> = std::result::Result<T, EngineError>;
