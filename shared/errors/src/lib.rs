//! SmartMessage Error Handling Library
//!
//! This library provides error handling for the SmartMessage framework.
//! It includes the framework error taxonomy, structured validation
//! failures, and error classification utilities.

pub mod types;
pub mod validation;

// Re-export commonly used types
pub use types::*;
pub use validation::*;

// Re-export external dependencies
pub use anyhow::{anyhow, Context, Result as AnyhowResult};
pub use thiserror::Error;
