//! SmartMessage Configuration Library
//!
//! This library provides configuration management for the SmartMessage
//! framework: transport options, deduplication, circuit breaker, dead-letter
//! queue, and logger settings, loaded from layered files and environment
//! variables.

pub mod logging;
pub mod resilience;
pub mod settings;
pub mod transport;

// Re-export commonly used types
pub use logging::*;
pub use resilience::*;
pub use settings::*;
pub use transport::*;
