//! SmartMessage Logging Library
//!
//! This library provides the structured logging contract for the
//! SmartMessage framework: level and format gating, sink selection, file
//! rotation, and a no-op sink for tests.

pub mod logger;

// Re-export commonly used types
pub use logger::*;

// Re-export external dependencies
pub use tracing::{debug, error, event, info, span, trace, warn, Level, Span};
