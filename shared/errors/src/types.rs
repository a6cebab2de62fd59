//! Core error types for the SmartMessage framework

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single transport's failure inside a multi-transport publish attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportFailure {
    /// Name of the transport that failed
    pub transport: String,

    /// Rendered error from that transport
    pub error: String,
}

impl std::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.transport, self.error)
    }
}

/// Main error type for SmartMessage operations
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum SmartMessageError {
    /// Property or version validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        property: Option<String>,
        code: String,
    },

    /// Header (envelope metadata) validation errors
    #[error("Invalid header: {message}")]
    HeaderInvalid {
        message: String,
        field: Option<String>,
        code: String,
    },

    /// Operation attempted before a transport was wired
    #[error("No transport configured for {message_class}")]
    TransportNotConfigured {
        message_class: String,
        code: String,
    },

    /// Operation attempted before a serializer was wired
    #[error("No serializer configured for {message_class}")]
    SerializerNotConfigured {
        message_class: String,
        code: String,
    },

    /// Every configured transport rejected a publish
    #[error("Publish failed on all transports for {message_class}: {}", format_failures(.failures))]
    PublishFailed {
        message_class: String,
        failures: Vec<TransportFailure>,
        code: String,
    },

    /// Transport-side subscribe failure
    #[error("Subscribe failed on transport {transport}: {message}")]
    Subscribe {
        transport: String,
        message: String,
        code: String,
    },

    /// Failure raised inside a subscriber handler
    #[error("Handler {handler_id} failed: {message}")]
    Handler {
        handler_id: String,
        message: String,
        code: String,
    },

    /// Operation rejected because a circuit breaker is open
    #[error("Circuit {circuit} is open")]
    CircuitOpen {
        circuit: String,
        code: String,
    },

    /// A single dead-letter record failed to parse
    #[error("Corrupt dead letter record at line {line}: {message}")]
    DlqCorruption {
        line: usize,
        message: String,
        code: String,
    },

    /// Broker or backend connectivity errors
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        endpoint: Option<String>,
        code: String,
    },

    /// Backend reachable but refusing service
    #[error("Backend unavailable: {message}")]
    BackendUnavailable {
        message: String,
        code: String,
    },

    /// Encode/decode errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        format: String,
        code: String,
    },

    /// File system errors (DLQ file, file transport)
    #[error("File system error: {message}")]
    FileSystem {
        message: String,
        path: Option<String>,
        operation: String,
        code: String,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        key: Option<String>,
        code: String,
    },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout {
        operation: String,
        timeout_ms: u64,
        code: String,
    },

    /// Internal framework errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        code: String,
    },
}

fn format_failures(failures: &[TransportFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl SmartMessageError {
    /// Get the error code
    pub fn code(&self) -> &str {
        match self {
            Self::Validation { code, .. } => code,
            Self::HeaderInvalid { code, .. } => code,
            Self::TransportNotConfigured { code, .. } => code,
            Self::SerializerNotConfigured { code, .. } => code,
            Self::PublishFailed { code, .. } => code,
            Self::Subscribe { code, .. } => code,
            Self::Handler { code, .. } => code,
            Self::CircuitOpen { code, .. } => code,
            Self::DlqCorruption { code, .. } => code,
            Self::Connection { code, .. } => code,
            Self::BackendUnavailable { code, .. } => code,
            Self::Serialization { code, .. } => code,
            Self::FileSystem { code, .. } => code,
            Self::Configuration { code, .. } => code,
            Self::Timeout { code, .. } => code,
            Self::Internal { code, .. } => code,
        }
    }

    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::BackendUnavailable { .. } | Self::Timeout { .. }
        )
    }

    /// Check if the error propagates to the publishing caller.
    ///
    /// Subscriber-side failures (handler errors, decode errors, circuit
    /// rejections) are absorbed by the dispatcher and never reach the
    /// original publisher.
    pub fn is_publisher_facing(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::HeaderInvalid { .. }
                | Self::TransportNotConfigured { .. }
                | Self::SerializerNotConfigured { .. }
                | Self::PublishFailed { .. }
                | Self::Configuration { .. }
        )
    }
}

/// Result type alias for SmartMessage operations
pub type Result<T> = std::result::Result<T, SmartMessageError>;

/// Convenience macros for creating errors
#[macro_export]
macro_rules! validation_error {
    ($message:expr) => {
        $crate::SmartMessageError::Validation {
            message: $message.to_string(),
            property: None,
            code: "VALIDATION_ERROR".to_string(),
        }
    };
    ($message:expr, $property:expr) => {
        $crate::SmartMessageError::Validation {
            message: $message.to_string(),
            property: Some($property.to_string()),
            code: "VALIDATION_ERROR".to_string(),
        }
    };
}

#[macro_export]
macro_rules! internal_error {
    ($message:expr) => {
        $crate::SmartMessageError::Internal {
            message: $message.to_string(),
            code: "INTERNAL_ERROR".to_string(),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_failed_mentions_every_transport() {
        let err = SmartMessageError::PublishFailed {
            message_class: "Order".to_string(),
            failures: vec![
                TransportFailure {
                    transport: "memory".to_string(),
                    error: "buffer full".to_string(),
                },
                TransportFailure {
                    transport: "broker".to_string(),
                    error: "connection refused".to_string(),
                },
            ],
            code: "PUBLISH_FAILED".to_string(),
        };

        let rendered = err.to_string();
        assert!(rendered.contains("memory: buffer full"));
        assert!(rendered.contains("broker: connection refused"));
    }

    #[test]
    fn retryable_classification() {
        let conn = SmartMessageError::Connection {
            message: "refused".to_string(),
            endpoint: None,
            code: "CONNECTION_ERROR".to_string(),
        };
        assert!(conn.is_retryable());

        let validation = validation_error!("bad property", "amount");
        assert!(!validation.is_retryable());
        assert!(validation.is_publisher_facing());
    }

    #[test]
    fn handler_errors_stay_subscriber_side() {
        let err = SmartMessageError::Handler {
            handler_id: "Order.process".to_string(),
            message: "boom".to_string(),
            code: "HANDLER_ERROR".to_string(),
        };
        assert!(!err.is_publisher_facing());
    }
}
