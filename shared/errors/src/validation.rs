//! Structured validation failures for message and header validation

use serde::{Deserialize, Serialize};

use crate::types::SmartMessageError;

/// A single validation failure with field-specific information.
///
/// `Message::validate` collects these instead of stopping at the first
/// violation; the full list is folded into a single
/// [`SmartMessageError::Validation`] at the raise boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationFailure {
    /// The offending property or header field, when attributable
    pub property: Option<String>,

    /// Human-readable description of the violation
    pub message: String,

    /// Stable failure code
    pub code: String,
}

impl ValidationFailure {
    /// A required property was not supplied.
    pub fn missing(property: &str) -> Self {
        Self {
            property: Some(property.to_string()),
            message: format!("Required property '{}' is missing", property),
            code: "PROPERTY_MISSING".to_string(),
        }
    }

    /// A supplied property value failed its validator.
    pub fn invalid(property: &str, message: impl Into<String>) -> Self {
        Self {
            property: Some(property.to_string()),
            message: message.into(),
            code: "PROPERTY_INVALID".to_string(),
        }
    }

    /// A header field violated the envelope contract.
    pub fn header(field: &str, message: impl Into<String>) -> Self {
        Self {
            property: Some(field.to_string()),
            message: message.into(),
            code: "HEADER_INVALID".to_string(),
        }
    }

    /// The envelope version does not match the declared class version.
    pub fn version_mismatch(expected: u32, actual: u32) -> Self {
        Self {
            property: Some("version".to_string()),
            message: format!(
                "Message version {} does not match declared class version {}",
                actual, expected
            ),
            code: "VERSION_MISMATCH".to_string(),
        }
    }
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.property {
            Some(property) => write!(f, "{}: {}", property, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Fold a list of failures into a single error for the raise boundary.
pub fn into_validation_error(failures: Vec<ValidationFailure>) -> SmartMessageError {
    let property = if failures.len() == 1 {
        failures[0].property.clone()
    } else {
        None
    };

    SmartMessageError::Validation {
        message: failures
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(", "),
        property,
        code: "VALIDATION_ERROR".to_string(),
    }
}
