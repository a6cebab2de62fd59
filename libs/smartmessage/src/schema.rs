//! Message class descriptors
//!
//! A message class is declared as a schema: typed property specs, a
//! version, addressing defaults, transports, an optional serializer
//! override, and deduplication configuration. Instances are property maps
//! validated against the schema (see `message.rs`).

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use smartmessage_config::DdqSettings;
use smartmessage_errors::{Result, SmartMessageError};

use crate::serializer::Serializer;
use crate::transport::Transport;

/// Validator applied to a supplied property value.
///
/// Returns a human-readable violation message on failure.
pub type PropertyValidator =
    Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;

/// Default value for an omitted property.
#[derive(Clone)]
pub enum PropertyDefault {
    /// A fixed value
    Static(Value),
    /// A thunk evaluated per instance
    Generated(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl PropertyDefault {
    pub fn resolve(&self) -> Value {
        match self {
            Self::Static(value) => value.clone(),
            Self::Generated(thunk) => thunk(),
        }
    }
}

impl fmt::Debug for PropertyDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(value) => write!(f, "Static({})", value),
            Self::Generated(_) => write!(f, "Generated(..)"),
        }
    }
}

/// A declared property of a message class.
#[derive(Clone)]
pub struct PropertySpec {
    name: String,
    required: bool,
    default: Option<PropertyDefault>,
    validator: Option<PropertyValidator>,
    description: Option<String>,
}

impl PropertySpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            required: false,
            default: None,
            validator: None,
            description: None,
        }
    }

    /// Mark the property as required at validation time.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Set a fixed default value.
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(PropertyDefault::Static(value));
        self
    }

    /// Set a per-instance default thunk.
    pub fn with_default_fn<F>(mut self, thunk: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.default = Some(PropertyDefault::Generated(Arc::new(thunk)));
        self
    }

    /// Attach a validator returning a violation message on failure.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Attach a human description.
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn default(&self) -> Option<&PropertyDefault> {
        self.default.as_ref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Run the validator against a supplied value.
    pub fn check(&self, value: &Value) -> std::result::Result<(), String> {
        match &self.validator {
            Some(validator) => validator(value),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for PropertySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertySpec")
            .field("name", &self.name)
            .field("required", &self.required)
            .field("default", &self.default)
            .field("has_validator", &self.validator.is_some())
            .field("description", &self.description)
            .finish()
    }
}

/// Immutable descriptor of a message class.
///
/// Built once through [`SchemaBuilder`], shared as `Arc<MessageSchema>` by
/// every instance of the class.
pub struct MessageSchema {
    class_name: String,
    description: String,
    version: u32,
    properties: Vec<PropertySpec>,
    from: Option<String>,
    to: Option<String>,
    reply_to: Option<String>,
    transports: Vec<Arc<dyn Transport>>,
    serializer: Option<Arc<dyn Serializer>>,
    ddq: DdqSettings,
    report_first_missing_only: bool,
}

impl MessageSchema {
    /// Start declaring a message class.
    pub fn builder(class_name: &str) -> SchemaBuilder {
        SchemaBuilder::new(class_name)
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn properties(&self) -> &[PropertySpec] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&PropertySpec> {
        self.properties.iter().find(|p| p.name() == name)
    }

    pub fn default_from(&self) -> Option<&str> {
        self.from.as_deref()
    }

    pub fn default_to(&self) -> Option<&str> {
        self.to.as_deref()
    }

    pub fn default_reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }

    pub fn serializer_override(&self) -> Option<Arc<dyn Serializer>> {
        self.serializer.clone()
    }

    pub fn ddq(&self) -> &DdqSettings {
        &self.ddq
    }

    pub fn report_first_missing_only(&self) -> bool {
        self.report_first_missing_only
    }
}

impl fmt::Debug for MessageSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSchema")
            .field("class_name", &self.class_name)
            .field("version", &self.version)
            .field("properties", &self.properties)
            .field("transports", &self.transports.len())
            .finish()
    }
}

/// Fluent builder for [`MessageSchema`].
pub struct SchemaBuilder {
    class_name: String,
    description: Option<String>,
    version: u32,
    properties: Vec<PropertySpec>,
    from: Option<String>,
    to: Option<String>,
    reply_to: Option<String>,
    transports: Vec<Arc<dyn Transport>>,
    serializer: Option<Arc<dyn Serializer>>,
    ddq: DdqSettings,
    report_first_missing_only: bool,
}

impl SchemaBuilder {
    fn new(class_name: &str) -> Self {
        Self {
            class_name: class_name.to_string(),
            description: None,
            version: 1,
            properties: Vec::new(),
            from: None,
            to: None,
            reply_to: None,
            transports: Vec::new(),
            serializer: None,
            ddq: DdqSettings::default(),
            report_first_missing_only: false,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Declare a property.
    pub fn with_property(mut self, spec: PropertySpec) -> Self {
        self.properties.push(spec);
        self
    }

    /// Class-level sender default.
    pub fn with_from(mut self, from: &str) -> Self {
        self.from = Some(from.to_string());
        self
    }

    /// Class-level recipient default; omit for broadcast.
    pub fn with_to(mut self, to: &str) -> Self {
        self.to = Some(to.to_string());
        self
    }

    pub fn with_reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_string());
        self
    }

    /// Append a transport; declaration order is publish order.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Override the transport serializer for this class.
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn with_ddq(mut self, ddq: DdqSettings) -> Self {
        self.ddq = ddq;
        self
    }

    /// Restore the legacy behavior of reporting only the first missing
    /// required property.
    pub fn report_first_missing_only(mut self, enabled: bool) -> Self {
        self.report_first_missing_only = enabled;
        self
    }

    /// Finalize the descriptor.
    pub fn build(self) -> Result<Arc<MessageSchema>> {
        if self.class_name.trim().is_empty() {
            return Err(SmartMessageError::Validation {
                message: "message class name must not be empty".to_string(),
                property: Some("class_name".to_string()),
                code: "VALIDATION_ERROR".to_string(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for spec in &self.properties {
            if !seen.insert(spec.name().to_string()) {
                return Err(SmartMessageError::Validation {
                    message: format!("duplicate property '{}'", spec.name()),
                    property: Some(spec.name().to_string()),
                    code: "VALIDATION_ERROR".to_string(),
                });
            }
        }

        let description = self
            .description
            .unwrap_or_else(|| format!("{} is a SmartMessage", self.class_name));

        Ok(Arc::new(MessageSchema {
            class_name: self.class_name,
            description,
            version: self.version,
            properties: self.properties,
            from: self.from,
            to: self.to,
            reply_to: self.reply_to,
            transports: self.transports,
            serializer: self.serializer,
            ddq: self.ddq,
            report_first_missing_only: self.report_first_missing_only,
        }))
    }

    /// Finalize and register in the process-wide class registry.
    pub fn register(self) -> Result<Arc<MessageSchema>> {
        let schema = self.build()?;
        crate::registry::SchemaRegistry::register(schema.clone());
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn description_defaults_to_class_name() {
        let schema = MessageSchema::builder("Announcement").build().unwrap();
        assert_eq!(schema.description(), "Announcement is a SmartMessage");
        assert_eq!(schema.version(), 1);
    }

    #[test]
    fn duplicate_properties_rejected() {
        let result = MessageSchema::builder("X")
            .with_property(PropertySpec::new("id"))
            .with_property(PropertySpec::new("id"))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn generated_defaults_resolve_per_call() {
        let spec = PropertySpec::new("stamp").with_default_fn(|| json!("generated"));
        assert_eq!(spec.default().unwrap().resolve(), json!("generated"));
    }

    #[test]
    fn validator_reports_violation_message() {
        let spec = PropertySpec::new("amount").with_validator(|v| {
            if v.as_f64().map(|n| n > 0.0).unwrap_or(false) {
                Ok(())
            } else {
                Err("amount must be positive".to_string())
            }
        });

        assert!(spec.check(&json!(10.0)).is_ok());
        assert_eq!(
            spec.check(&json!(-1)).unwrap_err(),
            "amount must be positive"
        );
    }
}
