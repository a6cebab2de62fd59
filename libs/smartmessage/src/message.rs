//! Message instances
//!
//! A message is a property map plus a header, bound to its class schema.
//! Publishing validates the instance, then fans out to every configured
//! transport in declaration order; the publish succeeds when any transport
//! accepts and fails only when all of them refuse.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, error};

use smartmessage_errors::{
    into_validation_error, Result, SmartMessageError, TransportFailure, ValidationFailure,
};

use crate::header::MessageHeader;
use crate::schema::MessageSchema;
use crate::serializer::{from_wire_value, to_wire_value, Envelope};
use crate::transport::Transport;

/// A typed, self-describing message instance.
#[derive(Clone)]
pub struct Message {
    header: MessageHeader,
    schema: Arc<MessageSchema>,
    properties: Map<String, Value>,
    transport_override: Option<Vec<Arc<dyn Transport>>>,
}

impl Message {
    /// Build an instance from supplied properties.
    ///
    /// Defaults are assigned for omitted properties, validators run against
    /// everything supplied, and unknown keys are silently dropped. The
    /// header is derived from the class-level addressing defaults and may
    /// be re-bound until publish.
    pub fn new(schema: Arc<MessageSchema>, props: Map<String, Value>) -> Result<Self> {
        let mut properties = Map::new();

        for spec in schema.properties() {
            if let Some(default) = spec.default() {
                properties.insert(spec.name().to_string(), default.resolve());
            }
        }

        for (name, value) in props {
            match schema.property(&name) {
                Some(spec) => {
                    spec.check(&value).map_err(|message| {
                        SmartMessageError::Validation {
                            message,
                            property: Some(name.clone()),
                            code: "PROPERTY_INVALID".to_string(),
                        }
                    })?;
                    properties.insert(name, value);
                }
                None => {
                    debug!(
                        class = schema.class_name(),
                        property = %name,
                        "dropping unknown property"
                    );
                }
            }
        }

        let header = MessageHeader::new(
            schema.class_name(),
            schema.default_from().unwrap_or(""),
            schema.default_to(),
            schema.default_reply_to(),
            schema.version(),
        );

        Ok(Self {
            header,
            schema,
            properties,
            transport_override: None,
        })
    }

    /// Convenience constructor taking a JSON object literal.
    pub fn from_json(schema: Arc<MessageSchema>, props: Value) -> Result<Self> {
        match props {
            Value::Object(map) => Self::new(schema, map),
            other => Err(SmartMessageError::Validation {
                message: format!("expected a property object, got {}", other),
                property: None,
                code: "VALIDATION_ERROR".to_string(),
            }),
        }
    }

    /// Rebuild an instance from a decoded envelope, preserving every
    /// header field. Used by the receive path and dead-letter replay.
    pub fn from_envelope(schema: Arc<MessageSchema>, envelope: Envelope) -> Self {
        Self {
            header: envelope.header,
            schema,
            properties: envelope.properties,
            transport_override: None,
        }
    }

    /// Rebuild an instance from a flat wire object.
    pub fn from_wire(schema: Arc<MessageSchema>, wire: Value) -> Result<Self> {
        Ok(Self::from_envelope(schema, from_wire_value(wire)?))
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn schema(&self) -> &Arc<MessageSchema> {
        &self.schema
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Set a declared property, running its validator.
    pub fn set(&mut self, name: &str, value: Value) -> Result<()> {
        let spec = self.schema.property(name).ok_or_else(|| {
            SmartMessageError::Validation {
                message: format!("unknown property '{}'", name),
                property: Some(name.to_string()),
                code: "PROPERTY_UNKNOWN".to_string(),
            }
        })?;

        spec.check(&value).map_err(|message| SmartMessageError::Validation {
            message,
            property: Some(name.to_string()),
            code: "PROPERTY_INVALID".to_string(),
        })?;

        self.properties.insert(name.to_string(), value);
        Ok(())
    }

    /// Re-bind the sender before publish.
    pub fn set_from(&mut self, from: &str) -> Result<()> {
        self.header.set_from(from)
    }

    /// Re-bind the recipient before publish; `None` makes it a broadcast.
    pub fn set_to(&mut self, to: Option<&str>) -> Result<()> {
        self.header.set_to(to)
    }

    pub fn set_reply_to(&mut self, reply_to: Option<&str>) -> Result<()> {
        self.header.set_reply_to(reply_to)
    }

    /// Replace the class-level transport list for this instance only.
    pub fn with_transports(mut self, transports: Vec<Arc<dyn Transport>>) -> Self {
        self.transport_override = Some(transports);
        self
    }

    /// Transports this instance will publish through.
    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        match &self.transport_override {
            Some(transports) => transports,
            None => self.schema.transports(),
        }
    }

    pub fn single_transport(&self) -> bool {
        self.transports().len() == 1
    }

    pub fn multiple_transports(&self) -> bool {
        self.transports().len() > 1
    }

    /// Run the full validation pipeline: required properties, property
    /// validators, header contract, then the class/header version match.
    pub fn validate(&self) -> Vec<ValidationFailure> {
        let mut failures = Vec::new();

        for spec in self.schema.properties() {
            if spec.is_required() && !self.properties.contains_key(spec.name()) {
                failures.push(ValidationFailure::missing(spec.name()));
                if self.schema.report_first_missing_only() {
                    break;
                }
            }
        }

        for spec in self.schema.properties() {
            if let Some(value) = self.properties.get(spec.name()) {
                if let Err(message) = spec.check(value) {
                    failures.push(ValidationFailure::invalid(spec.name(), message));
                }
            }
        }

        failures.extend(self.header.validate());

        if self.header.version() != self.schema.version() {
            failures.push(ValidationFailure::version_mismatch(
                self.schema.version(),
                self.header.version(),
            ));
        }

        failures
    }

    /// Validate and raise a single aggregated error on failure.
    pub fn validate_strict(&self) -> Result<()> {
        let failures = self.validate();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(into_validation_error(failures))
        }
    }

    /// The flat serialized form: `_sm_header` plus top-level properties.
    pub fn to_wire(&self) -> Result<Value> {
        to_wire_value(&self.header, &self.properties)
    }

    /// Snapshot of this instance as a wire envelope.
    pub fn to_envelope(&self) -> Envelope {
        Envelope::new(self.header.clone(), self.properties.clone())
    }

    /// Validate and fan the message out to every configured transport.
    ///
    /// Returns the number of transports that accepted. Individual failures
    /// are logged; the call errs only when every transport failed.
    pub async fn publish(&mut self) -> Result<usize> {
        self.validate_strict()?;

        if self.transports().is_empty() {
            return Err(SmartMessageError::TransportNotConfigured {
                message_class: self.header.message_class().to_string(),
                code: "TRANSPORT_NOT_CONFIGURED".to_string(),
            });
        }

        self.header.mark_published();

        let transports: Vec<Arc<dyn Transport>> = self.transports().to_vec();
        let mut accepted = 0usize;
        let mut failures = Vec::new();

        for transport in transports {
            match transport.publish(self).await {
                Ok(()) => accepted += 1,
                Err(e) => {
                    error!(
                        class = self.header.message_class(),
                        transport = transport.name(),
                        error = %e,
                        "transport rejected publish"
                    );
                    failures.push(TransportFailure {
                        transport: transport.name().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if accepted > 0 {
            Ok(accepted)
        } else {
            Err(SmartMessageError::PublishFailed {
                message_class: self.header.message_class().to_string(),
                failures,
                code: "PUBLISH_FAILED".to_string(),
            })
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("class", &self.header.message_class())
            .field("uuid", &self.header.uuid())
            .field("properties", &self.properties)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PropertySpec;
    use serde_json::json;

    fn order_schema() -> Arc<MessageSchema> {
        MessageSchema::builder("Order")
            .with_version(2)
            .with_from("orders")
            .with_to("fulfil")
            .with_property(PropertySpec::new("id").required())
            .with_property(
                PropertySpec::new("qty")
                    .with_default(json!(1))
                    .with_validator(|v| {
                        if v.as_i64().map(|n| n > 0).unwrap_or(false) {
                            Ok(())
                        } else {
                            Err("qty must be positive".to_string())
                        }
                    }),
            )
            .build()
            .unwrap()
    }

    fn props(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn defaults_and_addressing_applied() {
        let msg = Message::new(order_schema(), props(json!({"id": "O-1"}))).unwrap();
        assert_eq!(msg.get("qty"), Some(&json!(1)));
        assert_eq!(msg.header().from(), "orders");
        assert_eq!(msg.header().to(), Some("fulfil"));
        assert_eq!(msg.header().version(), 2);
        assert!(msg.validate().is_empty());
    }

    #[test]
    fn unknown_properties_are_dropped() {
        let msg = Message::new(
            order_schema(),
            props(json!({"id": "O-1", "surprise": true})),
        )
        .unwrap();
        assert!(msg.get("surprise").is_none());
    }

    #[test]
    fn constructor_rejects_invalid_values() {
        let result = Message::new(order_schema(), props(json!({"id": "O-1", "qty": 0})));
        assert!(result.is_err());
    }

    #[test]
    fn missing_required_property_reported() {
        let msg = Message::new(order_schema(), Map::new()).unwrap();
        let failures = msg.validate();
        assert!(failures
            .iter()
            .any(|f| f.property.as_deref() == Some("id") && f.code == "PROPERTY_MISSING"));
    }

    #[test]
    fn first_missing_only_flag_limits_reporting() {
        let all = MessageSchema::builder("Pair")
            .with_from("svc")
            .with_property(PropertySpec::new("a").required())
            .with_property(PropertySpec::new("b").required())
            .build()
            .unwrap();
        let first_only = MessageSchema::builder("Pair")
            .with_from("svc")
            .with_property(PropertySpec::new("a").required())
            .with_property(PropertySpec::new("b").required())
            .report_first_missing_only(true)
            .build()
            .unwrap();

        let missing = |schema: Arc<MessageSchema>| {
            Message::new(schema, Map::new())
                .unwrap()
                .validate()
                .into_iter()
                .filter(|f| f.code == "PROPERTY_MISSING")
                .count()
        };

        assert_eq!(missing(all), 2);
        assert_eq!(missing(first_only), 1);
    }

    #[test]
    fn set_enforces_schema() {
        let mut msg = Message::new(order_schema(), props(json!({"id": "O-1"}))).unwrap();
        assert!(msg.set("qty", json!(5)).is_ok());
        assert!(msg.set("qty", json!(-2)).is_err());
        assert!(msg.set("nope", json!(1)).is_err());
    }

    #[test]
    fn wire_round_trip_preserves_header_and_properties() {
        let msg = Message::new(order_schema(), props(json!({"id": "O-1"}))).unwrap();
        let wire = msg.to_wire().unwrap();
        let rebuilt = Message::from_wire(order_schema(), wire).unwrap();
        assert_eq!(rebuilt.header(), msg.header());
        assert_eq!(rebuilt.get("id"), Some(&json!("O-1")));
    }

    #[tokio::test]
    async fn publish_without_transports_is_an_error() {
        let mut msg = Message::new(order_schema(), props(json!({"id": "O-1"}))).unwrap();
        match msg.publish().await {
            Err(SmartMessageError::TransportNotConfigured { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
