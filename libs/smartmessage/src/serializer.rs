//! Serializer contract and wire envelope
//!
//! The wire form is a single structured object: the reserved `_sm_header`
//! key holds the header map, and the declared properties sit alongside it
//! at the top level. Serializers are owned by transports; a message class
//! may override the serializer for its own publishes.

use serde_json::{Map, Value};

use smartmessage_errors::{Result, SmartMessageError};

use crate::header::{MessageHeader, WIRE_HEADER_KEY};
use crate::message::Message;

/// Decoded wire form: header plus raw property map.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub header: MessageHeader,
    pub properties: Map<String, Value>,
}

impl Envelope {
    pub fn new(header: MessageHeader, properties: Map<String, Value>) -> Self {
        Self { header, properties }
    }
}

/// Encode/decode contract between messages and transport backends.
pub trait Serializer: Send + Sync {
    /// Stable serializer name, recorded in dead-letter entries.
    fn name(&self) -> &str;

    fn encode(&self, message: &Message) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<Envelope>;
}

/// Build the flat wire object from header and properties.
pub fn to_wire_value(header: &MessageHeader, properties: &Map<String, Value>) -> Result<Value> {
    let header_value =
        serde_json::to_value(header).map_err(|e| SmartMessageError::Serialization {
            message: e.to_string(),
            format: "json".to_string(),
            code: "SERIALIZATION_ERROR".to_string(),
        })?;

    let mut wire = properties.clone();
    wire.insert(WIRE_HEADER_KEY.to_string(), header_value);
    Ok(Value::Object(wire))
}

/// Split a wire object back into header and properties.
///
/// The header is extracted from the payload, never synthesized; a missing
/// or malformed `_sm_header` is a decode error.
pub fn from_wire_value(value: Value) -> Result<Envelope> {
    let mut wire = match value {
        Value::Object(map) => map,
        other => {
            return Err(decode_error(format!(
                "expected wire object, got {}",
                kind_of(&other)
            )))
        }
    };

    let header_value = wire
        .remove(WIRE_HEADER_KEY)
        .ok_or_else(|| decode_error(format!("missing {} key", WIRE_HEADER_KEY)))?;

    let header: MessageHeader =
        serde_json::from_value(header_value).map_err(|e| decode_error(e.to_string()))?;

    Ok(Envelope::new(header, wire))
}

fn decode_error(message: String) -> SmartMessageError {
    SmartMessageError::Serialization {
        message,
        format: "json".to_string(),
        code: "SERIALIZATION_ERROR".to_string(),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Structured-text serializer; the framework default.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &str {
        "json"
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        let wire = to_wire_value(message.header(), message.properties())?;
        serde_json::to_vec(&wire).map_err(|e| SmartMessageError::Serialization {
            message: e.to_string(),
            format: "json".to_string(),
            code: "SERIALIZATION_ERROR".to_string(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| decode_error(e.to_string()))?;
        from_wire_value(value)
    }
}

/// Compact binary serializer (MessagePack).
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackSerializer;

impl Serializer for MsgPackSerializer {
    fn name(&self) -> &str {
        "msgpack"
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        let wire = to_wire_value(message.header(), message.properties())?;
        rmp_serde::to_vec_named(&wire).map_err(|e| SmartMessageError::Serialization {
            message: e.to_string(),
            format: "msgpack".to_string(),
            code: "SERIALIZATION_ERROR".to_string(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        let value: Value =
            rmp_serde::from_slice(bytes).map_err(|e| SmartMessageError::Serialization {
                message: e.to_string(),
                format: "msgpack".to_string(),
                code: "SERIALIZATION_ERROR".to_string(),
            })?;
        from_wire_value(value)
    }
}

/// Human-readable pretty printer; publish-only.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrettySerializer;

impl Serializer for PrettySerializer {
    fn name(&self) -> &str {
        "pretty"
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        let wire = to_wire_value(message.header(), message.properties())?;
        let mut bytes =
            serde_json::to_vec_pretty(&wire).map_err(|e| SmartMessageError::Serialization {
                message: e.to_string(),
                format: "pretty".to_string(),
                code: "SERIALIZATION_ERROR".to_string(),
            })?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    fn decode(&self, _bytes: &[u8]) -> Result<Envelope> {
        Err(SmartMessageError::Serialization {
            message: "pretty serializer is publish-only".to_string(),
            format: "pretty".to_string(),
            code: "SERIALIZATION_ERROR".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_envelope() -> Envelope {
        let header = MessageHeader::new("Order", "orders", Some("fulfil"), None, 2);
        let mut properties = Map::new();
        properties.insert("id".to_string(), json!("O-1"));
        properties.insert("qty".to_string(), json!(3));
        Envelope::new(header, properties)
    }

    #[test]
    fn wire_value_nests_header_under_reserved_key() {
        let env = sample_envelope();
        let wire = to_wire_value(&env.header, &env.properties).unwrap();

        assert!(wire.get(WIRE_HEADER_KEY).is_some());
        assert_eq!(wire.get("id"), Some(&json!("O-1")));

        let decoded = from_wire_value(wire).unwrap();
        assert_eq!(decoded.header, env.header);
        assert_eq!(decoded.properties, env.properties);
    }

    #[test]
    fn missing_header_key_is_a_decode_error() {
        let result = from_wire_value(json!({"id": "O-1"}));
        assert!(result.is_err());
    }

    #[test]
    fn msgpack_round_trips_the_header() {
        let env = sample_envelope();
        let wire = to_wire_value(&env.header, &env.properties).unwrap();
        let bytes = rmp_serde::to_vec_named(&wire).unwrap();

        let decoded = MsgPackSerializer.decode(&bytes).unwrap();
        assert_eq!(decoded.header, env.header);
        assert_eq!(decoded.properties.get("qty"), Some(&json!(3)));
    }

    #[test]
    fn pretty_decode_is_rejected() {
        assert!(PrettySerializer.decode(b"{}").is_err());
    }
}
