//! Message header (envelope metadata)
//!
//! Every message carries a header: identity, addressing, versioning, and
//! publish bookkeeping. The header travels on the wire under the reserved
//! `_sm_header` key, separate from the declared payload properties.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use smartmessage_errors::{Result, SmartMessageError, ValidationFailure};

/// Reserved wire key holding the header map.
pub const WIRE_HEADER_KEY: &str = "_sm_header";

/// Message header attached to every message instance.
///
/// `uuid` and `message_class` are fixed at creation. Addressing fields may
/// be re-bound until the message is published; the emitted envelope is
/// immutable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageHeader {
    /// Globally-unique message identity, used for deduplication
    uuid: Uuid,

    /// Fully-qualified message class name, used for routing
    message_class: String,

    /// Declared schema version of the emitting class
    version: u32,

    /// Wall-clock publish timestamp; `None` until first publish
    published_at: Option<DateTime<Utc>>,

    /// Opaque identity of the emitting process instance
    publisher_pid: String,

    /// Sender entity; never empty
    from: String,

    /// Directed recipient; `None` means broadcast
    to: Option<String>,

    /// Response destination
    reply_to: Option<String>,
}

impl MessageHeader {
    /// Allocate a fresh header for a message class.
    pub fn new(
        message_class: &str,
        from: &str,
        to: Option<&str>,
        reply_to: Option<&str>,
        version: u32,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            message_class: message_class.to_string(),
            version,
            published_at: None,
            publisher_pid: std::process::id().to_string(),
            from: from.to_string(),
            to: to.map(str::to_string),
            reply_to: reply_to.map(str::to_string),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn message_class(&self) -> &str {
        &self.message_class
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.published_at
    }

    pub fn publisher_pid(&self) -> &str {
        &self.publisher_pid
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> Option<&str> {
        self.to.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// A broadcast has no directed recipient.
    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }

    /// Validate the envelope contract.
    pub fn validate(&self) -> Vec<ValidationFailure> {
        let mut failures = Vec::new();

        if self.uuid.is_nil() {
            failures.push(ValidationFailure::header("uuid", "uuid must not be nil"));
        }
        if self.message_class.trim().is_empty() {
            failures.push(ValidationFailure::header(
                "message_class",
                "message class must not be empty",
            ));
        }
        if self.version < 1 {
            failures.push(ValidationFailure::header("version", "version must be >= 1"));
        }
        if self.from.trim().is_empty() {
            failures.push(ValidationFailure::header("from", "from must not be empty"));
        }

        failures
    }

    /// Validate and raise on the first contract breach.
    pub fn validate_strict(&self) -> Result<()> {
        match self.validate().into_iter().next() {
            None => Ok(()),
            Some(failure) => Err(SmartMessageError::HeaderInvalid {
                message: failure.message,
                field: failure.property,
                code: "HEADER_INVALID".to_string(),
            }),
        }
    }

    /// Re-bind addressing fields, mutating only the supplied ones.
    ///
    /// Permitted only before publish; to clear `to` or `reply_to`, use the
    /// dedicated setters.
    pub fn rebind_addressing(
        &mut self,
        from: Option<&str>,
        to: Option<&str>,
        reply_to: Option<&str>,
    ) -> Result<()> {
        self.ensure_unpublished()?;
        if let Some(from) = from {
            self.from = from.to_string();
        }
        if let Some(to) = to {
            self.to = Some(to.to_string());
        }
        if let Some(reply_to) = reply_to {
            self.reply_to = Some(reply_to.to_string());
        }
        Ok(())
    }

    pub fn set_from(&mut self, from: &str) -> Result<()> {
        self.ensure_unpublished()?;
        self.from = from.to_string();
        Ok(())
    }

    pub fn set_to(&mut self, to: Option<&str>) -> Result<()> {
        self.ensure_unpublished()?;
        self.to = to.map(str::to_string);
        Ok(())
    }

    pub fn set_reply_to(&mut self, reply_to: Option<&str>) -> Result<()> {
        self.ensure_unpublished()?;
        self.reply_to = reply_to.map(str::to_string);
        Ok(())
    }

    /// Stamp the publish timestamp; later calls keep the original stamp so
    /// replayed envelopes retain their history.
    pub(crate) fn mark_published(&mut self) {
        if self.published_at.is_none() {
            self.published_at = Some(Utc::now());
        }
    }

    fn ensure_unpublished(&self) -> Result<()> {
        if self.is_published() {
            return Err(SmartMessageError::HeaderInvalid {
                message: "addressing cannot change after publish".to_string(),
                field: None,
                code: "HEADER_IMMUTABLE".to_string(),
            });
        }
        Ok(())
    }
}
