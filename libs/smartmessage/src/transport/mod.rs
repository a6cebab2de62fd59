//! Transport abstraction
//!
//! Every transport implements the same publish/subscribe contract; the
//! dispatcher stays transport-agnostic and transports stay handler-
//! agnostic. Concrete implementations: in-memory loopback, pub/sub broker
//! channels, pattern-routed broker queues, and file/FIFO/stdout sinks.

pub mod file;
pub mod memory;
pub mod pubsub;
pub mod queue;
pub mod routing;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use smartmessage_errors::{Result, SmartMessageError};

use crate::dispatcher::Dispatcher;
use crate::message::Message;
use crate::serializer::{Envelope, Serializer};
use crate::subscription::{MessageHandler, SubscriptionFilter};

pub use file::{
    FifoMode, FileFormat, FilePartitioner, FileTransport, FileTransportConfig, FileWriteMode,
    OverflowPolicy, SinkTarget, TailConfig,
};
pub use memory::{InMemoryTransport, MemoryOverflowPolicy, MemoryTransportConfig};
pub use pubsub::PubSubTransport;
pub use queue::{QueueSubscriptionBuilder, QueueTransport, ALERT_TYPES};
pub use routing::{pattern_matches, routing_key, sanitize_segment};

/// Per-transport delivery counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TransportStats {
    pub published: u64,
    pub received: u64,
    pub failed: u64,
}

/// Shared atomic counters behind [`TransportStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    published: AtomicU64,
    received: AtomicU64,
    failed: AtomicU64,
}

impl StatsCounters {
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            published: self.published.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Uniform publish/subscribe contract implemented by every transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable transport name used in logs, stats, and dead letters.
    fn name(&self) -> &str;

    /// The serializer this transport encodes with, unless the message
    /// class overrides it.
    fn serializer(&self) -> Arc<dyn Serializer>;

    /// The dispatcher inbound envelopes are forwarded to.
    fn dispatcher(&self) -> &Arc<Dispatcher>;

    /// Encode and deliver a message.
    async fn publish(&self, message: &Message) -> Result<()>;

    /// Register interest in a message class; idempotent per
    /// (class, handler id).
    async fn subscribe(
        &self,
        message_class: &str,
        handler: Arc<dyn MessageHandler>,
        filter: SubscriptionFilter,
    ) -> Result<()>;

    /// Remove one handler, or all handlers for the class when
    /// `handler_id` is `None`.
    async fn unsubscribe(&self, message_class: &str, handler_id: Option<&str>) -> Result<()>;

    async fn connect(&self) -> Result<()>;

    /// Release receive loops and file handles; must be idempotent.
    async fn disconnect(&self) -> Result<()>;

    async fn connected(&self) -> bool;

    fn stats(&self) -> TransportStats;

    /// Inbound hook: forward a decoded envelope to the dispatcher.
    async fn receive(&self, envelope: Envelope) -> Result<()> {
        self.dispatcher().route_via(self.name(), envelope).await
    }
}

/// Resolve the serializer for a publish: the class override wins over the
/// transport default.
pub fn effective_serializer(
    transport: &dyn Transport,
    message: &Message,
) -> Arc<dyn Serializer> {
    message
        .schema()
        .serializer_override()
        .unwrap_or_else(|| transport.serializer())
}

/// Constructor signature stored in the registry.
pub type TransportFactory =
    Arc<dyn Fn(Value) -> Result<Arc<dyn Transport>> + Send + Sync>;

static FACTORIES: OnceLock<RwLock<HashMap<String, TransportFactory>>> = OnceLock::new();

fn factories() -> &'static RwLock<HashMap<String, TransportFactory>> {
    FACTORIES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Process-wide name to constructor map for transport plugins.
pub struct TransportRegistry;

impl TransportRegistry {
    /// Register a constructor under a name. Idempotent: the first
    /// registration for a name wins.
    pub fn register(name: &str, factory: TransportFactory) {
        factories()
            .write()
            .expect("transport registry poisoned")
            .entry(name.to_string())
            .or_insert(factory);
    }

    /// Instantiate a registered transport with options.
    pub fn create(name: &str, options: Value) -> Result<Arc<dyn Transport>> {
        let factory = factories()
            .read()
            .expect("transport registry poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| SmartMessageError::Configuration {
                message: format!("unknown transport '{}'", name),
                key: Some("transport".to_string()),
                code: "CONFIG_ERROR".to_string(),
            })?;
        factory(options)
    }

    pub fn names() -> Vec<String> {
        factories()
            .read()
            .expect("transport registry poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use serde_json::json;

    #[test]
    fn registry_is_idempotent_and_creates() {
        let factory: TransportFactory = Arc::new(|_options| {
            let dispatcher = Dispatcher::with_defaults();
            let transport: Arc<dyn Transport> =
                InMemoryTransport::new(dispatcher, MemoryTransportConfig::default());
            Ok(transport)
        });

        TransportRegistry::register("registry-test", factory.clone());
        TransportRegistry::register("registry-test", factory);

        let transport = TransportRegistry::create("registry-test", json!({})).unwrap();
        assert_eq!(transport.name(), "memory");

        assert!(TransportRegistry::create("missing", json!({})).is_err());
        assert!(TransportRegistry::names().contains(&"registry-test".to_string()));
    }
}
