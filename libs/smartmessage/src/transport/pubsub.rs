//! Pub/sub broker transport
//!
//! One backend channel per message class. Publishes post the full
//! serialized envelope; a single listener task per class owns the backend
//! subscription, decodes inbound envelopes (extracting the header from
//! the wire payload, never synthesizing it), and forwards them to the
//! dispatcher. Publish and subscribe are guarded by independent circuit
//! breakers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use smartmessage_config::{CircuitSettings, FallbackPolicy, TransportSettings};
use smartmessage_errors::{Result, SmartMessageError};

use crate::backend::Backend;
use crate::circuit::{CircuitBreaker, CircuitStats};
use crate::dispatcher::Dispatcher;
use crate::dlq::DeadLetterQueue;
use crate::message::Message;
use crate::registry::SchemaRegistry;
use crate::serializer::{JsonSerializer, Serializer};
use crate::subscription::{MessageHandler, Subscription, SubscriptionFilter};
use crate::transport::{effective_serializer, StatsCounters, Transport, TransportStats};

/// Channel-per-class broker transport.
pub struct PubSubTransport {
    self_ref: Weak<Self>,
    backend: Arc<dyn Backend>,
    dispatcher: Arc<Dispatcher>,
    serializer: Arc<dyn Serializer>,
    settings: TransportSettings,
    dlq: Option<Arc<DeadLetterQueue>>,
    subscribed_classes: Mutex<HashSet<String>>,
    listeners: Mutex<HashMap<String, JoinHandle<()>>>,
    publish_breaker: CircuitBreaker,
    subscribe_breaker: CircuitBreaker,
    connected: AtomicBool,
    stats: StatsCounters,
}

impl PubSubTransport {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        backend: Arc<dyn Backend>,
        settings: TransportSettings,
    ) -> Arc<Self> {
        Self::with_options(dispatcher, backend, settings, CircuitSettings::default(), None)
    }

    pub fn with_options(
        dispatcher: Arc<Dispatcher>,
        backend: Arc<dyn Backend>,
        settings: TransportSettings,
        circuit: CircuitSettings,
        dlq: Option<Arc<DeadLetterQueue>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            backend,
            dispatcher,
            serializer: Arc::new(JsonSerializer),
            settings,
            dlq,
            subscribed_classes: Mutex::new(HashSet::new()),
            listeners: Mutex::new(HashMap::new()),
            publish_breaker: CircuitBreaker::new("transport-publish", circuit.clone()),
            subscribe_breaker: CircuitBreaker::new("transport-subscribe", circuit),
            connected: AtomicBool::new(true),
            stats: StatsCounters::default(),
        })
    }

    pub fn publish_circuit_stats(&self) -> CircuitStats {
        self.publish_breaker.stats()
    }

    pub fn subscribe_circuit_stats(&self) -> CircuitStats {
        self.subscribe_breaker.stats()
    }

    fn strong(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("transport dropped")
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SmartMessageError::Connection {
                message: "pub/sub transport is disconnected".to_string(),
                endpoint: None,
                code: "CONNECTION_ERROR".to_string(),
            })
        }
    }

    /// Spawn the listener task for a class if none is running.
    async fn ensure_listener(&self, message_class: &str) -> Result<()> {
        let mut listeners = self.listeners.lock().await;
        if listeners.contains_key(message_class) {
            return Ok(());
        }

        let rx = self.backend.subscribe(message_class).await?;
        let transport = self.strong();
        let class = message_class.to_string();
        let handle = tokio::spawn(async move { transport.listen(class, rx).await });
        listeners.insert(message_class.to_string(), handle);
        debug!(class = message_class, "pub/sub listener started");
        Ok(())
    }

    /// Listener loop: decode and forward inbound envelopes, resubscribing
    /// with bounded backoff when the backend stream closes.
    async fn listen(self: Arc<Self>, class: String, mut rx: mpsc::Receiver<Vec<u8>>) {
        let mut attempts = 0u32;

        loop {
            while let Some(bytes) = rx.recv().await {
                // The class may override the transport serializer.
                let serializer = SchemaRegistry::lookup(&class)
                    .and_then(|s| s.serializer_override())
                    .unwrap_or_else(|| self.serializer.clone());

                match serializer.decode(&bytes) {
                    Ok(envelope) => {
                        self.stats.record_received();
                        if let Err(e) = self.receive(envelope).await {
                            warn!(class = %class, error = %e, "dispatch failed");
                        }
                    }
                    Err(e) => {
                        self.stats.record_failed();
                        warn!(class = %class, error = %e, "failed to decode inbound envelope");
                    }
                }
            }

            if !self.connected.load(Ordering::SeqCst) {
                break;
            }

            attempts += 1;
            if attempts > self.settings.reconnect_attempts {
                error!(class = %class, "pub/sub listener giving up after reconnect attempts");
                break;
            }

            warn!(class = %class, attempt = attempts, "pub/sub stream closed, resubscribing");
            tokio::time::sleep(Duration::from_millis(self.settings.reconnect_delay_ms)).await;

            match self.backend.subscribe(&class).await {
                Ok(new_rx) => {
                    rx = new_rx;
                    attempts = 0;
                    info!(class = %class, "pub/sub listener resubscribed");
                }
                Err(e) => {
                    warn!(class = %class, error = %e, "resubscribe failed");
                }
            }
        }
    }
}

#[async_trait]
impl Transport for PubSubTransport {
    fn name(&self) -> &str {
        "pubsub"
    }

    fn serializer(&self) -> Arc<dyn Serializer> {
        self.serializer.clone()
    }

    fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    async fn publish(&self, message: &Message) -> Result<()> {
        self.ensure_connected()?;

        if !self.publish_breaker.allow() {
            if self.publish_breaker.fallback() == FallbackPolicy::Dlq {
                if let Some(dlq) = &self.dlq {
                    let _ = dlq.enqueue_envelope(
                        &message.to_envelope(),
                        "json",
                        "transport-publish circuit is open",
                        self.name(),
                        0,
                    );
                }
            }
            return Err(SmartMessageError::CircuitOpen {
                circuit: "transport-publish".to_string(),
                code: "CIRCUIT_OPEN".to_string(),
            });
        }

        let serializer = effective_serializer(self, message);
        let bytes = serializer.encode(message)?;
        let channel = message.header().message_class();

        match self.backend.publish(channel, bytes).await {
            Ok(receivers) => {
                self.publish_breaker.record_success();
                self.stats.record_published();
                debug!(channel, receivers, "published envelope");
                Ok(())
            }
            Err(e) => {
                self.publish_breaker.record_failure();
                self.stats.record_failed();
                Err(e)
            }
        }
    }

    async fn subscribe(
        &self,
        message_class: &str,
        handler: Arc<dyn MessageHandler>,
        filter: SubscriptionFilter,
    ) -> Result<()> {
        if !self.subscribe_breaker.allow() {
            return Err(SmartMessageError::CircuitOpen {
                circuit: "transport-subscribe".to_string(),
                code: "CIRCUIT_OPEN".to_string(),
            });
        }

        let result: Result<()> = async {
            self.dispatcher
                .subscribe(Subscription::new(message_class, handler, filter))
                .await?;
            self.subscribed_classes
                .lock()
                .await
                .insert(message_class.to_string());

            if self.settings.auto_subscribe && self.connected.load(Ordering::SeqCst) {
                self.ensure_listener(message_class).await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.subscribe_breaker.record_success();
                Ok(())
            }
            Err(e) => {
                self.subscribe_breaker.record_failure();
                Err(SmartMessageError::Subscribe {
                    transport: self.name().to_string(),
                    message: e.to_string(),
                    code: "SUBSCRIBE_ERROR".to_string(),
                })
            }
        }
    }

    async fn unsubscribe(&self, message_class: &str, handler_id: Option<&str>) -> Result<()> {
        self.dispatcher.unsubscribe(message_class, handler_id).await?;

        if self.dispatcher.subscriber_count(message_class).await == 0 {
            self.subscribed_classes.lock().await.remove(message_class);
            if let Some(handle) = self.listeners.lock().await.remove(message_class) {
                handle.abort();
            }
            self.backend.unsubscribe(message_class).await?;
            debug!(class = message_class, "pub/sub listener stopped");
        }
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        self.backend.connect().await?;
        self.connected.store(true, Ordering::SeqCst);

        // Spawn loops for classes subscribed while disconnected or with
        // auto_subscribe disabled.
        let classes: Vec<String> = self
            .subscribed_classes
            .lock()
            .await
            .iter()
            .cloned()
            .collect();
        for class in classes {
            self.ensure_listener(&class).await?;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // Idempotent; stops every listener and releases the backend
        // subscriptions.
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut listeners = self.listeners.lock().await;
        for (class, handle) in listeners.drain() {
            handle.abort();
            let _ = self.backend.unsubscribe(&class).await;
        }
        Ok(())
    }

    async fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.backend.connected().await
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::schema::{MessageSchema, PropertySpec};
    use crate::subscription::FnHandler;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn handler(counter: Arc<AtomicUsize>) -> Arc<FnHandler> {
        Arc::new(FnHandler::new(move |_msg| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
    }

    #[tokio::test]
    async fn publish_reaches_subscriber_through_backend() {
        let dispatcher = Dispatcher::with_defaults();
        let backend = InMemoryBackend::new();
        let transport =
            PubSubTransport::new(dispatcher.clone(), backend, TransportSettings::default());

        let schema = MessageSchema::builder("pubsub.test.Tick")
            .with_from("clock")
            .with_property(PropertySpec::new("n"))
            .with_transport(transport.clone())
            .register()
            .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        transport
            .subscribe("pubsub.test.Tick", handler(counter.clone()), SubscriptionFilter::new())
            .await
            .unwrap();

        Message::from_json(schema, json!({ "n": 1 }))
            .unwrap()
            .publish()
            .await
            .unwrap();

        // Delivery crosses the listener task; poll briefly.
        for _ in 0..50 {
            if counter.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        dispatcher.quiesce().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(transport.stats().published, 1);
        SchemaRegistry::unregister("pubsub.test.Tick");
    }

    #[tokio::test]
    async fn unsubscribe_last_handler_stops_listener() {
        let dispatcher = Dispatcher::with_defaults();
        let backend = InMemoryBackend::new();
        let transport =
            PubSubTransport::new(dispatcher, backend, TransportSettings::default());

        let counter = Arc::new(AtomicUsize::new(0));
        let subscriber = handler(counter);
        let handler_id = subscriber.id().to_string();

        transport
            .subscribe("pubsub.test.Stop", subscriber, SubscriptionFilter::new())
            .await
            .unwrap();
        assert_eq!(transport.listeners.lock().await.len(), 1);

        transport
            .unsubscribe("pubsub.test.Stop", Some(&handler_id))
            .await
            .unwrap();
        assert!(transport.listeners.lock().await.is_empty());
    }

    #[tokio::test]
    async fn open_publish_circuit_rejects() {
        let dispatcher = Dispatcher::with_defaults();
        let backend = InMemoryBackend::new();
        let circuit = CircuitSettings {
            threshold: 1,
            ..CircuitSettings::default()
        };
        let transport = PubSubTransport::with_options(
            dispatcher,
            backend.clone(),
            TransportSettings::default(),
            circuit,
            None,
        );

        // Force a failure by disconnecting the backend out from under the
        // transport.
        backend.disconnect().await.unwrap();

        let schema = MessageSchema::builder("pubsub.test.Broken")
            .with_from("svc")
            .with_transport(transport.clone())
            .build()
            .unwrap();

        let mut message = Message::from_json(schema.clone(), json!({})).unwrap();
        assert!(message.publish().await.is_err());

        backend.connect().await.unwrap();
        let mut second = Message::from_json(schema, json!({})).unwrap();
        match second.publish().await {
            Err(SmartMessageError::PublishFailed { failures, .. }) => {
                assert!(failures[0].error.contains("transport-publish"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
