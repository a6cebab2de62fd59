//! Pattern-routed queue broker transport
//!
//! Publishes compute a routing key from the envelope header and push the
//! encoded envelope onto every backend queue whose bound pattern matches.
//! Consumers in the same consumer group share a queue: across processes
//! the pop competition picks one transport, and within a transport each
//! popped envelope is handed to exactly one group member in round-robin
//! order, so every envelope reaches one consumer per group and fans out
//! across groups. The fluent builder composes subscription patterns with
//! `*` in any unspecified position.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use smartmessage_config::{CircuitSettings, FallbackPolicy, TransportSettings};
use smartmessage_errors::{Result, SmartMessageError};

use crate::backend::Backend;
use crate::circuit::CircuitBreaker;
use crate::dispatcher::{Dispatcher, ANY_CLASS};
use crate::dlq::DeadLetterQueue;
use crate::message::Message;
use crate::serializer::{Envelope, JsonSerializer, MsgPackSerializer, Serializer};
use crate::subscription::{MessageHandler, Subscription, SubscriptionFilter};
use crate::transport::routing::{
    pattern_matches, routing_key_for, sanitize_segment, BROADCAST_SEGMENT,
};
use crate::transport::{effective_serializer, StatsCounters, Transport, TransportStats};

/// Message types treated as alerts by the subscription shortcut.
pub const ALERT_TYPES: &[&str] = &["alert", "alarm", "warning", "emergency"];

/// How long a consumer blocks on an empty queue before re-polling.
const CONSUME_WAIT: Duration = Duration::from_millis(500);

/// Group members registered on one backend queue.
struct QueueGroup {
    pattern: String,
    members: Vec<Subscription>,
    next: usize,
}

/// Pattern-routed broker queue transport.
pub struct QueueTransport {
    self_ref: Weak<Self>,
    backend: Arc<dyn Backend>,
    dispatcher: Arc<Dispatcher>,
    serializer: Arc<dyn Serializer>,
    settings: TransportSettings,
    dlq: Option<Arc<DeadLetterQueue>>,
    queue_groups: Mutex<HashMap<String, QueueGroup>>,
    consumers: Mutex<HashMap<String, JoinHandle<()>>>,
    publish_breaker: CircuitBreaker,
    subscribe_breaker: CircuitBreaker,
    connected: AtomicBool,
    stats: StatsCounters,
}

impl QueueTransport {
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
            queue_groups: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            publish_breaker: CircuitBreaker::new("transport-publish", circuit.clone()),
            subscribe_breaker: CircuitBreaker::new("transport-subscribe", circuit),
            connected: AtomicBool::new(true),
            stats: StatsCounters::default(),
        })
    }

    /// Start composing a pattern subscription.
    pub fn where_(&self) -> QueueSubscriptionBuilder<'_> {
        QueueSubscriptionBuilder::new(self)
    }

    /// Routing key this transport would publish a header under.
    pub fn routing_key_for_message(&self, message: &Message) -> String {
        routing_key_for(&self.settings.exchange, message.header())
    }

    /// Register a raw pattern subscription.
    ///
    /// `class_key` labels the membership for unsubscription: the concrete
    /// class when the pattern pins its type segment, the any-class key
    /// otherwise. `group` overrides the configured consumer group; members
    /// of the same group share a queue and each popped envelope is handed
    /// to exactly one of them.
    pub async fn subscribe_pattern(
        &self,
        pattern: &str,
        class_key: &str,
        handler: Arc<dyn MessageHandler>,
        filter: SubscriptionFilter,
        group: Option<&str>,
    ) -> Result<()> {
        if !self.subscribe_breaker.allow() {
            return Err(SmartMessageError::CircuitOpen {
                circuit: "transport-subscribe".to_string(),
                code: "CIRCUIT_OPEN".to_string(),
            });
        }

        let result: Result<()> = async {
            let group = group.unwrap_or(&self.settings.consumer_group);
            let queue = self.queue_name(group, pattern);

            let subscription = Subscription::new(class_key, handler, filter);
            {
                let mut groups = self.queue_groups.lock().await;
                let group = groups.entry(queue.clone()).or_insert_with(|| QueueGroup {
                    pattern: pattern.to_string(),
                    members: Vec::new(),
                    next: 0,
                });
                match group
                    .members
                    .iter_mut()
                    .find(|m| m.handler_id() == subscription.handler_id())
                {
                    Some(existing) => *existing = subscription,
                    None => group.members.push(subscription),
                }
            }

            self.backend.bind_pattern(pattern, &queue).await?;

            if self.settings.auto_subscribe && self.connected.load(Ordering::SeqCst) {
                self.ensure_consumer(&queue).await;
            }
            debug!(pattern, queue = %queue, "pattern subscription bound");
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

    fn queue_name(&self, group: &str, pattern: &str) -> String {
        let safe_pattern: Vec<String> = pattern
            .split('.')
            .map(|segment| match segment {
                "*" => "star".to_string(),
                "#" => "hash".to_string(),
                other => sanitize_segment(other),
            })
            .collect();

        format!(
            "{}.{}.{}",
            sanitize_segment(&self.settings.queue_prefix),
            sanitize_segment(group),
            safe_pattern.join(".")
        )
    }

    async fn ensure_consumer(&self, queue: &str) {
        let mut consumers = self.consumers.lock().await;
        if consumers.contains_key(queue) {
            return;
        }

        let transport = self.self_ref.upgrade().expect("transport dropped");
        let queue_name = queue.to_string();
        let handle = tokio::spawn(async move { transport.consume(queue_name).await });
        consumers.insert(queue.to_string(), handle);
    }

    /// Pick the next group member for a queue in round-robin order.
    async fn next_member(&self, queue: &str) -> Option<Subscription> {
        let mut groups = self.queue_groups.lock().await;
        let group = groups.get_mut(queue)?;
        if group.members.is_empty() {
            return None;
        }
        let index = group.next % group.members.len();
        group.next = group.next.wrapping_add(1);
        Some(group.members[index].clone())
    }

    /// Consumer loop: pop, decode, deliver to one group member.
    async fn consume(self: Arc<Self>, queue: String) {
        let mut failures = 0u32;

        loop {
            if !self.connected.load(Ordering::SeqCst) {
                break;
            }

            match self.backend.list_pop(&queue, CONSUME_WAIT).await {
                Ok(Some(bytes)) => {
                    failures = 0;
                    match self.decode_envelope(&bytes) {
                        Ok(envelope) => {
                            self.stats.record_received();
                            // Exactly-once per group: the envelope goes to
                            // a single member, never the whole table.
                            match self.next_member(&queue).await {
                                Some(subscription) => {
                                    if let Err(e) = self
                                        .dispatcher
                                        .route_to(self.name(), envelope, subscription)
                                        .await
                                    {
                                        warn!(queue = %queue, error = %e, "dispatch failed");
                                    }
                                }
                                None => {
                                    warn!(queue = %queue, "no group member registered, dropping envelope");
                                }
                            }
                        }
                        Err(e) => {
                            self.stats.record_failed();
                            warn!(queue = %queue, error = %e, "failed to decode queued envelope");
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    if !self.connected.load(Ordering::SeqCst) {
                        break;
                    }
                    failures += 1;
                    if failures > self.settings.reconnect_attempts {
                        error!(queue = %queue, "consumer giving up after reconnect attempts");
                        break;
                    }
                    warn!(queue = %queue, error = %e, attempt = failures, "consumer pop failed");
                    tokio::time::sleep(Duration::from_millis(self.settings.reconnect_delay_ms))
                        .await;
                }
            }
        }
    }

    /// Queue envelopes normally arrive in the transport serializer's
    /// format; a class-level override falls back to the binary decoder.
    fn decode_envelope(&self, bytes: &[u8]) -> Result<Envelope> {
        match self.serializer.decode(bytes) {
            Ok(envelope) => Ok(envelope),
            Err(primary) => MsgPackSerializer.decode(bytes).map_err(|_| primary),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SmartMessageError::Connection {
                message: "queue transport is disconnected".to_string(),
                endpoint: None,
                code: "CONNECTION_ERROR".to_string(),
            })
        }
    }
}

#[async_trait]
impl Transport for QueueTransport {
    fn name(&self) -> &str {
        "queue"
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

        let result: Result<()> = async {
            let serializer = effective_serializer(self, message);
            let bytes = serializer.encode(message)?;
            let key = self.routing_key_for_message(message);

            // Each matching queue receives the envelope once, even when
            // several of its patterns match.
            let mut matched: HashSet<String> = HashSet::new();
            for (pattern, queue) in self.backend.pattern_bindings().await? {
                if pattern_matches(&pattern, &key) {
                    matched.insert(queue);
                }
            }

            if matched.is_empty() {
                debug!(key = %key, "no bound pattern matched, envelope unrouted");
            }

            for queue in matched {
                self.backend.list_push(&queue, bytes.clone()).await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.publish_breaker.record_success();
                self.stats.record_published();
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
        // Any sender, any recipient, this class.
        let pattern = format!(
            "{}.{}.#",
            sanitize_segment(&self.settings.exchange),
            sanitize_segment(message_class)
        );
        self.subscribe_pattern(&pattern, message_class, handler, filter, None)
            .await
    }

    async fn unsubscribe(&self, message_class: &str, handler_id: Option<&str>) -> Result<()> {
        // Remove matching members; a queue left with no members loses its
        // binding and its consumer.
        let mut emptied: Vec<(String, String)> = Vec::new();
        {
            let mut groups = self.queue_groups.lock().await;
            groups.retain(|queue, group| {
                group.members.retain(|member| {
                    !(member.message_class() == message_class
                        && handler_id.map_or(true, |id| member.handler_id() == id))
                });
                if group.members.is_empty() {
                    emptied.push((queue.clone(), group.pattern.clone()));
                    false
                } else {
                    true
                }
            });
        }

        for (queue, pattern) in emptied {
            self.backend.unbind_pattern(&pattern, &queue).await?;
            if let Some(handle) = self.consumers.lock().await.remove(&queue) {
                handle.abort();
            }
            debug!(queue = %queue, "queue consumer stopped");
        }
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        self.backend.connect().await?;
        self.connected.store(true, Ordering::SeqCst);

        // Resume consumers for every queue with registered members.
        let queues: Vec<String> = self
            .queue_groups
            .lock()
            .await
            .keys()
            .cloned()
            .collect();
        for queue in queues {
            self.ensure_consumer(&queue).await;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // Idempotent; stops every consumer loop.
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut consumers = self.consumers.lock().await;
        for (_, handle) in consumers.drain() {
            handle.abort();
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

/// Fluent pattern composer: `transport.where_().from("x").to("y")
/// .message_type("T").handler(h).subscribe().await`.
///
/// Unspecified positions become `*`.
pub struct QueueSubscriptionBuilder<'a> {
    transport: &'a QueueTransport,
    from: Option<String>,
    to: Option<String>,
    message_types: Vec<String>,
    broadcast: bool,
    group: Option<String>,
    handler: Option<Arc<dyn MessageHandler>>,
    filter: SubscriptionFilter,
}

impl<'a> QueueSubscriptionBuilder<'a> {
    fn new(transport: &'a QueueTransport) -> Self {
        Self {
            transport,
            from: None,
            to: None,
            message_types: Vec::new(),
            broadcast: false,
            group: None,
            handler: None,
            filter: SubscriptionFilter::new(),
        }
    }

    /// Only envelopes from this sender.
    pub fn from(mut self, sender: &str) -> Self {
        self.from = Some(sender.to_string());
        self
    }

    /// Only envelopes directed to this recipient.
    pub fn to(mut self, recipient: &str) -> Self {
        self.to = Some(recipient.to_string());
        self
    }

    /// Only envelopes of this message type.
    pub fn message_type(mut self, message_type: &str) -> Self {
        self.message_types.push(message_type.to_string());
        self
    }

    /// Shortcut: only broadcasts.
    pub fn broadcasts(mut self) -> Self {
        self.broadcast = true;
        self
    }

    /// Shortcut: the known alert message types.
    pub fn alerts(mut self) -> Self {
        self.message_types
            .extend(ALERT_TYPES.iter().map(|t| t.to_string()));
        self
    }

    /// Consumer group override for this subscription.
    pub fn consumer_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    /// Route-time filter applied on top of the pattern.
    pub fn filter(mut self, filter: SubscriptionFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Bind the composed pattern(s) and start consuming.
    pub async fn subscribe(self) -> Result<()> {
        let handler = self.handler.ok_or_else(|| SmartMessageError::Configuration {
            message: "subscription builder needs a handler".to_string(),
            key: None,
            code: "CONFIG_ERROR".to_string(),
        })?;

        let exchange = sanitize_segment(&self.transport.settings.exchange);
        let from = self
            .from
            .as_deref()
            .map(sanitize_segment)
            .unwrap_or_else(|| "*".to_string());
        let to = if self.broadcast {
            BROADCAST_SEGMENT.to_string()
        } else {
            self.to
                .as_deref()
                .map(sanitize_segment)
                .unwrap_or_else(|| "*".to_string())
        };

        let types: Vec<(String, String)> = if self.message_types.is_empty() {
            vec![("*".to_string(), ANY_CLASS.to_string())]
        } else {
            self.message_types
                .iter()
                .map(|t| (sanitize_segment(t), t.clone()))
                .collect()
        };

        for (type_segment, class_key) in types {
            let pattern = format!("{}.{}.{}.{}", exchange, type_segment, from, to);
            self.transport
                .subscribe_pattern(
                    &pattern,
                    &class_key,
                    handler.clone(),
                    self.filter.clone(),
                    self.group.as_deref(),
                )
                .await?;
        }
        Ok(())
    }
}
