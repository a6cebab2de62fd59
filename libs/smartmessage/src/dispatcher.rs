//! Thread-safe subscription routing
//!
//! The dispatcher owns the process-wide subscription table and a worker
//! pool. Each inbound envelope is matched against the subscriptions for
//! its class, gated per handler by filters and the deduplication queue,
//! then handed to a worker wrapped in the message-processor circuit
//! breaker. Handler failures never affect sibling handlers and never
//! propagate to the publisher; exhausted retries end in the dead-letter
//! queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use smartmessage_config::{CircuitSettings, DdqSettings, DdqStorage, FallbackPolicy};
use smartmessage_errors::Result;

use crate::backend::Backend;
use crate::circuit::{CircuitBreaker, CircuitStats};
use crate::ddq::{ddq_key, DedupStats, DedupStore, DistributedDedupStore, MemoryDedupStore};
use crate::dlq::DeadLetterQueue;
use crate::message::Message;
use crate::registry::SchemaRegistry;
use crate::schema::MessageSchema;
use crate::serializer::Envelope;
use crate::subscription::Subscription;

/// Subscription-table key matching any message class; used by pattern
/// subscribers that leave the type segment unspecified.
pub const ANY_CLASS: &str = "*";

/// Worker pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// Spawn a task per invocation; no ordering guarantee (default)
    Cached,
    /// At most `n` concurrent handler invocations
    Bounded(usize),
    /// One worker; preserves FIFO per (message_class, handler_id)
    Single,
}

impl Default for PoolMode {
    fn default() -> Self {
        Self::Cached
    }
}

/// Dispatcher construction options.
#[derive(Clone, Default)]
pub struct DispatcherConfig {
    pub pool: PoolMode,

    /// Message-processor circuit settings, applied per handler
    pub circuit: CircuitSettings,

    /// Deduplication defaults for classes without a registered schema
    pub ddq: DdqSettings,

    /// Failure destination; without it exhausted envelopes are dropped
    pub dlq: Option<Arc<DeadLetterQueue>>,

    /// Backend for distributed deduplication storage
    pub backend: Option<Arc<dyn Backend>>,
}

/// Point-in-time routing statistics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DispatcherStats {
    pub routed: u64,
    pub processed: u64,
    pub duplicates_skipped: u64,
    pub filtered: u64,
    pub version_rejected: u64,
    pub rejected_by_circuit: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

#[derive(Default)]
struct Counters {
    routed: AtomicU64,
    processed: AtomicU64,
    duplicates_skipped: AtomicU64,
    filtered: AtomicU64,
    version_rejected: AtomicU64,
    rejected_by_circuit: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Concurrent routing engine mapping envelopes onto subscriber handlers.
pub struct Dispatcher {
    config: DispatcherConfig,
    self_ref: Weak<Dispatcher>,
    subscriptions: RwLock<HashMap<String, Vec<Subscription>>>,
    ddqs: RwLock<HashMap<String, Arc<dyn DedupStore>>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    limiter: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
    ingress_closed: CancellationToken,
    hard_cancel: CancellationToken,
    counters: Counters,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Arc<Self> {
        let limiter = match config.pool {
            PoolMode::Cached => None,
            PoolMode::Bounded(n) => Some(Arc::new(Semaphore::new(n.max(1)))),
            PoolMode::Single => Some(Arc::new(Semaphore::new(1))),
        };

        Arc::new_cyclic(|self_ref| Self {
            config,
            self_ref: self_ref.clone(),
            subscriptions: RwLock::new(HashMap::new()),
            ddqs: RwLock::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            limiter,
            tracker: TaskTracker::new(),
            ingress_closed: CancellationToken::new(),
            hard_cancel: CancellationToken::new(),
            counters: Counters::default(),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(DispatcherConfig::default())
    }

    /// Register a subscription; idempotent per (class, handler_id), where
    /// a re-registration replaces the stored filter.
    pub async fn subscribe(&self, subscription: Subscription) -> Result<()> {
        let mut table = self.subscriptions.write().await;
        let records = table
            .entry(subscription.message_class().to_string())
            .or_default();

        match records
            .iter_mut()
            .find(|r| r.handler_id() == subscription.handler_id())
        {
            Some(existing) => *existing = subscription,
            None => records.push(subscription),
        }
        Ok(())
    }

    /// Remove one handler, or every handler for the class when
    /// `handler_id` is `None`.
    pub async fn unsubscribe(&self, message_class: &str, handler_id: Option<&str>) -> Result<()> {
        let mut table = self.subscriptions.write().await;
        match handler_id {
            Some(handler_id) => {
                if let Some(records) = table.get_mut(message_class) {
                    records.retain(|r| r.handler_id() != handler_id);
                    if records.is_empty() {
                        table.remove(message_class);
                    }
                }
            }
            None => {
                table.remove(message_class);
            }
        }
        Ok(())
    }

    pub async fn subscriber_count(&self, message_class: &str) -> usize {
        self.subscriptions
            .read()
            .await
            .get(message_class)
            .map_or(0, Vec::len)
    }

    /// Route an envelope that originated in this process.
    pub async fn route(&self, envelope: Envelope) -> Result<()> {
        self.route_via("local", envelope).await
    }

    /// Route an envelope received through the named transport.
    pub async fn route_via(&self, transport: &str, envelope: Envelope) -> Result<()> {
        if self.ingress_closed.is_cancelled() {
            debug!("dispatcher shut down, dropping envelope");
            return Ok(());
        }

        self.counters.routed.fetch_add(1, Ordering::Relaxed);

        let Some((schema, message)) = self.prepare(&envelope) else {
            return Ok(());
        };

        let class = envelope.header.message_class().to_string();
        let subscriptions = {
            let table = self.subscriptions.read().await;
            let mut matched: Vec<Subscription> =
                table.get(&class).cloned().unwrap_or_default();
            if class != ANY_CLASS {
                matched.extend(table.get(ANY_CLASS).cloned().unwrap_or_default());
            }
            matched
        };

        if subscriptions.is_empty() {
            debug!(class = %class, "no subscribers");
            return Ok(());
        }

        for subscription in subscriptions {
            self.dispatch_one(transport, &envelope, &message, &schema, subscription)
                .await;
        }

        Ok(())
    }

    /// Route an envelope to a single subscription, bypassing the table.
    ///
    /// Used by consumer-group transports, where each popped envelope
    /// belongs to exactly one group member; the version gate, filter,
    /// deduplication, and circuit machinery still apply.
    pub async fn route_to(
        &self,
        transport: &str,
        envelope: Envelope,
        subscription: Subscription,
    ) -> Result<()> {
        if self.ingress_closed.is_cancelled() {
            debug!("dispatcher shut down, dropping envelope");
            return Ok(());
        }

        self.counters.routed.fetch_add(1, Ordering::Relaxed);

        let Some((schema, message)) = self.prepare(&envelope) else {
            return Ok(());
        };

        self.dispatch_one(transport, &envelope, &message, &schema, subscription)
            .await;
        Ok(())
    }

    /// Version-gate an envelope and build the typed message handlers see.
    fn prepare(&self, envelope: &Envelope) -> Option<(Arc<MessageSchema>, Message)> {
        let schema = SchemaRegistry::lookup(envelope.header.message_class());

        // Version gate: a registered class only accepts envelopes carrying
        // its declared version.
        if let Some(schema) = &schema {
            if schema.version() != envelope.header.version() {
                warn!(
                    class = envelope.header.message_class(),
                    envelope_version = envelope.header.version(),
                    declared_version = schema.version(),
                    "rejecting envelope with mismatched version"
                );
                self.counters.version_rejected.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        let schema = schema.unwrap_or_else(|| ad_hoc_schema(envelope));
        let message = Message::from_envelope(schema.clone(), envelope.clone());
        Some((schema, message))
    }

    /// Filter and submit one handler invocation to the worker pool.
    async fn dispatch_one(
        &self,
        transport: &str,
        envelope: &Envelope,
        message: &Message,
        schema: &Arc<MessageSchema>,
        subscription: Subscription,
    ) {
        if !subscription.filter().accepts(&envelope.header) {
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let permit = match &self.limiter {
            Some(limiter) => Some(
                limiter
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("worker pool semaphore closed"),
            ),
            None => None,
        };

        let dispatcher = self
            .self_ref
            .upgrade()
            .expect("dispatcher dropped while routing");
        let message = message.clone();
        let envelope = envelope.clone();
        let schema = schema.clone();
        let transport = transport.to_string();
        let hard_cancel = self.hard_cancel.clone();

        let handler_id = subscription.handler_id().to_string();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = hard_cancel.cancelled() => {
                    debug!(handler = handler_id, "invocation cancelled");
                }
                _ = dispatcher.process_one(
                    subscription,
                    message,
                    envelope,
                    schema,
                    transport,
                    permit,
                ) => {}
            }
        });
    }

    /// Wait until every in-flight handler has finished. Test helper.
    pub async fn quiesce(&self) {
        while !self.tracker.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Stop accepting work, wait up to `timeout` for in-flight handlers,
    /// then cancel whatever remains. Idempotent.
    pub async fn shutdown(&self, timeout: Duration) {
        self.ingress_closed.cancel();
        self.tracker.close();

        if tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("dispatcher shutdown timed out, cancelling in-flight handlers");
            self.hard_cancel.cancel();
            let _ = tokio::time::timeout(Duration::from_secs(1), self.tracker.wait()).await;
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            routed: self.counters.routed.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            duplicates_skipped: self.counters.duplicates_skipped.load(Ordering::Relaxed),
            filtered: self.counters.filtered.load(Ordering::Relaxed),
            version_rejected: self.counters.version_rejected.load(Ordering::Relaxed),
            rejected_by_circuit: self.counters.rejected_by_circuit.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
        }
    }

    /// Occupancy of one handler's deduplication queue.
    pub async fn ddq_stats(&self, message_class: &str, handler_id: &str) -> Option<DedupStats> {
        let key = ddq_key(message_class, handler_id);
        let store = self.ddqs.read().await.get(&key).cloned()?;
        store.stats().await.ok()
    }

    /// Drop one handler's deduplication history.
    pub async fn clear_ddq(&self, message_class: &str, handler_id: &str) -> Result<()> {
        let key = ddq_key(message_class, handler_id);
        if let Some(store) = self.ddqs.read().await.get(&key).cloned() {
            store.clear().await?;
        }
        Ok(())
    }

    /// Stats for one handler's message-processor circuit.
    pub fn circuit_stats(&self, message_class: &str, handler_id: &str) -> Option<CircuitStats> {
        let key = ddq_key(message_class, handler_id);
        self.breakers
            .lock()
            .expect("breaker map poisoned")
            .get(&key)
            .map(|b| b.stats())
    }

    async fn process_one(
        self: Arc<Self>,
        subscription: Subscription,
        message: Message,
        envelope: Envelope,
        schema: Arc<MessageSchema>,
        transport: String,
        _permit: Option<OwnedSemaphorePermit>,
    ) {
        let class = envelope.header.message_class().to_string();
        let handler_id = subscription.handler_id().to_string();
        let uuid = envelope.header.uuid().to_string();

        let ddq_settings = schema.ddq().clone();
        let dedup = if ddq_settings.enabled {
            Some(self.ddq_for(&class, &handler_id, &ddq_settings).await)
        } else {
            None
        };

        // Duplicate gate: checked by the worker so a single-worker pool
        // observes deliveries in strict order.
        if let Some(store) = &dedup {
            match store.contains(&uuid).await {
                Ok(true) => {
                    debug!(class = %class, handler = %handler_id, %uuid, "skipping duplicate");
                    self.counters.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "dedup lookup failed, processing anyway"),
            }
        }

        let breaker = self.breaker_for(&class, &handler_id);

        if !breaker.allow() {
            self.counters.rejected_by_circuit.fetch_add(1, Ordering::Relaxed);
            self.run_open_fallback(&breaker, &envelope, &transport).await;
            return;
        }

        let max_attempts = breaker.settings().retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            match subscription.handler().handle(&message).await {
                Ok(()) => {
                    breaker.record_success();
                    if let Some(store) = &dedup {
                        if let Err(e) = store.add(&uuid).await {
                            warn!(error = %e, "failed to record processed uuid");
                        }
                    }
                    self.counters.processed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    breaker.record_failure();
                    last_error = e.to_string();
                    warn!(
                        class = %class,
                        handler = %handler_id,
                        attempt = attempt + 1,
                        error = %last_error,
                        "handler failed"
                    );

                    if attempt + 1 < max_attempts && breaker.allow() {
                        tokio::time::sleep(breaker.retry_delay(attempt)).await;
                    } else {
                        break;
                    }
                }
            }
        }

        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.dead_letter(&envelope, &transport, &last_error, max_attempts)
            .await;
    }

    async fn run_open_fallback(
        &self,
        breaker: &CircuitBreaker,
        envelope: &Envelope,
        transport: &str,
    ) {
        match breaker.fallback() {
            FallbackPolicy::Dlq => {
                self.dead_letter(
                    envelope,
                    transport,
                    &format!("circuit {} is open", breaker.name()),
                    0,
                )
                .await;
            }
            FallbackPolicy::Degrade => {
                debug!(circuit = breaker.name(), "circuit open, degrading");
            }
            FallbackPolicy::Retry => {
                tokio::time::sleep(breaker.retry_delay(0)).await;
                if breaker.allow() {
                    debug!(circuit = breaker.name(), "circuit re-admitted after backoff");
                } else {
                    self.dead_letter(
                        envelope,
                        transport,
                        &format!("circuit {} is open", breaker.name()),
                        0,
                    )
                    .await;
                }
            }
        }
    }

    async fn dead_letter(
        &self,
        envelope: &Envelope,
        transport: &str,
        error: &str,
        attempts: u32,
    ) {
        let Some(dlq) = &self.config.dlq else {
            debug!("no dead letter queue configured, dropping envelope");
            return;
        };

        match dlq.enqueue_envelope(envelope, "json", error, transport, attempts) {
            Ok(()) => {
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(error = %e, "failed to enqueue dead letter"),
        }
    }

    async fn ddq_for(
        &self,
        message_class: &str,
        handler_id: &str,
        settings: &DdqSettings,
    ) -> Arc<dyn DedupStore> {
        let key = ddq_key(message_class, handler_id);

        if let Some(store) = self.ddqs.read().await.get(&key) {
            return store.clone();
        }

        let mut stores = self.ddqs.write().await;
        stores
            .entry(key.clone())
            .or_insert_with(|| match (settings.storage, &self.config.backend) {
                (DdqStorage::Distributed, Some(backend)) => Arc::new(DistributedDedupStore::new(
                    settings.size,
                    backend.clone(),
                    &format!("smartmessage:ddq:{}", key),
                )),
                (DdqStorage::Distributed, None) => {
                    warn!(key = %key, "no backend for distributed dedup, using memory");
                    Arc::new(MemoryDedupStore::new(settings.size))
                }
                (DdqStorage::Memory, _) => Arc::new(MemoryDedupStore::new(settings.size)),
            })
            .clone()
    }

    fn breaker_for(&self, message_class: &str, handler_id: &str) -> Arc<CircuitBreaker> {
        let key = ddq_key(message_class, handler_id);
        self.breakers
            .lock()
            .expect("breaker map poisoned")
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    &format!("processor:{}", key),
                    self.config.circuit.clone(),
                ))
            })
            .clone()
    }
}

/// Minimal descriptor for envelopes whose class was never registered,
/// letting wildcard subscribers observe them.
fn ad_hoc_schema(envelope: &Envelope) -> Arc<MessageSchema> {
    MessageSchema::builder(envelope.header.message_class())
        .with_version(envelope.header.version())
        .build()
        .expect("ad hoc schema construction cannot fail")
}
