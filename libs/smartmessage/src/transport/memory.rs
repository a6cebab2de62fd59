//! In-memory loopback transport
//!
//! Same-process delivery through the local dispatcher. With
//! `auto_process` enabled a publish dispatches synchronously; otherwise
//! envelopes accumulate in a bounded buffer until `process_all` drains
//! them. Every publish still runs the encode/decode round trip so the
//! wire contract is exercised even in-process.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::warn;

use smartmessage_errors::{Result, SmartMessageError};

use crate::dispatcher::Dispatcher;
use crate::message::Message;
use crate::serializer::{Envelope, JsonSerializer, Serializer};
use crate::subscription::{MessageHandler, Subscription, SubscriptionFilter};
use crate::transport::{effective_serializer, StatsCounters, Transport, TransportStats};

/// What to do when the buffer is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryOverflowPolicy {
    /// Evict the oldest buffered envelope (default)
    #[default]
    DropOldest,
    /// Block the publisher until the buffer drains
    Block,
}

/// In-memory transport options.
#[derive(Debug, Clone)]
pub struct MemoryTransportConfig {
    /// Dispatch synchronously on publish
    pub auto_process: bool,

    /// Buffer cap; `None` is unbounded
    pub capacity: Option<usize>,

    /// Behavior at the cap
    pub overflow: MemoryOverflowPolicy,
}

impl Default for MemoryTransportConfig {
    fn default() -> Self {
        Self {
            auto_process: true,
            capacity: None,
            overflow: MemoryOverflowPolicy::default(),
        }
    }
}

/// Same-process loopback transport.
pub struct InMemoryTransport {
    config: MemoryTransportConfig,
    dispatcher: Arc<Dispatcher>,
    serializer: Arc<dyn Serializer>,
    buffer: Mutex<VecDeque<Envelope>>,
    drained: Notify,
    connected: AtomicBool,
    stats: StatsCounters,
}

impl InMemoryTransport {
    pub fn new(dispatcher: Arc<Dispatcher>, config: MemoryTransportConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            dispatcher,
            serializer: Arc::new(JsonSerializer),
            buffer: Mutex::new(VecDeque::new()),
            drained: Notify::new(),
            connected: AtomicBool::new(true),
            stats: StatsCounters::default(),
        })
    }

    pub fn with_defaults(dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        Self::new(dispatcher, MemoryTransportConfig::default())
    }

    /// Drain the buffer through the dispatcher.
    pub async fn process_all(&self) -> Result<usize> {
        let pending: Vec<Envelope> = {
            let mut buffer = self.buffer.lock().await;
            buffer.drain(..).collect()
        };
        self.drained.notify_waiters();

        let count = pending.len();
        for envelope in pending {
            self.stats.record_received();
            self.receive(envelope).await?;
        }
        Ok(count)
    }

    /// Snapshot of buffered envelopes, oldest first. Test helper.
    pub async fn buffered(&self) -> Vec<Envelope> {
        self.buffer.lock().await.iter().cloned().collect()
    }

    pub async fn buffered_len(&self) -> usize {
        self.buffer.lock().await.len()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SmartMessageError::Connection {
                message: "in-memory transport is disconnected".to_string(),
                endpoint: None,
                code: "CONNECTION_ERROR".to_string(),
            })
        }
    }

    async fn buffer_envelope(&self, envelope: Envelope) -> Result<()> {
        loop {
            {
                let mut buffer = self.buffer.lock().await;
                match self.config.capacity {
                    Some(cap) if buffer.len() >= cap => match self.config.overflow {
                        MemoryOverflowPolicy::DropOldest => {
                            warn!("in-memory buffer full, dropping oldest envelope");
                            buffer.pop_front();
                            buffer.push_back(envelope);
                            return Ok(());
                        }
                        MemoryOverflowPolicy::Block => {}
                    },
                    _ => {
                        buffer.push_back(envelope);
                        return Ok(());
                    }
                }
            }
            // Full with Block policy: wait for a drain and retry.
            self.drained.notified().await;
            self.ensure_connected()?;
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    fn serializer(&self) -> Arc<dyn Serializer> {
        self.serializer.clone()
    }

    fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    async fn publish(&self, message: &Message) -> Result<()> {
        self.ensure_connected()?;

        // Full wire round trip, same as any remote transport.
        let serializer = effective_serializer(self, message);
        let bytes = serializer.encode(message).inspect_err(|_| {
            self.stats.record_failed();
        })?;
        let envelope = serializer.decode(&bytes).inspect_err(|_| {
            self.stats.record_failed();
        })?;

        self.stats.record_published();

        if self.config.auto_process {
            self.stats.record_received();
            self.receive(envelope).await
        } else {
            self.buffer_envelope(envelope).await
        }
    }

    async fn subscribe(
        &self,
        message_class: &str,
        handler: Arc<dyn MessageHandler>,
        filter: SubscriptionFilter,
    ) -> Result<()> {
        self.dispatcher
            .subscribe(Subscription::new(message_class, handler, filter))
            .await
    }

    async fn unsubscribe(&self, message_class: &str, handler_id: Option<&str>) -> Result<()> {
        self.dispatcher.unsubscribe(message_class, handler_id).await
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // Idempotent; buffered envelopes are discarded and blocked
        // publishers released.
        self.connected.store(false, Ordering::SeqCst);
        self.buffer.lock().await.clear();
        self.drained.notify_waiters();
        Ok(())
    }

    async fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}
