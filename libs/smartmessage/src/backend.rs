//! Generic broker backend contract
//!
//! Broker transports are written against this trait rather than a concrete
//! client: key/value storage, pub/sub channels, FIFO lists, membership
//! sets, and the pattern-binding table used by queue routing. The bundled
//! [`InMemoryBackend`] serves tests and single-process deployments;
//! production backends adapt a real broker client to the same surface.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Instant};
use tracing::debug;

use smartmessage_errors::{Result, SmartMessageError};

/// Capacity of each pub/sub subscriber channel.
const SUBSCRIBER_BUFFER: usize = 256;

/// Key/value + pub/sub + list + set backend contract.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn connected(&self) -> bool;

    // Key/value
    async fn kv_set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    // Pub/sub channels
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize>;
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Vec<u8>>>;
    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    // FIFO lists
    async fn list_push(&self, queue: &str, payload: Vec<u8>) -> Result<()>;
    async fn list_pop(&self, queue: &str, wait: Duration) -> Result<Option<Vec<u8>>>;
    async fn list_len(&self, queue: &str) -> Result<usize>;

    // Membership sets
    async fn set_add(&self, key: &str, member: &str) -> Result<bool>;
    async fn set_contains(&self, key: &str, member: &str) -> Result<bool>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool>;

    // Pattern bindings for queue routing
    async fn bind_pattern(&self, pattern: &str, queue: &str) -> Result<()>;
    async fn unbind_pattern(&self, pattern: &str, queue: &str) -> Result<()>;
    async fn pattern_bindings(&self) -> Result<Vec<(String, String)>>;
}

#[derive(Default)]
struct SharedState {
    kv: HashMap<String, Vec<u8>>,
    channels: HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    sets: HashMap<String, HashSet<String>>,
    bindings: Vec<(String, String)>,
}

/// Same-process backend holding everything in mutex-guarded maps.
pub struct InMemoryBackend {
    state: Mutex<SharedState>,
    list_signal: Notify,
    connected: AtomicBool,
}

impl InMemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SharedState::default()),
            list_signal: Notify::new(),
            connected: AtomicBool::new(true),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SharedState> {
        self.state.lock().expect("backend state poisoned")
    }

    fn try_pop(&self, queue: &str) -> Option<Vec<u8>> {
        self.lock().lists.get_mut(queue).and_then(VecDeque::pop_front)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SmartMessageError::Connection {
                message: "backend is disconnected".to_string(),
                endpoint: None,
                code: "CONNECTION_ERROR".to_string(),
            })
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            state: Mutex::new(SharedState::default()),
            list_signal: Notify::new(),
            connected: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // Idempotent; dropping senders ends every subscriber stream.
        self.connected.store(false, Ordering::SeqCst);
        self.lock().channels.clear();
        self.list_signal.notify_waiters();
        Ok(())
    }

    async fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn kv_set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.ensure_connected()?;
        self.lock().kv.insert(key.to_string(), value);
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_connected()?;
        Ok(self.lock().kv.get(key).cloned())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize> {
        self.ensure_connected()?;

        let senders = match self.lock().channels.get(channel) {
            Some(senders) => senders.clone(),
            None => return Ok(0),
        };

        let mut delivered = 0usize;
        for sender in &senders {
            if sender.try_send(payload.clone()).is_ok() {
                delivered += 1;
            }
        }

        // Prune subscribers that went away.
        self.lock()
            .channels
            .entry(channel.to_string())
            .and_modify(|s| s.retain(|tx| !tx.is_closed()));

        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        self.ensure_connected()?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.lock()
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        debug!(channel, "backend subscription added");
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.lock().channels.remove(channel);
        Ok(())
    }

    async fn list_push(&self, queue: &str, payload: Vec<u8>) -> Result<()> {
        self.ensure_connected()?;
        self.lock()
            .lists
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
        self.list_signal.notify_waiters();
        Ok(())
    }

    async fn list_pop(&self, queue: &str, wait: Duration) -> Result<Option<Vec<u8>>> {
        self.ensure_connected()?;

        let deadline = Instant::now() + wait;
        loop {
            if let Some(payload) = self.try_pop(queue) {
                return Ok(Some(payload));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let notified = self.list_signal.notified();
            // A push may have landed between the check and registration.
            if let Some(payload) = self.try_pop(queue) {
                return Ok(Some(payload));
            }
            if timeout(remaining, notified).await.is_err() {
                return Ok(self.try_pop(queue));
            }
            self.ensure_connected()?;
        }
    }

    async fn list_len(&self, queue: &str) -> Result<usize> {
        Ok(self.lock().lists.get(queue).map_or(0, VecDeque::len))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        self.ensure_connected()?;
        Ok(self
            .lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .lock()
            .sets
            .get(key)
            .map_or(false, |set| set.contains(member)))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .lock()
            .sets
            .get_mut(key)
            .map_or(false, |set| set.remove(member)))
    }

    async fn bind_pattern(&self, pattern: &str, queue: &str) -> Result<()> {
        self.ensure_connected()?;
        let mut state = self.lock();
        let binding = (pattern.to_string(), queue.to_string());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn unbind_pattern(&self, pattern: &str, queue: &str) -> Result<()> {
        self.lock()
            .bindings
            .retain(|(p, q)| !(p == pattern && q == queue));
        Ok(())
    }

    async fn pattern_bindings(&self) -> Result<Vec<(String, String)>> {
        Ok(self.lock().bindings.clone())
    }
}
