//! Handler-scoped deduplication queues
//!
//! A DDQ is a bounded, ordered set of message UUIDs keyed by
//! `<message_class>:<handler_id>`. The dispatcher consults it before every
//! handler invocation and records successfully processed UUIDs, so a
//! redelivered envelope is skipped until its UUID ages out of the window.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;

use smartmessage_errors::{Result, SmartMessageError};

use crate::backend::Backend;

/// Scope key for one `(message_class, handler_id)` pair.
pub fn ddq_key(message_class: &str, handler_id: &str) -> String {
    format!("{}:{}", message_class, handler_id)
}

/// Occupancy snapshot of a deduplication queue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DedupStats {
    /// Configured capacity
    pub size: u32,
    /// UUIDs currently retained
    pub count: u32,
    /// count / size, zero for an unbounded-empty queue
    pub utilization: f64,
}

impl DedupStats {
    fn new(size: u32, count: u32) -> Self {
        let utilization = if size == 0 {
            0.0
        } else {
            f64::from(count) / f64::from(size)
        };
        Self {
            size,
            count,
            utilization,
        }
    }
}

/// Bounded ordered UUID set; all operations O(1).
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn contains(&self, uuid: &str) -> Result<bool>;

    /// Insert a UUID, evicting the oldest entry when at capacity.
    async fn add(&self, uuid: &str) -> Result<()>;

    async fn clear(&self) -> Result<()>;

    async fn stats(&self) -> Result<DedupStats>;
}

fn check_uuid(uuid: &str) -> Result<()> {
    if uuid.trim().is_empty() {
        return Err(SmartMessageError::Validation {
            message: "dedup uuid must not be empty".to_string(),
            property: Some("uuid".to_string()),
            code: "VALIDATION_ERROR".to_string(),
        });
    }
    Ok(())
}

struct MemoryInner {
    order: VecDeque<String>,
    members: HashSet<String>,
}

/// In-process store: ring buffer for ordering, hash set for membership.
pub struct MemoryDedupStore {
    capacity: u32,
    inner: Mutex<MemoryInner>,
}

impl MemoryDedupStore {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            inner: Mutex::new(MemoryInner {
                order: VecDeque::with_capacity(capacity as usize),
                members: HashSet::with_capacity(capacity as usize),
            }),
        }
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn contains(&self, uuid: &str) -> Result<bool> {
        check_uuid(uuid)?;
        Ok(self
            .inner
            .lock()
            .expect("ddq mutex poisoned")
            .members
            .contains(uuid))
    }

    async fn add(&self, uuid: &str) -> Result<()> {
        check_uuid(uuid)?;

        // Zero capacity retains nothing.
        if self.capacity == 0 {
            return Ok(());
        }

        let mut inner = self.inner.lock().expect("ddq mutex poisoned");
        if inner.members.contains(uuid) {
            return Ok(());
        }

        if inner.order.len() >= self.capacity as usize {
            if let Some(evicted) = inner.order.pop_front() {
                inner.members.remove(&evicted);
            }
        }

        inner.order.push_back(uuid.to_string());
        inner.members.insert(uuid.to_string());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("ddq mutex poisoned");
        inner.order.clear();
        inner.members.clear();
        Ok(())
    }

    async fn stats(&self) -> Result<DedupStats> {
        let inner = self.inner.lock().expect("ddq mutex poisoned");
        Ok(DedupStats::new(self.capacity, inner.order.len() as u32))
    }
}

/// Backend-resident store: a list for ordering plus a set for membership
/// under a shared key prefix, shared by every process in the deployment.
pub struct DistributedDedupStore {
    capacity: u32,
    backend: Arc<dyn Backend>,
    order_key: String,
    members_key: String,
}

impl DistributedDedupStore {
    pub fn new(capacity: u32, backend: Arc<dyn Backend>, key_prefix: &str) -> Self {
        Self {
            capacity,
            backend,
            order_key: format!("{}:order", key_prefix),
            members_key: format!("{}:members", key_prefix),
        }
    }
}

#[async_trait]
impl DedupStore for DistributedDedupStore {
    async fn contains(&self, uuid: &str) -> Result<bool> {
        check_uuid(uuid)?;
        self.backend.set_contains(&self.members_key, uuid).await
    }

    async fn add(&self, uuid: &str) -> Result<()> {
        check_uuid(uuid)?;

        if self.capacity == 0 {
            return Ok(());
        }

        if self.backend.set_contains(&self.members_key, uuid).await? {
            return Ok(());
        }

        if self.backend.list_len(&self.order_key).await? >= self.capacity as usize {
            if let Some(evicted) = self
                .backend
                .list_pop(&self.order_key, std::time::Duration::ZERO)
                .await?
            {
                let evicted = String::from_utf8_lossy(&evicted).to_string();
                self.backend.set_remove(&self.members_key, &evicted).await?;
            }
        }

        self.backend
            .list_push(&self.order_key, uuid.as_bytes().to_vec())
            .await?;
        self.backend.set_add(&self.members_key, uuid).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        while let Some(evicted) = self
            .backend
            .list_pop(&self.order_key, std::time::Duration::ZERO)
            .await?
        {
            let evicted = String::from_utf8_lossy(&evicted).to_string();
            self.backend.set_remove(&self.members_key, &evicted).await?;
        }
        Ok(())
    }

    async fn stats(&self) -> Result<DedupStats> {
        let count = self.backend.list_len(&self.order_key).await? as u32;
        Ok(DedupStats::new(self.capacity, count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    #[tokio::test]
    async fn add_twice_then_contains() {
        let store = MemoryDedupStore::new(3);
        store.add("u1").await.unwrap();
        store.add("u1").await.unwrap();
        assert!(store.contains("u1").await.unwrap());
        assert_eq!(store.stats().await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn capacity_evicts_oldest() {
        let store = MemoryDedupStore::new(3);
        for uuid in ["u1", "u2", "u3", "u4"] {
            store.add(uuid).await.unwrap();
        }

        assert!(!store.contains("u1").await.unwrap());
        assert!(store.contains("u2").await.unwrap());
        assert!(store.contains("u4").await.unwrap());
    }

    #[tokio::test]
    async fn zero_capacity_retains_nothing() {
        let store = MemoryDedupStore::new(0);
        store.add("u1").await.unwrap();
        assert!(!store.contains("u1").await.unwrap());
    }

    #[tokio::test]
    async fn empty_uuid_rejected() {
        let store = MemoryDedupStore::new(3);
        assert!(store.add(" ").await.is_err());
        assert!(store.contains("").await.is_err());
    }

    #[tokio::test]
    async fn stats_report_utilization() {
        let store = MemoryDedupStore::new(4);
        store.add("u1").await.unwrap();
        store.add("u2").await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.size, 4);
        assert_eq!(stats.count, 2);
        assert!((stats.utilization - 0.5).abs() < f64::EPSILON);

        store.clear().await.unwrap();
        assert_eq!(store.stats().await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn distributed_store_mirrors_memory_semantics() {
        let backend = InMemoryBackend::new();
        let store = DistributedDedupStore::new(3, backend, "ddq:Order:handler");

        for uuid in ["u1", "u2", "u3", "u4"] {
            store.add(uuid).await.unwrap();
        }

        assert!(!store.contains("u1").await.unwrap());
        assert!(store.contains("u4").await.unwrap());
        assert_eq!(store.stats().await.unwrap().count, 3);

        store.clear().await.unwrap();
        assert_eq!(store.stats().await.unwrap().count, 0);
        assert!(!store.contains("u2").await.unwrap());
    }
}
