//! Named FIFO queues with a durable history stream
//!
//! Queues decouple producers from consumers. Each queue keeps its pending
//! messages (consumed by `get`) and a separate history of every message
//! ever enqueued. Storage is pluggable through `QueueBackend`.

pub mod memory;
pub mod sled_queue;

pub use memory::MemoryQueueBackend;
pub use sled_queue::SledQueueBackend;

use crate::bus::{EventBus, EventPattern, SubscriptionId};
use crate::error::{Error, Result};
use crate::value::Value;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

/// Default pending-message cap for queues created by a manager
pub const DEFAULT_MAX_SIZE: usize = 10_000;

/// A message body wrapped with its per-backend sequence id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: u64,
    pub enqueued_at: DateTime<Utc>,
    pub body: Value,
}

/// Storage for one queue's pending messages and history
pub trait QueueStorage: Send {
    /// Append to both pending and history, assigning the next id
    fn push(&mut self, body: Value) -> Result<QueueMessage>;

    /// Remove and return the oldest pending message
    fn pop_front(&mut self) -> Result<Option<QueueMessage>>;

    fn pending_len(&self) -> usize;

    /// Every message ever enqueued, oldest first
    fn history(&self) -> Result<Vec<QueueMessage>>;

    /// Drop all pending messages; returns how many were dropped
    fn clear(&mut self) -> Result<usize>;

    fn clear_history(&mut self) -> Result<()>;
}

/// Where queues live
pub trait QueueBackend: Send + Sync {
    /// Open (or create) the storage for `name`
    fn open(&self, name: &str) -> Result<Box<dyn QueueStorage>>;

    /// Remove a queue's storage; returns whether it existed
    fn drop_queue(&self, name: &str) -> Result<bool>;

    /// Names of every stored queue
    fn queue_names(&self) -> Result<Vec<String>>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// One named FIFO queue
pub struct NamedQueue {
    name: String,
    /// 0 means unbounded
    max_size: usize,
    storage: Mutex<Box<dyn QueueStorage>>,
    available: Notify,
    deleted: AtomicBool,
}

impl NamedQueue {
    fn new(name: String, max_size: usize, storage: Box<dyn QueueStorage>) -> Self {
        Self {
            name,
            max_size,
            storage: Mutex::new(storage),
            available: Notify::new(),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Enqueue a message; returns its id.
    ///
    /// Fails with `QueueFull` once the pending count reaches `max_size`.
    pub fn put(&self, body: impl Into<Value>) -> Result<u64> {
        let message = {
            let mut storage = self.storage.lock();
            self.ensure_live()?;
            if self.max_size > 0 && storage.pending_len() >= self.max_size {
                return Err(Error::QueueFull {
                    name: self.name.clone(),
                    max_size: self.max_size,
                });
            }
            storage.push(body.into())?
        };
        debug!(queue = %self.name, id = message.id, "enqueued message");
        self.available.notify_one();
        Ok(message.id)
    }

    /// Pop the oldest pending message without waiting
    pub fn try_get(&self) -> Result<Option<QueueMessage>> {
        let mut storage = self.storage.lock();
        self.ensure_live()?;
        storage.pop_front()
    }

    /// Pop the oldest pending message, waiting for one to arrive.
    ///
    /// `Some(Duration::ZERO)` never waits, `None` waits indefinitely.
    /// Returns `Ok(None)` when the timeout elapses first.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<Option<QueueMessage>> {
        if timeout == Some(Duration::ZERO) {
            return self.try_get();
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent put cannot be missed
            notified.as_mut().enable();

            if let Some(message) = self.try_get()? {
                return Ok(Some(message));
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.try_get();
                    }
                }
            }
        }
    }

    /// Number of pending (unconsumed) messages
    pub fn size(&self) -> usize {
        self.storage.lock().pending_len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Every message ever enqueued, consumed or not, oldest first
    pub fn get_history(&self) -> Result<Vec<QueueMessage>> {
        let storage = self.storage.lock();
        self.ensure_live()?;
        storage.history()
    }

    /// Drop pending messages; history is kept
    pub fn clear(&self) -> Result<usize> {
        let mut storage = self.storage.lock();
        self.ensure_live()?;
        storage.clear()
    }

    pub fn clear_history(&self) -> Result<()> {
        let mut storage = self.storage.lock();
        self.ensure_live()?;
        storage.clear_history()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_deleted() {
            return Err(Error::QueueDeleted(self.name.clone()));
        }
        Ok(())
    }

    fn mark_deleted(&self) {
        let _storage = self.storage.lock();
        self.deleted.store(true, Ordering::Release);
        self.available.notify_waiters();
    }
}

/// Registry of named queues over one backend
pub struct QueueManager {
    backend: Arc<dyn QueueBackend>,
    max_size: usize,
    queues: Mutex<HashMap<String, Arc<NamedQueue>>>,
}

impl QueueManager {
    pub fn new(backend: Arc<dyn QueueBackend>, max_size: usize) -> Self {
        Self {
            backend,
            max_size,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Manager over a fresh in-memory backend
    pub fn in_memory(max_size: usize) -> Self {
        Self::new(Arc::new(MemoryQueueBackend::new()), max_size)
    }

    /// Create or return the queue called `name`
    pub fn get_queue(&self, name: &str) -> Result<Arc<NamedQueue>> {
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get(name) {
            return Ok(Arc::clone(queue));
        }
        let storage = self.backend.open(name)?;
        let queue = Arc::new(NamedQueue::new(name.to_string(), self.max_size, storage));
        queues.insert(name.to_string(), Arc::clone(&queue));
        debug!(queue = name, pending = queue.size(), "opened queue");
        Ok(queue)
    }

    /// Drop a queue and its storage.
    ///
    /// Outstanding handles fail with `QueueDeleted` afterwards, and waiting
    /// consumers are woken.
    pub fn delete_queue(&self, name: &str) -> Result<()> {
        let mut queues = self.queues.lock();
        let cached = queues.remove(name);
        if let Some(queue) = &cached {
            queue.mark_deleted();
        }
        let stored = self.backend.drop_queue(name)?;
        if cached.is_none() && !stored {
            return Err(Error::UnknownQueue(name.to_string()));
        }
        info!(queue = name, "deleted queue");
        Ok(())
    }

    /// Names of every known queue, sorted
    pub fn list_queues(&self) -> Result<Vec<String>> {
        let mut names: BTreeSet<String> = self.backend.queue_names()?.into_iter().collect();
        names.extend(self.queues.lock().keys().cloned());
        Ok(names.into_iter().collect())
    }

    /// Persist outstanding writes (no-op for in-memory queues)
    pub fn flush(&self) -> Result<()> {
        self.backend.flush()
    }
}

/// Enqueue every event matching `pattern` into `queue`.
///
/// A full or deleted queue makes the delivery fail, which the bus counts
/// and logs like any other subscriber failure.
pub fn forward_events(
    bus: &EventBus,
    pattern: impl Into<EventPattern>,
    queue: Arc<NamedQueue>,
) -> SubscriptionId {
    bus.subscribe(pattern, move |event| {
        queue.put(event.to_value())?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_max_size_is_unbounded() {
        let manager = QueueManager::in_memory(0);
        let queue = manager.get_queue("q").unwrap();
        for i in 0..100 {
            queue.put(i).unwrap();
        }
        assert_eq!(queue.size(), 100);
    }

    #[test]
    fn test_handles_fail_after_delete() {
        let manager = QueueManager::in_memory(10);
        let queue = manager.get_queue("q").unwrap();
        manager.delete_queue("q").unwrap();

        assert!(queue.is_deleted());
        assert!(matches!(queue.put(1), Err(Error::QueueDeleted(_))));
        assert!(matches!(manager.delete_queue("q"), Err(Error::UnknownQueue(_))));
    }
}
