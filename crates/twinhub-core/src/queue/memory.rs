//! In-memory queue backend for testing and development

use super::{QueueBackend, QueueMessage, QueueStorage};
use crate::error::Result;
use crate::value::Value;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};

/// In-memory queue backend (non-persistent)
#[derive(Default)]
pub struct MemoryQueueBackend {
    names: Mutex<BTreeSet<String>>,
}

impl MemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueBackend for MemoryQueueBackend {
    fn open(&self, name: &str) -> Result<Box<dyn QueueStorage>> {
        self.names.lock().insert(name.to_string());
        Ok(Box::new(MemoryQueue::default()))
    }

    fn drop_queue(&self, name: &str) -> Result<bool> {
        Ok(self.names.lock().remove(name))
    }

    fn queue_names(&self) -> Result<Vec<String>> {
        Ok(self.names.lock().iter().cloned().collect())
    }
}

#[derive(Default)]
struct MemoryQueue {
    pending: VecDeque<QueueMessage>,
    history: Vec<QueueMessage>,
    next_id: u64,
}

impl QueueStorage for MemoryQueue {
    fn push(&mut self, body: Value) -> Result<QueueMessage> {
        self.next_id += 1;
        let message = QueueMessage {
            id: self.next_id,
            enqueued_at: Utc::now(),
            body,
        };
        self.history.push(message.clone());
        self.pending.push_back(message.clone());
        Ok(message)
    }

    fn pop_front(&mut self) -> Result<Option<QueueMessage>> {
        Ok(self.pending.pop_front())
    }

    fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn history(&self) -> Result<Vec<QueueMessage>> {
        Ok(self.history.clone())
    }

    fn clear(&mut self) -> Result<usize> {
        let dropped = self.pending.len();
        self.pending.clear();
        Ok(dropped)
    }

    fn clear_history(&mut self) -> Result<()> {
        self.history.clear();
        Ok(())
    }
}
