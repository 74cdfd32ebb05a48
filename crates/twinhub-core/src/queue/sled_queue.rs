//! `Sled`-based persistent queue backend
//!
//! Each queue uses two trees, `queue/pending/<name>` and
//! `queue/history/<name>`, keyed by the big-endian message id. Ids come
//! from the database's monotonic id generator, so key order is FIFO order
//! and survives restarts.

use super::{QueueBackend, QueueMessage, QueueStorage};
use crate::error::{Error, Result};
use crate::value::Value;
use chrono::Utc;
use sled::transaction::{TransactionError, TransactionResult};
use sled::{Db, IVec, Transactional, Tree};
use std::path::Path;

const PENDING_PREFIX: &str = "queue/pending/";
const HISTORY_PREFIX: &str = "queue/history/";

/// `Sled`-based persistent queue backend
pub struct SledQueueBackend {
    db: Db,
}

impl SledQueueBackend {
    /// Open (or create) a queue database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_db(sled::open(path)?))
    }

    /// Backend over a temporary database removed on drop
    pub fn temporary() -> Result<Self> {
        Ok(Self::from_db(sled::Config::new().temporary(true).open()?))
    }

    /// Share an already open database
    pub fn from_db(db: Db) -> Self {
        Self { db }
    }
}

impl QueueBackend for SledQueueBackend {
    fn open(&self, name: &str) -> Result<Box<dyn QueueStorage>> {
        let pending = self.db.open_tree(format!("{PENDING_PREFIX}{name}"))?;
        let history = self.db.open_tree(format!("{HISTORY_PREFIX}{name}"))?;
        let pending_len = pending.len();
        Ok(Box::new(SledQueue {
            db: self.db.clone(),
            pending,
            history,
            pending_len,
        }))
    }

    fn drop_queue(&self, name: &str) -> Result<bool> {
        let pending = self.db.drop_tree(format!("{PENDING_PREFIX}{name}"))?;
        let history = self.db.drop_tree(format!("{HISTORY_PREFIX}{name}"))?;
        Ok(pending || history)
    }

    fn queue_names(&self) -> Result<Vec<String>> {
        Ok(self
            .db
            .tree_names()
            .iter()
            .filter_map(|tree| {
                let tree = std::str::from_utf8(tree).ok()?;
                tree.strip_prefix(PENDING_PREFIX).map(str::to_string)
            })
            .collect())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

struct SledQueue {
    db: Db,
    pending: Tree,
    history: Tree,
    /// `Tree::len` walks the whole tree, so the count is tracked here
    pending_len: usize,
}

fn encode(message: &QueueMessage) -> Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(message, bincode::config::standard())?)
}

fn decode(bytes: &IVec) -> Result<QueueMessage> {
    Ok(
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(decoded, _)| decoded)?,
    )
}

impl QueueStorage for SledQueue {
    fn push(&mut self, body: Value) -> Result<QueueMessage> {
        let message = QueueMessage {
            id: self.db.generate_id()?,
            enqueued_at: Utc::now(),
            body,
        };
        let key = message.id.to_be_bytes();
        let encoded = encode(&message)?;
        let written: TransactionResult<()> =
            (&self.history, &self.pending).transaction(|(history, pending)| {
                history.insert(&key[..], encoded.as_slice())?;
                pending.insert(&key[..], encoded.as_slice())?;
                Ok(())
            });
        written.map_err(|err| match err {
            TransactionError::Storage(err) => Error::Storage(err),
            TransactionError::Abort(()) => {
                Error::Storage(sled::Error::Unsupported("queue push aborted".to_string()))
            }
        })?;
        self.pending_len += 1;
        Ok(message)
    }

    fn pop_front(&mut self) -> Result<Option<QueueMessage>> {
        match self.pending.pop_min()? {
            Some((_, bytes)) => {
                self.pending_len = self.pending_len.saturating_sub(1);
                Ok(Some(decode(&bytes)?))
            }
            None => Ok(None),
        }
    }

    fn pending_len(&self) -> usize {
        self.pending_len
    }

    fn history(&self) -> Result<Vec<QueueMessage>> {
        self.history
            .iter()
            .map(|item| {
                let (_, bytes) = item?;
                decode(&bytes)
            })
            .collect()
    }

    fn clear(&mut self) -> Result<usize> {
        let dropped = self.pending_len;
        self.pending.clear()?;
        self.pending_len = 0;
        Ok(dropped)
    }

    fn clear_history(&mut self) -> Result<()> {
        self.history.clear()?;
        Ok(())
    }
}
