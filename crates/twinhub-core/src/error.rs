//! Error type shared by every twinhub component

use crate::servant::TagIdentity;
use thiserror::Error;

/// Errors raised synchronously to callers.
///
/// Subscriber failures never show up here: the bus logs and counts them.
#[derive(Debug, Error)]
pub enum Error {
    /// A servant operation needs a loaded site layout
    #[error("no site layout loaded")]
    LayoutNotLoaded,

    #[error("queue '{name}' is full (max_size={max_size})")]
    QueueFull { name: String, max_size: usize },

    #[error("unknown queue '{0}'")]
    UnknownQueue(String),

    /// The queue handle outlived a `delete_queue` call
    #[error("queue '{0}' has been deleted")]
    QueueDeleted(String),

    #[error("unknown tag servant {0}")]
    UnknownTag(TagIdentity),

    #[error("invalid quality {quality} for tag '{tag_id}' (expected 0-100)")]
    InvalidQuality { tag_id: String, quality: u8 },

    #[error("invalid time range: start is after end")]
    InvalidRange,

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("corrupt storage key in '{0}'")]
    CorruptKey(String),

    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
