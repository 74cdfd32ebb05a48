//! Events carried by the bus
//!
//! Every lifecycle transition and value change in the runtime is announced
//! as an `Event`. Events are immutable once published.

use crate::value::{Value, ValueMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Event type names published by the servants
pub mod types {
    pub const TAG_CREATED: &str = "TagCreated";
    pub const TAG_VALUE_CHANGED: &str = "TagValueChanged";
    pub const TAG_DELETED: &str = "TagDeleted";
    pub const INSTANCE_CREATED: &str = "InstanceCreated";
    pub const INSTANCE_UPDATED: &str = "InstanceUpdated";
    pub const INSTANCE_DELETED: &str = "InstanceDeleted";
}

pub const DEFAULT_SCHEMA_VERSION: &str = "1.0.0";

/// Time-ordered unique event identifier (UUIDv7)
///
/// Ids generated in this process sort by creation time, so history can be
/// ordered without a separate sequence counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How hard the bus tries to deliver an event.
///
/// Within one process the three levels differ only in how replay treats
/// the event:
/// - `AtLeastOnce`: delivered on publish, delivered again by every replay.
/// - `AtMostOnce`: delivered on publish only; replay skips it.
/// - `ExactlyOnce`: each subscription receives it at most once across
///   publish and replay, as long as the event is still in history.
///
/// A callback that fails is never retried by `publish` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryGuarantee {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

/// A published notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    /// Free-text origin, e.g. `TagServant:pump_001/inlet_temp`
    pub source: String,
    pub schema_version: String,
    pub payload: ValueMap,
}

impl Event {
    /// New event stamped with a fresh id and the current time
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            source: source.into(),
            schema_version: DEFAULT_SCHEMA_VERSION.to_string(),
            payload: ValueMap::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Flatten into a map value (used when events are forwarded to queues)
    pub fn to_value(&self) -> Value {
        let mut map = ValueMap::new();
        map.insert("event_id".to_string(), Value::from(self.event_id.to_string()));
        map.insert("event_type".to_string(), Value::from(self.event_type.clone()));
        map.insert("timestamp".to_string(), Value::from(self.timestamp));
        map.insert("source".to_string(), Value::from(self.source.clone()));
        map.insert(
            "schema_version".to_string(),
            Value::from(self.schema_version.clone()),
        );
        map.insert("payload".to_string(), Value::Map(self.payload.clone()));
        Value::Map(map)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} from {} ({})",
            self.timestamp, self.event_type, self.source, self.event_id
        )
    }
}
