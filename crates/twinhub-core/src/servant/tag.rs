//! Tag servant: owns one tag's live value

use super::TagIdentity;
use crate::bus::EventBus;
use crate::error::Result;
use crate::event::{types, DeliveryGuarantee, Event};
use crate::model::TagDefinition;
use crate::tsdb::{TagValue, TimeSeriesStore};
use crate::value::Value;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Configuration for a tag servant
#[derive(Debug, Clone, PartialEq)]
pub struct TagServantConfig {
    /// Publish lifecycle and value-change events
    pub publish_events: bool,

    /// Append every applied value to the attached time-series store
    pub write_through: bool,

    /// Drop numeric updates that move the value by less than this
    pub change_threshold: Option<f64>,
}

impl Default for TagServantConfig {
    fn default() -> Self {
        Self {
            publish_events: true,
            write_through: false,
            change_threshold: None,
        }
    }
}

/// What `update_value` did with a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Stored, announced and (if configured) persisted
    Applied,
    /// Within the change threshold of the current value
    Suppressed,
    /// The servant is not running
    Ignored,
}

#[derive(Default)]
struct TagState {
    running: bool,
    value: Option<Value>,
    last_update: Option<DateTime<Utc>>,
}

/// Live state of one tag on one placed instance
pub struct TagServant {
    identity: TagIdentity,
    definition: TagDefinition,
    config: TagServantConfig,
    bus: Arc<EventBus>,
    store: Option<Arc<dyn TimeSeriesStore>>,
    state: RwLock<TagState>,
    /// Serializes start/stop/update so events follow state order
    transition: Mutex<()>,
}

impl TagServant {
    pub fn new(
        asset_instance_id: impl Into<String>,
        definition: TagDefinition,
        bus: Arc<EventBus>,
        store: Option<Arc<dyn TimeSeriesStore>>,
        config: TagServantConfig,
    ) -> Self {
        Self {
            identity: TagIdentity::new(asset_instance_id, definition.tag_id.clone()),
            definition,
            config,
            bus,
            store,
            state: RwLock::new(TagState::default()),
            transition: Mutex::new(()),
        }
    }

    pub fn identity(&self) -> &TagIdentity {
        &self.identity
    }

    pub fn definition(&self) -> &TagDefinition {
        &self.definition
    }

    pub fn config(&self) -> &TagServantConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.state.read().running
    }

    pub fn get_value(&self) -> Option<Value> {
        self.state.read().value.clone()
    }

    pub fn get_last_update_time(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_update
    }

    /// Start the servant; returns `false` if it was already running
    pub async fn start(&self) -> bool {
        let _transition = self.transition.lock().await;
        {
            let mut state = self.state.write();
            if state.running {
                return false;
            }
            state.running = true;
        }

        if self.config.publish_events {
            self.publish(
                self.event(types::TAG_CREATED)
                    .with("name", self.definition.name.clone())
                    .with("kind", self.definition.kind.as_str())
                    .with("eu_unit", self.definition.eu_unit.clone()),
            );
        }
        debug!(tag = %self.identity, "tag servant started");
        true
    }

    /// Stop the servant; returns `false` if it was not running
    pub async fn stop(&self) -> bool {
        let _transition = self.transition.lock().await;
        if !self.is_running() {
            return false;
        }

        if self.config.publish_events {
            self.publish(self.event(types::TAG_DELETED));
        }
        self.state.write().running = false;
        debug!(tag = %self.identity, "tag servant stopped");
        true
    }

    /// Apply a new value.
    ///
    /// Ignored while stopped. With a change threshold, a numeric value
    /// closer than the threshold to the current numeric value is dropped
    /// without touching state. An applied value is published and, with
    /// write-through, appended to the store; a store error is returned
    /// after the in-memory value has already changed.
    pub async fn update_value(&self, value: impl Into<Value>) -> Result<UpdateOutcome> {
        let value = value.into();
        let _transition = self.transition.lock().await;

        let (old_value, timestamp) = {
            let mut state = self.state.write();
            if !state.running {
                return Ok(UpdateOutcome::Ignored);
            }
            if self.within_threshold(state.value.as_ref(), &value) {
                debug!(tag = %self.identity, %value, "update suppressed by change threshold");
                return Ok(UpdateOutcome::Suppressed);
            }
            let timestamp = Utc::now();
            let old_value = state.value.replace(value.clone());
            state.last_update = Some(timestamp);
            (old_value, timestamp)
        };

        if self.config.publish_events {
            self.publish(
                self.event(types::TAG_VALUE_CHANGED)
                    .with("old_value", old_value)
                    .with("new_value", value.clone())
                    .with("timestamp", timestamp)
                    .with("eu_unit", self.definition.eu_unit.clone()),
            );
        }

        if self.config.write_through {
            if let Some(store) = &self.store {
                store
                    .write_tag_value(
                        TagValue::new(self.identity.to_string(), timestamp, value)
                            .with_source(self.source()),
                    )
                    .await?;
            }
        }

        Ok(UpdateOutcome::Applied)
    }

    fn within_threshold(&self, current: Option<&Value>, new: &Value) -> bool {
        let Some(threshold) = self.config.change_threshold else {
            return false;
        };
        match (current.and_then(Value::as_f64), new.as_f64()) {
            (Some(current), Some(new)) => (new - current).abs() < threshold,
            _ => false,
        }
    }

    fn source(&self) -> String {
        format!("TagServant:{}", self.identity)
    }

    /// Event carrying the identity fields every tag event shares
    fn event(&self, event_type: &str) -> Event {
        Event::new(event_type, self.source())
            .with("tag_instance_id", self.identity.to_string())
            .with("tag_id", self.identity.tag_id.clone())
            .with("asset_instance_id", self.identity.asset_instance_id.clone())
    }

    fn publish(&self, event: Event) {
        self.bus.publish(event, DeliveryGuarantee::AtLeastOnce);
    }
}

impl fmt::Debug for TagServant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("TagServant")
            .field("identity", &self.identity)
            .field("name", &self.definition.name)
            .field("running", &state.running)
            .field("value", &state.value)
            .finish()
    }
}
