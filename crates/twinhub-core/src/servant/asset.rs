//! Asset servant: one placed instance and its tag servants

use super::tag::{TagServant, TagServantConfig};
use crate::bus::EventBus;
use crate::event::{types, DeliveryGuarantee, Event};
use crate::model::{AssetDefinition, PlacedInstance, Transform, TransformUpdate};
use crate::tsdb::TimeSeriesStore;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Configuration for an asset servant
#[derive(Debug, Clone, PartialEq)]
pub struct AssetServantConfig {
    /// Publish instance lifecycle and transform events
    pub publish_events: bool,

    /// Build one tag servant per tag of the asset definition
    pub enable_tag_servants: bool,

    /// Applied to every owned tag servant
    pub tags: TagServantConfig,
}

impl Default for AssetServantConfig {
    fn default() -> Self {
        Self {
            publish_events: true,
            enable_tag_servants: true,
            tags: TagServantConfig::default(),
        }
    }
}

/// Live state of one placed asset instance
pub struct AssetServant {
    instance_id: String,
    ref_asset: String,
    name: Option<String>,
    definition: Arc<AssetDefinition>,
    config: AssetServantConfig,
    bus: Arc<EventBus>,
    transform: RwLock<Transform>,
    /// Keyed by tag definition id; fixed after construction
    tags: BTreeMap<String, Arc<TagServant>>,
    running: AtomicBool,
    transition: Mutex<()>,
}

impl AssetServant {
    /// Build the servant and its tag servants.
    ///
    /// A tag id repeated in the definition keeps its first occurrence.
    pub fn new(
        instance: PlacedInstance,
        definition: Arc<AssetDefinition>,
        bus: Arc<EventBus>,
        store: Option<Arc<dyn TimeSeriesStore>>,
        config: AssetServantConfig,
    ) -> Self {
        let mut tags = BTreeMap::new();
        if config.enable_tag_servants {
            for tag in &definition.tags {
                if tags.contains_key(&tag.tag_id) {
                    warn!(
                        instance = %instance.instance_id,
                        tag = %tag.tag_id,
                        "duplicate tag id in asset definition, skipping"
                    );
                    continue;
                }
                let servant = TagServant::new(
                    instance.instance_id.clone(),
                    tag.clone(),
                    Arc::clone(&bus),
                    store.clone(),
                    config.tags.clone(),
                );
                tags.insert(tag.tag_id.clone(), Arc::new(servant));
            }
        }

        Self {
            instance_id: instance.instance_id,
            ref_asset: instance.ref_asset,
            name: instance.name,
            definition,
            config,
            bus,
            transform: RwLock::new(instance.transform),
            tags,
            running: AtomicBool::new(false),
            transition: Mutex::new(()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn ref_asset(&self) -> &str {
        &self.ref_asset
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn definition(&self) -> &Arc<AssetDefinition> {
        &self.definition
    }

    pub fn config(&self) -> &AssetServantConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn transform(&self) -> Transform {
        *self.transform.read()
    }

    /// Snapshot of the placed instance with its current transform
    pub fn instance(&self) -> PlacedInstance {
        PlacedInstance {
            instance_id: self.instance_id.clone(),
            ref_asset: self.ref_asset.clone(),
            name: self.name.clone(),
            transform: self.transform(),
        }
    }

    pub fn tag_servant(&self, tag_id: &str) -> Option<Arc<TagServant>> {
        self.tags.get(tag_id).cloned()
    }

    /// Owned tag servants ordered by tag id
    pub fn tag_servants(&self) -> Vec<Arc<TagServant>> {
        self.tags.values().cloned().collect()
    }

    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    /// Announce the instance, then start every tag servant.
    ///
    /// Returns `false` if the servant was already running.
    pub async fn start(&self) -> bool {
        let _transition = self.transition.lock().await;
        if self.is_running() {
            return false;
        }
        self.running.store(true, Ordering::Release);

        if self.config.publish_events {
            self.publish(
                self.event(types::INSTANCE_CREATED)
                    .with("ref_asset", self.ref_asset.clone())
                    .with("transform", self.transform().to_value()),
            );
        }
        for tag in self.tags.values() {
            tag.start().await;
        }
        debug!(instance = %self.instance_id, tags = self.tags.len(), "asset servant started");
        true
    }

    /// Stop every tag servant, then announce the instance's removal.
    ///
    /// Returns `false` if the servant was not running.
    pub async fn stop(&self) -> bool {
        let _transition = self.transition.lock().await;
        if !self.is_running() {
            return false;
        }

        for tag in self.tags.values() {
            tag.stop().await;
        }
        if self.config.publish_events {
            self.publish(self.event(types::INSTANCE_DELETED));
        }
        self.running.store(false, Ordering::Release);
        debug!(instance = %self.instance_id, "asset servant stopped");
        true
    }

    /// Apply a partial transform update and announce the full result.
    ///
    /// Allowed whether or not the servant is running.
    pub async fn update_transform(&self, update: TransformUpdate) -> Transform {
        let _transition = self.transition.lock().await;
        let transform = {
            let mut transform = self.transform.write();
            transform.apply(&update);
            *transform
        };

        if self.config.publish_events {
            self.publish(
                self.event(types::INSTANCE_UPDATED).with("transform", transform.to_value()),
            );
        }
        transform
    }

    fn event(&self, event_type: &str) -> Event {
        Event::new(event_type, format!("AssetServant:{}", self.instance_id))
            .with("instance_id", self.instance_id.clone())
    }

    fn publish(&self, event: Event) {
        self.bus.publish(event, DeliveryGuarantee::AtLeastOnce);
    }
}

impl fmt::Debug for AssetServant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetServant")
            .field("instance_id", &self.instance_id)
            .field("ref_asset", &self.ref_asset)
            .field("running", &self.is_running())
            .field("tags", &self.tags.len())
            .finish()
    }
}
