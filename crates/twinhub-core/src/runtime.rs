//! Servant runtime
//!
//! Binds a site layout to an asset registry and manages the resulting
//! servant population as a unit.

use crate::bus::{BusStats, EventBus};
use crate::error::{Error, Result};
use crate::mapping::{MappingService, MappingStats, TagMapping};
use crate::model::{AssetDefinition, AssetLibrary, AssetRegistry, SiteLayout};
use crate::queue::{QueueBackend, QueueManager, DEFAULT_MAX_SIZE};
use crate::servant::{
    AssetServant, AssetServantConfig, TagIdentity, TagServant, TagServantConfig, UpdateOutcome,
};
use crate::tsdb::TimeSeriesStore;
use crate::value::Value;
use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Configuration for the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Events kept by the bus for history queries and replay
    pub event_history_capacity: usize,

    /// Whether servants publish lifecycle and value events
    pub publish_events: bool,

    /// Persist tag values when a time-series store is attached
    pub write_through: bool,

    /// Change threshold applied to every tag servant
    pub change_threshold: Option<f64>,

    /// Pending-message cap for queues opened through `Runtime::queues`
    pub queue_max_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_history_capacity: 10_000,
            publish_events: true,
            write_through: true,
            change_threshold: None,
            queue_max_size: DEFAULT_MAX_SIZE,
        }
    }
}

impl RuntimeConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeStats {
    pub asset_servants: usize,
    pub tag_servants: usize,
    pub running_asset_servants: usize,
    pub is_running: bool,
    pub bus: BusStats,
}

/// Owner of the servant graph built from one site layout
pub struct Runtime {
    config: RuntimeConfig,
    bus: Arc<EventBus>,
    store: Option<Arc<dyn TimeSeriesStore>>,
    registry: RwLock<Arc<dyn AssetRegistry>>,
    layout: ArcSwapOption<SiteLayout>,
    servants: RwLock<BTreeMap<String, Arc<AssetServant>>>,
    mappings: MappingService,
    queues: QueueManager,
    running: AtomicBool,
    /// Serializes generate/start/stop
    lifecycle: Mutex<()>,
}

impl Runtime {
    /// Create a runtime without a time-series store
    pub fn new(config: RuntimeConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a runtime whose tag servants persist into `store`
    pub fn with_store(config: RuntimeConfig, store: Arc<dyn TimeSeriesStore>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: RuntimeConfig, store: Option<Arc<dyn TimeSeriesStore>>) -> Self {
        let bus = Arc::new(EventBus::with_history_capacity(config.event_history_capacity));
        let queues = QueueManager::in_memory(config.queue_max_size);
        Self {
            config,
            bus,
            store,
            registry: RwLock::new(Arc::new(AssetLibrary::new())),
            layout: ArcSwapOption::empty(),
            servants: RwLock::new(BTreeMap::new()),
            mappings: MappingService::new(),
            queues,
            running: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        }
    }

    /// Open named queues on `backend` instead of in memory
    #[must_use]
    pub fn with_queue_backend(mut self, backend: Arc<dyn QueueBackend>) -> Self {
        self.queues = QueueManager::new(backend, self.config.queue_max_size);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> Option<&Arc<dyn TimeSeriesStore>> {
        self.store.as_ref()
    }

    pub fn mappings(&self) -> &MappingService {
        &self.mappings
    }

    /// Named queues capped at `queue_max_size`
    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    /// Replace the loaded site layout; servants are rebuilt by
    /// `generate_servants`
    pub fn load_layout(&self, layout: SiteLayout) {
        info!(
            site = %layout.site_id,
            instances = layout.instances().count(),
            "loaded site layout"
        );
        self.layout.store(Some(Arc::new(layout)));
    }

    pub fn layout(&self) -> Option<Arc<SiteLayout>> {
        self.layout.load_full()
    }

    /// Install the given definitions as the asset registry; returns how
    /// many distinct definitions were loaded
    pub fn load_asset_definitions(
        &self,
        definitions: impl IntoIterator<Item = AssetDefinition>,
    ) -> usize {
        let library: AssetLibrary = definitions.into_iter().collect();
        let count = library.len();
        self.set_asset_registry(Arc::new(library));
        info!(assets = count, "loaded asset definitions");
        count
    }

    /// Resolve asset definitions through an external registry
    pub fn set_asset_registry(&self, registry: Arc<dyn AssetRegistry>) {
        *self.registry.write() = registry;
    }

    pub fn asset_registry(&self) -> Arc<dyn AssetRegistry> {
        self.registry.read().clone()
    }

    /// Build one asset servant per resolvable placed instance.
    ///
    /// Instances whose asset definition cannot be resolved, and repeated
    /// instance ids, are skipped with a warning. Replaces any previously
    /// generated servants and drops mappings to tags that no longer exist.
    /// A running population is stopped first, so the runtime is not running
    /// afterwards. Returns the number of asset servants built.
    pub async fn generate_servants(&self) -> Result<usize> {
        let _lifecycle = self.lifecycle.lock().await;
        let layout = self.layout.load_full().ok_or(Error::LayoutNotLoaded)?;
        if self.is_running() {
            let stopped = self.stop_current().await;
            info!(stopped, "stopped running servants before regenerating");
        }

        let registry = self.asset_registry();
        let config = self.asset_config();
        let mut servants = BTreeMap::new();
        let mut skipped = 0;

        for instance in layout.instances() {
            if servants.contains_key(&instance.instance_id) {
                warn!(instance = %instance.instance_id, "duplicate instance id, skipping");
                skipped += 1;
                continue;
            }
            let Some(definition) = registry.resolve(&instance.ref_asset) else {
                warn!(
                    instance = %instance.instance_id,
                    asset = %instance.ref_asset,
                    "asset definition not found, skipping instance"
                );
                skipped += 1;
                continue;
            };
            let servant = AssetServant::new(
                instance.clone(),
                definition,
                Arc::clone(&self.bus),
                self.store.clone(),
                config.clone(),
            );
            servants.insert(instance.instance_id.clone(), Arc::new(servant));
        }

        let generated = servants.len();
        let tags: usize = servants.values().map(|s| s.tag_count()).sum();
        let dropped = self.mappings.retain(|tag| {
            servants
                .get(&tag.asset_instance_id)
                .is_some_and(|s| s.tag_servant(&tag.tag_id).is_some())
        });
        *self.servants.write() = servants;

        info!(generated, tags, skipped, dropped_mappings = dropped, "generated servants");
        Ok(generated)
    }

    /// Start every asset servant; returns how many were started.
    ///
    /// A second call while running does nothing.
    pub async fn start_all_servants(&self) -> Result<usize> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.layout.load().is_none() {
            return Err(Error::LayoutNotLoaded);
        }
        if self.is_running() {
            return Ok(0);
        }

        let mut started = 0;
        for servant in self.asset_servants() {
            if servant.start().await {
                started += 1;
            }
        }
        self.running.store(true, Ordering::Release);
        info!(started, "started all servants");
        Ok(started)
    }

    /// Stop every asset servant; returns how many were stopped.
    ///
    /// Does nothing when not running.
    pub async fn stop_all_servants(&self) -> Result<usize> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.layout.load().is_none() {
            return Err(Error::LayoutNotLoaded);
        }
        if !self.is_running() {
            return Ok(0);
        }

        let stopped = self.stop_current().await;
        info!(stopped, "stopped all servants");
        Ok(stopped)
    }

    /// Caller holds the lifecycle lock
    async fn stop_current(&self) -> usize {
        let mut stopped = 0;
        for servant in self.asset_servants() {
            if servant.stop().await {
                stopped += 1;
            }
        }
        self.running.store(false, Ordering::Release);
        stopped
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn asset_servant(&self, instance_id: &str) -> Option<Arc<AssetServant>> {
        self.servants.read().get(instance_id).cloned()
    }

    /// All asset servants ordered by instance id
    pub fn asset_servants(&self) -> Vec<Arc<AssetServant>> {
        self.servants.read().values().cloned().collect()
    }

    /// Every tag servant of every asset servant
    pub fn tag_servants(&self) -> Vec<Arc<TagServant>> {
        self.servants
            .read()
            .values()
            .flat_map(|s| s.tag_servants())
            .collect()
    }

    pub fn tag_servant(&self, tag: &TagIdentity) -> Option<Arc<TagServant>> {
        self.asset_servant(&tag.asset_instance_id)
            .and_then(|s| s.tag_servant(&tag.tag_id))
    }

    /// Route a value to the tag servant named by `tag`
    pub async fn update_tag_value(
        &self,
        tag: &TagIdentity,
        value: impl Into<Value>,
    ) -> Result<UpdateOutcome> {
        let servant = self
            .tag_servant(tag)
            .ok_or_else(|| Error::UnknownTag(tag.clone()))?;
        servant.update_value(value).await
    }

    /// Bind a generated tag servant to an external source; returns the
    /// mapping it replaced
    pub fn create_mapping(&self, mapping: TagMapping) -> Result<Option<TagMapping>> {
        if self.tag_servant(&mapping.tag).is_none() {
            return Err(Error::UnknownTag(mapping.tag));
        }
        Ok(self.mappings.insert(mapping))
    }

    pub fn mapping_stats(&self) -> MappingStats {
        self.mappings.stats(self.tag_servants().len())
    }

    pub fn stats(&self) -> RuntimeStats {
        let servants = self.servants.read();
        RuntimeStats {
            asset_servants: servants.len(),
            tag_servants: servants.values().map(|s| s.tag_count()).sum(),
            running_asset_servants: servants.values().filter(|s| s.is_running()).count(),
            is_running: self.is_running(),
            bus: self.bus.get_stats(),
        }
    }

    fn asset_config(&self) -> AssetServantConfig {
        AssetServantConfig {
            publish_events: self.config.publish_events,
            enable_tag_servants: true,
            tags: TagServantConfig {
                publish_events: self.config.publish_events,
                write_through: self.config.write_through && self.store.is_some(),
                change_threshold: self.config.change_threshold,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config = RuntimeConfig::from_json_str(r#"{"change_threshold": 0.5}"#).unwrap();
        assert_eq!(config.change_threshold, Some(0.5));
        assert_eq!(config.event_history_capacity, 10_000);
        assert!(config.write_through);
        assert_eq!(config.queue_max_size, DEFAULT_MAX_SIZE);
    }

    #[test]
    fn test_queues_use_configured_cap() {
        let runtime = Runtime::new(RuntimeConfig {
            queue_max_size: 1,
            ..RuntimeConfig::default()
        });
        let queue = runtime.queues().get_queue("audit").unwrap();
        queue.put(1).unwrap();
        assert!(matches!(queue.put(2), Err(Error::QueueFull { max_size: 1, .. })));
    }

    #[test]
    fn test_config_rejects_malformed_json() {
        assert!(matches!(
            RuntimeConfig::from_json_str("{not json"),
            Err(Error::Config(_))
        ));
    }
}
