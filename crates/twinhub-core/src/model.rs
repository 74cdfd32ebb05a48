//! Site layout and asset definitions
//!
//! These arrive already parsed and validated from the layout and
//! asset-definition tooling; the runtime only reads them (and updates
//! placement transforms it owns through `AssetServant::update_transform`).

use crate::value::{Value, ValueMap};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// What kind of data point a tag is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagKind {
    Sensor,
    Actuator,
    Indicator,
    ControlPoint,
    Alarm,
    Setpoint,
    Status,
}

impl TagKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sensor => "sensor",
            Self::Actuator => "actuator",
            Self::Indicator => "indicator",
            Self::ControlPoint => "control_point",
            Self::Alarm => "alarm",
            Self::Setpoint => "setpoint",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One data point exposed by an asset definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagDefinition {
    pub tag_id: String,
    pub name: String,
    pub kind: TagKind,
    /// Engineering unit, e.g. "degC" or "bar"
    #[serde(default)]
    pub eu_unit: Option<String>,
}

impl TagDefinition {
    pub fn new(tag_id: impl Into<String>, name: impl Into<String>, kind: TagKind) -> Self {
        Self {
            tag_id: tag_id.into(),
            name: name.into(),
            kind,
            eu_unit: None,
        }
    }

    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.eu_unit = Some(unit.into());
        self
    }
}

/// Reusable equipment template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetDefinition {
    pub asset_id: String,
    pub name: String,
    /// Ordered tag list; servants are built in this order
    #[serde(default)]
    pub tags: Vec<TagDefinition>,
}

impl AssetDefinition {
    pub fn new(asset_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            name: name.into(),
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_tag(mut self, tag: TagDefinition) -> Self {
        self.tags.push(tag);
        self
    }
}

/// Placement of an instance: translation, Euler rotation in degrees, scale
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub translation: [f64; 3],
    pub rotation: [f64; 3],
    pub scale: [f64; 3],
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            translation: [0.0; 3],
            rotation: [0.0; 3],
            scale: [1.0; 3],
        }
    }
}

impl Transform {
    pub fn at(translation: [f64; 3]) -> Self {
        Self {
            translation,
            ..Self::default()
        }
    }

    /// Apply a partial update; omitted fields are left unchanged
    pub fn apply(&mut self, update: &TransformUpdate) {
        if let Some(t) = update.translation {
            self.translation = t;
        }
        if let Some(r) = update.rotation {
            self.rotation = r;
        }
        if let Some(s) = update.scale {
            self.scale = s;
        }
    }

    /// Payload form used in instance events
    pub fn to_value(&self) -> Value {
        let mut map = ValueMap::new();
        map.insert("translation".to_string(), Value::from(self.translation));
        map.insert("rotation".to_string(), Value::from(self.rotation));
        map.insert("scale".to_string(), Value::from(self.scale));
        Value::Map(map)
    }
}

/// Partial transform update
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformUpdate {
    pub translation: Option<[f64; 3]>,
    pub rotation: Option<[f64; 3]>,
    pub scale: Option<[f64; 3]>,
}

impl TransformUpdate {
    #[must_use]
    pub fn translation(mut self, t: [f64; 3]) -> Self {
        self.translation = Some(t);
        self
    }

    #[must_use]
    pub fn rotation(mut self, r: [f64; 3]) -> Self {
        self.rotation = Some(r);
        self
    }

    #[must_use]
    pub fn scale(mut self, s: [f64; 3]) -> Self {
        self.scale = Some(s);
        self
    }
}

/// One concrete placement of an asset definition in a site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedInstance {
    pub instance_id: String,
    /// Asset definition id this instance is built from
    pub ref_asset: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub transform: Transform,
}

impl PlacedInstance {
    pub fn new(instance_id: impl Into<String>, ref_asset: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ref_asset: ref_asset.into(),
            name: None,
            transform: Transform::default(),
        }
    }

    #[must_use]
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Area {
    pub area_id: String,
    pub name: String,
    #[serde(default)]
    pub instances: Vec<PlacedInstance>,
}

/// A site: areas holding placed instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteLayout {
    pub site_id: String,
    pub name: String,
    #[serde(default)]
    pub areas: Vec<Area>,
}

impl SiteLayout {
    pub fn new(site_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            name: name.into(),
            areas: Vec::new(),
        }
    }

    /// Convenience for single-area layouts
    #[must_use]
    pub fn with_area(
        mut self,
        area_id: impl Into<String>,
        instances: impl IntoIterator<Item = PlacedInstance>,
    ) -> Self {
        let area_id = area_id.into();
        self.areas.push(Area {
            name: area_id.clone(),
            area_id,
            instances: instances.into_iter().collect(),
        });
        self
    }

    /// Every placed instance across all areas, in layout order
    pub fn instances(&self) -> impl Iterator<Item = &PlacedInstance> {
        self.areas.iter().flat_map(|a| a.instances.iter())
    }
}

/// Source of resolved asset definitions
pub trait AssetRegistry: Send + Sync {
    fn resolve(&self, asset_id: &str) -> Option<Arc<AssetDefinition>>;

    /// Ids of every definition the registry can resolve
    fn asset_ids(&self) -> Vec<String>;
}

/// In-memory asset registry
#[derive(Default)]
pub struct AssetLibrary {
    assets: DashMap<String, Arc<AssetDefinition>>,
}

impl AssetLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a definition; returns the previous one
    pub fn insert(&self, asset: AssetDefinition) -> Option<Arc<AssetDefinition>> {
        self.assets.insert(asset.asset_id.clone(), Arc::new(asset))
    }

    pub fn get(&self, asset_id: &str) -> Option<Arc<AssetDefinition>> {
        self.assets.get(asset_id).map(|a| a.clone())
    }

    pub fn remove(&self, asset_id: &str) -> Option<Arc<AssetDefinition>> {
        self.assets.remove(asset_id).map(|(_, a)| a)
    }

    /// All definitions sorted by id
    pub fn list(&self) -> Vec<Arc<AssetDefinition>> {
        let mut assets: Vec<_> = self.assets.iter().map(|e| e.value().clone()).collect();
        assets.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));
        assets
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn clear(&self) {
        self.assets.clear();
    }
}

impl FromIterator<AssetDefinition> for AssetLibrary {
    fn from_iter<I: IntoIterator<Item = AssetDefinition>>(iter: I) -> Self {
        let library = Self::new();
        for asset in iter {
            library.insert(asset);
        }
        library
    }
}

impl AssetRegistry for AssetLibrary {
    fn resolve(&self, asset_id: &str) -> Option<Arc<AssetDefinition>> {
        self.get(asset_id)
    }

    fn asset_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.assets.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_transform_update() {
        let mut transform = Transform::at([1.0, 2.0, 3.0]);
        transform.apply(&TransformUpdate::default().rotation([0.0, 0.0, 90.0]));

        assert_eq!(transform.translation, [1.0, 2.0, 3.0]);
        assert_eq!(transform.rotation, [0.0, 0.0, 90.0]);
        assert_eq!(transform.scale, [1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_library_resolves_definitions() {
        let library: AssetLibrary = vec![
            AssetDefinition::new("pump", "Pump"),
            AssetDefinition::new("valve", "Valve"),
        ]
        .into_iter()
        .collect();

        assert_eq!(library.len(), 2);
        assert_eq!(library.resolve("pump").map(|a| a.name.clone()), Some("Pump".into()));
        assert!(library.resolve("boiler").is_none());
        assert_eq!(library.asset_ids(), vec!["pump", "valve"]);
    }

    #[test]
    fn test_layout_flattens_areas() {
        let layout = SiteLayout::new("fab", "Fab")
            .with_area("a", vec![PlacedInstance::new("p1", "pump")])
            .with_area("b", vec![PlacedInstance::new("p2", "pump")]);

        let ids: Vec<_> = layout.instances().map(|i| i.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2"]);
    }
}
