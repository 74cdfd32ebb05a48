//! Bindings from tag servants to external data sources
//!
//! A mapping records where a tag's live value comes from (an OPC UA node,
//! a historian point, a Modbus register). The runtime validates that the
//! tag exists before a mapping is stored.

use crate::servant::TagIdentity;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One tag's external data-source binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagMapping {
    pub tag: TagIdentity,
    /// Source system, e.g. `OPC_UA`, `AVEVA_PI`, `Modbus`
    pub external_source: String,
    /// Tag name in the source system
    pub external_tag_name: String,
    pub read_only: bool,
    pub polling_interval: Duration,
}

impl TagMapping {
    /// Read-only mapping polled once per second
    pub fn new(
        tag: TagIdentity,
        external_source: impl Into<String>,
        external_tag_name: impl Into<String>,
    ) -> Self {
        Self {
            tag,
            external_source: external_source.into(),
            external_tag_name: external_tag_name.into(),
            read_only: true,
            polling_interval: Duration::from_secs(1),
        }
    }

    #[must_use]
    pub fn writable(mut self) -> Self {
        self.read_only = false;
        self
    }

    #[must_use]
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MappingStats {
    pub total_mappings: usize,
    /// Known tags without a mapping
    pub unmapped_tags: usize,
}

/// Mapping table keyed by tag identity
#[derive(Default)]
pub struct MappingService {
    mappings: DashMap<TagIdentity, TagMapping>,
}

impl MappingService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a mapping, replacing any previous one for the same tag
    pub fn insert(&self, mapping: TagMapping) -> Option<TagMapping> {
        self.mappings.insert(mapping.tag.clone(), mapping)
    }

    pub fn get(&self, tag: &TagIdentity) -> Option<TagMapping> {
        self.mappings.get(tag).map(|m| m.clone())
    }

    /// Mappings ordered by tag, optionally only those from one source
    pub fn list(&self, external_source: Option<&str>) -> Vec<TagMapping> {
        let mut mappings: Vec<TagMapping> = self
            .mappings
            .iter()
            .filter(|m| external_source.map_or(true, |s| m.external_source == s))
            .map(|m| m.value().clone())
            .collect();
        mappings.sort_by(|a, b| a.tag.cmp(&b.tag));
        mappings
    }

    pub fn remove(&self, tag: &TagIdentity) -> Option<TagMapping> {
        self.mappings.remove(tag).map(|(_, m)| m)
    }

    /// Keep only mappings whose tag satisfies `keep`; returns how many were dropped
    pub fn retain(&self, mut keep: impl FnMut(&TagIdentity) -> bool) -> usize {
        let before = self.mappings.len();
        self.mappings.retain(|tag, _| keep(tag));
        before - self.mappings.len()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Counts relative to `known_tags` tag servants
    pub fn stats(&self, known_tags: usize) -> MappingStats {
        let total_mappings = self.mappings.len();
        MappingStats {
            total_mappings,
            unmapped_tags: known_tags.saturating_sub(total_mappings),
        }
    }
}
