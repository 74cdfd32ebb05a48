//! Live runtime objects for placed asset instances and their tags
//!
//! An `AssetServant` owns one placed instance and a fixed set of
//! `TagServant`s, one per tag of its asset definition. Both are stopped
//! when created and announce their lifecycle on the event bus.

pub mod asset;
pub mod tag;

pub use asset::{AssetServant, AssetServantConfig};
pub use tag::{TagServant, TagServantConfig, UpdateOutcome};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Runtime-wide identity of a tag servant
///
/// Renders as `<asset_instance_id>/<tag_id>`, which is also the series
/// name used for time-series writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagIdentity {
    pub asset_instance_id: String,
    pub tag_id: String,
}

impl TagIdentity {
    pub fn new(asset_instance_id: impl Into<String>, tag_id: impl Into<String>) -> Self {
        Self {
            asset_instance_id: asset_instance_id.into(),
            tag_id: tag_id.into(),
        }
    }
}

impl fmt::Display for TagIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.asset_instance_id, self.tag_id)
    }
}
