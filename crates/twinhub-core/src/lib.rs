//! TwinHub Core Runtime
//!
//! This crate provides the event-driven servant runtime for a digital twin
//! of an industrial site:
//! - In-process event bus with bounded history and replay
//! - Time-series persistence for tag values
//! - Named FIFO queues for decoupled consumers
//! - Tag and asset servants orchestrated by a runtime built from a site layout

pub mod bus;
pub mod error;
pub mod event;
pub mod mapping;
pub mod model;
pub mod queue;
pub mod runtime;
pub mod servant;
pub mod tsdb;
pub mod value;

pub use bus::{EventBus, EventBusConfig, EventFilter, EventPattern, SubscriptionId};
pub use error::{Error, Result};
pub use event::{DeliveryGuarantee, Event, EventId};
pub use mapping::{MappingService, TagMapping};
pub use model::{
    AssetDefinition, AssetLibrary, AssetRegistry, PlacedInstance, SiteLayout, TagDefinition,
    TagKind, Transform, TransformUpdate,
};
pub use queue::{NamedQueue, QueueManager, QueueMessage};
pub use runtime::{Runtime, RuntimeConfig, RuntimeStats};
pub use servant::{AssetServant, TagIdentity, TagServant, UpdateOutcome};
pub use tsdb::{TagValue, TimeRange, TimeSeriesStore};
pub use value::Value;
