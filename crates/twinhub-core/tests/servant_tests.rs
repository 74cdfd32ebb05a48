//! Tests for tag and asset servant lifecycles

use parking_lot::Mutex;
use std::sync::Arc;
use twinhub_core::event::types;
use twinhub_core::servant::{AssetServantConfig, TagServantConfig};
use twinhub_core::tsdb::{MemoryTimeSeriesStore, TimeRange};
use twinhub_core::{
    AssetDefinition, AssetServant, Event, EventBus, EventFilter, PlacedInstance, TagDefinition,
    TagKind, TagServant, TimeSeriesStore, Transform, TransformUpdate, UpdateOutcome, Value,
};

fn inlet_temp() -> TagDefinition {
    TagDefinition::new("inlet_temp", "Inlet Temperature", TagKind::Sensor).with_unit("degC")
}

fn pump() -> Arc<AssetDefinition> {
    Arc::new(
        AssetDefinition::new("pump", "Centrifugal Pump")
            .with_tag(inlet_temp())
            .with_tag(TagDefinition::new("speed", "Speed", TagKind::Setpoint).with_unit("rpm")),
    )
}

fn events_of(bus: &EventBus, event_type: &str) -> Vec<Event> {
    bus.get_event_history(&EventFilter::of_type(event_type), usize::MAX)
}

fn tag_servant(bus: &Arc<EventBus>, config: TagServantConfig) -> TagServant {
    TagServant::new("pump_001", inlet_temp(), Arc::clone(bus), None, config)
}

#[tokio::test]
async fn test_tag_lifecycle_is_idempotent() {
    let bus = Arc::new(EventBus::default());
    let servant = tag_servant(&bus, TagServantConfig::default());

    assert!(!servant.stop().await);
    assert!(bus.get_event_history(&EventFilter::all(), 10).is_empty());

    assert!(servant.start().await);
    assert!(!servant.start().await);
    assert!(servant.is_running());

    let created = events_of(&bus, types::TAG_CREATED);
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].source, "TagServant:pump_001/inlet_temp");
    assert_eq!(created[0].get("tag_instance_id"), Some(&Value::from("pump_001/inlet_temp")));
    assert_eq!(created[0].get("kind"), Some(&Value::from("sensor")));
    assert_eq!(created[0].get("eu_unit"), Some(&Value::from("degC")));

    assert!(servant.stop().await);
    assert!(!servant.stop().await);
    assert_eq!(events_of(&bus, types::TAG_DELETED).len(), 1);
}

#[tokio::test]
async fn test_updates_ignored_while_stopped() {
    let bus = Arc::new(EventBus::default());
    let servant = tag_servant(&bus, TagServantConfig::default());

    let outcome = servant.update_value(1.0).await.unwrap();
    assert_eq!(outcome, UpdateOutcome::Ignored);
    assert!(servant.get_value().is_none());
    assert!(servant.get_last_update_time().is_none());
}

#[tokio::test]
async fn test_value_change_event() {
    let bus = Arc::new(EventBus::default());
    let servant = tag_servant(&bus, TagServantConfig::default());
    servant.start().await;

    servant.update_value(20.0).await.unwrap();
    servant.update_value(21.5).await.unwrap();

    assert_eq!(servant.get_value(), Some(Value::from(21.5)));
    let changes = events_of(&bus, types::TAG_VALUE_CHANGED);
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].get("old_value"), Some(&Value::Nil));
    assert_eq!(changes[1].get("old_value"), Some(&Value::from(20.0)));
    assert_eq!(changes[1].get("new_value"), Some(&Value::from(21.5)));
}

#[tokio::test]
async fn test_identical_values_publish_without_threshold() {
    let bus = Arc::new(EventBus::default());
    let servant = tag_servant(&bus, TagServantConfig::default());
    servant.start().await;

    assert_eq!(servant.update_value(1.0).await.unwrap(), UpdateOutcome::Applied);
    assert_eq!(servant.update_value(1.0).await.unwrap(), UpdateOutcome::Applied);
    assert_eq!(events_of(&bus, types::TAG_VALUE_CHANGED).len(), 2);
}

#[tokio::test]
async fn test_threshold_suppresses_small_changes() {
    let bus = Arc::new(EventBus::default());
    let store = Arc::new(MemoryTimeSeriesStore::new());
    let servant = TagServant::new(
        "pump_001",
        inlet_temp(),
        Arc::clone(&bus),
        Some(store.clone()),
        TagServantConfig {
            write_through: true,
            change_threshold: Some(0.1),
            ..TagServantConfig::default()
        },
    );
    servant.start().await;

    assert_eq!(servant.update_value(25.0).await.unwrap(), UpdateOutcome::Applied);
    let stamped = servant.get_last_update_time();

    assert_eq!(servant.update_value(25.05).await.unwrap(), UpdateOutcome::Suppressed);
    assert_eq!(servant.get_value(), Some(Value::from(25.0)));
    assert_eq!(servant.get_last_update_time(), stamped);
    assert_eq!(events_of(&bus, types::TAG_VALUE_CHANGED).len(), 1);

    assert_eq!(servant.update_value(26.0).await.unwrap(), UpdateOutcome::Applied);
    // Non-numeric values are never suppressed
    assert_eq!(servant.update_value("fault").await.unwrap(), UpdateOutcome::Applied);

    let stored = store
        .query_tag_values("pump_001/inlet_temp", TimeRange::all(), 10)
        .await
        .unwrap();
    let values: Vec<_> = stored.iter().map(|v| v.value.clone()).collect();
    assert_eq!(
        values,
        vec![Value::from("fault"), Value::from(26.0), Value::from(25.0)]
    );
    assert_eq!(stored[0].source, "TagServant:pump_001/inlet_temp");
}

#[tokio::test]
async fn test_no_store_writes_without_write_through() {
    let bus = Arc::new(EventBus::default());
    let store = Arc::new(MemoryTimeSeriesStore::new());
    let servant = TagServant::new(
        "pump_001",
        inlet_temp(),
        bus,
        Some(store.clone()),
        TagServantConfig::default(),
    );
    servant.start().await;
    servant.update_value(1.0).await.unwrap();

    assert_eq!(store.get_stats().await.unwrap().total_values, 0);
}

#[tokio::test]
async fn test_asset_start_announces_instance_before_tags() {
    let bus = Arc::new(EventBus::default());
    let order = Arc::new(Mutex::new(Vec::new()));
    {
        let order = Arc::clone(&order);
        bus.subscribe("*", move |e: &Event| {
            order.lock().push(e.event_type.clone());
            Ok(())
        });
    }

    let instance =
        PlacedInstance::new("pump_001", "pump").with_transform(Transform::at([1.0, 2.0, 0.0]));
    let servant = AssetServant::new(
        instance,
        pump(),
        Arc::clone(&bus),
        None,
        AssetServantConfig::default(),
    );
    assert_eq!(servant.tag_count(), 2);
    assert!(!servant.is_running());

    assert!(servant.start().await);
    assert!(!servant.start().await);
    assert!(servant.tag_servants().iter().all(|t| t.is_running()));

    assert!(servant.stop().await);
    assert!(!servant.stop().await);
    assert!(servant.tag_servants().iter().all(|t| !t.is_running()));

    assert_eq!(
        *order.lock(),
        vec![
            types::INSTANCE_CREATED,
            types::TAG_CREATED,
            types::TAG_CREATED,
            types::TAG_DELETED,
            types::TAG_DELETED,
            types::INSTANCE_DELETED,
        ]
    );

    let created = events_of(&bus, types::INSTANCE_CREATED);
    assert_eq!(created[0].get("ref_asset"), Some(&Value::from("pump")));
    assert_eq!(created[0].source, "AssetServant:pump_001");
    assert_eq!(
        created[0].get("transform").and_then(|t| t.get("translation")),
        Some(&Value::from([1.0, 2.0, 0.0]))
    );
}

#[tokio::test]
async fn test_update_transform_is_partial() {
    let bus = Arc::new(EventBus::default());
    let instance =
        PlacedInstance::new("pump_001", "pump").with_transform(Transform::at([1.0, 2.0, 0.0]));
    let servant = AssetServant::new(
        instance,
        pump(),
        Arc::clone(&bus),
        None,
        AssetServantConfig::default(),
    );

    // Allowed while stopped
    let transform = servant
        .update_transform(TransformUpdate::default().rotation([0.0, 0.0, 90.0]))
        .await;

    assert_eq!(transform.translation, [1.0, 2.0, 0.0]);
    assert_eq!(transform.rotation, [0.0, 0.0, 90.0]);
    assert_eq!(transform.scale, [1.0, 1.0, 1.0]);
    assert_eq!(servant.transform(), transform);

    let updated = events_of(&bus, types::INSTANCE_UPDATED);
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].get("transform"), Some(&transform.to_value()));
}

#[tokio::test]
async fn test_duplicate_tag_ids_keep_first() {
    let bus = Arc::new(EventBus::default());
    let definition = Arc::new(
        AssetDefinition::new("valve", "Valve")
            .with_tag(TagDefinition::new("pos", "Position", TagKind::Sensor))
            .with_tag(TagDefinition::new("pos", "Duplicate", TagKind::Actuator)),
    );
    let servant = AssetServant::new(
        PlacedInstance::new("valve_001", "valve"),
        definition,
        bus,
        None,
        AssetServantConfig::default(),
    );

    assert_eq!(servant.tag_count(), 1);
    let tag = servant.tag_servant("pos").unwrap();
    assert_eq!(tag.definition().name, "Position");
    assert!(servant.tag_servant("missing").is_none());
}

#[tokio::test]
async fn test_tag_servants_can_be_disabled() {
    let bus = Arc::new(EventBus::default());
    let servant = AssetServant::new(
        PlacedInstance::new("pump_001", "pump"),
        pump(),
        bus,
        None,
        AssetServantConfig {
            enable_tag_servants: false,
            ..AssetServantConfig::default()
        },
    );
    assert_eq!(servant.tag_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_never_land_while_stopped() {
    let bus = Arc::new(EventBus::with_history_capacity(100_000));
    let servant = Arc::new(AssetServant::new(
        PlacedInstance::new("pump_001", "pump"),
        pump(),
        Arc::clone(&bus),
        None,
        AssetServantConfig::default(),
    ));
    servant.start().await;
    let tag = servant.tag_servant("inlet_temp").unwrap();

    let mut writers = Vec::new();
    for writer in 0..4i64 {
        let tag = Arc::clone(&tag);
        writers.push(tokio::spawn(async move {
            let mut applied = 0;
            for i in 0..200 {
                let outcome = tag.update_value(writer * 1_000 + i).await.unwrap();
                if outcome == UpdateOutcome::Applied {
                    applied += 1;
                }
                tokio::task::yield_now().await;
            }
            applied
        }));
    }
    let toggler = {
        let servant = Arc::clone(&servant);
        tokio::spawn(async move {
            for _ in 0..50 {
                servant.stop().await;
                tokio::task::yield_now().await;
                servant.start().await;
                tokio::task::yield_now().await;
            }
        })
    };

    let mut applied = 0;
    for writer in writers {
        applied += writer.await.unwrap();
    }
    toggler.await.unwrap();

    let identity = Value::from("pump_001/inlet_temp");
    let mut running = false;
    let mut changes = 0;
    for event in bus.get_event_history(&EventFilter::all(), usize::MAX) {
        if event.get("tag_instance_id") != Some(&identity) {
            continue;
        }
        match event.event_type.as_str() {
            types::TAG_CREATED => running = true,
            types::TAG_DELETED => running = false,
            types::TAG_VALUE_CHANGED => {
                assert!(running, "value change published while stopped");
                changes += 1;
            }
            _ => {}
        }
    }
    assert_eq!(changes, applied);
}
