//! Walkthrough: build a small plant, drive some values, inspect the results

use std::sync::Arc;
use std::time::Duration;
use twinhub_core::event::types;
use twinhub_core::queue::forward_events;
use twinhub_core::tsdb::{AggregationFunction, MemoryTimeSeriesStore};
use twinhub_core::{
    AssetDefinition, Event, PlacedInstance, Runtime, RuntimeConfig, SiteLayout, TagDefinition,
    TagIdentity, TagKind, TimeSeriesStore, Transform, TransformUpdate,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    println!("=== TwinHub Plant Demo ===\n");

    let store = Arc::new(MemoryTimeSeriesStore::new());
    let runtime = Runtime::with_store(
        RuntimeConfig {
            change_threshold: Some(0.1),
            ..RuntimeConfig::default()
        },
        store.clone(),
    );

    runtime.load_asset_definitions([
        AssetDefinition::new("pump", "Centrifugal Pump")
            .with_tag(
                TagDefinition::new("inlet_temp", "Inlet Temperature", TagKind::Sensor)
                    .with_unit("degC"),
            )
            .with_tag(TagDefinition::new("speed", "Speed", TagKind::Setpoint).with_unit("rpm")),
        AssetDefinition::new("tank", "Buffer Tank")
            .with_tag(TagDefinition::new("level", "Level", TagKind::Sensor).with_unit("m")),
    ]);
    runtime.load_layout(
        SiteLayout::new("plant_a", "Plant A")
            .with_area(
                "pump_house",
                [
                    PlacedInstance::new("pump_001", "pump")
                        .with_transform(Transform::at([0.0, 0.0, 0.0])),
                    PlacedInstance::new("pump_002", "pump")
                        .with_transform(Transform::at([4.0, 0.0, 0.0])),
                ],
            )
            .with_area(
                "tank_farm",
                [
                    PlacedInstance::new("tank_001", "tank"),
                    PlacedInstance::new("mixer_001", "mixer"),
                ],
            ),
    );

    runtime.bus().subscribe(types::TAG_VALUE_CHANGED, |event: &Event| {
        println!(
            "  {} -> {}",
            event.get("tag_instance_id").map(ToString::to_string).unwrap_or_default(),
            event.get("new_value").map(ToString::to_string).unwrap_or_default(),
        );
        Ok(())
    });
    let audit = runtime.queues().get_queue("audit")?;
    forward_events(runtime.bus(), "*", Arc::clone(&audit));

    let generated = runtime.generate_servants().await?;
    println!("Generated {generated} asset servants (mixer_001 has no definition)\n");
    runtime.start_all_servants().await?;

    println!("Value changes:");
    let temp = TagIdentity::new("pump_001", "inlet_temp");
    for reading in [25.0, 25.05, 26.0, 27.5] {
        let outcome = runtime.update_tag_value(&temp, reading).await?;
        if outcome != twinhub_core::UpdateOutcome::Applied {
            println!("  {temp} {reading} -> {outcome:?}");
        }
    }
    runtime
        .update_tag_value(&TagIdentity::new("tank_001", "level"), 2.4)
        .await?;

    if let Some(pump) = runtime.asset_servant("pump_002") {
        let moved = pump
            .update_transform(TransformUpdate::default().rotation([0.0, 0.0, 90.0]))
            .await;
        println!("\npump_002 rotated to {:?}", moved.rotation);
    }

    let start = chrono::Utc::now() - chrono::TimeDelta::minutes(1);
    let end = chrono::Utc::now();
    let avg = store
        .query_aggregated_values(
            &temp.to_string(),
            start,
            end,
            AggregationFunction::Avg,
            Duration::ZERO,
        )
        .await?;
    if let Some(bucket) = avg.first() {
        println!("\nAverage {temp}: {:.2} over {} samples", bucket.value, bucket.count);
    }

    runtime.stop_all_servants().await?;

    let stats = runtime.stats();
    println!("\nRuntime stats:");
    println!("  asset servants: {}", stats.asset_servants);
    println!("  tag servants: {}", stats.tag_servants);
    println!("  events published: {}", stats.bus.total_published);
    println!("  audit queue: {} messages", audit.size());

    Ok(())
}
