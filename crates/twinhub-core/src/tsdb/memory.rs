//! In-memory time-series store for testing and development

use super::{StoreStats, TagValue, TimeRange, TimeSeriesStore};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

struct Sample {
    seq: u64,
    value: TagValue,
}

#[derive(Default)]
struct Series {
    /// Sorted by (timestamp, seq)
    by_tag: HashMap<String, Vec<Sample>>,
    next_seq: u64,
}

impl Series {
    fn insert(&mut self, value: TagValue) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let samples = self.by_tag.entry(value.tag_id.clone()).or_default();
        let at = samples.partition_point(|s| s.value.timestamp <= value.timestamp);
        samples.insert(at, Sample { seq, value });
    }
}

/// In-memory time-series store (non-persistent)
#[derive(Default)]
pub struct MemoryTimeSeriesStore {
    series: RwLock<Series>,
}

impl MemoryTimeSeriesStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryTimeSeriesStore {
    async fn write_tag_value(&self, value: TagValue) -> Result<()> {
        value.validate()?;
        self.series.write().insert(value);
        Ok(())
    }

    async fn write_tag_values(&self, values: Vec<TagValue>) -> Result<usize> {
        for value in &values {
            value.validate()?;
        }
        let count = values.len();
        let mut series = self.series.write();
        for value in values {
            series.insert(value);
        }
        Ok(count)
    }

    async fn query_tag_values(
        &self,
        tag_id: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<TagValue>> {
        let series = self.series.read();
        let Some(samples) = series.by_tag.get(tag_id) else {
            return Ok(Vec::new());
        };
        Ok(samples
            .iter()
            .rev()
            .filter(|s| range.contains(s.value.timestamp))
            .take(limit)
            .map(|s| s.value.clone())
            .collect())
    }

    async fn query_latest_value(&self, tag_id: &str) -> Result<Option<TagValue>> {
        let series = self.series.read();
        Ok(series
            .by_tag
            .get(tag_id)
            .and_then(|samples| samples.iter().max_by_key(|s| (s.value.timestamp, s.seq)))
            .map(|s| s.value.clone()))
    }

    async fn delete_tag_values(&self, tag_id: &str, range: TimeRange) -> Result<usize> {
        let mut series = self.series.write();
        let Some(samples) = series.by_tag.get_mut(tag_id) else {
            return Ok(0);
        };
        let before = samples.len();
        samples.retain(|s| !range.contains(s.value.timestamp));
        let removed = before - samples.len();
        if samples.is_empty() {
            series.by_tag.remove(tag_id);
        }
        Ok(removed)
    }

    async fn get_stats(&self) -> Result<StoreStats> {
        let series = self.series.read();
        Ok(StoreStats {
            total_values: series.by_tag.values().map(Vec::len).sum(),
            distinct_tags: series.by_tag.len(),
            storage_bytes: 0,
        })
    }
}
