//! Time-series persistence for tag values
//!
//! Values are append-only. Range queries return newest first; when two
//! values share a timestamp the later write wins.

pub mod memory;
pub mod sled_store;

pub use memory::MemoryTimeSeriesStore;
pub use sled_store::SledTimeSeriesStore;

use crate::error::{Error, Result};
use crate::value::Value;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Quality reported for values that carry no quality of their own
pub const GOOD_QUALITY: u8 = 100;

/// One timestamped reading of a tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagValue {
    pub tag_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: Value,
    /// 0 (bad) to 100 (good)
    pub quality: u8,
    pub source: String,
}

impl TagValue {
    pub fn new(
        tag_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            tag_id: tag_id.into(),
            timestamp,
            value: value.into(),
            quality: GOOD_QUALITY,
            source: String::new(),
        }
    }

    #[must_use]
    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.quality > GOOD_QUALITY {
            return Err(Error::InvalidQuality {
                tag_id: self.tag_id.clone(),
                quality: self.quality,
            });
        }
        Ok(())
    }
}

/// Inclusive time window; an unset bound is open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn since(start: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn until(end: DateTime<Utc>) -> Self {
        Self {
            start: None,
            end: Some(end),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts <= e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationFunction {
    Avg,
    Min,
    Max,
    Sum,
    Count,
    /// Value at the earliest timestamp in the bucket
    First,
    /// Value at the latest timestamp in the bucket
    Last,
    /// Population standard deviation
    StdDev,
}

impl fmt::Display for AggregationFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Count => "count",
            Self::First => "first",
            Self::Last => "last",
            Self::StdDev => "stddev",
        };
        f.write_str(name)
    }
}

/// One aggregate over one bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedValue {
    pub tag_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub function: AggregationFunction,
    pub value: f64,
    /// Numeric samples that went into the bucket
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total_values: usize,
    pub distinct_tags: usize,
    /// On-disk footprint; 0 for in-memory stores
    pub storage_bytes: u64,
}

/// Append/query contract shared by every backend
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    async fn write_tag_value(&self, value: TagValue) -> Result<()>;

    /// All-or-nothing batch write; returns the number of values written
    async fn write_tag_values(&self, values: Vec<TagValue>) -> Result<usize>;

    /// Values in `range`, newest first, at most `limit`
    async fn query_tag_values(
        &self,
        tag_id: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<TagValue>>;

    async fn query_latest_value(&self, tag_id: &str) -> Result<Option<TagValue>>;

    /// Aggregate numeric values in `[start, end]` per `interval` bucket.
    ///
    /// Buckets are aligned to `start`; a zero interval aggregates the whole
    /// range. A sample exactly at `end` belongs to the last bucket. Empty
    /// buckets are omitted.
    async fn query_aggregated_values(
        &self,
        tag_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        function: AggregationFunction,
        interval: Duration,
    ) -> Result<Vec<AggregatedValue>> {
        if start > end {
            return Err(Error::InvalidRange);
        }
        let mut samples = self
            .query_tag_values(tag_id, TimeRange::between(start, end), usize::MAX)
            .await?;
        samples.reverse();
        Ok(aggregate(tag_id, &samples, start, end, function, interval))
    }

    /// Remove values in `range`; returns how many were removed
    async fn delete_tag_values(&self, tag_id: &str, range: TimeRange) -> Result<usize>;

    async fn get_stats(&self) -> Result<StoreStats>;
}

/// Bucket oldest-first `samples` and fold each bucket with `function`
pub(crate) fn aggregate(
    tag_id: &str,
    samples: &[TagValue],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    function: AggregationFunction,
    interval: Duration,
) -> Vec<AggregatedValue> {
    let width_us = i64::try_from(interval.as_micros())
        .ok()
        .filter(|w| *w > 0);
    let span_us = (end - start).num_microseconds().unwrap_or(i64::MAX);
    // Index of the bucket that closes at `end`
    let last_index = width_us.map_or(0, |w| (span_us.max(1) - 1) / w);

    let mut buckets: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    for sample in samples {
        let Some(x) = sample.value.as_f64() else {
            continue;
        };
        let index = match width_us {
            Some(w) => (sample.timestamp - start)
                .num_microseconds()
                .map_or(last_index, |offset| offset / w)
                .min(last_index),
            None => 0,
        };
        buckets.entry(index).or_default().push(x);
    }

    buckets
        .into_iter()
        .map(|(index, xs)| {
            let (bucket_start, bucket_end) = match width_us {
                Some(w) => {
                    let bucket_start = start + TimeDelta::microseconds(index.saturating_mul(w));
                    let bucket_end = (bucket_start + TimeDelta::microseconds(w)).min(end);
                    (bucket_start, bucket_end)
                }
                None => (start, end),
            };
            AggregatedValue {
                tag_id: tag_id.to_string(),
                start_time: bucket_start,
                end_time: bucket_end,
                function,
                value: fold(function, &xs),
                count: xs.len(),
            }
        })
        .collect()
}

fn fold(function: AggregationFunction, xs: &[f64]) -> f64 {
    let n = xs.len() as f64;
    let sum: f64 = xs.iter().sum();
    match function {
        AggregationFunction::Avg => sum / n,
        AggregationFunction::Min => xs.iter().copied().fold(f64::INFINITY, f64::min),
        AggregationFunction::Max => xs.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggregationFunction::Sum => sum,
        AggregationFunction::Count => n,
        AggregationFunction::First => xs.first().copied().unwrap_or(f64::NAN),
        AggregationFunction::Last => xs.last().copied().unwrap_or(f64::NAN),
        AggregationFunction::StdDev => {
            let mean = sum / n;
            (xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n).sqrt()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn series(points: &[(i64, f64)]) -> Vec<TagValue> {
        points
            .iter()
            .map(|(s, v)| TagValue::new("t", at(*s), *v))
            .collect()
    }

    #[test]
    fn test_single_bucket_when_interval_is_zero() {
        let samples = series(&[(0, 1.0), (10, 3.0), (20, 5.0)]);
        let out = aggregate(
            "t",
            &samples,
            at(0),
            at(30),
            AggregationFunction::Avg,
            Duration::ZERO,
        );

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, 3.0);
        assert_eq!(out[0].count, 3);
        assert_eq!(out[0].start_time, at(0));
        assert_eq!(out[0].end_time, at(30));
    }

    #[test]
    fn test_windowed_buckets() {
        let samples = series(&[(0, 1.0), (5, 2.0), (10, 10.0), (25, 7.0)]);
        let out = aggregate(
            "t",
            &samples,
            at(0),
            at(30),
            AggregationFunction::Sum,
            Duration::from_secs(10),
        );

        let sums: Vec<_> = out.iter().map(|a| (a.start_time, a.value)).collect();
        assert_eq!(sums, vec![(at(0), 3.0), (at(10), 10.0), (at(20), 7.0)]);
        assert_eq!(out[2].end_time, at(30));
    }

    #[test]
    fn test_sample_at_end_joins_last_bucket() {
        let samples = series(&[(0, 1.0), (15, 2.0), (20, 4.0)]);
        let out = aggregate(
            "t",
            &samples,
            at(0),
            at(20),
            AggregationFunction::Sum,
            Duration::from_secs(10),
        );

        let sums: Vec<_> = out
            .iter()
            .map(|a| (a.start_time, a.end_time, a.value))
            .collect();
        assert_eq!(sums, vec![(at(0), at(10), 1.0), (at(10), at(20), 6.0)]);
    }

    #[test]
    fn test_first_last_and_stddev() {
        let samples = series(&[
            (0, 2.0),
            (1, 4.0),
            (2, 4.0),
            (3, 4.0),
            (4, 5.0),
            (5, 5.0),
            (6, 7.0),
            (7, 9.0),
        ]);
        let whole = |function| aggregate("t", &samples, at(0), at(10), function, Duration::ZERO);
        let first = whole(AggregationFunction::First);
        let last = whole(AggregationFunction::Last);
        let sd = whole(AggregationFunction::StdDev);

        assert_eq!(first[0].value, 2.0);
        assert_eq!(last[0].value, 9.0);
        assert!((sd[0].value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_non_numeric_values_are_skipped() {
        let mut samples = series(&[(0, 1.0)]);
        samples.push(TagValue::new("t", at(1), "open"));
        let out = aggregate(
            "t",
            &samples,
            at(0),
            at(10),
            AggregationFunction::Count,
            Duration::ZERO,
        );
        assert_eq!(out[0].value, 1.0);
    }

    #[test]
    fn test_quality_validation() {
        assert!(TagValue::new("t", at(0), 1.0).validate().is_ok());
        assert!(matches!(
            TagValue::new("t", at(0), 1.0).with_quality(101).validate(),
            Err(Error::InvalidQuality { quality: 101, .. })
        ));
    }
}
