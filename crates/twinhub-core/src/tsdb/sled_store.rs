//! `Sled`-based time-series store
//!
//! Keys are `[tag len: u32][tag bytes][seconds][nanos][seq]`, all
//! big-endian, so one tag's values are contiguous and ordered by time then
//! by write.

use super::{StoreStats, TagValue, TimeRange, TimeSeriesStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sled::{Batch, Db, Tree};
use std::path::Path;

const TREE: &str = "tag_values";

/// `Sled`-based persistent time-series store
pub struct SledTimeSeriesStore {
    db: Db,
    values: Tree,
}

impl SledTimeSeriesStore {
    /// Open (or create) a store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// Store backed by a temporary database removed on drop
    pub fn temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    /// Share an already open database
    pub fn from_db(db: Db) -> Result<Self> {
        let values = db.open_tree(TREE)?;
        Ok(Self { db, values })
    }

    fn key(&self, value: &TagValue) -> Result<Vec<u8>> {
        let seq = self.db.generate_id()?;
        let mut key = series_prefix(&value.tag_id);
        key.extend_from_slice(&time_bytes(value.timestamp));
        key.extend_from_slice(&seq.to_be_bytes());
        Ok(key)
    }

    fn encode(value: &TagValue) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(value, bincode::config::standard())?)
    }

    fn decode(bytes: &[u8]) -> Result<TagValue> {
        Ok(
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map(|(decoded, _)| decoded)?,
        )
    }

    /// Inclusive key bounds for `range` within one tag
    fn bounds(tag_id: &str, range: TimeRange) -> (Vec<u8>, Vec<u8>) {
        let prefix = series_prefix(tag_id);

        let mut lower = prefix.clone();
        if let Some(start) = range.start {
            lower.extend_from_slice(&time_bytes(start));
        }

        let mut upper = prefix;
        match range.end {
            Some(end) => upper.extend_from_slice(&time_bytes(end)),
            None => upper.extend_from_slice(&[0xff; TIME_LEN]),
        }
        upper.extend_from_slice(&[0xff; 8]);

        (lower, upper)
    }
}

fn series_prefix(tag_id: &str) -> Vec<u8> {
    let bytes = tag_id.as_bytes();
    let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
    let mut prefix = Vec::with_capacity(4 + bytes.len() + TIME_LEN + 8);
    prefix.extend_from_slice(&len.to_be_bytes());
    prefix.extend_from_slice(bytes);
    prefix
}

const TIME_LEN: usize = 12;

/// Seconds with the sign bit flipped, then subsecond nanos, so byte order
/// matches time order at full precision
fn time_bytes(ts: DateTime<Utc>) -> [u8; TIME_LEN] {
    let secs = (ts.timestamp() as u64) ^ (1 << 63);
    let mut bytes = [0; TIME_LEN];
    bytes[..8].copy_from_slice(&secs.to_be_bytes());
    bytes[8..].copy_from_slice(&ts.timestamp_subsec_nanos().to_be_bytes());
    bytes
}

#[async_trait]
impl TimeSeriesStore for SledTimeSeriesStore {
    async fn write_tag_value(&self, value: TagValue) -> Result<()> {
        value.validate()?;
        let key = self.key(&value)?;
        self.values.insert(key, Self::encode(&value)?)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn write_tag_values(&self, values: Vec<TagValue>) -> Result<usize> {
        let mut batch = Batch::default();
        for value in &values {
            value.validate()?;
            batch.insert(self.key(value)?, Self::encode(value)?);
        }
        self.values.apply_batch(batch)?;
        self.db.flush_async().await?;
        Ok(values.len())
    }

    async fn query_tag_values(
        &self,
        tag_id: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<TagValue>> {
        let (lower, upper) = Self::bounds(tag_id, range);
        let mut out = Vec::new();
        for item in self.values.range(lower..=upper).rev().take(limit) {
            let (_, bytes) = item?;
            out.push(Self::decode(&bytes)?);
        }
        Ok(out)
    }

    async fn query_latest_value(&self, tag_id: &str) -> Result<Option<TagValue>> {
        match self.values.scan_prefix(series_prefix(tag_id)).next_back() {
            Some(item) => {
                let (_, bytes) = item?;
                Ok(Some(Self::decode(&bytes)?))
            }
            None => Ok(None),
        }
    }

    async fn delete_tag_values(&self, tag_id: &str, range: TimeRange) -> Result<usize> {
        let (lower, upper) = Self::bounds(tag_id, range);
        let mut batch = Batch::default();
        let mut count = 0;
        for item in self.values.range(lower..=upper) {
            let (key, _) = item?;
            batch.remove(key);
            count += 1;
        }
        self.values.apply_batch(batch)?;
        self.db.flush_async().await?;
        Ok(count)
    }

    async fn get_stats(&self) -> Result<StoreStats> {
        let mut distinct_tags = 0;
        let mut last_prefix: Option<Vec<u8>> = None;
        for item in self.values.iter() {
            let (key, _) = item?;
            let prefix = key_prefix(&key).ok_or_else(|| Error::CorruptKey(TREE.to_string()))?;
            if last_prefix.as_deref() != Some(prefix) {
                distinct_tags += 1;
                last_prefix = Some(prefix.to_vec());
            }
        }
        Ok(StoreStats {
            total_values: self.values.len(),
            distinct_tags,
            storage_bytes: self.db.size_on_disk()?,
        })
    }
}

/// The `[len][tag]` part of a value key
fn key_prefix(key: &[u8]) -> Option<&[u8]> {
    let len_bytes: [u8; 4] = key.get(..4)?.try_into().ok()?;
    let len = usize::try_from(u32::from_be_bytes(len_bytes)).ok()?;
    key.get(..4 + len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_time_bytes_preserve_order() {
        let before_epoch = Utc.timestamp_opt(-10, 0).unwrap();
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        let later = Utc.timestamp_opt(10, 0).unwrap();
        assert!(time_bytes(before_epoch) < time_bytes(epoch));
        assert!(time_bytes(epoch) < time_bytes(later));
    }

    #[test]
    fn test_time_bytes_keep_nanoseconds() {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let plus_100ns = base + chrono::TimeDelta::nanoseconds(100);
        let before = Utc.timestamp_opt(1_699_999_999, 999_999_999).unwrap();
        assert!(time_bytes(base) < time_bytes(plus_100ns));
        assert!(time_bytes(before) < time_bytes(base));
    }

    #[test]
    fn test_prefixes_do_not_collide() {
        let a = series_prefix("ab");
        let b = series_prefix("a");
        assert!(!a.starts_with(&b));
        assert_eq!(key_prefix(&a), Some(a.as_slice()));
    }
}
