//! In-process engine, used when no external engine is configured.

use super::{EngineStats, StreamReadings, TimeseriesStore};
use crate::core::{Reading, StreamId};
use crate::error::{GilesError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Readings held in ordered per-stream maps. A later insert at the same
/// timestamp replaces the earlier value.
#[derive(Default)]
pub struct MemoryTimeseries {
    streams: RwLock<HashMap<StreamId, BTreeMap<u64, f64>>>,
    flushes: RwLock<Vec<(StreamId, usize)>>,
    inserted: AtomicU64,
    requests: AtomicU64,
}

impl MemoryTimeseries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `add_buffer` call so far, as `(stream, number of readings)`.
    pub fn flush_log(&self) -> Vec<(StreamId, usize)> {
        self.flushes.read().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn reading_count(&self, uuid: &StreamId) -> usize {
        self.streams
            .read()
            .ok()
            .and_then(|s| s.get(uuid).map(BTreeMap::len))
            .unwrap_or(0)
    }

    fn collect<Fsel>(&self, ids: &[StreamId], select: Fsel) -> Result<Vec<StreamReadings>>
    where
        Fsel: Fn(&BTreeMap<u64, f64>) -> Vec<Reading>,
    {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let streams = self.streams.read().map_err(|_| poisoned())?;
        Ok(ids
            .iter()
            .map(|id| {
                let readings = streams.get(id).map(&select).unwrap_or_default();
                StreamReadings::new(*id, readings)
            })
            .collect())
    }
}

fn poisoned() -> GilesError {
    GilesError::TransientEngine("in-memory engine lock poisoned".into())
}

#[async_trait]
impl TimeseriesStore for MemoryTimeseries {
    async fn add_buffer(&self, uuid: StreamId, readings: &[Reading]) -> Result<()> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        {
            let mut streams = self.streams.write().map_err(|_| poisoned())?;
            let series = streams.entry(uuid).or_default();
            for r in readings {
                series.insert(r.timestamp, r.value);
            }
        }
        self.flushes.write().map_err(|_| poisoned())?.push((uuid, readings.len()));
        self.inserted.fetch_add(readings.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn get_data(&self, ids: &[StreamId], start: u64, end: u64) -> Result<Vec<StreamReadings>> {
        if start > end {
            return Ok(ids.iter().map(|id| StreamReadings::new(*id, Vec::new())).collect());
        }
        self.collect(ids, |series| {
            series.range(start..=end).map(|(t, v)| Reading::new(*t, *v)).collect()
        })
    }

    async fn prev(&self, ids: &[StreamId], time: u64) -> Result<Vec<StreamReadings>> {
        self.collect(ids, |series| {
            series.range(..time).next_back().map(|(t, v)| Reading::new(*t, *v)).into_iter().collect()
        })
    }

    async fn next(&self, ids: &[StreamId], time: u64) -> Result<Vec<StreamReadings>> {
        self.collect(ids, |series| {
            series.range(time..).next().map(|(t, v)| Reading::new(*t, *v)).into_iter().collect()
        })
    }

    async fn delete_data(&self, ids: &[StreamId], start: u64, end: u64) -> Result<()> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let mut streams = self.streams.write().map_err(|_| poisoned())?;
        for id in ids {
            if let Some(series) = streams.get_mut(id) {
                series.retain(|t, _| *t < start || *t > end);
            }
        }
        Ok(())
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            inserted_readings: self.inserted.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            failures: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_range_and_nearest() {
        let engine = MemoryTimeseries::new();
        let id = StreamId::new_v4();
        let readings: Vec<Reading> = (1..=5).map(|i| Reading::new(i * 10, i as f64)).collect();
        engine.add_buffer(id, &readings).await.unwrap();

        let range = engine.get_data(&[id], 20, 40).await.unwrap();
        assert_eq!(range[0].readings.len(), 3);

        let prev = engine.prev(&[id], 30).await.unwrap();
        assert_eq!(prev[0].readings, vec![Reading::new(20, 2.0)]);

        let next = engine.next(&[id], 30).await.unwrap();
        assert_eq!(next[0].readings, vec![Reading::new(30, 3.0)]);

        let none = engine.prev(&[id], 10).await.unwrap();
        assert!(none[0].readings.is_empty());
    }

    #[tokio::test]
    async fn test_delete_range() {
        let engine = MemoryTimeseries::new();
        let id = StreamId::new_v4();
        let readings: Vec<Reading> = (1..=5).map(|i| Reading::new(i, 0.0)).collect();
        engine.add_buffer(id, &readings).await.unwrap();
        engine.delete_data(&[id], 2, 4).await.unwrap();
        assert_eq!(engine.reading_count(&id), 2);
        assert_eq!(engine.flush_log(), vec![(id, 5)]);
    }
}
