//! Access to the time-series engine that stores readings.

use crate::core::{Reading, StreamId};
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;

pub mod client;
pub mod memory;
pub mod wire;

pub use client::BtrdbClient;
pub use memory::MemoryTimeseries;

/// Readings of one stream, timestamps in nanoseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamReadings {
    pub uuid: StreamId,
    pub readings: Vec<Reading>,
}

impl StreamReadings {
    pub fn new(uuid: StreamId, readings: Vec<Reading>) -> Self {
        Self { uuid, readings }
    }
}

/// Operations the archiver needs from a time-series engine.
///
/// Time bounds are inclusive nanosecond timestamps. `prev` returns, per stream,
/// the latest reading strictly before `time`; `next` the earliest at or after it.
#[async_trait]
pub trait TimeseriesStore: Send + Sync {
    async fn add_buffer(&self, uuid: StreamId, readings: &[Reading]) -> Result<()>;

    async fn get_data(&self, ids: &[StreamId], start: u64, end: u64) -> Result<Vec<StreamReadings>>;

    async fn prev(&self, ids: &[StreamId], time: u64) -> Result<Vec<StreamReadings>>;

    async fn next(&self, ids: &[StreamId], time: u64) -> Result<Vec<StreamReadings>>;

    async fn delete_data(&self, ids: &[StreamId], start: u64, end: u64) -> Result<()>;

    fn stats(&self) -> EngineStats {
        EngineStats::default()
    }
}

/// Snapshot of engine client counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub inserted_readings: u64,
    pub requests: u64,
    pub failures: u64,
}
