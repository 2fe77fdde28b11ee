//! Client for the framed time-series engine protocol.

use super::wire::{self, Command, FramePool, RawRecord, Request, Response, ResponseKind, STATUS_OK};
use super::{EngineStats, StreamReadings, TimeseriesStore};
use crate::core::{Reading, StreamId, MAX_TIMESTAMP_NS};
use crate::error::{GilesError, Result};
use crate::pool::{Connection, ConnectionFactory, ConnectionPool};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Frame buffers kept around for inserts.
const RETAINED_FRAMES: usize = 16;
/// Initial capacity of a frame buffer, enough for a full coalesced buffer.
const FRAME_CAPACITY: usize = 16_384 * 16 + 64;

/// Talks to the engine over pooled connections. Each call borrows one connection
/// and runs its per-stream requests over it in order.
pub struct BtrdbClient<F: ConnectionFactory> {
    pool: Arc<ConnectionPool<F>>,
    frames: FramePool,
    echo: AtomicU64,
    inserted: AtomicU64,
    requests: AtomicU64,
    failures: AtomicU64,
}

impl<F: ConnectionFactory> BtrdbClient<F> {
    pub fn new(pool: Arc<ConnectionPool<F>>) -> Self {
        Self {
            pool,
            frames: FramePool::new(RETAINED_FRAMES, FRAME_CAPACITY),
            echo: AtomicU64::new(1),
            inserted: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<F>> {
        &self.pool
    }

    /// Runs `commands` in order over one borrowed connection.
    ///
    /// Stops at the first failure. A transport, framing or protocol failure leaves
    /// the stream position unknown, so that connection is closed before release.
    async fn run(&self, commands: Vec<Command>) -> Result<Vec<Vec<RawRecord>>> {
        let mut frame = self.frames.take();
        let mut lease = self.pool.lease().await;
        let mut results = Vec::with_capacity(commands.len());
        let mut outcome = Ok(());

        for command in commands {
            let request = Request { echo_tag: self.echo.fetch_add(1, Ordering::Relaxed), command };
            self.requests.fetch_add(1, Ordering::Relaxed);
            match exchange(lease.conn(), &request, &mut frame).await {
                Ok(records) => results.push(records),
                Err(err) => {
                    if !matches!(err, GilesError::TransientEngine(_)) {
                        lease.conn().close();
                    }
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(target: "giles::tsengine", error = %err, echo_tag = request.echo_tag, "Engine request failed");
                    outcome = Err(err);
                    break;
                }
            }
        }
        lease.release();
        self.frames.give(frame);

        match outcome {
            Ok(()) => Ok(results),
            Err(GilesError::TransientEngine(msg)) => Err(GilesError::TransientEngine(msg)),
            Err(other) => Err(GilesError::TransientEngine(other.to_string())),
        }
    }

    async fn nearest(&self, ids: &[StreamId], time: u64, backward: bool) -> Result<Vec<StreamReadings>> {
        let commands = ids
            .iter()
            .map(|id| Command::QueryNearestValue { uuid: *id.as_bytes(), time: to_wire_time(time), backward })
            .collect();
        let results = self.run(commands).await?;
        Ok(zip_readings(ids, results))
    }
}

/// Response kind the engine answers `command` with.
fn expected_kind(command: &Command) -> ResponseKind {
    match command {
        Command::InsertValues { .. } | Command::DeleteValues { .. } => ResponseKind::Void,
        Command::QueryStandardValues { .. } | Command::QueryNearestValue { .. } => ResponseKind::Records,
    }
}

async fn exchange<C: Connection>(conn: &mut C, request: &Request, frame: &mut Vec<u8>) -> Result<Vec<RawRecord>> {
    wire::encode_into(request, frame)?;
    wire::write_frame(conn, frame).await?;

    let expected = expected_kind(&request.command);
    let mut records = Vec::new();
    loop {
        wire::read_frame(conn, frame).await?;
        let response: Response = wire::decode(frame)?;
        if response.echo_tag != request.echo_tag {
            return Err(GilesError::Codec(format!(
                "echo tag mismatch: sent {}, got {}",
                request.echo_tag, response.echo_tag
            )));
        }
        if response.status_code != STATUS_OK {
            if !response.is_final {
                return Err(GilesError::Codec(format!(
                    "engine status {} on a non-final frame",
                    response.status_code
                )));
            }
            return Err(GilesError::TransientEngine(format!("engine returned status {}", response.status_code)));
        }
        if response.which != expected {
            return Err(GilesError::Codec(format!(
                "expected a {:?} response, got {:?}",
                expected, response.which
            )));
        }
        records.extend(response.records);
        if response.is_final {
            return Ok(records);
        }
    }
}

fn zip_readings(ids: &[StreamId], results: Vec<Vec<RawRecord>>) -> Vec<StreamReadings> {
    ids.iter()
        .zip(results)
        .map(|(id, records)| StreamReadings::new(*id, from_records(records)))
        .collect()
}

fn to_wire_time(t: u64) -> i64 {
    t.min(MAX_TIMESTAMP_NS) as i64
}

fn from_records(records: Vec<RawRecord>) -> Vec<Reading> {
    records
        .into_iter()
        .filter(|r| r.time >= 0)
        .map(|r| Reading::new(r.time as u64, r.value))
        .collect()
}

#[async_trait]
impl<F: ConnectionFactory> TimeseriesStore for BtrdbClient<F> {
    async fn add_buffer(&self, uuid: StreamId, readings: &[Reading]) -> Result<()> {
        if readings.is_empty() {
            return Ok(());
        }
        let values = readings
            .iter()
            .map(|r| RawRecord { time: to_wire_time(r.timestamp), value: r.value })
            .collect();
        self.run(vec![Command::InsertValues { uuid: *uuid.as_bytes(), sync: false, values }]).await?;
        self.inserted.fetch_add(readings.len() as u64, Ordering::Relaxed);
        debug!(target: "giles::tsengine", %uuid, count = readings.len(), "Inserted readings");
        Ok(())
    }

    async fn get_data(&self, ids: &[StreamId], start: u64, end: u64) -> Result<Vec<StreamReadings>> {
        let commands = ids
            .iter()
            .map(|id| Command::QueryStandardValues {
                uuid: *id.as_bytes(),
                start: to_wire_time(start),
                end: to_wire_time(end),
            })
            .collect();
        let results = self.run(commands).await?;
        Ok(zip_readings(ids, results))
    }

    async fn prev(&self, ids: &[StreamId], time: u64) -> Result<Vec<StreamReadings>> {
        self.nearest(ids, time, true).await
    }

    async fn next(&self, ids: &[StreamId], time: u64) -> Result<Vec<StreamReadings>> {
        self.nearest(ids, time, false).await
    }

    async fn delete_data(&self, ids: &[StreamId], start: u64, end: u64) -> Result<()> {
        let commands = ids
            .iter()
            .map(|id| Command::DeleteValues { uuid: *id.as_bytes(), start: to_wire_time(start), end: to_wire_time(end) })
            .collect();
        self.run(commands).await?;
        Ok(())
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            inserted_readings: self.inserted.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
