//! Per-stream write coalescing.
//!
//! Readings are appended to a buffer per stream and handed to the time-series
//! engine once the buffer holds `max` readings or `timeout` has passed since it
//! was created, whichever comes first. Appends are synchronous and never wait on
//! I/O; flushing happens on a fixed set of worker tasks, each owning a shard of
//! the stream space so that a stream's buffers reach the engine in order.

use crate::core::{Reading, StreamId};
use crate::error::{GilesError, Result};
use crate::tsengine::TimeseriesStore;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

pub const DEFAULT_COALESCE_MAX: usize = 16_384;
pub const DEFAULT_COALESCE_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_FLUSH_WORKERS: usize = 8;

#[derive(Debug, Clone)]
pub struct CoalescerConfig {
    pub max: usize,
    pub timeout: Duration,
    pub workers: usize,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self { max: DEFAULT_COALESCE_MAX, timeout: DEFAULT_COALESCE_TIMEOUT, workers: DEFAULT_FLUSH_WORKERS }
    }
}

/// Accumulates readings for one stream until it is detached for flushing.
#[derive(Debug)]
pub struct StreamBuffer {
    pub uuid: StreamId,
    readings: Vec<Reading>,
    max: usize,
    generation: u64,
    sealed: bool,
    created: Instant,
}

impl StreamBuffer {
    pub fn new(uuid: StreamId, max: usize, generation: u64) -> Self {
        Self {
            uuid,
            readings: Vec::with_capacity(max.min(DEFAULT_COALESCE_MAX)),
            max,
            generation,
            sealed: false,
            created: Instant::now(),
        }
    }

    /// Appends as many readings as fit and returns how many were taken.
    pub fn append(&mut self, readings: &[Reading]) -> usize {
        if self.sealed {
            return 0;
        }
        let room = self.max - self.readings.len();
        let taken = room.min(readings.len());
        self.readings.extend_from_slice(&readings[..taken]);
        taken
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.readings.len() >= self.max
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Seals the buffer and takes its readings. Later appends are refused.
    fn seal(&mut self) -> Vec<Reading> {
        self.sealed = true;
        std::mem::take(&mut self.readings)
    }
}

#[derive(Debug, Default)]
struct CoalescerMetrics {
    readings_added: AtomicU64,
    buffers_flushed: AtomicU64,
    readings_flushed: AtomicU64,
    readings_dropped: AtomicU64,
}

/// Point-in-time copy of the coalescer counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoalescerStats {
    pub readings_added: u64,
    pub buffers_flushed: u64,
    pub readings_flushed: u64,
    pub readings_dropped: u64,
    pub active_buffers: usize,
}

struct FlushJob {
    uuid: StreamId,
    readings: Vec<Reading>,
    ack: Option<oneshot::Sender<Result<()>>>,
}

struct Inner {
    buffers: RwLock<HashMap<StreamId, Arc<Mutex<StreamBuffer>>>>,
    next_generation: AtomicU64,
    config: CoalescerConfig,
    workers: Vec<mpsc::UnboundedSender<FlushJob>>,
    runtime: Handle,
    metrics: Arc<CoalescerMetrics>,
}

/// Shared handle to the coalescer. Cloning is cheap.
#[derive(Clone)]
pub struct Coalescer {
    inner: Arc<Inner>,
}

impl Coalescer {
    /// Starts the flush workers on the current Tokio runtime.
    pub fn new(store: Arc<dyn TimeseriesStore>, config: CoalescerConfig) -> Result<Self> {
        if config.max == 0 {
            return Err(GilesError::Config("coalesce max must be at least 1".into()));
        }
        let runtime = Handle::try_current()
            .map_err(|e| GilesError::FatalStartup(format!("coalescer needs a Tokio runtime: {}", e)))?;
        let metrics = Arc::new(CoalescerMetrics::default());

        let workers = (0..config.workers.max(1))
            .map(|shard| {
                let (tx, rx) = mpsc::unbounded_channel();
                runtime.spawn(flush_worker(shard, Arc::clone(&store), rx, Arc::clone(&metrics)));
                tx
            })
            .collect();

        info!(
            target: "giles::coalescer",
            max = config.max,
            timeout_ms = config.timeout.as_millis() as u64,
            workers = config.workers.max(1),
            "Coalescer started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                buffers: RwLock::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                config,
                workers,
                runtime,
                metrics,
            }),
        })
    }

    /// Buffers readings (timestamps in nanoseconds) for `uuid`.
    ///
    /// Readings that do not fit in the current buffer go into its successor. A
    /// buffer that fills up is handed to its flush worker immediately.
    pub fn add(&self, uuid: StreamId, readings: &[Reading]) {
        let mut remaining = readings;
        self.inner.metrics.readings_added.fetch_add(readings.len() as u64, Ordering::Relaxed);

        while !remaining.is_empty() {
            let appended = {
                let buffers = self.inner.buffers.read().unwrap_or_else(PoisonError::into_inner);
                buffers.get(&uuid).map(|buffer| {
                    let mut buffer = buffer.lock().unwrap_or_else(PoisonError::into_inner);
                    let taken = buffer.append(remaining);
                    (taken, buffer.is_full(), buffer.generation())
                })
            };

            match appended {
                Some((taken, full, generation)) => {
                    remaining = &remaining[taken..];
                    if full {
                        self.inner.flush_detached(uuid, Some(generation), None);
                    }
                }
                None => self.install(uuid),
            }
        }
    }

    /// Flushes the buffer of `uuid`, if any, and waits until everything added for
    /// that stream so far has been written.
    pub async fn commit(&self, uuid: StreamId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.flush_detached(uuid, None, Some(tx));
        rx.await
            .unwrap_or_else(|_| Err(GilesError::TransientEngine("flush worker stopped".into())))
    }

    /// Flushes every buffer and waits for all workers to drain.
    pub async fn flush_all(&self) -> Result<()> {
        let mut acks = Vec::new();
        {
            let mut buffers = self.inner.buffers.write().unwrap_or_else(PoisonError::into_inner);
            for (uuid, buffer) in buffers.drain() {
                let readings = buffer.lock().unwrap_or_else(PoisonError::into_inner).seal();
                let (tx, rx) = oneshot::channel();
                self.inner.dispatch(FlushJob { uuid, readings, ack: Some(tx) });
                acks.push(rx);
            }
        }
        for worker in &self.inner.workers {
            let (tx, rx) = oneshot::channel();
            let barrier = FlushJob { uuid: StreamId::from_bytes([0; 16]), readings: Vec::new(), ack: Some(tx) };
            if worker.send(barrier).is_ok() {
                acks.push(rx);
            }
        }

        let mut first_error = None;
        for ack in acks {
            let result = ack
                .await
                .unwrap_or_else(|_| Err(GilesError::TransientEngine("flush worker stopped".into())));
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn active_buffers(&self) -> usize {
        self.inner.buffers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn config(&self) -> &CoalescerConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> CoalescerStats {
        let m = &self.inner.metrics;
        CoalescerStats {
            readings_added: m.readings_added.load(Ordering::Relaxed),
            buffers_flushed: m.buffers_flushed.load(Ordering::Relaxed),
            readings_flushed: m.readings_flushed.load(Ordering::Relaxed),
            readings_dropped: m.readings_dropped.load(Ordering::Relaxed),
            active_buffers: self.active_buffers(),
        }
    }

    /// Installs a fresh buffer for `uuid` unless another producer got there first.
    fn install(&self, uuid: StreamId) {
        let generation = {
            let mut buffers = self.inner.buffers.write().unwrap_or_else(PoisonError::into_inner);
            if buffers.contains_key(&uuid) {
                return;
            }
            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            let buffer = StreamBuffer::new(uuid, self.inner.config.max, generation);
            buffers.insert(uuid, Arc::new(Mutex::new(buffer)));
            generation
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let timeout = self.inner.config.timeout;
        self.inner.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.flush_detached(uuid, Some(generation), None);
            }
        });
    }
}

impl Inner {
    /// Removes the buffer of `uuid` from the map and queues it for flushing.
    ///
    /// With `generation` set, only the buffer of that generation is detached. An
    /// acknowledged request is always queued, even with no buffer, so it resolves
    /// after any earlier flush of the same stream.
    fn flush_detached(&self, uuid: StreamId, generation: Option<u64>, ack: Option<oneshot::Sender<Result<()>>>) {
        // Sealing and queueing happen under the map lock, so a successor buffer
        // for the same stream cannot reach the shard worker first.
        let mut buffers = self.buffers.write().unwrap_or_else(PoisonError::into_inner);
        let matches = buffers.get(&uuid).map_or(false, |buffer| {
            generation.map_or(true, |g| buffer.lock().unwrap_or_else(PoisonError::into_inner).generation() == g)
        });
        let readings = if matches {
            buffers
                .remove(&uuid)
                .map(|buffer| buffer.lock().unwrap_or_else(PoisonError::into_inner).seal())
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        if readings.is_empty() && ack.is_none() {
            return;
        }
        self.dispatch(FlushJob { uuid, readings, ack });
    }

    fn dispatch(&self, job: FlushJob) {
        let mut hasher = DefaultHasher::new();
        job.uuid.hash(&mut hasher);
        let shard = (hasher.finish() % self.workers.len() as u64) as usize;
        if let Err(mpsc::error::SendError(job)) = self.workers[shard].send(job) {
            self.metrics.readings_dropped.fetch_add(job.readings.len() as u64, Ordering::Relaxed);
            error!(target: "giles::coalescer", uuid = %job.uuid, count = job.readings.len(), "Flush worker gone, dropping readings");
            if let Some(ack) = job.ack {
                let _ = ack.send(Err(GilesError::TransientEngine("flush worker stopped".into())));
            }
        }
    }
}

async fn flush_worker(
    shard: usize,
    store: Arc<dyn TimeseriesStore>,
    mut jobs: mpsc::UnboundedReceiver<FlushJob>,
    metrics: Arc<CoalescerMetrics>,
) {
    while let Some(job) = jobs.recv().await {
        let count = job.readings.len();
        let result = if count == 0 { Ok(()) } else { store.add_buffer(job.uuid, &job.readings).await };

        match &result {
            Ok(()) if count > 0 => {
                metrics.buffers_flushed.fetch_add(1, Ordering::Relaxed);
                metrics.readings_flushed.fetch_add(count as u64, Ordering::Relaxed);
                debug!(target: "giles::coalescer", shard, uuid = %job.uuid, count, "Flushed buffer");
            }
            Ok(()) => {}
            Err(err) => {
                metrics.readings_dropped.fetch_add(count as u64, Ordering::Relaxed);
                error!(target: "giles::coalescer", shard, uuid = %job.uuid, count, error = %err, "Flush failed, readings dropped");
            }
        }

        if let Some(ack) = job.ack {
            let _ = ack.send(result);
        }
    }
    debug!(target: "giles::coalescer", shard, "Flush worker stopped");
}
