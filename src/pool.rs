//! Bounded pool of long-lived transport connections.
//!
//! Connections are created lazily up to `max` through a [`ConnectionFactory`],
//! retried with exponential back-off when the factory fails. Callers that observe
//! an I/O failure close the connection before handing it back; the pool then
//! drops it and frees its slot instead of lending it out again.

use crate::error::{GilesError, Result};
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, info, warn};

/// A transport connection that can be lent out by a [`ConnectionPool`].
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    fn is_closed(&self) -> bool;

    /// Marks the connection unusable. The underlying transport is released on drop.
    fn close(&mut self);
}

/// Creates new connections for the pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Conn: Connection;

    async fn connect(&self) -> io::Result<Self::Conn>;
}

/// Plain TCP connection.
pub struct TcpConnection {
    stream: TcpStream,
    closed: bool,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Self {
        // Frames are small and latency matters more than packet count.
        let _ = stream.set_nodelay(true);
        Self { stream, closed: false }
    }
}

impl Connection for TcpConnection {
    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

impl AsyncRead for TcpConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Connects to a fixed TCP address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub address: String,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into() }
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnector {
    type Conn = TcpConnection;

    async fn connect(&self) -> io::Result<TcpConnection> {
        let stream = TcpStream::connect(&self.address).await?;
        Ok(TcpConnection::new(stream))
    }
}

/// Exponential back-off applied when the factory fails.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub ceiling: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { initial: Duration::from_millis(100), ceiling: Duration::from_secs(600) }
    }
}

impl Backoff {
    fn next(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.ceiling)
    }
}

/// Counters exposed for the periodic statistics log.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub created: AtomicU64,
    pub discarded: AtomicU64,
    pub connect_failures: AtomicU64,
}

/// Bounded connection pool.
pub struct ConnectionPool<F: ConnectionFactory> {
    factory: F,
    max: usize,
    backoff: Backoff,
    free_tx: mpsc::Sender<F::Conn>,
    free_rx: Mutex<mpsc::Receiver<F::Conn>>,
    live: AtomicUsize,
    capacity_freed: Notify,
    stats: PoolStats,
}

/// Holds a reserved slot; releases it unless a connection was created into it.
struct SlotReservation<'a, F: ConnectionFactory> {
    pool: &'a ConnectionPool<F>,
    armed: bool,
}

impl<F: ConnectionFactory> Drop for SlotReservation<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_slot();
        }
    }
}

/// A connection borrowed through [`ConnectionPool::lease`].
///
/// Dropping a lease without [`Lease::release`] discards the connection and frees
/// its slot, so a request future cancelled mid-exchange never strands capacity.
pub struct Lease<'a, F: ConnectionFactory> {
    conn: F::Conn,
    slot: SlotReservation<'a, F>,
}

impl<'a, F: ConnectionFactory> Lease<'a, F> {
    pub fn conn(&mut self) -> &mut F::Conn {
        &mut self.conn
    }

    /// Hands the connection back; a closed one is discarded by [`ConnectionPool::put`].
    pub fn release(self) {
        let Lease { conn, mut slot } = self;
        slot.armed = false;
        slot.pool.put(conn);
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Builds the pool and eagerly opens `max / 2` connections.
    ///
    /// Fails with [`GilesError::FatalStartup`] when an initial connection cannot be
    /// made before the back-off delay reaches its ceiling.
    pub async fn new(factory: F, max: usize, backoff: Backoff) -> Result<Self> {
        if max == 0 {
            return Err(GilesError::Config("connection pool size must be at least 1".into()));
        }
        let (free_tx, free_rx) = mpsc::channel(max);
        let pool = Self {
            factory,
            max,
            backoff,
            free_tx,
            free_rx: Mutex::new(free_rx),
            live: AtomicUsize::new(0),
            capacity_freed: Notify::new(),
            stats: PoolStats::default(),
        };

        for _ in 0..max / 2 {
            let conn = pool.connect_bounded().await?;
            pool.live.fetch_add(1, Ordering::SeqCst);
            pool.put(conn);
        }
        info!(target: "giles::pool", max, initial = max / 2, "Connection pool ready");
        Ok(pool)
    }

    /// Borrows a connection, creating one if the pool is below `max`.
    ///
    /// Never returns a closed connection. Waits for a returned connection when the
    /// pool is at capacity.
    pub async fn get(&self) -> F::Conn {
        loop {
            if let Some(conn) = self.try_pop() {
                return conn;
            }

            if let Some(mut reservation) = self.try_reserve() {
                let conn = self.connect_forever().await;
                reservation.armed = false;
                return conn;
            }

            let freed = self.capacity_freed.notified();
            tokio::pin!(freed);
            let mut rx = self.free_rx.lock().await;
            tokio::select! {
                conn = rx.recv() => {
                    match conn {
                        Some(conn) if conn.is_closed() => self.discard(),
                        Some(conn) => return conn,
                        None => {}
                    }
                }
                _ = &mut freed => {}
            }
        }
    }

    /// Borrows a connection that is discarded unless explicitly released.
    pub async fn lease(&self) -> Lease<'_, F> {
        let conn = self.get().await;
        Lease { conn, slot: SlotReservation { pool: self, armed: true } }
    }

    /// Returns a connection to the pool.
    pub fn put(&self, conn: F::Conn) {
        if conn.is_closed() {
            self.discard();
            return;
        }
        if let Err(err) = self.free_tx.try_send(conn) {
            let (mpsc::error::TrySendError::Full(mut conn)
            | mpsc::error::TrySendError::Closed(mut conn)) = err;
            conn.close();
            self.discard();
        }
    }

    /// Connections currently alive, lent out or idle.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Idle connections waiting in the pool.
    pub fn free_count(&self) -> usize {
        self.max - self.free_tx.capacity()
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    fn try_pop(&self) -> Option<F::Conn> {
        let mut rx = self.free_rx.try_lock().ok()?;
        while let Ok(conn) = rx.try_recv() {
            if conn.is_closed() {
                self.discard();
                continue;
            }
            return Some(conn);
        }
        None
    }

    fn try_reserve(&self) -> Option<SlotReservation<'_, F>> {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < self.max).then_some(live + 1)
            })
            .ok()
            .map(|_| SlotReservation { pool: self, armed: true })
    }

    fn discard(&self) {
        self.stats.discarded.fetch_add(1, Ordering::Relaxed);
        self.release_slot();
    }

    fn release_slot(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.capacity_freed.notify_one();
    }

    async fn connect_bounded(&self) -> Result<F::Conn> {
        let mut delay = self.backoff.initial;
        loop {
            match self.factory.connect().await {
                Ok(conn) => {
                    self.stats.created.fetch_add(1, Ordering::Relaxed);
                    return Ok(conn);
                }
                Err(err) => {
                    self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                    if delay >= self.backoff.ceiling {
                        return Err(GilesError::FatalStartup(format!(
                            "could not open initial connection: {}",
                            err
                        )));
                    }
                    warn!(target: "giles::pool", error = %err, delay_ms = delay.as_millis() as u64, "Connect failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = self.backoff.next(delay);
                }
            }
        }
    }

    async fn connect_forever(&self) -> F::Conn {
        let mut delay = self.backoff.initial;
        loop {
            match self.factory.connect().await {
                Ok(conn) => {
                    self.stats.created.fetch_add(1, Ordering::Relaxed);
                    debug!(target: "giles::pool", live = self.live_count(), "Opened connection");
                    return conn;
                }
                Err(err) => {
                    self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                    if delay >= self.backoff.ceiling {
                        let exhausted = GilesError::PoolExhaustion(err.to_string());
                        error!(target: "giles::pool", error = %exhausted, "Still unable to connect");
                    } else {
                        warn!(target: "giles::pool", error = %err, delay_ms = delay.as_millis() as u64, "Connect failed, retrying");
                    }
                    tokio::time::sleep(delay).await;
                    delay = self.backoff.next(delay);
                }
            }
        }
    }
}
