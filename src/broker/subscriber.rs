//! Subscriber endpoints shared between a frontend and the broker.

use crate::error::GilesError;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};

pub type SubscriberId = u64;

/// Outbound queue depth of a subscriber.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 10;

/// Broker side of a subscription.
pub struct Subscriber {
    pub(crate) outbound: mpsc::Sender<Value>,
    pub(crate) closed: oneshot::Receiver<()>,
    pub(crate) errors: oneshot::Sender<GilesError>,
}

/// Frontend side of a subscription. Dropping it ends the subscription.
pub struct SubscriberHandle {
    messages: mpsc::Receiver<Value>,
    close: Option<oneshot::Sender<()>>,
    errors: oneshot::Receiver<GilesError>,
}

impl Subscriber {
    pub fn channel(capacity: usize) -> (Subscriber, SubscriberHandle) {
        let (outbound, messages) = mpsc::channel(capacity.max(1));
        let (close, closed) = oneshot::channel();
        let (errors, error_rx) = oneshot::channel();
        (
            Subscriber { outbound, closed, errors },
            SubscriberHandle { messages, close: Some(close), errors: error_rx },
        )
    }
}

impl SubscriberHandle {
    /// Next delivery: the initial snapshot first, then live records.
    /// Returns `None` once the broker has let go of the subscription.
    pub async fn recv(&mut self) -> Option<Value> {
        self.messages.recv().await
    }

    /// Signals the broker to detach this subscriber.
    pub fn close(&mut self) {
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
    }

    /// The error that ended the subscription, if any.
    pub fn try_error(&mut self) -> Option<GilesError> {
        self.errors.try_recv().ok()
    }

    /// Waits for the error that ended the subscription. Resolves to `None` if
    /// the subscription ended without one.
    pub async fn error(&mut self) -> Option<GilesError> {
        (&mut self.errors).await.ok()
    }
}

enum DeliveryState {
    /// The snapshot has not been sent yet; live records wait here.
    Priming(Vec<Value>),
    Live,
}

/// Registry entry for an attached subscriber.
pub(crate) struct SubscriberEntry {
    pub query: String,
    outbound: mpsc::Sender<Value>,
    state: Mutex<DeliveryState>,
    capacity: usize,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl SubscriberEntry {
    pub fn new(query: String, outbound: mpsc::Sender<Value>, capacity: usize) -> Self {
        Self {
            query,
            outbound,
            state: Mutex::new(DeliveryState::Priming(Vec::new())),
            capacity,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Offers a record without blocking. Returns false if it was dropped.
    pub fn offer(&self, record: Value) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *state {
            DeliveryState::Priming(parked) if parked.len() < self.capacity => {
                parked.push(record);
                true
            }
            DeliveryState::Priming(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            DeliveryState::Live => self.try_send(record),
        }
    }

    /// Releases parked records behind the snapshot and switches to live delivery.
    pub fn go_live(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let DeliveryState::Priming(parked) = std::mem::replace(&mut *state, DeliveryState::Live) {
            for record in parked {
                self.try_send(record);
            }
        }
    }

    fn try_send(&self, record: Value) -> bool {
        match self.outbound.try_send(record) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
