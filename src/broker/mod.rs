//! Continuous-query broker.
//!
//! Keeps one standing query per distinct query string, tracks which streams
//! currently match it, and routes incoming readings to the subscribers of every
//! matching standing query.
//!
//! Locks are taken in the order `queries`, `subscribers`, then a standing query's
//! `streams`. None of them is held across an `.await`.

use crate::core::{render_document, SmapMessage, StreamId};
use crate::error::Result;
use crate::metadata::{Document, MetadataStore};
use crate::querylang::{ParsedQuery, ALL_TAGS};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

pub mod subscriber;

pub use subscriber::{Subscriber, SubscriberHandle, SubscriberId, DEFAULT_SUBSCRIBER_CAPACITY};
use subscriber::SubscriberEntry;

/// Membership of a stream in a standing query after the latest evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Matched before, no longer matches. Removed in the same pass.
    Old,
    /// Matches now, did not before.
    New,
    /// Matched before and still matches.
    Same,
}

/// Streams that joined and left a standing query in one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub added: Vec<StreamId>,
    pub removed: Vec<StreamId>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct StandingQuery {
    pub query: ParsedQuery,
    streams: RwLock<HashMap<StreamId, StreamState>>,
    last_result: RwLock<Vec<Document>>,
    /// Held for the whole of a re-evaluation so results land in the order they were computed.
    evaluation: tokio::sync::Mutex<()>,
}

impl StandingQuery {
    fn new(query: ParsedQuery, ids: Vec<StreamId>, result: Vec<Document>) -> Self {
        let streams = ids.into_iter().map(|id| (id, StreamState::New)).collect();
        Self {
            query,
            streams: RwLock::new(streams),
            last_result: RwLock::new(result),
            evaluation: tokio::sync::Mutex::new(()),
        }
    }

    pub fn streams(&self) -> HashMap<StreamId, StreamState> {
        self.streams.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn stream_state(&self, uuid: &StreamId) -> Option<StreamState> {
        self.streams.read().unwrap_or_else(PoisonError::into_inner).get(uuid).copied()
    }

    /// The last full result as sent to new subscribers.
    pub fn snapshot(&self) -> Value {
        let docs = self.last_result.read().unwrap_or_else(PoisonError::into_inner);
        Value::Array(docs.iter().map(render_document).collect())
    }
}

#[derive(Default)]
struct SubscriberIndex {
    by_stream: HashMap<StreamId, Vec<SubscriberId>>,
    by_query: HashMap<String, HashSet<SubscriberId>>,
    registry: HashMap<SubscriberId, Arc<SubscriberEntry>>,
}

impl SubscriberIndex {
    fn attach(&mut self, uuid: StreamId, id: SubscriberId) {
        let list = self.by_stream.entry(uuid).or_default();
        if !list.contains(&id) {
            list.push(id);
        }
    }

    fn detach(&mut self, uuid: &StreamId, ids: &HashSet<SubscriberId>) {
        if let Some(list) = self.by_stream.get_mut(uuid) {
            list.retain(|id| !ids.contains(id));
            if list.is_empty() {
                self.by_stream.remove(uuid);
            }
        }
    }
}

/// An attached subscriber. Dropping it detaches the subscriber, even when the
/// serving future is cancelled part way.
struct Attachment<'a> {
    broker: &'a Broker,
    id: SubscriberId,
    entry: Arc<SubscriberEntry>,
}

impl Drop for Attachment<'_> {
    fn drop(&mut self) {
        self.broker.detach_subscriber(self.id, &self.entry.query);
        self.broker.delivered.fetch_add(self.entry.delivered(), Ordering::Relaxed);
        self.broker.dropped.fetch_add(self.entry.dropped(), Ordering::Relaxed);
        info!(target: "giles::broker", subscriber = self.id, dropped = self.entry.dropped(), "Subscriber detached");
    }
}

/// Point-in-time copy of broker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub standing_queries: usize,
    pub subscribers: usize,
    pub forwarded: u64,
    pub delivered: u64,
    pub dropped: u64,
}

pub struct Broker {
    metadata: Arc<dyn MetadataStore>,
    queries: RwLock<HashMap<String, Arc<StandingQuery>>>,
    subscribers: RwLock<SubscriberIndex>,
    next_subscriber: AtomicU64,
    capacity: usize,
    forwarded: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Broker {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self::with_capacity(metadata, DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// `capacity` bounds how many live records wait behind a subscriber's snapshot.
    pub fn with_capacity(metadata: Arc<dyn MetadataStore>, capacity: usize) -> Self {
        Self {
            metadata,
            queries: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(SubscriberIndex::default()),
            next_subscriber: AtomicU64::new(1),
            capacity: capacity.max(1),
            forwarded: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Returns the standing query for `query`, evaluating and installing it if needed.
    pub async fn get_query(&self, query: &ParsedQuery) -> Result<Arc<StandingQuery>> {
        if let Some(existing) = self.lookup(&query.querystring) {
            return Ok(existing);
        }

        let (ids, docs) = self.evaluate(query).await?;
        let fresh = Arc::new(StandingQuery::new(query.clone(), ids, docs));

        let mut queries = self.queries.write().unwrap_or_else(PoisonError::into_inner);
        let installed = queries.entry(query.querystring.clone()).or_insert_with(|| {
            debug!(target: "giles::broker", query = %query.querystring, "Installed standing query");
            fresh
        });
        Ok(Arc::clone(installed))
    }

    pub fn lookup(&self, querystring: &str) -> Option<Arc<StandingQuery>> {
        self.queries.read().unwrap_or_else(PoisonError::into_inner).get(querystring).cloned()
    }

    async fn evaluate(&self, query: &ParsedQuery) -> Result<(Vec<StreamId>, Vec<Document>)> {
        let where_clause = query.where_clause.as_ref();
        let ids = self.metadata.get_uuids(where_clause).await?;
        let docs = self.metadata.get_tags(&[ALL_TAGS.to_string()], where_clause).await?;
        Ok((ids, docs))
    }

    /// Serves one subscriber until it closes.
    ///
    /// Sends the query's current result first, then live records for matching
    /// streams. Evaluation errors go to the subscriber's error sink.
    pub async fn new_subscriber(&self, subscriber: Subscriber, query: ParsedQuery) {
        let Subscriber { outbound, closed, errors } = subscriber;
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);

        let (standing, attachment) = loop {
            let standing = match self.get_query(&query).await {
                Ok(standing) => standing,
                Err(err) => {
                    warn!(target: "giles::broker", query = %query.querystring, error = %err, "Subscription failed");
                    let _ = errors.send(err);
                    return;
                }
            };
            if let Some(entry) = self.register(id, &standing, &outbound) {
                break (standing, Attachment { broker: self, id, entry });
            }
            // The standing query was retired between lookup and registration.
        };
        info!(target: "giles::broker", subscriber = id, query = %query.querystring, "Subscriber attached");

        let snapshot = standing.snapshot();
        if outbound.send(snapshot).await.is_ok() {
            attachment.entry.go_live();
            tokio::select! {
                _ = closed => {}
                _ = outbound.closed() => {}
            }
        }
        drop(attachment);
    }

    fn register(
        &self,
        id: SubscriberId,
        standing: &Arc<StandingQuery>,
        outbound: &tokio::sync::mpsc::Sender<Value>,
    ) -> Option<Arc<SubscriberEntry>> {
        let key = &standing.query.querystring;
        let queries = self.queries.read().unwrap_or_else(PoisonError::into_inner);
        match queries.get(key) {
            Some(current) if Arc::ptr_eq(current, standing) => {}
            _ => return None,
        }

        let entry = Arc::new(SubscriberEntry::new(key.clone(), outbound.clone(), self.capacity));
        let mut index = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        index.registry.insert(id, Arc::clone(&entry));
        index.by_query.entry(key.clone()).or_default().insert(id);
        let streams = standing.streams.read().unwrap_or_else(PoisonError::into_inner);
        for uuid in streams.keys() {
            index.attach(*uuid, id);
        }
        Some(entry)
    }

    fn detach_subscriber(&self, id: SubscriberId, querystring: &str) {
        let mut queries = self.queries.write().unwrap_or_else(PoisonError::into_inner);
        let mut index = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);

        index.registry.remove(&id);
        index.by_stream.retain(|_, list| {
            list.retain(|sub| *sub != id);
            !list.is_empty()
        });

        let last = match index.by_query.get_mut(querystring) {
            Some(set) => {
                set.remove(&id);
                set.is_empty()
            }
            None => true,
        };
        if last {
            index.by_query.remove(querystring);
            if queries.remove(querystring).is_some() {
                debug!(target: "giles::broker", query = querystring, "Retired standing query");
            }
        }
    }

    /// Offers a message to every subscriber attached to its stream. Never blocks;
    /// subscribers with a full queue miss it.
    pub fn forward_message(&self, msg: &SmapMessage) {
        let index = self.subscribers.read().unwrap_or_else(PoisonError::into_inner);
        let Some(ids) = index.by_stream.get(&msg.uuid) else {
            return;
        };
        let record = Value::Array(vec![msg.to_json()]);
        for id in ids {
            if let Some(entry) = index.registry.get(id) {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                if !entry.offer(record.clone()) {
                    debug!(target: "giles::broker", subscriber = id, uuid = %msg.uuid, "Subscriber queue full, dropped");
                }
            }
        }
    }

    /// Re-resolves one standing query and re-attaches its subscribers.
    pub async fn reevaluate(&self, querystring: &str) -> Result<Delta> {
        let Some(standing) = self.lookup(querystring) else {
            return Ok(Delta::default());
        };
        let _evaluating = standing.evaluation.lock().await;
        let (ids, docs) = self.evaluate(&standing.query).await?;
        Ok(self.apply_evaluation(&standing, ids, docs))
    }

    /// Re-resolves every standing query. Failures are logged and skipped.
    pub async fn reevaluate_all(&self) -> HashMap<String, Delta> {
        let keys: Vec<String> =
            self.queries.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        let mut deltas = HashMap::new();
        for key in keys {
            match self.reevaluate(&key).await {
                Ok(delta) => {
                    if !delta.is_empty() {
                        debug!(
                            target: "giles::broker",
                            query = %key,
                            added = delta.added.len(),
                            removed = delta.removed.len(),
                            "Standing query changed"
                        );
                    }
                    deltas.insert(key, delta);
                }
                Err(err) => {
                    warn!(target: "giles::broker", query = %key, error = %err, "Re-evaluation failed");
                }
            }
        }
        deltas
    }

    fn apply_evaluation(&self, standing: &StandingQuery, ids: Vec<StreamId>, docs: Vec<Document>) -> Delta {
        let key = &standing.query.querystring;
        let mut index = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let mut streams = standing.streams.write().unwrap_or_else(PoisonError::into_inner);

        for state in streams.values_mut() {
            *state = StreamState::Old;
        }
        let mut delta = Delta::default();
        for id in ids {
            match streams.get_mut(&id) {
                Some(state) => *state = StreamState::Same,
                None => {
                    streams.insert(id, StreamState::New);
                    delta.added.push(id);
                }
            }
        }
        streams.retain(|id, state| {
            if *state == StreamState::Old {
                delta.removed.push(*id);
                false
            } else {
                true
            }
        });
        delta.added.sort();
        delta.removed.sort();

        if let Some(subs) = index.by_query.get(key).cloned() {
            for uuid in &delta.added {
                for id in &subs {
                    index.attach(*uuid, *id);
                }
            }
            for uuid in &delta.removed {
                index.detach(uuid, &subs);
            }
        }
        drop(streams);
        drop(index);

        *standing.last_result.write().unwrap_or_else(PoisonError::into_inner) = docs;
        delta
    }

    /// Subscribers currently attached to `uuid`.
    pub fn subscribers_of(&self, uuid: &StreamId) -> Vec<SubscriberId> {
        let index = self.subscribers.read().unwrap_or_else(PoisonError::into_inner);
        index.by_stream.get(uuid).cloned().unwrap_or_default()
    }

    pub fn stats(&self) -> BrokerStats {
        let queries = self.queries.read().unwrap_or_else(PoisonError::into_inner).len();
        let index = self.subscribers.read().unwrap_or_else(PoisonError::into_inner);
        let (live_delivered, live_dropped) = index
            .registry
            .values()
            .fold((0, 0), |(d, x), e| (d + e.delivered(), x + e.dropped()));
        BrokerStats {
            standing_queries: queries,
            subscribers: index.registry.len(),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed) + live_delivered,
            dropped: self.dropped.load(Ordering::Relaxed) + live_dropped,
        }
    }
}
