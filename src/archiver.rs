//! The archiver: the single entry point frontends talk to.
//!
//! Writes go to the metadata store and the coalescer, readings are fanned out to
//! subscribers through the broker, and query strings are parsed and dispatched
//! to whichever backend answers them.

use crate::broker::{Broker, BrokerStats, Subscriber, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::coalescer::{Coalescer, CoalescerConfig, CoalescerStats};
use crate::core::{
    convert_time, guess_time_unit, guess_to_nanoseconds, render_document, to_nanoseconds,
    Properties, Reading, ReadingValue, SmapMessage, StreamId, StreamType, UnitOfTime,
    MAX_TIMESTAMP_NS, PROPERTY_UNIT_OF_TIME,
};
use crate::error::{GilesError, Result};
use crate::metadata::{Document, MetadataStore};
use crate::querylang::{
    DataRange, ParsedQuery, QueryKind, QueryParser, TimeValue, WhereNode, ALL_TAGS,
};
use crate::tsengine::{EngineStats, StreamReadings, TimeseriesStore};
use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tunables of the archiver core.
#[derive(Debug, Clone)]
pub struct ArchiverOptions {
    pub coalescer: CoalescerConfig,
    pub subscriber_capacity: usize,
    pub query_cache_capacity: usize,
    pub query_cache_ttl: Duration,
}

impl Default for ArchiverOptions {
    fn default() -> Self {
        Self {
            coalescer: CoalescerConfig::default(),
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            query_cache_capacity: crate::querylang::cache::DEFAULT_CACHE_CAPACITY,
            query_cache_ttl: crate::querylang::cache::DEFAULT_CACHE_TTL,
        }
    }
}

/// Readings of one stream as returned by a data query.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRecord {
    pub uuid: StreamId,
    /// Timestamps in `unit`.
    pub readings: Vec<Reading>,
    pub unit: UnitOfTime,
    pub document: Option<Document>,
}

impl DataRecord {
    pub fn to_json(&self) -> Value {
        let mut record = match self.document.as_ref().map(render_document) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        record.insert("uuid".into(), Value::String(self.uuid.to_string()));
        let readings = self.readings.iter().map(|r| json!([r.timestamp, r.value])).collect();
        record.insert("Readings".into(), Value::Array(readings));
        let properties = record.entry("Properties").or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(properties) = properties {
            properties.insert(PROPERTY_UNIT_OF_TIME.into(), Value::String(self.unit.to_string()));
        }
        Value::Object(record)
    }
}

/// Result of [`Archiver::handle_query`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResponse {
    Tags(Vec<Document>),
    Distinct(Vec<String>),
    Data(Vec<DataRecord>),
    Modified { count: usize },
    Applied(Value),
}

impl QueryResponse {
    pub fn to_json(&self) -> Value {
        match self {
            QueryResponse::Tags(docs) => Value::Array(docs.iter().map(render_document).collect()),
            QueryResponse::Distinct(values) => json!(values),
            QueryResponse::Data(records) => Value::Array(records.iter().map(DataRecord::to_json).collect()),
            QueryResponse::Modified { count } => json!({ "modified": count }),
            QueryResponse::Applied(value) => value.clone(),
        }
    }
}

impl Serialize for QueryResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Resolved inputs of a data query.
#[derive(Debug, Clone)]
pub struct DataParams {
    pub ids: Vec<StreamId>,
    /// Range start, or the reference time of `before`/`after`, in nanoseconds.
    pub start: u64,
    pub end: u64,
    pub limit: Option<u64>,
    pub unit: UnitOfTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiverStats {
    pub coalescer: CoalescerStats,
    pub broker: BrokerStats,
    pub engine: EngineStats,
    pub cached_queries: usize,
}

pub struct Archiver {
    metadata: Arc<dyn MetadataStore>,
    timeseries: Arc<dyn TimeseriesStore>,
    coalescer: Coalescer,
    broker: Arc<Broker>,
    parser: QueryParser,
}

impl Archiver {
    /// Builds the archiver and starts its flush workers on the current runtime.
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        timeseries: Arc<dyn TimeseriesStore>,
        options: ArchiverOptions,
    ) -> Result<Self> {
        let coalescer = Coalescer::new(Arc::clone(&timeseries), options.coalescer)?;
        let broker = Arc::new(Broker::with_capacity(Arc::clone(&metadata), options.subscriber_capacity));
        Ok(Self {
            metadata,
            timeseries,
            coalescer,
            broker,
            parser: QueryParser::with_cache(options.query_cache_capacity, options.query_cache_ttl),
        })
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn coalescer(&self) -> &Coalescer {
        &self.coalescer
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Ingests one message: saves its tags, buffers its readings and forwards it
    /// to matching subscribers.
    pub async fn add_data(&self, msg: SmapMessage) -> Result<()> {
        if msg.has_tags() && self.metadata.save_tags(&msg).await? {
            self.broker.reevaluate_all().await;
        }
        if msg.readings.is_empty() {
            return Ok(());
        }

        let stream_type = match msg.properties.as_ref().and_then(|p| p.stream_type) {
            Some(st) => Some(st),
            None => self.metadata.get_stream_type(msg.uuid).await?,
        };
        if stream_type == Some(StreamType::Object) {
            return Err(GilesError::Ingest(format!(
                "stream {} holds objects; only numeric readings are archived",
                msg.uuid
            )));
        }

        let unit = self.unit_of_time(&msg).await?;
        let readings = normalize_readings(&msg, unit)?;

        self.coalescer.add(msg.uuid, &readings);
        self.broker.forward_message(&msg);
        debug!(target: "giles::archiver", uuid = %msg.uuid, count = readings.len(), "Accepted readings");
        Ok(())
    }

    /// The unit of the message's timestamps: from the message, from the store, or
    /// guessed from the first reading and recorded for the stream.
    async fn unit_of_time(&self, msg: &SmapMessage) -> Result<UnitOfTime> {
        if let Some(unit) = msg.properties.as_ref().and_then(|p| p.unit_of_time) {
            return Ok(unit);
        }
        if let Some(unit) = self.metadata.get_unit_of_time(msg.uuid).await? {
            return Ok(unit);
        }
        let first = msg.readings.first().map_or(0, |r| r.timestamp);
        let unit = guess_time_unit(first);

        let mut record = SmapMessage::new(msg.path.clone(), msg.uuid);
        record.properties = Some(Properties { unit_of_time: Some(unit), ..Default::default() });
        if self.metadata.save_tags(&record).await? {
            self.broker.reevaluate_all().await;
        }
        info!(target: "giles::archiver", uuid = %msg.uuid, unit = %unit, "Inferred unit of time");
        Ok(unit)
    }

    /// Flushes the buffered readings of one stream.
    pub async fn commit(&self, uuid: StreamId) -> Result<()> {
        self.coalescer.commit(uuid).await
    }

    /// Parses and runs a query.
    pub async fn handle_query(&self, querystring: &str) -> Result<QueryResponse> {
        let query = self.parser.parse(querystring)?;
        debug!(target: "giles::archiver", query = %query.querystring, "Handling query");

        match query.kind {
            QueryKind::Select if query.distinct => {
                let tag = query.tags.first().ok_or_else(|| GilesError::parse(0, "", "missing tag"))?;
                Ok(QueryResponse::Distinct(self.distinct_tag(tag, query.where_clause.as_ref()).await?))
            }
            QueryKind::Select => {
                Ok(QueryResponse::Tags(self.select_tags(&query.tags, query.where_clause.as_ref()).await?))
            }
            QueryKind::Data => {
                let records = match query.data.map(|d| d.range) {
                    Some(DataRange::Range { .. }) => self.select_data_range(&query).await?,
                    Some(DataRange::Before(_)) => self.select_data_before(&query).await?,
                    Some(DataRange::After(_)) => self.select_data_after(&query).await?,
                    None => return Err(GilesError::parse(0, "", "data query without a range")),
                };
                Ok(QueryResponse::Data(records))
            }
            QueryKind::Delete => {
                let count = if query.data.is_some() {
                    self.delete_data(&query).await?
                } else {
                    let where_clause = required_where(&query)?;
                    if query.tags.is_empty() || query.selects_all_tags() {
                        self.delete_documents(where_clause).await?
                    } else {
                        self.delete_tags(&query.tags, where_clause).await?
                    }
                };
                Ok(QueryResponse::Modified { count })
            }
            QueryKind::Set => {
                let count = self.set_tags(&query.set, required_where(&query)?).await?;
                Ok(QueryResponse::Modified { count })
            }
            QueryKind::Apply => {
                let expr = query.apply.as_deref().unwrap_or_default();
                Ok(QueryResponse::Applied(self.metadata.apply(expr, query.where_clause.as_ref()).await?))
            }
        }
    }

    /// Serves a subscription until the subscriber closes. Parse errors go to the
    /// subscriber's error sink.
    pub async fn handle_new_subscriber(&self, subscriber: Subscriber, querystring: &str) {
        match self.parser.parse(querystring) {
            Ok(query) => self.broker.new_subscriber(subscriber, query).await,
            Err(err) => {
                warn!(target: "giles::archiver", query = querystring, error = %err, "Rejected subscription");
                let _ = subscriber.errors.send(err);
            }
        }
    }

    pub async fn select_tags(&self, tags: &[String], where_clause: Option<&WhereNode>) -> Result<Vec<Document>> {
        self.metadata.get_tags(tags, where_clause).await
    }

    pub async fn distinct_tag(&self, tag: &str, where_clause: Option<&WhereNode>) -> Result<Vec<String>> {
        self.metadata.get_distinct(tag, where_clause).await
    }

    pub async fn select_data_range(&self, query: &ParsedQuery) -> Result<Vec<DataRecord>> {
        let params = self.prepare_data_params(query).await?;
        let results = self.timeseries.get_data(&params.ids, params.start, params.end).await?;
        self.shape_data(query, &params, results).await
    }

    pub async fn select_data_before(&self, query: &ParsedQuery) -> Result<Vec<DataRecord>> {
        let params = self.prepare_data_params(query).await?;
        let results = self.timeseries.prev(&params.ids, params.start).await?;
        self.shape_data(query, &params, results).await
    }

    pub async fn select_data_after(&self, query: &ParsedQuery) -> Result<Vec<DataRecord>> {
        let params = self.prepare_data_params(query).await?;
        let results = self.timeseries.next(&params.ids, params.start).await?;
        self.shape_data(query, &params, results).await
    }

    /// Removes readings in the query's range; returns the number of streams touched.
    pub async fn delete_data(&self, query: &ParsedQuery) -> Result<usize> {
        let params = self.prepare_data_params(query).await?;
        let (start, end) = match query.data.map(|d| d.range) {
            Some(DataRange::Before(_)) => (0, params.start.saturating_sub(1)),
            Some(DataRange::After(_)) => (params.start, MAX_TIMESTAMP_NS),
            _ => (params.start, params.end),
        };
        if params.ids.is_empty() {
            return Ok(0);
        }
        for id in &params.ids {
            self.coalescer.commit(*id).await?;
        }
        self.timeseries.delete_data(&params.ids, start, end).await?;
        info!(target: "giles::archiver", streams = params.ids.len(), start, end, "Deleted readings");
        Ok(params.ids.len())
    }

    pub async fn set_tags(&self, updates: &[(String, String)], where_clause: &WhereNode) -> Result<usize> {
        let count = self.metadata.set_tags(updates, where_clause).await?;
        self.after_metadata_change(count).await;
        Ok(count)
    }

    pub async fn delete_tags(&self, tags: &[String], where_clause: &WhereNode) -> Result<usize> {
        let count = self.metadata.remove_tags(tags, where_clause).await?;
        self.after_metadata_change(count).await;
        Ok(count)
    }

    pub async fn delete_documents(&self, where_clause: &WhereNode) -> Result<usize> {
        let count = self.metadata.remove_docs(where_clause).await?;
        self.after_metadata_change(count).await;
        Ok(count)
    }

    async fn after_metadata_change(&self, count: usize) {
        if count > 0 {
            self.broker.reevaluate_all().await;
        }
    }

    /// Resolves the streams of a data query and normalises its time bounds.
    ///
    /// Bare numbers are read in the unit their magnitude suggests. A reversed
    /// range is swapped.
    pub async fn prepare_data_params(&self, query: &ParsedQuery) -> Result<DataParams> {
        let data = query
            .data
            .ok_or_else(|| GilesError::parse(0, "", "query has no data clause"))?;

        let mut ids = self.metadata.get_uuids(query.where_clause.as_ref()).await?;
        if let Some(stream_limit) = data.stream_limit {
            ids.truncate(usize::try_from(stream_limit).unwrap_or(usize::MAX));
        }

        let (mut start, mut end) = match data.range {
            DataRange::Range { start, end } => (to_ns(start), to_ns(end)),
            DataRange::Before(t) | DataRange::After(t) => (to_ns(t), to_ns(t)),
        };
        if start > end {
            std::mem::swap(&mut start, &mut end);
        }

        Ok(DataParams { ids, start, end, limit: data.limit, unit: data.timeconv })
    }

    async fn shape_data(
        &self,
        query: &ParsedQuery,
        params: &DataParams,
        results: Vec<StreamReadings>,
    ) -> Result<Vec<DataRecord>> {
        let docs: HashMap<String, Document> = self
            .metadata
            .get_tags(&[ALL_TAGS.to_string()], query.where_clause.as_ref())
            .await?
            .into_iter()
            .filter_map(|doc| doc.get(crate::core::UUID_TAG).cloned().map(|id| (id, doc)))
            .collect();

        let limit = params.limit.and_then(|l| usize::try_from(l).ok()).unwrap_or(usize::MAX);
        Ok(results
            .into_iter()
            .map(|stream| {
                let readings = stream
                    .readings
                    .into_iter()
                    .take(limit)
                    .map(|r| {
                        let t = convert_time(r.timestamp, UnitOfTime::Nanoseconds, params.unit)
                            .unwrap_or(r.timestamp);
                        Reading::new(t, r.value)
                    })
                    .collect();
                DataRecord {
                    uuid: stream.uuid,
                    readings,
                    unit: params.unit,
                    document: docs.get(&stream.uuid.to_string()).cloned(),
                }
            })
            .collect())
    }

    /// Flushes buffered readings and persists metadata.
    pub async fn shutdown(&self) -> Result<()> {
        let flushed = self.coalescer.flush_all().await;
        let persisted = self.metadata.persist().await;
        info!(target: "giles::archiver", "Archiver stopped");
        flushed.and(persisted)
    }

    pub fn stats(&self) -> ArchiverStats {
        ArchiverStats {
            coalescer: self.coalescer.stats(),
            broker: self.broker.stats(),
            engine: self.timeseries.stats(),
            cached_queries: self.parser.cached(),
        }
    }
}

fn to_ns(t: TimeValue) -> u64 {
    match t {
        TimeValue::Absolute(ns) => ns,
        TimeValue::Raw(n) => guess_to_nanoseconds(n),
    }
}

fn required_where(query: &ParsedQuery) -> Result<&WhereNode> {
    query
        .where_clause
        .as_ref()
        .ok_or_else(|| GilesError::parse(query.querystring.len(), "", "where clause required"))
}

/// Converts a message's readings to nanoseconds, rejecting the whole message if
/// any reading is out of range or not numeric.
fn normalize_readings(msg: &SmapMessage, unit: UnitOfTime) -> Result<Vec<Reading>> {
    msg.readings
        .iter()
        .map(|r| {
            let value = match &r.value {
                ReadingValue::Numeric(v) => *v,
                ReadingValue::Object(_) => {
                    return Err(GilesError::Ingest(format!(
                        "non-numeric reading at {} for {}",
                        r.timestamp, msg.uuid
                    )))
                }
            };
            let ns = to_nanoseconds(r.timestamp, unit)
                .filter(|ns| *ns > 0 && *ns <= MAX_TIMESTAMP_NS)
                .ok_or_else(|| {
                    GilesError::Ingest(format!(
                        "timestamp {} {} for {} is out of range",
                        r.timestamp, unit, msg.uuid
                    ))
                })?;
            Ok(Reading::new(ns, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{property_tag, SmapReading};
    use crate::metadata::MemoryMetadataStore;
    use crate::tsengine::MemoryTimeseries;

    fn archiver() -> (Archiver, Arc<MemoryMetadataStore>, Arc<MemoryTimeseries>) {
        let metadata = Arc::new(MemoryMetadataStore::new());
        let engine = Arc::new(MemoryTimeseries::new());
        let archiver = Archiver::new(metadata.clone(), engine.clone(), ArchiverOptions::default()).unwrap();
        (archiver, metadata, engine)
    }

    #[tokio::test]
    async fn test_unit_is_inferred_and_recorded() {
        let (archiver, metadata, engine) = archiver();
        let mut msg = SmapMessage::new("/s", StreamId::new_v4());
        msg.readings.push(SmapReading::numeric(1_351_043_674, 1.0));
        archiver.add_data(msg.clone()).await.unwrap();
        archiver.commit(msg.uuid).await.unwrap();

        assert_eq!(metadata.get_unit_of_time(msg.uuid).await.unwrap(), Some(UnitOfTime::Seconds));
        let doc = metadata.document(&msg.uuid).unwrap();
        assert_eq!(doc.get(&property_tag(PROPERTY_UNIT_OF_TIME)).map(String::as_str), Some("s"));
        let stored = engine.get_data(&[msg.uuid], 0, MAX_TIMESTAMP_NS).await.unwrap();
        assert_eq!(stored[0].readings, vec![Reading::new(1_351_043_674_000_000_000, 1.0)]);
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_and_objects() {
        let (archiver, _, engine) = archiver();
        let mut msg = SmapMessage::new("/s", StreamId::new_v4());
        msg.properties = Some(Properties { unit_of_time: Some(UnitOfTime::Seconds), ..Default::default() });
        msg.readings.push(SmapReading::numeric(0, 1.0));
        assert!(matches!(archiver.add_data(msg.clone()).await, Err(GilesError::Ingest(_))));

        msg.readings = vec![SmapReading::numeric(u64::MAX / 2, 1.0)];
        assert!(archiver.add_data(msg.clone()).await.is_err());

        let mut object = msg.clone();
        object.properties = Some(Properties { stream_type: Some(StreamType::Object), ..Default::default() });
        object.readings = vec![SmapReading { timestamp: 5, value: ReadingValue::Object(json!({"on": true})) }];
        assert!(archiver.add_data(object.clone()).await.is_err());
        assert!(archiver.metadata().get_stream_type(object.uuid).await.unwrap() == Some(StreamType::Object));

        archiver.commit(msg.uuid).await.unwrap();
        assert_eq!(engine.reading_count(&msg.uuid), 0);
    }

    #[tokio::test]
    async fn test_set_and_delete_queries() {
        let (archiver, _, _) = archiver();
        let mut msg = SmapMessage::new("/s", StreamId::new_v4());
        msg.metadata.insert("Room".into(), "410".into());
        archiver.add_data(msg.clone()).await.unwrap();

        let q = format!(r#"set Metadata/Floor = "4" where uuid = "{}""#, msg.uuid);
        assert_eq!(archiver.handle_query(&q).await.unwrap(), QueryResponse::Modified { count: 1 });

        let floors = archiver.handle_query("select distinct Metadata/Floor").await.unwrap();
        assert_eq!(floors, QueryResponse::Distinct(vec!["4".into()]));

        let removed = archiver.handle_query("delete Metadata/Floor where has Metadata/Floor").await.unwrap();
        assert_eq!(removed.to_json(), json!({"modified": 1}));

        let gone = archiver.handle_query("delete where has Metadata/Room").await.unwrap();
        assert_eq!(gone, QueryResponse::Modified { count: 1 });
        assert_eq!(archiver.handle_query("select *").await.unwrap(), QueryResponse::Tags(vec![]));
    }

    #[tokio::test]
    async fn test_set_rejects_invalid_unit_of_time() {
        let (archiver, _, engine) = archiver();
        let mut msg = SmapMessage::new("/s", StreamId::new_v4());
        msg.readings.push(SmapReading::numeric(1_351_043_674, 1.0));
        archiver.add_data(msg.clone()).await.unwrap();

        let q = format!(r#"set Properties/UnitofTime = "bogus" where uuid = "{}""#, msg.uuid);
        let err = archiver.handle_query(&q).await.unwrap_err();
        assert!(err.is_client_error());

        msg.readings = vec![SmapReading::numeric(1_351_043_675, 2.0)];
        archiver.add_data(msg.clone()).await.unwrap();
        archiver.commit(msg.uuid).await.unwrap();
        assert_eq!(engine.reading_count(&msg.uuid), 2);
    }

    #[tokio::test]
    async fn test_apply_is_unsupported_by_memory_store() {
        let (archiver, _, _) = archiver();
        assert!(matches!(
            archiver.handle_query("apply mean where has x").await,
            Err(GilesError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_before_after_and_delete_data() {
        let (archiver, _, _) = archiver();
        let mut msg = SmapMessage::new("/s", StreamId::new_v4());
        msg.properties = Some(Properties { unit_of_time: Some(UnitOfTime::Seconds), ..Default::default() });
        msg.readings = (1..=5).map(|i| SmapReading::numeric(1_351_043_670 + i, i as f64)).collect();
        archiver.add_data(msg.clone()).await.unwrap();
        archiver.commit(msg.uuid).await.unwrap();

        let q = format!(r#"select data before 1351043673 as s where uuid = "{}""#, msg.uuid);
        match archiver.handle_query(&q).await.unwrap() {
            QueryResponse::Data(records) => {
                assert_eq!(records[0].readings, vec![Reading::new(1_351_043_672, 2.0)]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let q = format!(r#"select data after 1351043673 as s where uuid = "{}""#, msg.uuid);
        match archiver.handle_query(&q).await.unwrap() {
            QueryResponse::Data(records) => {
                assert_eq!(records[0].readings, vec![Reading::new(1_351_043_673, 3.0)]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let q = format!(r#"delete data before 1351043674 where uuid = "{}""#, msg.uuid);
        assert_eq!(archiver.handle_query(&q).await.unwrap(), QueryResponse::Modified { count: 1 });
        let q = format!(r#"select data in (1351043600, 1351043700) as s where uuid = "{}""#, msg.uuid);
        match archiver.handle_query(&q).await.unwrap() {
            QueryResponse::Data(records) => assert_eq!(records[0].readings.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }
}
