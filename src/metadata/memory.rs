//! In-process metadata store with optional snapshot persistence.

use super::{Document, Matcher, MetadataStore};
use crate::core::{
    property_tag, SmapMessage, StreamId, StreamType, UnitOfTime, PROPERTY_STREAM_TYPE,
    PROPERTY_UNIT_OF_MEASURE, PROPERTY_UNIT_OF_TIME, UUID_TAG,
};
use crate::error::{GilesError, Result};
use crate::querylang::{WhereNode, ALL_TAGS};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info};

/// Checks values of the properties the archiver interprets, returning their canonical spelling.
fn normalize_property(tag: &str, value: &str) -> Result<String> {
    let invalid = |e: String| GilesError::Ingest(format!("{}: {}", tag, e));
    if tag == property_tag(PROPERTY_UNIT_OF_TIME) {
        return Ok(value.parse::<UnitOfTime>().map_err(invalid)?.as_str().to_string());
    }
    if tag == property_tag(PROPERTY_STREAM_TYPE) {
        return Ok(value.parse::<StreamType>().map_err(invalid)?.as_str().to_string());
    }
    Ok(value.to_string())
}

#[derive(Default)]
pub struct MemoryMetadataStore {
    docs: RwLock<HashMap<StreamId, Document>>,
    snapshot: Option<PathBuf>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a store backed by a snapshot file, loading it when it exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let docs = if path.exists() {
            let docs = Self::load_from_file(&path)?;
            info!(target: "giles::metadata", path = %path.display(), streams = docs.len(), "Loaded metadata snapshot");
            docs
        } else {
            HashMap::new()
        };
        Ok(Self { docs: RwLock::new(docs), snapshot: Some(path) })
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let encoded = {
            let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
            bincode::serialize(&*docs)?
        };
        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<HashMap<StreamId, Document>> {
        let mut file = File::open(path)?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        Ok(bincode::deserialize(&buffer)?)
    }

    pub fn document(&self, uuid: &StreamId) -> Option<Document> {
        self.docs.read().unwrap_or_else(PoisonError::into_inner).get(uuid).cloned()
    }

    fn property(&self, uuid: &StreamId, name: &str) -> Option<String> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        docs.get(uuid).and_then(|doc| doc.get(&property_tag(name)).cloned())
    }

    /// Applies `update` to every matching document and counts those it changed.
    fn update_matching<F>(&self, where_clause: &WhereNode, mut update: F) -> Result<usize>
    where
        F: FnMut(&mut Document) -> bool,
    {
        let matcher = Matcher::compile(Some(where_clause))?;
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        let mut changed = 0;
        for doc in docs.values_mut() {
            if matcher.matches(doc) && update(doc) {
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get_uuids(&self, where_clause: Option<&WhereNode>) -> Result<Vec<StreamId>> {
        let matcher = Matcher::compile(where_clause)?;
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<StreamId> =
            docs.iter().filter(|(_, doc)| matcher.matches(doc)).map(|(id, _)| *id).collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_tags(&self, tags: &[String], where_clause: Option<&WhereNode>) -> Result<Vec<Document>> {
        let matcher = Matcher::compile(where_clause)?;
        let all = tags.iter().any(|t| t == ALL_TAGS);
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);

        let mut ids: Vec<&StreamId> = docs.keys().collect();
        ids.sort();
        let mut out = Vec::new();
        for id in ids {
            let doc = &docs[id];
            if !matcher.matches(doc) {
                continue;
            }
            if all {
                out.push(doc.clone());
                continue;
            }
            let projected: Document = doc
                .iter()
                .filter(|(k, _)| tags.iter().any(|t| covers(t, k)))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if !projected.is_empty() {
                out.push(projected);
            }
        }
        Ok(out)
    }

    async fn get_distinct(&self, tag: &str, where_clause: Option<&WhereNode>) -> Result<Vec<String>> {
        let matcher = Matcher::compile(where_clause)?;
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let values: BTreeSet<String> = docs
            .values()
            .filter(|doc| matcher.matches(doc))
            .filter_map(|doc| doc.get(tag).cloned())
            .collect();
        Ok(values.into_iter().collect())
    }

    async fn save_tags(&self, msg: &SmapMessage) -> Result<bool> {
        let incoming = msg.to_document();
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        let doc = docs.entry(msg.uuid).or_default();
        let mut changed = false;
        for (k, v) in incoming {
            if doc.get(&k) != Some(&v) {
                doc.insert(k, v);
                changed = true;
            }
        }
        if changed {
            debug!(target: "giles::metadata", uuid = %msg.uuid, "Saved tags");
        }
        Ok(changed)
    }

    async fn set_tags(&self, updates: &[(String, String)], where_clause: &WhereNode) -> Result<usize> {
        if updates.iter().any(|(k, _)| k == UUID_TAG) {
            return Err(GilesError::Unsupported("the uuid tag cannot be set".into()));
        }
        let updates = updates
            .iter()
            .map(|(k, v)| Ok((k.clone(), normalize_property(k, v)?)))
            .collect::<Result<Vec<_>>>()?;
        self.update_matching(where_clause, |doc| {
            let mut changed = false;
            for (k, v) in &updates {
                if doc.get(k) != Some(v) {
                    doc.insert(k.clone(), v.clone());
                    changed = true;
                }
            }
            changed
        })
    }

    async fn remove_tags(&self, tags: &[String], where_clause: &WhereNode) -> Result<usize> {
        self.update_matching(where_clause, |doc| {
            let before = doc.len();
            doc.retain(|k, _| k == UUID_TAG || !tags.iter().any(|t| covers(t, k)));
            doc.len() != before
        })
    }

    async fn remove_docs(&self, where_clause: &WhereNode) -> Result<usize> {
        let matcher = Matcher::compile(Some(where_clause))?;
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        let before = docs.len();
        docs.retain(|_, doc| !matcher.matches(doc));
        Ok(before - docs.len())
    }

    async fn get_unit_of_time(&self, uuid: StreamId) -> Result<Option<UnitOfTime>> {
        match self.property(&uuid, PROPERTY_UNIT_OF_TIME) {
            Some(text) => text.parse().map(Some).map_err(GilesError::Resolve),
            None => Ok(None),
        }
    }

    async fn get_unit_of_measure(&self, uuid: StreamId) -> Result<Option<String>> {
        Ok(self.property(&uuid, PROPERTY_UNIT_OF_MEASURE))
    }

    async fn get_stream_type(&self, uuid: StreamId) -> Result<Option<StreamType>> {
        match self.property(&uuid, PROPERTY_STREAM_TYPE) {
            Some(text) => text.parse().map(Some).map_err(GilesError::Resolve),
            None => Ok(None),
        }
    }

    async fn persist(&self) -> Result<()> {
        if let Some(path) = &self.snapshot {
            self.save_to_file(path)?;
            info!(target: "giles::metadata", path = %path.display(), "Wrote metadata snapshot");
        }
        Ok(())
    }

    async fn document_count(&self) -> Result<usize> {
        Ok(self.docs.read().unwrap_or_else(PoisonError::into_inner).len())
    }
}

/// True if the requested tag names `key` itself or a nested key below it.
fn covers(requested: &str, key: &str) -> bool {
    key == requested
        || (key.len() > requested.len()
            && key.starts_with(requested)
            && key[requested.len()..].starts_with(crate::core::TAG_SEPARATOR))
}
