//! Stream metadata: tag documents keyed by stream id.

use crate::core::{SmapMessage, StreamId, StreamType, UnitOfTime};
use crate::error::{GilesError, Result};
use crate::querylang::WhereNode;
use async_trait::async_trait;
use std::collections::BTreeMap;

pub mod matcher;
pub mod memory;

pub use matcher::Matcher;
pub use memory::MemoryMetadataStore;

/// Flat document of canonical tag names to values. Always holds `uuid`.
pub type Document = BTreeMap<String, String>;

/// Document store holding the tags of every stream.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Streams matching `where_clause`, or every stream when it is `None`.
    async fn get_uuids(&self, where_clause: Option<&WhereNode>) -> Result<Vec<StreamId>>;

    /// Documents of matching streams, projected to `tags` (`*` keeps everything).
    /// Streams carrying none of the requested tags are left out.
    async fn get_tags(&self, tags: &[String], where_clause: Option<&WhereNode>) -> Result<Vec<Document>>;

    /// Sorted distinct values of `tag` among matching streams.
    async fn get_distinct(&self, tag: &str, where_clause: Option<&WhereNode>) -> Result<Vec<String>>;

    /// Upserts the message's path, metadata, actuator and properties.
    /// Returns whether the stored document changed.
    async fn save_tags(&self, msg: &SmapMessage) -> Result<bool>;

    /// Sets tags on every matching stream; returns the number of streams changed.
    async fn set_tags(&self, updates: &[(String, String)], where_clause: &WhereNode) -> Result<usize>;

    /// Removes tags from every matching stream; returns the number of streams changed.
    async fn remove_tags(&self, tags: &[String], where_clause: &WhereNode) -> Result<usize>;

    /// Removes matching documents entirely; returns how many were removed.
    async fn remove_docs(&self, where_clause: &WhereNode) -> Result<usize>;

    async fn get_unit_of_time(&self, uuid: StreamId) -> Result<Option<UnitOfTime>>;

    async fn get_unit_of_measure(&self, uuid: StreamId) -> Result<Option<String>>;

    async fn get_stream_type(&self, uuid: StreamId) -> Result<Option<StreamType>>;

    async fn apply(&self, expr: &str, _where_clause: Option<&WhereNode>) -> Result<serde_json::Value> {
        Err(GilesError::Unsupported(format!("apply '{}' is not supported by this metadata store", expr)))
    }

    /// Writes any buffered state to durable storage.
    async fn persist(&self) -> Result<()> {
        Ok(())
    }

    async fn document_count(&self) -> Result<usize>;
}
