//! Core data structures and types for the Giles archiver

use crate::error::GilesError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod smap;
pub mod units;

pub use smap::{parse_smap_json, render_document};
pub use units::{
    convert_time, guess_time_unit, guess_to_nanoseconds, to_nanoseconds, UnitOfTime,
    MAX_TIMESTAMP_NS,
};

/// Separator used inside canonical tag names.
pub const TAG_SEPARATOR: char = '|';

/// Stable 128-bit identity of a stream, rendered as the 36-character UUID text form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(Uuid);

impl StreamId {
    pub fn new_v4() -> Self {
        StreamId(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        StreamId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.0.hyphenated())
    }
}

impl FromStr for StreamId {
    type Err = GilesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.len() != 36 {
            return Err(GilesError::Ingest(format!("'{}' is not a 36 character uuid", trimmed)));
        }
        Uuid::parse_str(trimmed)
            .map(StreamId)
            .map_err(|e| GilesError::Ingest(format!("invalid uuid '{}': {}", trimmed, e)))
    }
}

/// Opaque 32-byte token forwarded by frontends. The core never looks inside it.
#[derive(Clone, PartialEq, Eq)]
pub struct EphemeralKey([u8; 32]);

impl EphemeralKey {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(EphemeralKey(array))
    }

    /// Decodes the 64 character hex form used in frontend URLs.
    pub fn from_hex(text: &str) -> Option<Self> {
        if text.len() != 64 || !text.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in text.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).ok()?;
            bytes[i] = u8::from_str_radix(pair, 16).ok()?;
        }
        Some(EphemeralKey(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EphemeralKey(..)")
    }
}

/// Kind of values a stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Numeric,
    Object,
}

impl StreamType {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamType::Numeric => "numeric",
            StreamType::Object => "object",
        }
    }
}

impl FromStr for StreamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "numeric" => Ok(StreamType::Numeric),
            "object" => Ok(StreamType::Object),
            other => Err(format!("unknown stream type '{}'", other)),
        }
    }
}

/// Stream properties. Absent fields are inherited from what the store already knows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    pub unit_of_time: Option<UnitOfTime>,
    pub unit_of_measure: Option<String>,
    pub stream_type: Option<StreamType>,
}

impl Properties {
    pub fn is_empty(&self) -> bool {
        self.unit_of_time.is_none() && self.unit_of_measure.is_none() && self.stream_type.is_none()
    }

    /// Canonical document entries for these properties.
    pub fn to_tags(&self) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        if let Some(uot) = self.unit_of_time {
            tags.insert(property_tag(PROPERTY_UNIT_OF_TIME), uot.as_str().to_string());
        }
        if let Some(uom) = &self.unit_of_measure {
            tags.insert(property_tag(PROPERTY_UNIT_OF_MEASURE), uom.clone());
        }
        if let Some(st) = self.stream_type {
            tags.insert(property_tag(PROPERTY_STREAM_TYPE), st.as_str().to_string());
        }
        tags
    }
}

pub const PROPERTY_UNIT_OF_TIME: &str = "UnitofTime";
pub const PROPERTY_UNIT_OF_MEASURE: &str = "UnitofMeasure";
pub const PROPERTY_STREAM_TYPE: &str = "StreamType";

/// Canonical name of a `Properties` entry, e.g. `Properties|UnitofTime`.
pub fn property_tag(name: &str) -> String {
    format!("Properties{}{}", TAG_SEPARATOR, name)
}

/// A numeric sample, timestamp in nanoseconds once it has entered the coalescer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub timestamp: u64,
    pub value: f64,
}

impl Reading {
    pub fn new(timestamp: u64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Value of a reading as submitted by a frontend.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadingValue {
    Numeric(f64),
    Object(serde_json::Value),
}

/// A reading as submitted by a frontend, timestamp in the message's unit of time.
#[derive(Debug, Clone, PartialEq)]
pub struct SmapReading {
    pub timestamp: u64,
    pub value: ReadingValue,
}

impl SmapReading {
    pub fn numeric(timestamp: u64, value: f64) -> Self {
        Self { timestamp, value: ReadingValue::Numeric(value) }
    }
}

/// What a frontend hands to the archiver.
#[derive(Debug, Clone, PartialEq)]
pub struct SmapMessage {
    pub path: String,
    pub uuid: StreamId,
    pub properties: Option<Properties>,
    pub metadata: BTreeMap<String, String>,
    pub actuator: BTreeMap<String, String>,
    pub readings: Vec<SmapReading>,
    pub key: Option<EphemeralKey>,
}

impl SmapMessage {
    pub fn new(path: impl Into<String>, uuid: StreamId) -> Self {
        Self {
            path: path.into(),
            uuid,
            properties: None,
            metadata: BTreeMap::new(),
            actuator: BTreeMap::new(),
            readings: Vec::new(),
            key: None,
        }
    }

    /// True if the message carries anything the metadata store should record.
    pub fn has_tags(&self) -> bool {
        !self.metadata.is_empty()
            || !self.actuator.is_empty()
            || self.properties.as_ref().map_or(false, |p| !p.is_empty())
    }

    /// Flattened document of every tag this message carries, keyed by canonical tag name.
    pub fn to_document(&self) -> BTreeMap<String, String> {
        let mut doc = BTreeMap::new();
        doc.insert(UUID_TAG.to_string(), self.uuid.to_string());
        if !self.path.is_empty() {
            doc.insert(PATH_TAG.to_string(), self.path.clone());
        }
        for (k, v) in &self.metadata {
            doc.insert(prefixed_tag("Metadata", k), v.clone());
        }
        for (k, v) in &self.actuator {
            doc.insert(prefixed_tag("Actuator", k), v.clone());
        }
        if let Some(props) = &self.properties {
            doc.extend(props.to_tags());
        }
        doc
    }
}

pub const UUID_TAG: &str = "uuid";
pub const PATH_TAG: &str = "Path";

fn prefixed_tag(prefix: &str, key: &str) -> String {
    format!("{}{}{}", prefix, TAG_SEPARATOR, canonical_key(key))
}

/// Rewrites `.` and `/` separators to `|` and drops empty segments.
pub fn canonical_key(key: &str) -> String {
    key.split(|c| c == '.' || c == '/' || c == TAG_SEPARATOR)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join(&TAG_SEPARATOR.to_string())
}

/// Canonical form of a tag name as used in queries and documents.
///
/// `Metadata/Room`, `metadata.Room` and `/Metadata/Room` all become `Metadata|Room`.
/// The `Metadata`, `Properties` and `Actuator` prefixes are normalised to that
/// capitalisation, as are `uuid` and `Path`; the rest of the name is kept verbatim.
pub fn canonical_tag(tag: &str) -> String {
    let key = canonical_key(tag);
    let (head, rest) = match key.split_once(TAG_SEPARATOR) {
        Some((head, rest)) => (head, Some(rest)),
        None => (key.as_str(), None),
    };
    let head = match head.to_lowercase().as_str() {
        "metadata" => "Metadata",
        "properties" => "Properties",
        "actuator" => "Actuator",
        "uuid" if rest.is_none() => UUID_TAG,
        "path" if rest.is_none() => PATH_TAG,
        _ => head,
    };
    match rest {
        Some(rest) => format!("{}{}{}", head, TAG_SEPARATOR, rest),
        None => head.to_string(),
    }
}
