//! JSON encoding of sMAP messages.
//!
//! Frontends receive payloads shaped like
//!
//! ```text
//! { "/path": { "uuid": "...", "Path": "/path",
//!              "Properties": {"UnitofTime": "ns", "UnitofMeasure": "W", "StreamType": "numeric"},
//!              "Metadata": {"Room": "410"},
//!              "Readings": [[1351043674000000000, 4.4]] } }
//! ```
//!
//! Entries without a `uuid` that only carry `Metadata` describe a collection: their
//! tags apply to every stream in the same payload whose path sits below them.

use super::{
    canonical_key, EphemeralKey, Properties, ReadingValue, SmapMessage, SmapReading, StreamId,
    StreamType, UnitOfTime, PROPERTY_STREAM_TYPE, PROPERTY_UNIT_OF_MEASURE,
    PROPERTY_UNIT_OF_TIME, TAG_SEPARATOR,
};
use crate::error::{GilesError, Result};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Parses an sMAP payload into messages.
///
/// Accepts either the path-keyed object form or a single message object.
pub fn parse_smap_json(payload: &Value, key: Option<&EphemeralKey>) -> Result<Vec<SmapMessage>> {
    let object = payload
        .as_object()
        .ok_or_else(|| GilesError::Ingest("payload must be a JSON object".to_string()))?;

    if object.contains_key("uuid") {
        let path = object.get("Path").and_then(Value::as_str).unwrap_or_default().to_string();
        let mut msg = parse_message(&path, object)?;
        msg.key = key.cloned();
        return Ok(vec![msg]);
    }

    let mut messages = Vec::new();
    let mut collections: Vec<(String, BTreeMap<String, String>)> = Vec::new();

    for (path, entry) in object {
        let entry = entry.as_object().ok_or_else(|| {
            GilesError::Ingest(format!("entry for path '{}' is not an object", path))
        })?;
        if entry.contains_key("uuid") {
            let mut msg = parse_message(path, entry)?;
            msg.key = key.cloned();
            messages.push(msg);
        } else if entry.contains_key("Readings") {
            return Err(GilesError::Ingest(format!("readings for path '{}' have no uuid", path)));
        } else if let Some(metadata) = entry.get("Metadata") {
            collections.push((path.clone(), flatten_tags(metadata)?));
        }
    }

    // Deeper collections win over shallower ones; the stream's own tags win over both.
    collections.sort_by_key(|(path, _)| path.len());
    for msg in &mut messages {
        let mut inherited = BTreeMap::new();
        for (prefix, tags) in &collections {
            if is_path_prefix(prefix, &msg.path) {
                inherited.extend(tags.clone());
            }
        }
        for (k, v) in inherited {
            msg.metadata.entry(k).or_insert(v);
        }
    }

    Ok(messages)
}

fn is_path_prefix(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    prefix.is_empty() || path == prefix || path.starts_with(&format!("{}/", prefix))
}

fn parse_message(path: &str, entry: &Map<String, Value>) -> Result<SmapMessage> {
    let uuid: StreamId = entry
        .get("uuid")
        .and_then(Value::as_str)
        .ok_or_else(|| GilesError::Ingest(format!("uuid for path '{}' must be a string", path)))?
        .parse()?;

    let path = entry.get("Path").and_then(Value::as_str).unwrap_or(path);
    let mut msg = SmapMessage::new(path, uuid);

    if let Some(props) = entry.get("Properties") {
        msg.properties = Some(parse_properties(props)?);
    }
    if let Some(metadata) = entry.get("Metadata") {
        msg.metadata = flatten_tags(metadata)?;
    }
    if let Some(actuator) = entry.get("Actuator") {
        msg.actuator = flatten_tags(actuator)?;
    }
    if let Some(readings) = entry.get("Readings") {
        msg.readings = parse_readings(readings)?;
    }
    Ok(msg)
}

fn parse_properties(value: &Value) -> Result<Properties> {
    let object = value
        .as_object()
        .ok_or_else(|| GilesError::Ingest("Properties must be an object".to_string()))?;
    let mut props = Properties::default();
    for (k, v) in object {
        let text = v.as_str().ok_or_else(|| {
            GilesError::Ingest(format!("property '{}' must be a string", k))
        })?;
        // Producers disagree on the capitalisation of "of".
        match k.to_lowercase().as_str() {
            "unitoftime" => {
                props.unit_of_time =
                    Some(text.parse::<UnitOfTime>().map_err(GilesError::Ingest)?);
            }
            "unitofmeasure" => props.unit_of_measure = Some(text.to_string()),
            "streamtype" => {
                props.stream_type = Some(text.parse::<StreamType>().map_err(GilesError::Ingest)?);
            }
            _ => {}
        }
    }
    Ok(props)
}

/// Flattens a (possibly nested) JSON object into canonical `|`-separated keys.
fn flatten_tags(value: &Value) -> Result<BTreeMap<String, String>> {
    let object = value
        .as_object()
        .ok_or_else(|| GilesError::Ingest("tags must be a JSON object".to_string()))?;
    let mut out = BTreeMap::new();
    flatten_into("", object, &mut out);
    Ok(out)
}

fn flatten_into(prefix: &str, object: &Map<String, Value>, out: &mut BTreeMap<String, String>) {
    for (k, v) in object {
        let key = if prefix.is_empty() {
            canonical_key(k)
        } else {
            format!("{}{}{}", prefix, TAG_SEPARATOR, canonical_key(k))
        };
        match v {
            Value::Object(inner) => flatten_into(&key, inner, out),
            Value::String(s) => {
                out.insert(key, s.clone());
            }
            Value::Null => {}
            other => {
                out.insert(key, other.to_string());
            }
        }
    }
}

fn parse_readings(value: &Value) -> Result<Vec<SmapReading>> {
    let array = value
        .as_array()
        .ok_or_else(|| GilesError::Ingest("Readings must be an array".to_string()))?;
    array.iter().map(parse_reading).collect()
}

fn parse_reading(value: &Value) -> Result<SmapReading> {
    let pair = value
        .as_array()
        .filter(|pair| pair.len() == 2)
        .ok_or_else(|| GilesError::Ingest(format!("reading {} is not a [time, value] pair", value)))?;

    let timestamp = match &pair[0] {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
        _ => None,
    }
    .ok_or_else(|| GilesError::Ingest(format!("bad timestamp {} in reading", pair[0])))?;

    let value = match &pair[1] {
        Value::Number(n) => n
            .as_f64()
            .map(ReadingValue::Numeric)
            .ok_or_else(|| GilesError::Ingest(format!("bad numeric value {}", n)))?,
        other => ReadingValue::Object(other.clone()),
    };

    Ok(SmapReading { timestamp, value })
}

impl SmapMessage {
    /// JSON record used in query responses and subscriber deliveries.
    pub fn to_json(&self) -> Value {
        let mut record = Map::new();
        record.insert("uuid".to_string(), Value::String(self.uuid.to_string()));
        if !self.path.is_empty() {
            record.insert("Path".to_string(), Value::String(self.path.clone()));
        }
        let readings: Vec<Value> = self
            .readings
            .iter()
            .map(|r| match &r.value {
                ReadingValue::Numeric(v) => json!([r.timestamp, v]),
                ReadingValue::Object(v) => json!([r.timestamp, v]),
            })
            .collect();
        record.insert("Readings".to_string(), Value::Array(readings));
        if !self.metadata.is_empty() {
            record.insert("Metadata".to_string(), nest(self.metadata.iter()));
        }
        if !self.actuator.is_empty() {
            record.insert("Actuator".to_string(), nest(self.actuator.iter()));
        }
        if let Some(props) = self.properties.as_ref().filter(|p| !p.is_empty()) {
            let mut object = Map::new();
            if let Some(uot) = props.unit_of_time {
                object.insert(PROPERTY_UNIT_OF_TIME.into(), Value::String(uot.to_string()));
            }
            if let Some(uom) = &props.unit_of_measure {
                object.insert(PROPERTY_UNIT_OF_MEASURE.into(), Value::String(uom.clone()));
            }
            if let Some(st) = props.stream_type {
                object.insert(PROPERTY_STREAM_TYPE.into(), Value::String(st.as_str().into()));
            }
            record.insert("Properties".to_string(), Value::Object(object));
        }
        Value::Object(record)
    }
}

/// Renders a flat canonical document as nested JSON.
///
/// `Metadata|Location|Building = "Soda"` becomes
/// `{"Metadata": {"Location": {"Building": "Soda"}}}`.
pub fn render_document(doc: &BTreeMap<String, String>) -> Value {
    nest(doc.iter())
}

fn nest<'a>(entries: impl Iterator<Item = (&'a String, &'a String)>) -> Value {
    let mut root = Map::new();
    for (key, value) in entries {
        let segments: Vec<&str> = key.split(TAG_SEPARATOR).collect();
        insert_nested(&mut root, &segments, value);
    }
    Value::Object(root)
}

fn insert_nested(object: &mut Map<String, Value>, segments: &[&str], value: &str) {
    match segments {
        [] => {}
        [last] => {
            object.insert((*last).to_string(), Value::String(value.to_string()));
        }
        [head, rest @ ..] => {
            let slot = object
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            match slot {
                Value::Object(inner) => insert_nested(inner, rest, value),
                // A scalar already sits at this level; keep the remainder as one joined key.
                _ => {
                    let joined = segments.join(&TAG_SEPARATOR.to_string());
                    object.insert(joined, Value::String(value.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "d24325e6-1d7d-11e2-ad69-a7c2fa8dba61";

    #[test]
    fn test_parse_path_keyed_payload() {
        let payload = json!({
            "/sensor0": {
                "uuid": UUID,
                "Properties": {"UnitofTime": "ns", "UnitofMeasure": "W", "StreamType": "numeric"},
                "Metadata": {"Room": "410", "Location": {"Building": "Soda"}},
                "Readings": [[1351043674000000000u64, 4.4]]
            }
        });
        let msgs = parse_smap_json(&payload, None).unwrap();
        assert_eq!(msgs.len(), 1);
        let msg = &msgs[0];
        assert_eq!(msg.path, "/sensor0");
        assert_eq!(msg.uuid.to_string(), UUID);
        let props = msg.properties.as_ref().unwrap();
        assert_eq!(props.unit_of_time, Some(UnitOfTime::Nanoseconds));
        assert_eq!(props.stream_type, Some(StreamType::Numeric));
        assert_eq!(msg.metadata.get("Location|Building").map(String::as_str), Some("Soda"));
        assert_eq!(msg.readings, vec![SmapReading::numeric(1_351_043_674_000_000_000, 4.4)]);
    }

    #[test]
    fn test_collection_metadata_is_inherited() {
        let payload = json!({
            "/": {"Metadata": {"Site": "Berkeley"}},
            "/building": {"Metadata": {"Site": "Soda", "Floor": "4"}},
            "/building/sensor0": {"uuid": UUID, "Metadata": {"Floor": "5"}, "Readings": []}
        });
        let msgs = parse_smap_json(&payload, None).unwrap();
        assert_eq!(msgs.len(), 1);
        let md = &msgs[0].metadata;
        assert_eq!(md.get("Site").map(String::as_str), Some("Soda"));
        assert_eq!(md.get("Floor").map(String::as_str), Some("5"));
    }

    #[test]
    fn test_rejects_bad_input() {
        let no_uuid = json!({"/s": {"Readings": [[1, 2]]}});
        assert!(matches!(parse_smap_json(&no_uuid, None), Err(GilesError::Ingest(_))));

        let bad_reading = json!({"uuid": UUID, "Readings": [[-1, 2]]});
        assert!(parse_smap_json(&bad_reading, None).is_err());

        let bad_unit = json!({"uuid": UUID, "Properties": {"UnitofTime": "weeks"}});
        assert!(parse_smap_json(&bad_unit, None).is_err());
    }

    #[test]
    fn test_object_values_are_kept() {
        let payload = json!({"uuid": UUID, "Readings": [[5, {"state": "on"}]]});
        let msgs = parse_smap_json(&payload, None).unwrap();
        assert!(matches!(msgs[0].readings[0].value, ReadingValue::Object(_)));
    }

    #[test]
    fn test_render_document_nests_keys() {
        let mut doc = BTreeMap::new();
        doc.insert("uuid".to_string(), UUID.to_string());
        doc.insert("Metadata|Location|Building".to_string(), "Soda".to_string());
        doc.insert("Metadata|Room".to_string(), "410".to_string());
        let rendered = render_document(&doc);
        assert_eq!(rendered["Metadata"]["Location"]["Building"], "Soda");
        assert_eq!(rendered["Metadata"]["Room"], "410");
        assert_eq!(rendered["uuid"], UUID);
    }

    #[test]
    fn test_message_to_json() {
        let mut msg = SmapMessage::new("/s", UUID.parse().unwrap());
        msg.readings.push(SmapReading::numeric(10, 1.5));
        let rendered = msg.to_json();
        assert_eq!(rendered["uuid"], UUID);
        assert_eq!(rendered["Readings"][0][0], 10);
        assert_eq!(rendered["Readings"][0][1], 1.5);
    }
}
