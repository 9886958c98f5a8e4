//! Response parsing.
//!
//! A response body is turned into keyed items. A body that cannot be read
//! at all fails the whole fetch; a single malformed item is skipped and
//! counted instead.

use crate::error::{IngestError, IngestResult};
use serde_json::{Map, Value};
use tidesync_protocol::Payload;
use tracing::{debug, warn};

/// Layout of an external response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFormat {
    /// A JSON document.
    ///
    /// Items live under `array_key` (or are the whole body when `None`),
    /// either as an array or as an object keyed by item id. Array items
    /// take their key from `key_field`, falling back to their index.
    Json {
        /// Field holding the items.
        array_key: Option<String>,
        /// Item field holding the key.
        key_field: Option<String>,
    },
    /// Field-delimited text: one header line, then one item per line.
    Delimited {
        /// Field separator.
        delimiter: char,
        /// Header column holding the key.
        key_field: String,
    },
}

impl ResponseFormat {
    /// JSON body whose items are the whole document.
    pub fn json() -> Self {
        ResponseFormat::Json {
            array_key: None,
            key_field: None,
        }
    }

    /// JSON body with items under `array_key`, keyed by `key_field`.
    pub fn json_array(array_key: impl Into<String>, key_field: impl Into<String>) -> Self {
        ResponseFormat::Json {
            array_key: Some(array_key.into()),
            key_field: Some(key_field.into()),
        }
    }

    /// Delimited text keyed by the `key_field` column.
    pub fn delimited(delimiter: char, key_field: impl Into<String>) -> Self {
        ResponseFormat::Delimited {
            delimiter,
            key_field: key_field.into(),
        }
    }
}

/// One parsed item.
#[derive(Debug, Clone, PartialEq)]
pub struct RawItem {
    /// Item key, before namespacing.
    pub key: String,
    /// Item payload.
    pub payload: Payload,
}

/// Items parsed from one body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parsed {
    /// Items that parsed cleanly.
    pub items: Vec<RawItem>,
    /// Items that were skipped as malformed.
    pub failures: usize,
}

/// Parses a response body.
pub fn parse(body: &str, format: &ResponseFormat) -> IngestResult<Parsed> {
    match format {
        ResponseFormat::Json {
            array_key,
            key_field,
        } => parse_json(body, array_key.as_deref(), key_field.as_deref()),
        ResponseFormat::Delimited {
            delimiter,
            key_field,
        } => parse_delimited(body, *delimiter, key_field),
    }
}

fn parse_json(body: &str, array_key: Option<&str>, key_field: Option<&str>) -> IngestResult<Parsed> {
    let document: Value =
        serde_json::from_str(body).map_err(|e| IngestError::Parse(format!("invalid JSON: {e}")))?;

    let container = match array_key {
        Some(field) => document
            .get(field)
            .ok_or_else(|| IngestError::Parse(format!("missing field `{field}`")))?,
        None => &document,
    };

    let parsed = match container {
        Value::Array(items) => {
            let mut parsed = Parsed::default();
            for (index, item) in items.iter().enumerate() {
                match item_key(item, key_field, index) {
                    Some(key) => parsed.items.push(RawItem {
                        key,
                        payload: item.clone(),
                    }),
                    None => {
                        debug!(index, "skipping item with unusable key");
                        parsed.failures += 1;
                    }
                }
            }
            parsed
        }
        Value::Object(map) => Parsed {
            items: map
                .iter()
                .map(|(key, payload)| RawItem {
                    key: key.clone(),
                    payload: payload.clone(),
                })
                .collect(),
            failures: 0,
        },
        _ => return Err(IngestError::Parse("items are neither an array nor an object".into())),
    };

    if let Some(count) = document.get("count").and_then(Value::as_u64) {
        let seen = (parsed.items.len() + parsed.failures) as u64;
        if count != seen {
            warn!(count, seen, "response count disagrees with item count");
        }
    }
    Ok(parsed)
}

/// Key of an array item: the `key_field` value, or the index when absent.
fn item_key(item: &Value, key_field: Option<&str>, index: usize) -> Option<String> {
    let value = match key_field.and_then(|field| item.get(field)) {
        Some(value) => value,
        None => return Some(index.to_string()),
    };
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_delimited(body: &str, delimiter: char, key_field: &str) -> IngestResult<Parsed> {
    let mut lines = body.lines().map(str::trim_end).filter(|l| !l.trim().is_empty());
    let header: Vec<String> = lines
        .next()
        .ok_or_else(|| IngestError::Parse("missing header line".into()))?
        .split(delimiter)
        .map(|f| f.trim().to_string())
        .collect();
    let key_index = header
        .iter()
        .position(|f| f == key_field)
        .ok_or_else(|| IngestError::Parse(format!("header has no `{key_field}` column")))?;

    let mut parsed = Parsed::default();
    for (line_no, line) in lines.enumerate() {
        let fields: Vec<&str> = line.split(delimiter).map(str::trim).collect();
        if fields.len() != header.len() {
            debug!(line = line_no + 2, expected = header.len(), found = fields.len(), "skipping malformed line");
            parsed.failures += 1;
            continue;
        }
        let key = fields[key_index];
        if key.is_empty() {
            parsed.failures += 1;
            continue;
        }
        let payload: Map<String, Value> = header
            .iter()
            .zip(&fields)
            .map(|(name, value)| (name.clone(), Value::String((*value).to_string())))
            .collect();
        parsed.items.push(RawItem {
            key: key.to_string(),
            payload: Value::Object(payload),
        });
    }
    Ok(parsed)
}
