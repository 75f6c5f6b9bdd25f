//! Decoding of hashtag lookup responses.
//!
//! The service answers with a JSON envelope carrying a `status` string and one
//! of two payload shapes. Each tag travels as a colon-delimited positional
//! record whose layout is fixed by the remote side.

use serde_json::{Map, Value};

use crate::hashtag::{split_suggestions, HashtagRecord, NEVER_FETCHED};

const RECORD_FIELD_SEPARATOR: char = ':';
const FIELD_NAME: usize = 0;
const FIELD_HASHTAG_ID: usize = 1;
// Fields 2 and 3 are reserved by the remote format and never read.
const FIELD_LIKES: usize = 4;
const FIELD_COMMENTS: usize = 5;
const FIELD_ENGAGEMENT: usize = 6;
const FIELD_SUGGESTIONS: usize = 7;
const MIN_RECORD_FIELDS: usize = FIELD_ENGAGEMENT + 1;
const FULL_RECORD_FIELDS: usize = FIELD_SUGGESTIONS + 1;
const TIER_KEYS: [&str; 4] = ["low", "medium", "high", "vhigh"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    TooManyRequests,
    Other(String),
}

impl ResponseStatus {
    fn from_wire(status: &str) -> Self {
        match status {
            "ok" => Self::Ok,
            "too-many-requests" => Self::TooManyRequests,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Payload shapes the service is known to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePayload {
    /// `tags`: tag name to record string.
    TagMap(Vec<(String, String)>),
    /// `low`/`medium`/`high`/`vhigh` record strings, already concatenated in tier order.
    Tiered(Vec<String>),
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResponse {
    pub status: ResponseStatus,
    pub payload: ResponsePayload,
}

pub fn parse_response(body: &str) -> Result<LookupResponse, String> {
    let value: Value =
        serde_json::from_str(body).map_err(|error| format!("Invalid JSON response: {error}"))?;
    let Some(object) = value.as_object() else {
        return Err("Response is not a JSON object".to_string());
    };

    let status = ResponseStatus::from_wire(
        object
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default(),
    );
    Ok(LookupResponse {
        status,
        payload: classify_payload(object),
    })
}

fn string_items(value: Option<&Value>) -> Option<Vec<String>> {
    match value {
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
        ),
        None | Some(Value::Null) => Some(Vec::new()),
        Some(_) => None,
    }
}

fn classify_payload(object: &Map<String, Value>) -> ResponsePayload {
    if let Some(tags) = object.get("tags") {
        let Some(tags) = tags.as_object() else {
            return ResponsePayload::Unrecognized;
        };
        let entries = tags
            .iter()
            .filter_map(|(name, record)| record.as_str().map(|text| (name.clone(), text.to_string())))
            .collect();
        return ResponsePayload::TagMap(entries);
    }

    if object.contains_key(TIER_KEYS[0]) {
        let mut records = Vec::new();
        for key in TIER_KEYS {
            let Some(items) = string_items(object.get(key)) else {
                return ResponsePayload::Unrecognized;
            };
            records.extend(items);
        }
        return ResponsePayload::Tiered(records);
    }

    ResponsePayload::Unrecognized
}

fn parse_count(field: Option<&&str>) -> Option<i64> {
    field.and_then(|text| text.trim().parse::<i64>().ok())
}

/// Decodes one positional record string.
pub fn decode_record(record: &str) -> Result<HashtagRecord, String> {
    let fields: Vec<&str> = record.split(RECORD_FIELD_SEPARATOR).collect();
    if fields.len() < MIN_RECORD_FIELDS {
        return Err(format!(
            "record has {} fields, expected at least {MIN_RECORD_FIELDS}: {record}",
            fields.len()
        ));
    }
    let name = fields[FIELD_NAME].trim();
    if name.is_empty() {
        return Err(format!("record has an empty name: {record}"));
    }

    let hashtag_id = Some(fields[FIELD_HASHTAG_ID].trim())
        .filter(|id| !id.is_empty())
        .map(str::to_string);
    let suggestions = fields
        .get(FIELD_SUGGESTIONS)
        .map(|joined| split_suggestions(joined))
        .unwrap_or_default();

    Ok(HashtagRecord {
        name: name.to_string(),
        hashtag_id,
        likes: parse_count(fields.get(FIELD_LIKES)),
        comments: parse_count(fields.get(FIELD_COMMENTS)),
        engagement: parse_count(fields.get(FIELD_ENGAGEMENT)),
        suggestions: Some(suggestions),
        score: None,
        last_update: NEVER_FETCHED,
    })
}

/// Decodes a tag-map entry. Values either carry the full record or omit the
/// leading name, in which case the map key supplies it.
fn decode_tag_map_entry(name: &str, value: &str) -> Result<HashtagRecord, String> {
    if value.split(RECORD_FIELD_SEPARATOR).count() >= FULL_RECORD_FIELDS {
        decode_record(value)
    } else {
        decode_record(&format!("{name}{RECORD_FIELD_SEPARATOR}{value}"))
    }
}

/// Flattens a payload into records. Malformed entries are reported separately
/// so the caller can log them without losing the rest of the batch.
pub fn payload_records(payload: &ResponsePayload) -> (Vec<HashtagRecord>, Vec<String>) {
    let mut records = Vec::new();
    let mut errors = Vec::new();
    let decoded: Vec<Result<HashtagRecord, String>> = match payload {
        ResponsePayload::TagMap(entries) => entries
            .iter()
            .map(|(name, value)| decode_tag_map_entry(name, value))
            .collect(),
        ResponsePayload::Tiered(items) => items.iter().map(|item| decode_record(item)).collect(),
        ResponsePayload::Unrecognized => Vec::new(),
    };
    for result in decoded {
        match result {
            Ok(record) => records.push(record),
            Err(error) => errors.push(error),
        }
    }
    (records, errors)
}
