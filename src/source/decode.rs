//! Debezium envelope decoding.
//!
//! Accepted record values, all JSON:
//! - `{"schema": …, "payload": {"op": …, "before": …, "after": …, "ts_ms": …}}`
//! - the same envelope without the `schema`/`payload` wrapper
//! - a bare row `{"value": 42}`, treated as an insert
//!
//! Rows emitted by the MongoDB connector arrive as JSON strings and are parsed
//! a second time. Integer fields may use MongoDB extended JSON
//! (`{"$numberLong": "42"}`).

use super::broker::RawRecord;
use crate::event_model::change_event::{ChangeEvent, ChangeKind};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Name of the single schema field contributing to the aggregate.
pub const VALUE_FIELD: &str = "value";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Event(ChangeEvent),
    /// Null record value: consumed without business effect.
    Tombstone,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("record at offset {offset} failed to decode: {failure}")]
pub struct DecodeError {
    pub offset: u64,
    pub failure: DecodeFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeFailure {
    NotJson(String),
    NotAnObject,
    UnknownOp(String),
    MissingRow,
    MissingValue,
    NotInteger(String),
}

impl fmt::Display for DecodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeFailure::NotJson(reason) => write!(f, "invalid JSON: {reason}"),
            DecodeFailure::NotAnObject => f.write_str("record is not a JSON object"),
            DecodeFailure::UnknownOp(op) => write!(f, "unknown change op `{op}`"),
            DecodeFailure::MissingRow => f.write_str("envelope carries no row image"),
            DecodeFailure::MissingValue => write!(f, "row has no `{VALUE_FIELD}` field"),
            DecodeFailure::NotInteger(found) => {
                write!(f, "`{VALUE_FIELD}` is not a 64-bit integer: {found}")
            }
        }
    }
}

/// Decodes one broker record. `fallback_ts_ms` stamps events carrying no timestamp.
pub fn decode_record(record: &RawRecord, fallback_ts_ms: u64) -> Result<Decoded, DecodeError> {
    let fail = |failure| DecodeError {
        offset: record.offset,
        failure,
    };
    let bytes = match record.value.as_deref() {
        None => return Ok(Decoded::Tombstone),
        Some(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => return Ok(Decoded::Tombstone),
        Some(bytes) => bytes,
    };
    let document: Value =
        serde_json::from_slice(bytes).map_err(|err| fail(DecodeFailure::NotJson(err.to_string())))?;
    let Value::Object(root) = document else {
        return Err(fail(DecodeFailure::NotAnObject));
    };
    let envelope = match unwrap_payload(root) {
        Some(envelope) => envelope,
        None => return Ok(Decoded::Tombstone),
    };
    let timestamp_ms = envelope
        .get("ts_ms")
        .and_then(Value::as_u64)
        .or(record.timestamp_ms)
        .unwrap_or(fallback_ts_ms);
    let key = record.key.clone().unwrap_or_default();

    let Some(op) = envelope.get("op") else {
        let value = integer_field(&envelope).map_err(fail)?;
        return Ok(Decoded::Event(
            ChangeEvent::new(record.offset, ChangeKind::Insert, value)
                .with_key(key)
                .with_timestamp_ms(timestamp_ms),
        ));
    };
    let op = op.as_str().unwrap_or_default();
    let kind = ChangeKind::from_op(op).ok_or_else(|| fail(DecodeFailure::UnknownOp(op.to_string())))?;
    let after = row_image(envelope.get("after")).map_err(fail)?;
    let before = row_image(envelope.get("before")).map_err(fail)?;
    let (row, previous) = match kind {
        ChangeKind::Delete => (before.or(after), None),
        ChangeKind::Insert | ChangeKind::Update => (after, before),
    };
    let row = row.ok_or_else(|| fail(DecodeFailure::MissingRow))?;
    let value = integer_field(&row).map_err(fail)?;
    let previous_value = previous.and_then(|row| integer_field(&row).ok());
    Ok(Decoded::Event(
        ChangeEvent::new(record.offset, kind, value)
            .with_key(key)
            .with_previous_value(previous_value)
            .with_timestamp_ms(timestamp_ms),
    ))
}

/// Strips the `schema`/`payload` wrapper. `None` when the payload is null.
fn unwrap_payload(mut root: Map<String, Value>) -> Option<Map<String, Value>> {
    if !root.contains_key("payload") || root.contains_key("op") {
        return Some(root);
    }
    match root.remove("payload") {
        Some(Value::Object(payload)) => Some(payload),
        Some(Value::Null) | None => None,
        Some(other) => {
            root.insert("payload".to_string(), other);
            Some(root)
        }
    }
}

fn row_image(image: Option<&Value>) -> Result<Option<Map<String, Value>>, DecodeFailure> {
    match image {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(row)) => Ok(Some(row.clone())),
        Some(Value::String(text)) => match serde_json::from_str(text) {
            Ok(Value::Object(row)) => Ok(Some(row)),
            Ok(_) => Err(DecodeFailure::NotAnObject),
            Err(err) => Err(DecodeFailure::NotJson(err.to_string())),
        },
        Some(_) => Err(DecodeFailure::NotAnObject),
    }
}

fn integer_field(row: &Map<String, Value>) -> Result<i64, DecodeFailure> {
    let field = row.get(VALUE_FIELD).ok_or(DecodeFailure::MissingValue)?;
    integer_value(field)
}

fn integer_value(field: &Value) -> Result<i64, DecodeFailure> {
    match field {
        Value::Number(number) => number
            .as_i64()
            .ok_or_else(|| DecodeFailure::NotInteger(number.to_string())),
        Value::Object(wrapper) => {
            let text = wrapper
                .get("$numberLong")
                .or_else(|| wrapper.get("$numberInt"))
                .and_then(Value::as_str)
                .ok_or_else(|| DecodeFailure::NotInteger(field.to_string()))?;
            text.parse()
                .map_err(|_| DecodeFailure::NotInteger(field.to_string()))
        }
        other => Err(DecodeFailure::NotInteger(other.to_string())),
    }
}
