//! Classification of raw upstream frames.
//!
//! A frame is a JSON array of heterogeneous records, each tagged with an
//! `ev` discriminator. [`classify`] partitions one frame into status records,
//! per-category event records and unrecognized records, preserving the
//! relative order of same-category records.

use serde_json::Value;
use thiserror::Error;

use super::event::{
    Category, EventRecord, Payload, StatusRecord, CATEGORY_COUNT, DISCRIMINATOR_FIELD,
    STATUS_DISCRIMINATOR,
};

/// Maximum number of characters of a malformed frame included in logs.
pub const SAMPLE_LEN: usize = 200;

/// Label used for records without a usable discriminator.
const MISSING_DISCRIMINATOR: &str = "<missing>";

/// Label used for array elements that are not JSON objects.
const NON_OBJECT: &str = "<non-object>";

/// Errors that make a whole frame unusable.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is a JSON {kind}, expected an array of records")]
    NotRecords { kind: &'static str },
}

/// One frame partitioned by record kind.
#[derive(Debug, Default)]
pub struct ClassifiedFrame {
    /// Control/status records in arrival order.
    pub status: Vec<StatusRecord>,
    /// Discriminators of records that matched no known kind.
    pub unrecognized: Vec<String>,
    events: [Vec<EventRecord>; CATEGORY_COUNT],
}

impl ClassifiedFrame {
    /// Returns the classified records of one category.
    pub fn events(&self, category: Category) -> &[EventRecord] {
        &self.events[category.index()]
    }

    /// Moves the records of one category out of the frame.
    pub fn take_events(&mut self, category: Category) -> Vec<EventRecord> {
        std::mem::take(&mut self.events[category.index()])
    }

    /// Number of category records across all categories.
    pub fn event_count(&self) -> usize {
        self.events.iter().map(Vec::len).sum()
    }

    /// True when the frame carried anything besides status records.
    pub fn has_data(&self) -> bool {
        self.event_count() > 0 || !self.unrecognized.is_empty()
    }
}

/// Parses and classifies a raw text frame.
pub fn classify(raw: &str) -> Result<ClassifiedFrame, FrameError> {
    let value: Value = serde_json::from_str(raw)?;
    classify_value(value)
}

/// Classifies an already-parsed frame.
///
/// A bare object is accepted as a single-record frame.
pub fn classify_value(value: Value) -> Result<ClassifiedFrame, FrameError> {
    let records = match value {
        Value::Array(records) => records,
        Value::Object(record) => vec![Value::Object(record)],
        other => {
            return Err(FrameError::NotRecords {
                kind: json_kind(&other),
            })
        }
    };

    let mut frame = ClassifiedFrame::default();

    for record in records {
        let Value::Object(mut payload) = record else {
            frame.unrecognized.push(NON_OBJECT.to_string());
            continue;
        };

        let discriminator = match payload.remove(DISCRIMINATOR_FIELD) {
            Some(Value::String(ev)) => ev,
            _ => {
                frame.unrecognized.push(MISSING_DISCRIMINATOR.to_string());
                continue;
            }
        };

        if discriminator == STATUS_DISCRIMINATOR {
            frame.status.push(StatusRecord::from_payload(&payload));
            continue;
        }

        match Category::from_discriminator(&discriminator) {
            Some(category) => route(&mut frame, category, payload),
            None => frame.unrecognized.push(discriminator),
        }
    }

    Ok(frame)
}

fn route(frame: &mut ClassifiedFrame, category: Category, payload: Payload) {
    frame.events[category.index()].push(EventRecord::new(category, payload));
}

/// Returns a log-safe prefix of a frame, cut on a char boundary.
pub fn sample(raw: &str) -> &str {
    match raw.char_indices().nth(SAMPLE_LEN) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
