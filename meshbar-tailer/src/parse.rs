//! Recognition of structured event lines.
//!
//! The engine logs events as a JSON object embedded in an otherwise plain log
//! line, e.g.
//!
//! ```text
//! 2024-05-01T10:00:00Z  INFO easytier::events: {"time":"2024-05-01T10:00:00+00:00","event":{"PeerAdded":1234}}
//! ```
//!
//! `event` is either a bare tag string or a single-key object whose key is the
//! tag and whose value is the payload.

use chrono::{DateTime, FixedOffset, Local};
use meshbar_core::{EventKind, EventRecord};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::pretty::pretty_print;

const DISPLAY_FORMAT: &str = "%H:%M:%S";

/// Turn an ANSI-stripped line into an event, or `None` for plain text.
///
/// `arrival` stamps lines whose JSON carries no parseable `time`.
pub fn parse_event_line(line: &str, arrival: DateTime<Local>) -> Option<EventRecord> {
    let object = json_span(line)?;

    let time = object
        .get("time")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok());

    let (kind, payload) = match object.get("event") {
        Some(Value::String(tag)) => (EventKind::from_tag(tag), None),
        Some(Value::Object(inner)) if inner.len() == 1 => {
            let (tag, payload) = inner.iter().next()?;
            (EventKind::from_tag(tag), Some(payload.clone()))
        }
        Some(other) => (EventKind::Unknown, Some(other.clone())),
        None => (EventKind::Unknown, Some(Value::Object(object.clone()))),
    };

    let (details, highlights) = match (&payload, object.get("event")) {
        (Some(payload), _) => {
            let pretty = pretty_print(payload);
            (pretty.text, pretty.highlights)
        }
        (None, Some(Value::String(tag))) => (tag.clone(), Vec::new()),
        (None, _) => (String::new(), Vec::new()),
    };

    Some(EventRecord {
        id: Uuid::new_v4().to_string(),
        timestamp: display_timestamp(time, arrival),
        time,
        kind,
        details,
        highlights,
    })
}

/// Outermost `{...}` span of the line, if it parses as a JSON object.
fn json_span(line: &str) -> Option<Map<String, Value>> {
    let start = line.find('{')?;
    let end = line.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&line[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => None,
        Err(err) => {
            tracing::trace!(error = %err, "brace span is not JSON");
            None
        }
    }
}

fn display_timestamp(time: Option<DateTime<FixedOffset>>, arrival: DateTime<Local>) -> String {
    match time {
        Some(time) => time.with_timezone(&Local).format(DISPLAY_FORMAT).to_string(),
        None => arrival.format(DISPLAY_FORMAT).to_string(),
    }
}
