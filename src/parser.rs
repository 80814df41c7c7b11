//! Tokenizer for new pane output.
//!
//! Each line of the fresh slice is classified into at most one typed
//! message: an explicit `### SENTRY {json}` marker, a bare single-line JSON
//! object, or a keyword heuristic. Lines that match nothing still reach the
//! policy engine as plain text for `log_regex` triggers.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

const MARKER: &str = "### SENTRY";

static SUCCESS_KEYWORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(done|success|passed|completed)\b").unwrap());
static ERROR_KEYWORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(error|failed|exception)\b").unwrap());

/// A typed event extracted from a single line of pane output.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    /// The `type` field of the JSON payload, or `ERROR` / `STATUS` /
    /// `UNKNOWN` for heuristic and untyped lines.
    pub kind: String,
    pub payload: Map<String, Value>,
    pub raw: String,
}

/// Classify lines into typed messages. Pure: the output depends only on the
/// input lines.
pub fn parse_messages(lines: &[String]) -> Vec<ParsedMessage> {
    let mut messages = Vec::new();
    for raw in lines {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix(MARKER) {
            if let Some(payload) = parse_json_object(rest.trim()) {
                messages.push(message_from_payload(payload, line));
                continue;
            }
            // Malformed marker JSON: drop the line, keep going.
            continue;
        }
        if line.starts_with('{') && line.ends_with('}') {
            if let Some(payload) = parse_json_object(line) {
                messages.push(message_from_payload(payload, line));
                continue;
            }
        }
        if ERROR_KEYWORDS.is_match(line) {
            let mut payload = Map::new();
            payload.insert("text".to_string(), Value::String(line.to_string()));
            messages.push(ParsedMessage {
                kind: "ERROR".to_string(),
                payload,
                raw: line.to_string(),
            });
        } else if SUCCESS_KEYWORDS.is_match(line) {
            let mut payload = Map::new();
            payload.insert("ok".to_string(), Value::Bool(true));
            payload.insert("text".to_string(), Value::String(line.to_string()));
            messages.push(ParsedMessage {
                kind: "STATUS".to_string(),
                payload,
                raw: line.to_string(),
            });
        }
    }
    messages
}

fn message_from_payload(payload: Map<String, Value>, raw: &str) -> ParsedMessage {
    let kind = payload
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN")
        .to_string();
    ParsedMessage {
        kind,
        payload,
        raw: raw.to_string(),
    }
}

fn parse_json_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}
