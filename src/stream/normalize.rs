//! Raw backend output to [`NormalizedEvent`]s.
//!
//! Backends emit one of three line shapes:
//! - nested records carrying a `content` array of blocks, either at the top
//!   level next to `role` or under `message`
//! - flat records keyed by a top-level `type`
//! - timestamp-prefixed verbose lines, `[ts] verb payload`
//!
//! Each shape has its own adapter. The adapter is chosen by which keys are
//! present, never by trying one parser after another.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::trace;

use super::detail::tool_detail;
use super::event::NormalizedEvent;

static VERBOSE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[([^\]]+)\]\s+([A-Za-z_][\w.-]*)(?:\s+(.*))?$").unwrap()
});

/// Flat discriminators that mark the end of a backend run.
const COMPLETION_TYPES: &[&str] = &[
    "result",
    "turn.completed",
    "turn_complete",
    "complete",
    "done",
];

/// Normalize a chunk of backend output.
///
/// Total: never panics and never drops a structured line. Blank lines are
/// skipped. Lines that neither look structured nor match the verbose shape
/// are terminal noise and produce nothing.
pub fn normalize(chunk: &str) -> Vec<NormalizedEvent> {
    chunk
        .lines()
        .flat_map(|line| normalize_line(line, false))
        .collect()
}

/// Normalize one line. With `keep_plain_text` unstructured lines become
/// `text` events instead of being dropped.
pub fn normalize_line(line: &str, keep_plain_text: bool) -> Vec<NormalizedEvent> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }

    if line.starts_with('{') {
        return parse_json_line(line);
    }
    if let Some(caps) = VERBOSE_LINE_RE.captures(line) {
        let timestamp = caps.get(1).map_or("", |m| m.as_str());
        let verb = caps.get(2).map_or("", |m| m.as_str());
        let payload = caps.get(3).map_or("", |m| m.as_str().trim());
        return vec![adapt_verbose(timestamp, verb, payload)];
    }
    if line.starts_with('[') {
        return parse_json_line(line);
    }

    if keep_plain_text {
        vec![NormalizedEvent::text(line)]
    } else {
        trace!(line, "dropping unstructured line");
        Vec::new()
    }
}

fn parse_json_line(line: &str) -> Vec<NormalizedEvent> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(record)) => adapt_record(record),
        Ok(other) => vec![NormalizedEvent::metadata(other)],
        Err(err) => {
            trace!(error = %err, "malformed structured line kept as text");
            vec![NormalizedEvent::text(line)]
        }
    }
}

fn adapt_record(record: Map<String, Value>) -> Vec<NormalizedEvent> {
    let nested = match record.get("message").and_then(|m| m.get("content")) {
        Some(Value::Array(blocks)) => Some(blocks.iter().map(adapt_block).collect::<Vec<_>>()),
        _ if record.contains_key("role") => match record.get("content") {
            Some(Value::Array(blocks)) => Some(blocks.iter().map(adapt_block).collect()),
            Some(Value::String(content)) => Some(vec![NormalizedEvent::text(content.clone())]),
            _ => None,
        },
        _ => None,
    };
    match nested {
        // An empty content array is still a record.
        Some(events) if events.is_empty() => {
            return vec![NormalizedEvent::metadata(Value::Object(record))]
        }
        Some(events) => return events,
        None => {}
    }
    let kind = record
        .get("type")
        .and_then(Value::as_str)
        .map(String::from);
    if let Some(kind) = kind {
        return vec![adapt_flat(&kind, record)];
    }
    vec![NormalizedEvent::metadata(Value::Object(record))]
}

/// One content block of a nested record.
fn adapt_block(block: &Value) -> NormalizedEvent {
    match block.get("type").and_then(Value::as_str) {
        Some("text") => NormalizedEvent::text(str_field(block, &["text", "content"])),
        Some("thinking") => NormalizedEvent::thinking(str_field(block, &["thinking", "text"])),
        Some("tool_use") => tool_call(
            str_field(block, &["id"]),
            str_field(block, &["name"]),
            block.get("input").cloned().unwrap_or(Value::Null),
        ),
        Some("tool_result") => NormalizedEvent::ToolResult {
            tool_use_id: str_field(block, &["tool_use_id"]),
            content: result_content(block.get("content")),
            is_error: block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        _ => NormalizedEvent::metadata(block.clone()),
    }
}

fn adapt_flat(kind: &str, record: Map<String, Value>) -> NormalizedEvent {
    let value = Value::Object(record);
    match kind {
        "text" => NormalizedEvent::text(str_field(&value, &["content", "text"])),
        "thinking" | "reasoning" => {
            NormalizedEvent::thinking(str_field(&value, &["content", "thinking", "text"]))
        }
        "message" => match value.get("content") {
            Some(Value::String(content)) => NormalizedEvent::text(content.clone()),
            _ => NormalizedEvent::metadata(value),
        },
        "tool_use" | "tool_call" => {
            let input = first_value(&value, &["input", "parameters", "arguments"])
                .map(decode_arguments)
                .unwrap_or(Value::Null);
            tool_call(
                str_field(&value, &["id", "tool_id"]),
                str_field(&value, &["name", "tool_name"]),
                input,
            )
        }
        "tool_result" => {
            let is_error = value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or_else(|| value.get("status").and_then(Value::as_str) == Some("error"));
            NormalizedEvent::ToolResult {
                tool_use_id: str_field(&value, &["tool_use_id", "tool_id"]),
                content: result_content(first_value(&value, &["content", "output"])),
                is_error,
            }
        }
        kind if COMPLETION_TYPES.contains(&kind) => {
            let reason = ["subtype", "reason"]
                .iter()
                .find_map(|k| value.get(*k).and_then(Value::as_str))
                .unwrap_or(kind);
            NormalizedEvent::complete(Some(reason.to_string()))
        }
        _ => NormalizedEvent::metadata(value),
    }
}

fn adapt_verbose(timestamp: &str, verb: &str, payload: &str) -> NormalizedEvent {
    match verb {
        "thinking" => NormalizedEvent::thinking(payload),
        "exec" => tool_call(String::new(), "exec".to_string(), json!({ "command": payload })),
        "tool" => {
            let (name, rest) = payload.split_once(char::is_whitespace).unwrap_or((payload, ""));
            tool_call(
                String::new(),
                name.to_string(),
                Value::String(rest.trim().to_string()),
            )
        }
        "codex" | "assistant" | "message" => NormalizedEvent::text(payload),
        "done" | "complete" | "completed" => {
            NormalizedEvent::complete((!payload.is_empty()).then(|| payload.to_string()))
        }
        _ => NormalizedEvent::metadata(json!({
            "timestamp": timestamp,
            "verb": verb,
            "payload": payload,
        })),
    }
}

fn tool_call(id: String, name: String, input: Value) -> NormalizedEvent {
    let detail = tool_detail(&name, &input);
    NormalizedEvent::ToolCall {
        id,
        name,
        input,
        detail,
    }
}

/// Some backends send tool arguments as an encoded JSON string.
fn decode_arguments(value: &Value) -> Value {
    match value {
        Value::String(s) if s.trim_start().starts_with('{') => {
            serde_json::from_str(s).unwrap_or_else(|_| value.clone())
        }
        other => other.clone(),
    }
}

/// Tool result content is either a string or an array of text blocks.
fn result_content(content: Option<&Value>) -> String {
    match content {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .map(|b| match b {
                Value::String(s) => s.clone(),
                other => other
                    .get("text")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(|| other.to_string()),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
    }
}

fn first_value<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| value.get(*k))
}

fn str_field(value: &Value, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}
