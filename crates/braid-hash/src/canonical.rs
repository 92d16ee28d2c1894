//! Canonical string form for messages and system prompts.
//!
//! Rules, applied in order: deduplicate tool blocks across the whole
//! sequence, strip `<system-reminder>` spans, normalize line endings and
//! whitespace, then serialize blocks with index prefixes.

use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::hash::sha256_hex;

fn reminder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Includes immediately preceding whitespace so stripped text re-joins cleanly.
    RE.get_or_init(|| Regex::new(r"(?is)\s*<system-reminder>.*?</system-reminder>").unwrap())
}

/// Remove every `<system-reminder>...</system-reminder>` span, case-insensitively.
pub fn strip_reminders(text: &str) -> String {
    reminder_re().replace_all(text, "").into_owned()
}

fn normalize(text: &str) -> String {
    text.replace("\r\n", "\n").trim().to_string()
}

fn strip_and_normalize(text: &str) -> String {
    normalize(&strip_reminders(text))
}

/// Drop repeated `tool_use` ids and repeated `tool_result` references across
/// the whole sequence. A message whose filtered block count differs from its
/// original is removed entirely — duplicate siblings take the message with
/// them (locked in by `dropping_duplicate_drops_whole_message`).
pub fn dedup_messages(messages: &[Value]) -> Vec<Value> {
    let mut seen_tool_use: HashSet<String> = HashSet::new();
    let mut seen_tool_result: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(messages.len());

    for message in messages {
        let Some(blocks) = message.get("content").and_then(Value::as_array) else {
            out.push(message.clone());
            continue;
        };

        let mut kept = 0usize;
        for block in blocks {
            let duplicate = match block.get("type").and_then(Value::as_str) {
                Some("tool_use") => {
                    let id = block.get("id").and_then(Value::as_str).unwrap_or_default();
                    !seen_tool_use.insert(id.to_string())
                }
                Some("tool_result") => {
                    let id = block
                        .get("tool_use_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    !seen_tool_result.insert(id.to_string())
                }
                _ => false,
            };
            if !duplicate {
                kept += 1;
            }
        }

        if kept == blocks.len() {
            out.push(message.clone());
        }
    }

    out
}

/// Serialize one block at position `index` in the kept-block list.
/// Returns `None` for text blocks that are empty after reminder stripping.
fn serialize_block(index: usize, block: &Value) -> Option<String> {
    let kind = block.get("type").and_then(Value::as_str).unwrap_or("unknown");
    match kind {
        "text" => {
            let text = block.get("text").and_then(Value::as_str).unwrap_or_default();
            let text = strip_and_normalize(text);
            if text.is_empty() {
                return None;
            }
            Some(format!("[{index}]text:{text}"))
        }
        "image" => {
            let media_type = block
                .pointer("/source/media_type")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let data = block
                .pointer("/source/data")
                .and_then(Value::as_str)
                .unwrap_or_default();
            // Image payloads are hashed, never embedded in the canonical form.
            Some(format!("[{index}]image:{media_type}:{}", sha256_hex(data)))
        }
        "tool_use" => {
            let name = block.get("name").and_then(Value::as_str).unwrap_or_default();
            let id = block.get("id").and_then(Value::as_str).unwrap_or_default();
            let input = block.get("input").cloned().unwrap_or(Value::Null);
            let input = serde_json::to_string(&input).unwrap_or_else(|_| "null".to_string());
            Some(format!("[{index}]tool_use:{name}:{id}:{input}"))
        }
        "tool_result" => {
            let id = block
                .get("tool_use_id")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let content = stringify_tool_result(block.get("content"));
            Some(format!("[{index}]tool_result:{id}:{content}"))
        }
        other => Some(format!("[{index}]{other}:unknown")),
    }
}

/// Flatten tool_result content into a stable string: bare strings are
/// stripped and normalized, block arrays contribute their text blocks,
/// anything else falls back to its JSON encoding.
fn stringify_tool_result(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => strip_and_normalize(s),
        Some(Value::Array(blocks)) => {
            let texts: Vec<String> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .map(strip_and_normalize)
                .collect();
            if texts.is_empty() {
                serde_json::to_string(content.unwrap_or(&Value::Null)).unwrap_or_default()
            } else {
                texts.join("\n")
            }
        }
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
        None => String::new(),
    }
}

/// Canonical form of a single message: the literal role, a colon, then the
/// serialized blocks joined by newlines. Bare string content is promoted to
/// a single text block at index 0.
pub fn serialize_message(message: &Value) -> String {
    let role = message.get("role").and_then(Value::as_str).unwrap_or_default();
    let body = match message.get("content") {
        Some(Value::String(s)) => format!("[0]text:{}", strip_and_normalize(s)),
        Some(Value::Array(blocks)) => {
            let mut parts = Vec::with_capacity(blocks.len());
            for block in blocks {
                if let Some(serialized) = serialize_block(parts.len(), block) {
                    parts.push(serialized);
                }
            }
            parts.join("\n")
        }
        _ => String::new(),
    };
    format!("{role}:{body}")
}

/// Canonical form of an (already deduplicated) message sequence.
pub fn serialize_messages(messages: &[Value]) -> String {
    messages
        .iter()
        .map(serialize_message)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Canonical form of a system prompt — text blocks only, no reminder
/// stripping, hashed separately from messages.
pub fn serialize_system(system: &Value) -> String {
    match system {
        Value::String(s) => format!("[0]text:{}", normalize(s)),
        Value::Array(blocks) => blocks
            .iter()
            .enumerate()
            .map(|(i, block)| {
                let text = block.get("text").and_then(Value::as_str).unwrap_or_default();
                format!("[{i}]text:{}", normalize(text))
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}
