//! SSE response reconstruction.
//!
//! The proxy tees raw bytes to the client verbatim while folding the event
//! stream back into a complete `messages` response for persistence and
//! metrics. Unparseable `data:` payloads are forwarded untouched and logged.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use braid_core::types::TokenUsage;

/// Parse a single SSE line: `event: <type>` or `data: <json>`.
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ")
            .map(|data| SseParsed::Data(data.to_string()))
    }
}

#[derive(Debug)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

/// The response rebuilt from a completed (or aborted) event stream.
#[derive(Debug, Clone, Default)]
pub struct ReconstructedResponse {
    pub id: String,
    pub model: String,
    pub role: String,
    pub content: Vec<Value>,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    pub usage: TokenUsage,
    pub tool_call_count: u32,
    /// False when the stream ended before `message_stop` / `[DONE]`.
    pub complete: bool,
}

impl ReconstructedResponse {
    /// Reassemble the JSON body the non-streaming API would have returned.
    pub fn to_body(&self) -> Value {
        json!({
            "id": self.id,
            "type": "message",
            "role": self.role,
            "model": self.model,
            "content": self.content,
            "stop_reason": self.stop_reason,
            "stop_sequence": self.stop_sequence,
            "usage": {
                "input_tokens": self.usage.input_tokens,
                "output_tokens": self.usage.output_tokens,
                "cache_creation_input_tokens": self.usage.cache_creation_input_tokens,
                "cache_read_input_tokens": self.usage.cache_read_input_tokens,
            },
        })
    }

    /// Text of the first text content block, if any.
    pub fn first_text(&self) -> Option<&str> {
        self.content
            .iter()
            .find(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .and_then(|b| b.get("text").and_then(Value::as_str))
    }
}

/// In-flight block state between `content_block_start` and
/// `content_block_stop`.
enum OpenBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input_json: String,
    },
    /// Unknown block kinds are committed verbatim from their start payload.
    Other(Value),
}

/// Folds SSE events into a [`ReconstructedResponse`]. Feed complete lines
/// via [`StreamAssembler::apply_line`]; fetch the result with `finish`.
#[derive(Default)]
pub struct StreamAssembler {
    current_event: String,
    open_block: Option<OpenBlock>,
    response: ReconstructedResponse,
    done: bool,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the terminator has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Apply one SSE line. Blank lines (event separators) are ignored —
    /// state is keyed off the `event:`/`data:` pair.
    pub fn apply_line(&mut self, line: &str) {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            return;
        }
        match parse_sse_line(line) {
            Some(SseParsed::Event(event)) => self.current_event = event,
            Some(SseParsed::Data(data)) => self.apply_data(&data),
            None => {}
        }
    }

    fn apply_data(&mut self, data: &str) {
        if data.trim() == "[DONE]" {
            self.done = true;
            return;
        }

        let Ok(payload) = serde_json::from_str::<Value>(data) else {
            // Forwarded verbatim by the tee; nothing to fold in.
            debug!(len = data.len(), "unparseable SSE data line passed through");
            return;
        };

        // Some upstreams omit `event:` lines; fall back to the payload type.
        let event_type = if self.current_event.is_empty() {
            payload
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        } else {
            self.current_event.clone()
        };

        match event_type.as_str() {
            "message_start" => {
                if let Ok(start) = serde_json::from_value::<MessageStart>(payload) {
                    self.response.id = start.message.id;
                    self.response.model = start.message.model;
                    self.response.role = start.message.role;
                    self.response.usage = start.message.usage;
                }
            }

            "content_block_start" => {
                // Commit any block left open by a missing stop event.
                self.commit_block();
                if let Some(block) = payload.get("content_block") {
                    self.open_block = Some(match block.get("type").and_then(Value::as_str) {
                        Some("text") => OpenBlock::Text {
                            text: block
                                .get("text")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                        },
                        Some("tool_use") => OpenBlock::ToolUse {
                            id: block
                                .get("id")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            name: block
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            input_json: String::new(),
                        },
                        _ => OpenBlock::Other(block.clone()),
                    });
                }
            }

            "content_block_delta" => match payload.pointer("/delta/type").and_then(Value::as_str) {
                Some("text_delta") => {
                    if let (Some(OpenBlock::Text { text }), Some(delta)) = (
                        self.open_block.as_mut(),
                        payload.pointer("/delta/text").and_then(Value::as_str),
                    ) {
                        text.push_str(delta);
                    }
                }
                Some("input_json_delta") => {
                    if let (Some(OpenBlock::ToolUse { input_json, .. }), Some(partial)) = (
                        self.open_block.as_mut(),
                        payload.pointer("/delta/partial_json").and_then(Value::as_str),
                    ) {
                        input_json.push_str(partial);
                    }
                }
                other => {
                    debug!(delta_type = other, "unhandled content delta");
                }
            },

            "content_block_stop" => self.commit_block(),

            "message_delta" => {
                if let Some(reason) = payload.pointer("/delta/stop_reason").and_then(Value::as_str)
                {
                    self.response.stop_reason = Some(reason.to_string());
                }
                if let Some(seq) = payload.pointer("/delta/stop_sequence").and_then(Value::as_str)
                {
                    self.response.stop_sequence = Some(seq.to_string());
                }
                if let Some(usage) = payload.get("usage") {
                    if let Ok(delta) = serde_json::from_value::<TokenUsage>(usage.clone()) {
                        self.response.usage.apply_delta(&delta);
                    }
                }
            }

            "message_stop" => {
                self.commit_block();
                self.done = true;
            }

            "error" => {
                warn!(data, "upstream stream error event");
            }

            "ping" => {}

            other => {
                debug!(event = other, "unhandled SSE event");
            }
        }
    }

    fn commit_block(&mut self) {
        let Some(block) = self.open_block.take() else {
            return;
        };
        let value = match block {
            OpenBlock::Text { text } => json!({"type": "text", "text": text}),
            OpenBlock::ToolUse {
                id,
                name,
                input_json,
            } => {
                // Keep the raw buffer when it does not parse as JSON.
                let input = serde_json::from_str::<Value>(&input_json)
                    .unwrap_or_else(|_| Value::String(input_json));
                self.response.tool_call_count += 1;
                json!({"type": "tool_use", "id": id, "name": name, "input": input})
            }
            OpenBlock::Other(value) => value,
        };
        self.response.content.push(value);
    }

    /// Finalize, committing any still-open block. `complete` reflects
    /// whether the stream terminated normally.
    pub fn finish(mut self) -> ReconstructedResponse {
        self.commit_block();
        self.response.complete = self.done;
        self.response
    }
}

#[derive(Deserialize)]
struct MessageStart {
    message: MessageStartInner,
}

#[derive(Deserialize)]
struct MessageStartInner {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    usage: TokenUsage,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(assembler: &mut StreamAssembler, lines: &[&str]) {
        for line in lines {
            assembler.apply_line(line);
        }
    }

    #[test]
    fn reconstructs_text_response() {
        let mut assembler = StreamAssembler::new();
        feed(
            &mut assembler,
            &[
                "event: message_start",
                r#"data: {"type":"message_start","message":{"id":"msg_1","model":"claude-sonnet-4-5","role":"assistant","usage":{"input_tokens":12,"cache_read_input_tokens":3}}}"#,
                "event: content_block_start",
                r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
                "event: content_block_delta",
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
                "event: content_block_delta",
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":", world"}}"#,
                "event: content_block_stop",
                r#"data: {"type":"content_block_stop","index":0}"#,
                "event: message_delta",
                r#"data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#,
                "event: message_stop",
                r#"data: {"type":"message_stop"}"#,
            ],
        );
        let response = assembler.finish();
        assert!(response.complete);
        assert_eq!(response.id, "msg_1");
        assert_eq!(response.model, "claude-sonnet-4-5");
        assert_eq!(response.first_text(), Some("Hello, world"));
        assert_eq!(response.usage.input_tokens, 12);
        assert_eq!(response.usage.output_tokens, 7);
        assert_eq!(response.usage.cache_read_input_tokens, 3);
        assert_eq!(response.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(response.tool_call_count, 0);
    }

    #[test]
    fn accumulates_tool_use_input_json() {
        let mut assembler = StreamAssembler::new();
        feed(
            &mut assembler,
            &[
                "event: content_block_start",
                r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"tu_1","name":"Bash"}}"#,
                "event: content_block_delta",
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"cmd\":"}}"#,
                "event: content_block_delta",
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"ls\"}"}}"#,
                "event: content_block_stop",
                r#"data: {"type":"content_block_stop","index":0}"#,
            ],
        );
        let response = assembler.finish();
        assert_eq!(response.tool_call_count, 1);
        assert_eq!(
            response.content[0],
            serde_json::json!({"type": "tool_use", "id": "tu_1", "name": "Bash", "input": {"cmd": "ls"}})
        );
    }

    #[test]
    fn unparseable_tool_input_keeps_raw_buffer() {
        let mut assembler = StreamAssembler::new();
        feed(
            &mut assembler,
            &[
                "event: content_block_start",
                r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"tu_1","name":"Bash"}}"#,
                "event: content_block_delta",
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"truncated"}}"#,
                "event: content_block_stop",
                r#"data: {"type":"content_block_stop","index":0}"#,
            ],
        );
        let response = assembler.finish();
        assert_eq!(
            response.content[0].pointer("/input").and_then(serde_json::Value::as_str),
            Some("{\"truncated")
        );
    }

    #[test]
    fn unparseable_data_lines_are_ignored_by_the_assembler() {
        let mut assembler = StreamAssembler::new();
        assembler.apply_line("data: not json at all");
        assembler.apply_line("data: [DONE]");
        let response = assembler.finish();
        assert!(response.complete);
        assert!(response.content.is_empty());
    }

    #[test]
    fn missing_event_lines_fall_back_to_payload_type() {
        let mut assembler = StreamAssembler::new();
        feed(
            &mut assembler,
            &[
                r#"data: {"type":"message_start","message":{"id":"msg_2","model":"m","role":"assistant","usage":{"input_tokens":1}}}"#,
                r#"data: {"type":"message_stop"}"#,
            ],
        );
        let response = assembler.finish();
        assert!(response.complete);
        assert_eq!(response.id, "msg_2");
    }

    #[test]
    fn aborted_stream_is_partial() {
        let mut assembler = StreamAssembler::new();
        feed(
            &mut assembler,
            &[
                "event: content_block_start",
                r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
                "event: content_block_delta",
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"partial out"}}"#,
            ],
        );
        let response = assembler.finish();
        assert!(!response.complete);
        // The open block is still committed for best-effort persistence.
        assert_eq!(response.first_text(), Some("partial out"));
    }
}
