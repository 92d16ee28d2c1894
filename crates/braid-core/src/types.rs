use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Marker Claude Code includes in its topic-detection system prompt.
/// Requests carrying it are evaluation traffic, not real inference.
const QUERY_EVALUATION_MARKER: &str = "Analyze if this message indicates a new conversation topic";

/// Role of a message in the `messages` API payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A content block inside a message. The discriminator is a closed set;
/// anything else lands in `Unknown` and is preserved verbatim on the wire
/// (the proxy forwards raw JSON — this typed view is for inspection only).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub data: String,
}

/// Message content: a bare string or an ordered block sequence.
/// Block order is semantically significant and is never reordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<Value>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

/// Classification of an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Inference,
    QueryEvaluation,
    Quota,
}

impl RequestType {
    /// Derive the request type from the parsed body.
    ///
    /// A quota probe is a single message whose whole text is `quota`.
    /// Topic-detection traffic is recognised by its system prompt marker.
    pub fn classify(messages: &[Value], system: Option<&Value>) -> Self {
        if messages.len() == 1 && first_text(&messages[0]).is_some_and(|t| t.trim() == "quota") {
            return RequestType::Quota;
        }
        if let Some(system) = system {
            if system_text(system).contains(QUERY_EVALUATION_MARKER) {
                return RequestType::QueryEvaluation;
            }
        }
        RequestType::Inference
    }

    /// Whether requests of this type are persisted.
    pub fn is_storable(&self) -> bool {
        matches!(self, RequestType::Inference)
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestType::Inference => write!(f, "inference"),
            RequestType::QueryEvaluation => write!(f, "query_evaluation"),
            RequestType::Quota => write!(f, "quota"),
        }
    }
}

/// Concatenated text content of a message (string content, or the text
/// blocks of array content joined by newlines).
pub fn first_text(message: &Value) -> Option<String> {
    match message.get("content") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(blocks)) => {
            let texts: Vec<&str> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
        _ => None,
    }
}

/// Canonical string form of a system prompt: a bare string, or the text of
/// each block joined by newlines.
pub fn system_text(system: &Value) -> String {
    match system {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Token accounting for a single request/response pair.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    /// Merge incremental usage from a `message_delta` event. Zero fields in
    /// the delta leave the current value untouched.
    pub fn apply_delta(&mut self, delta: &TokenUsage) {
        if delta.input_tokens > 0 {
            self.input_tokens = delta.input_tokens;
        }
        if delta.output_tokens > 0 {
            self.output_tokens = delta.output_tokens;
        }
        if delta.cache_creation_input_tokens > 0 {
            self.cache_creation_input_tokens = delta.cache_creation_input_tokens;
        }
        if delta.cache_read_input_tokens > 0 {
            self.cache_read_input_tokens = delta.cache_read_input_tokens;
        }
    }
}

/// Completion state of a request as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Completed,
    Partial,
    Error,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Completed => write!(f, "completed"),
            RequestStatus::Partial => write!(f, "partial"),
            RequestStatus::Error => write!(f, "error"),
        }
    }
}

/// The persistence-ready record for one proxied request. Rows are appended,
/// never mutated in place; the response fields are filled by a follow-up
/// update keyed on `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub domain: String,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub request_type: RequestType,
    pub current_message_hash: String,
    pub parent_message_hash: Option<String>,
    pub system_hash: Option<String>,
    pub conversation_id: Option<Uuid>,
    pub branch_id: String,
    pub parent_request_id: Option<String>,
    pub parent_task_request_id: Option<String>,
    pub is_subtask: bool,
    pub response_status: u16,
    pub response_body: Option<Value>,
    pub usage: TokenUsage,
    pub tool_call_count: u32,
    pub status: RequestStatus,
    pub processing_time_ms: u64,
}
