use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use braid_core::types::{first_text, RequestType};
use braid_core::{BraidError, Result};

/// A parsed inbound request, ready for the proxy pipeline. The raw body is
/// forwarded verbatim; the parsed views exist for linking and accounting.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub request_id: String,
    pub domain: String,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub request_type: RequestType,
    pub stream: bool,
    pub body: Value,
    pub messages: Vec<Value>,
    pub system: Option<Value>,
    pub inbound_headers: Vec<(String, String)>,
    /// Bearer token carried on the inbound request, used only for
    /// personal-domain fallback.
    pub inbound_bearer: Option<String>,
}

impl ProxyRequest {
    pub fn from_parts(
        domain: &str,
        body: Value,
        inbound_headers: Vec<(String, String)>,
    ) -> Result<Self> {
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| BraidError::Validation("missing 'model'".to_string()))?
            .to_string();
        let messages = body
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let system = body.get("system").cloned();
        let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let request_type = RequestType::classify(&messages, system.as_ref());

        let inbound_bearer = inbound_headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("authorization"))
            .and_then(|(_, value)| value.strip_prefix("Bearer "))
            .map(String::from);

        Ok(Self {
            request_id: Uuid::new_v4().to_string(),
            domain: domain.to_string(),
            timestamp: Utc::now(),
            model,
            request_type,
            stream,
            body,
            messages,
            system,
            inbound_headers,
            inbound_bearer,
        })
    }

    /// Text of the last user message — the notification de-dup key.
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
            .and_then(first_text)
    }
}

/// Per-request execution context.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Fired when the client disconnects; aborts the upstream read.
    pub cancel: CancellationToken,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_body_fields() {
        let body = json!({
            "model": "claude-sonnet-4-5",
            "stream": true,
            "system": "be terse",
            "messages": [{"role": "user", "content": "hi"}],
        });
        let request = ProxyRequest::from_parts(
            "acme.example.com",
            body,
            vec![("authorization".to_string(), "Bearer tok-123".to_string())],
        )
        .unwrap();
        assert_eq!(request.model, "claude-sonnet-4-5");
        assert!(request.stream);
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.inbound_bearer.as_deref(), Some("tok-123"));
        assert_eq!(request.request_type, RequestType::Inference);
    }

    #[test]
    fn missing_model_is_a_validation_error() {
        let result = ProxyRequest::from_parts("acme", json!({"messages": []}), Vec::new());
        assert!(matches!(result, Err(BraidError::Validation(_))));
    }

    #[test]
    fn last_user_text_finds_trailing_user_message() {
        let body = json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": "second"},
            ],
        });
        let request = ProxyRequest::from_parts("acme", body, Vec::new()).unwrap();
        assert_eq!(request.last_user_text().as_deref(), Some("second"));
    }
}
