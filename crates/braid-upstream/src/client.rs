//! HTTP client for the upstream `messages` endpoint.

use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use braid_auth::AuthOutcome;

use crate::error::{Result, UpstreamError};
use crate::retry::parse_retry_after;
use crate::sse::{ReconstructedResponse, StreamAssembler};

const API_VERSION: &str = "2023-06-01";
const MESSAGES_PATH: &str = "/v1/messages";

/// Inbound headers that never pass through: hop-by-hop, framing, and
/// anything credential-shaped (the authentication outcome always wins).
const BLOCKED_HEADERS: [&str; 8] = [
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "accept-encoding",
    "authorization",
    "x-api-key",
    "anthropic-beta",
];

pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
}

/// A decoded non-streaming upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl UpstreamClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(UpstreamError::Http)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Merge headers: inbound passthrough first, then the authentication
    /// outcome on top, then protocol defaults.
    fn build_request(
        &self,
        body: &Value,
        inbound_headers: &[(String, String)],
        auth: &AuthOutcome,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}{MESSAGES_PATH}", self.base_url);
        let mut builder = self.client.post(&url);

        let mut inbound_beta = None;
        for (name, value) in inbound_headers {
            let lower = name.to_ascii_lowercase();
            if lower == "anthropic-beta" {
                inbound_beta = Some(value.clone());
            }
            if BLOCKED_HEADERS.contains(&lower.as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }

        for (name, value) in &auth.headers {
            builder = builder.header(name, value);
        }

        // OAuth credentials require their beta flag alongside any the
        // client already requested.
        let beta = match (&auth.beta_header, inbound_beta) {
            (Some(auth_beta), Some(client_beta)) => Some(format!("{client_beta},{auth_beta}")),
            (Some(auth_beta), None) => Some(auth_beta.clone()),
            (None, Some(client_beta)) => Some(client_beta),
            (None, None) => None,
        };
        if let Some(beta) = beta {
            builder = builder.header("anthropic-beta", beta);
        }

        builder
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body)
    }

    /// Non-streaming forward.
    pub async fn send(
        &self,
        body: &Value,
        inbound_headers: &[(String, String)],
        auth: &AuthOutcome,
    ) -> Result<UpstreamResponse> {
        debug!(key = %auth.opaque_key, "forwarding request upstream");
        let resp = self.build_request(body, inbound_headers, auth).send().await?;
        let status = resp.status().as_u16();
        let headers = response_headers(&resp);

        if !resp.status().is_success() {
            return Err(decode_error(resp).await);
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| UpstreamError::Parse(e.to_string()))?;
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }

    /// Open a streaming forward. The status line and headers are checked
    /// here so retries and the circuit breaker act on connection-time
    /// failures; the body is consumed via [`pump_stream`].
    pub async fn open_stream(
        &self,
        body: &Value,
        inbound_headers: &[(String, String)],
        auth: &AuthOutcome,
    ) -> Result<reqwest::Response> {
        debug!(key = %auth.opaque_key, "opening upstream stream");
        let resp = self.build_request(body, inbound_headers, auth).send().await?;
        if !resp.status().is_success() {
            return Err(decode_error(resp).await);
        }
        Ok(resp)
    }
}

/// Drain a streaming response: every raw chunk is teed verbatim to
/// `raw_tx` while the SSE lines are folded into a reconstruction. A closed
/// receiver or a fired cancellation token aborts the upstream read; the
/// partial reconstruction is still returned for best-effort persistence.
pub async fn pump_stream(
    resp: reqwest::Response,
    raw_tx: mpsc::Sender<Bytes>,
    cancel: &CancellationToken,
) -> ReconstructedResponse {
    let mut assembler = StreamAssembler::new();
    let mut line_buf = String::new();
    let mut byte_stream = resp.bytes_stream();

    loop {
        let chunk = tokio::select! {
            chunk = byte_stream.next() => chunk,
            _ = cancel.cancelled() => {
                debug!("upstream stream cancelled");
                break;
            }
        };

        let chunk = match chunk {
            Some(Ok(c)) => c,
            Some(Err(e)) => {
                warn!(error = %e, "upstream stream read failed");
                // Headers are already out; surface the failure as an SSE
                // error event before closing the stream.
                let event = serde_json::json!({
                    "type": "error",
                    "error": {"type": "stream_error", "message": e.to_string()},
                });
                let frame = format!("event: error\ndata: {event}\n\n");
                let _ = raw_tx.send(Bytes::from(frame)).await;
                break;
            }
            None => break,
        };

        if raw_tx.send(chunk.clone()).await.is_err() {
            // Client went away — stop reading upstream.
            debug!("client receiver dropped; aborting upstream read");
            break;
        }

        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };

        // SSE frames arrive split across chunks; keep the trailing partial
        // line in the buffer.
        line_buf.push_str(text);
        while let Some(newline) = line_buf.find('\n') {
            let line: String = line_buf.drain(..=newline).collect();
            assembler.apply_line(line.trim_end_matches('\n'));
        }
    }

    if !line_buf.is_empty() {
        assembler.apply_line(&line_buf);
    }
    assembler.finish()
}

/// Response headers safe to relay to the client (framing headers dropped).
pub fn response_headers(resp: &reqwest::Response) -> Vec<(String, String)> {
    resp.headers()
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            !matches!(name, "content-length" | "transfer-encoding" | "connection")
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

async fn decode_error(resp: reqwest::Response) -> UpstreamError {
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let text = resp.text().await.unwrap_or_default();

    let (error_type, message) = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => (body.error.error_type, body.error.message),
        Err(_) => ("upstream_error".to_string(), text),
    };

    warn!(status, error_type, "upstream returned an error");
    if status == 429 {
        UpstreamError::RateLimited {
            status,
            retry_after,
            message,
        }
    } else {
        UpstreamError::Api {
            status,
            error_type,
            message,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorInner,
}

#[derive(Deserialize)]
struct ErrorInner {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_shape_parses() {
        let body: ErrorBody = serde_json::from_str(
            r#"{"error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        )
        .unwrap();
        assert_eq!(body.error.error_type, "overloaded_error");
        assert_eq!(body.error.message, "Overloaded");
    }

    #[test]
    fn blocked_headers_cover_credentials() {
        assert!(BLOCKED_HEADERS.contains(&"authorization"));
        assert!(BLOCKED_HEADERS.contains(&"x-api-key"));
        assert!(BLOCKED_HEADERS.contains(&"host"));
    }
}
