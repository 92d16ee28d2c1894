//! Proxy endpoint — POST /v1/messages
//!
//! The tenant domain comes from the Host header; the body is forwarded
//! upstream verbatim. Streaming responses relay raw SSE bytes as they
//! arrive; non-streaming responses return the upstream JSON.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use braid_core::mask::mask;
use braid_core::BraidError;
use braid_proxy::{ProxyOutcome, ProxyRequest, RequestContext};

use crate::app::AppState;

pub async fn messages_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let Some(domain) = extract_domain(&headers) else {
        return error_response(&BraidError::Validation(
            "missing Host header".to_string(),
        ));
    };

    let inbound_headers: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let request = match ProxyRequest::from_parts(&domain, body, inbound_headers) {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };

    let ctx = RequestContext::default();
    match state.proxy.handle(request, ctx).await {
        Ok(ProxyOutcome::Json {
            status,
            headers,
            body,
        }) => {
            let mut response = (
                StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
                Json(body),
            )
                .into_response();
            relay_headers(response.headers_mut(), &headers);
            response
        }
        Ok(ProxyOutcome::Stream {
            status,
            headers,
            rx,
        }) => {
            let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
            let mut response = Response::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
            relay_headers(response.headers_mut(), &headers);
            response.headers_mut().insert(
                "content-type",
                HeaderValue::from_static("text/event-stream"),
            );
            response
        }
        Err(e) => error_response(&e),
    }
}

/// Tenant domain from the Host header, port stripped.
fn extract_domain(headers: &HeaderMap) -> Option<String> {
    headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.split(':').next())
        .map(str::to_string)
        .filter(|d| !d.is_empty())
}

fn relay_headers(target: &mut HeaderMap, upstream: &[(String, String)]) {
    for (name, value) in upstream {
        if name.eq_ignore_ascii_case("content-type") {
            continue; // set by the body builder
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            target.insert(name, value);
        }
    }
}

/// Error body: upstream status where possible, masked message, 401 hint
/// for authentication failures (credential paths never appear).
fn error_response(error: &BraidError) -> Response {
    let status = StatusCode::from_u16(error.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!(code = error.code(), "request failed");
    }
    let message = match error {
        BraidError::Authentication(_) => format!(
            "{}. Add a credential file for this domain or use a personal domain.",
            mask(&error.to_string())
        ),
        other => mask(&other.to_string()),
    };
    let body = serde_json::json!({
        "error": {
            "type": error.code(),
            "message": message,
        }
    });
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_strips_port() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("acme.example.com:8443"));
        assert_eq!(extract_domain(&headers).as_deref(), Some("acme.example.com"));
    }

    #[test]
    fn missing_host_yields_none() {
        assert!(extract_domain(&HeaderMap::new()).is_none());
    }

    #[test]
    fn auth_errors_carry_a_hint_but_no_path() {
        let response = error_response(&BraidError::Authentication(
            "no credentials for domain 'acme'".to_string(),
        ));
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
