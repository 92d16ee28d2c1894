//! The request lifecycle: link → authenticate → forward (breaker outside,
//! retries inside) → persist → dispatch.

use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use braid_auth::{AuthOutcome, CredentialManager};
use braid_core::config::UPSTREAM_DEADLINE_SECS;
use braid_core::types::{RequestRecord, RequestStatus, TokenUsage};
use braid_core::{BraidError, Result};
use braid_link::{ConversationLinker, LinkError, LinkExecutors, LinkInput, Linkage};
use braid_upstream::{
    pump_stream, response_headers, retry_with, BreakerRegistry, RetryConfig, UpstreamClient,
};

use crate::dispatch::Dispatcher;
use crate::types::{ProxyRequest, RequestContext};

/// What the web layer hands back to the client.
pub enum ProxyOutcome {
    Json {
        status: u16,
        headers: Vec<(String, String)>,
        body: Value,
    },
    /// Raw upstream SSE bytes, relayed verbatim as they arrive.
    Stream {
        status: u16,
        headers: Vec<(String, String)>,
        rx: mpsc::Receiver<Bytes>,
    },
}

pub struct ProxyService {
    upstream_name: String,
    client: Arc<UpstreamClient>,
    credentials: Arc<CredentialManager>,
    link_store: Arc<dyn LinkExecutors>,
    dispatcher: Arc<Dispatcher>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryConfig,
}

impl ProxyService {
    pub fn new(
        upstream_name: &str,
        client: Arc<UpstreamClient>,
        credentials: Arc<CredentialManager>,
        link_store: Arc<dyn LinkExecutors>,
        dispatcher: Arc<Dispatcher>,
        breakers: Arc<BreakerRegistry>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            upstream_name: upstream_name.to_string(),
            client,
            credentials,
            link_store,
            dispatcher,
            breakers,
            retry,
        }
    }

    /// Single entry point for one proxied request.
    pub async fn handle(&self, request: ProxyRequest, ctx: RequestContext) -> Result<ProxyOutcome> {
        let started = Instant::now();

        let linkage = self.resolve_linkage(&request).await?;

        let auth = match self
            .credentials
            .authenticate(&request.domain, request.inbound_bearer.as_deref())
            .await
        {
            Ok(auth) => auth,
            Err(e) => {
                let err = BraidError::from(e);
                self.dispatcher.dispatch_error(&request, &err, None).await;
                return Err(err);
            }
        };

        let result = if request.stream {
            self.forward_streaming(&request, &ctx, &auth, linkage, started)
                .await
        } else {
            self.forward_non_streaming(&request, &auth, linkage, started)
                .await
        };

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.dispatcher
                    .dispatch_error(&request, &e, Some(&auth))
                    .await;
                Err(e)
            }
        }
    }

    /// Step 2: conversation linking, with conversation-id allocation for
    /// brand-new conversations.
    async fn resolve_linkage(&self, request: &ProxyRequest) -> Result<Option<Linkage>> {
        if request.messages.is_empty() {
            return Ok(None);
        }
        let linker = ConversationLinker::new(self.link_store.clone());
        let mut linkage = linker
            .link(&LinkInput {
                domain: &request.domain,
                messages: &request.messages,
                system: request.system.as_ref(),
                request_id: &request.request_id,
                timestamp: request.timestamp,
            })
            .await
            .map_err(|e| match e {
                LinkError::EmptyMessages => {
                    BraidError::Validation("messages must not be empty".to_string())
                }
                other => BraidError::Internal(other.to_string()),
            })?;

        if linkage.conversation_id.is_none() {
            let conversation_id = Uuid::new_v4();
            linkage.conversation_id = Some(conversation_id);
            debug!(
                domain = request.domain,
                %conversation_id,
                "allocated new conversation"
            );
        }
        Ok(Some(linkage))
    }

    async fn forward_non_streaming(
        &self,
        request: &ProxyRequest,
        auth: &AuthOutcome,
        linkage: Option<Linkage>,
        started: Instant,
    ) -> Result<ProxyOutcome> {
        let deadline = Duration::from_secs(UPSTREAM_DEADLINE_SECS);
        let breaker = self.breakers.get(&self.upstream_name);

        let response = tokio::time::timeout(
            deadline,
            breaker.call(|| {
                retry_with(&self.retry, "upstream_messages", || {
                    self.client
                        .send(&request.body, &request.inbound_headers, auth)
                })
            }),
        )
        .await
        .map_err(|_| BraidError::Timeout {
            ms: deadline.as_millis() as u64,
        })?
        .map_err(BraidError::from)?;

        let record = build_record(
            request,
            linkage.as_ref(),
            response.status,
            Some(response.body.clone()),
            usage_of(&response.body),
            tool_calls_of(&response.body),
            RequestStatus::Completed,
            started.elapsed(),
        );
        self.dispatcher.dispatch(request, &record, auth).await?;

        Ok(ProxyOutcome::Json {
            status: response.status,
            headers: response.headers,
            body: response.body,
        })
    }

    /// Streaming: the transformed stream is returned immediately;
    /// persistence and dispatch run after the stream terminates.
    async fn forward_streaming(
        &self,
        request: &ProxyRequest,
        ctx: &RequestContext,
        auth: &AuthOutcome,
        linkage: Option<Linkage>,
        started: Instant,
    ) -> Result<ProxyOutcome> {
        let breaker = self.breakers.get(&self.upstream_name);
        let resp = breaker
            .call(|| {
                retry_with(&self.retry, "upstream_stream", || {
                    self.client
                        .open_stream(&request.body, &request.inbound_headers, auth)
                })
            })
            .await
            .map_err(BraidError::from)?;

        let status = resp.status().as_u16();
        let headers = response_headers(&resp);
        let (tx, rx) = mpsc::channel::<Bytes>(64);

        // The 10-minute deadline is a hard cutoff: a watcher cancels the
        // pump's token, which also fires if the client disconnects.
        let pump_token = ctx.cancel.child_token();
        let deadline_token = pump_token.clone();
        let deadline = Duration::from_secs(UPSTREAM_DEADLINE_SECS).saturating_sub(started.elapsed());
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            deadline_token.cancel();
        });

        let dispatcher = self.dispatcher.clone();
        let request = request.clone();
        let auth = auth.clone();
        tokio::spawn(async move {
            let reconstruction = pump_stream(resp, tx, &pump_token).await;
            let record_status = if reconstruction.complete {
                RequestStatus::Completed
            } else {
                RequestStatus::Partial
            };
            let record = build_record(
                &request,
                linkage.as_ref(),
                status,
                Some(reconstruction.to_body()),
                reconstruction.usage,
                reconstruction.tool_call_count,
                record_status,
                started.elapsed(),
            );
            if let Err(e) = dispatcher.dispatch(&request, &record, &auth).await {
                warn!(
                    request_id = request.request_id,
                    error = %e,
                    "post-stream dispatch failed"
                );
            }
        });

        Ok(ProxyOutcome::Stream {
            status,
            headers,
            rx,
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn build_record(
    request: &ProxyRequest,
    linkage: Option<&Linkage>,
    response_status: u16,
    response_body: Option<Value>,
    usage: TokenUsage,
    tool_call_count: u32,
    status: RequestStatus,
    elapsed: Duration,
) -> RequestRecord {
    RequestRecord {
        request_id: request.request_id.clone(),
        domain: request.domain.clone(),
        timestamp: request.timestamp,
        model: request.model.clone(),
        request_type: request.request_type,
        current_message_hash: linkage
            .map(|l| l.current_message_hash.clone())
            .unwrap_or_default(),
        parent_message_hash: linkage.and_then(|l| l.parent_message_hash.clone()),
        system_hash: linkage.and_then(|l| l.system_hash.clone()),
        conversation_id: linkage.and_then(|l| l.conversation_id),
        branch_id: linkage
            .map(|l| l.branch_id.clone())
            .unwrap_or_else(|| "main".to_string()),
        parent_request_id: linkage.and_then(|l| l.parent_request_id.clone()),
        parent_task_request_id: linkage.and_then(|l| l.parent_task_request_id.clone()),
        is_subtask: linkage.is_some_and(|l| l.is_subtask),
        response_status,
        response_body,
        usage,
        tool_call_count,
        status,
        processing_time_ms: elapsed.as_millis() as u64,
    }
}

fn usage_of(body: &Value) -> TokenUsage {
    body.get("usage")
        .and_then(|u| serde_json::from_value(u.clone()).ok())
        .unwrap_or_default()
}

fn tool_calls_of(body: &Value) -> u32 {
    body.get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
                .count() as u32
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn usage_parses_cache_fields() {
        let body = json!({
            "usage": {
                "input_tokens": 10,
                "output_tokens": 4,
                "cache_creation_input_tokens": 2,
                "cache_read_input_tokens": 8,
            }
        });
        let usage = usage_of(&body);
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.cache_read_input_tokens, 8);
        assert_eq!(usage_of(&json!({})).input_tokens, 0);
    }

    #[test]
    fn tool_calls_count_tool_use_blocks() {
        let body = json!({
            "content": [
                {"type": "text", "text": "running"},
                {"type": "tool_use", "id": "a", "name": "Bash", "input": {}},
                {"type": "tool_use", "id": "b", "name": "Read", "input": {}},
            ]
        });
        assert_eq!(tool_calls_of(&body), 2);
    }

    #[test]
    fn record_without_linkage_defaults_to_main() {
        let request = ProxyRequest::from_parts("acme", json!({"model": "m"}), Vec::new()).unwrap();
        let record = build_record(
            &request,
            None,
            200,
            None,
            TokenUsage::default(),
            0,
            RequestStatus::Completed,
            Duration::from_millis(5),
        );
        assert_eq!(record.branch_id, "main");
        assert!(record.conversation_id.is_none());
        assert!(record.current_message_hash.is_empty());
    }
}
