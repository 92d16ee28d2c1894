//! Post-response dispatch: persistence, token accounting, best-effort
//! telemetry, and notification delivery.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use braid_auth::AuthOutcome;
use braid_core::mask::mask;
use braid_core::types::RequestRecord;
use braid_core::{BraidError, Result};

use crate::notify::{build_payload, Notifier};
use crate::samples::SampleCollector;
use crate::tracker::TokenTracker;
use crate::types::ProxyRequest;

const TELEMETRY_DEADLINE: Duration = Duration::from_secs(5);

/// Persistence seam — implemented by the storage layer at wiring time.
#[async_trait]
pub trait RequestSink: Send + Sync {
    async fn persist(&self, record: &RequestRecord) -> Result<()>;
    async fn enqueue_analysis(&self, conversation_id: Uuid, branch_id: &str) -> Result<()>;
}

pub struct Dispatcher {
    sink: Arc<dyn RequestSink>,
    tracker: Arc<TokenTracker>,
    notifier: Notifier,
    samples: SampleCollector,
    telemetry_endpoint: Option<String>,
    client: reqwest::Client,
    analysis_enabled: bool,
}

impl Dispatcher {
    pub fn new(
        sink: Arc<dyn RequestSink>,
        tracker: Arc<TokenTracker>,
        samples: SampleCollector,
        telemetry_endpoint: Option<String>,
        analysis_enabled: bool,
    ) -> Self {
        Self {
            sink,
            tracker,
            notifier: Notifier::new(),
            samples,
            telemetry_endpoint,
            client: reqwest::Client::new(),
            analysis_enabled,
        }
    }

    /// Split one completed request into its storage row, tracker update,
    /// telemetry POST, and notification. Only the storage write can fail
    /// the caller; everything else is logged and swallowed.
    pub async fn dispatch(
        &self,
        request: &ProxyRequest,
        record: &RequestRecord,
        auth: &AuthOutcome,
    ) -> Result<()> {
        self.samples.collect(record.request_type, &request.body).await;

        if record.request_type.is_storable() {
            self.sink.persist(record).await?;
            if self.analysis_enabled {
                if let Some(conversation_id) = record.conversation_id {
                    if let Err(e) = self
                        .sink
                        .enqueue_analysis(conversation_id, &record.branch_id)
                        .await
                    {
                        warn!(error = %e, "analysis enqueue failed");
                    }
                }
            }
        } else {
            debug!(
                request_type = %record.request_type,
                "skipping persistence for non-storable request"
            );
        }

        self.tracker.record(
            &record.domain,
            record.request_type,
            &record.usage,
            record.tool_call_count,
        );
        self.send_telemetry(record).await;
        self.maybe_notify(request, record, auth).await;
        Ok(())
    }

    /// A single error notification plus an error metric — never fails.
    pub async fn dispatch_error(
        &self,
        request: &ProxyRequest,
        error: &BraidError,
        auth: Option<&AuthOutcome>,
    ) {
        self.tracker.record_error(&request.domain);
        self.send_error_telemetry(request, error).await;

        let Some(slack) = auth.and_then(|a| a.slack.as_ref()) else {
            return;
        };
        let payload = serde_json::json!({
            "text": format!(
                "*{}* request failed ({}): {}",
                request.domain,
                error.code(),
                mask(&error.to_string())
            ),
        });
        self.notifier.deliver(&request.domain, slack, payload).await;
    }

    async fn maybe_notify(
        &self,
        request: &ProxyRequest,
        record: &RequestRecord,
        auth: &AuthOutcome,
    ) {
        let Some(user_text) = request.last_user_text() else {
            return;
        };
        // The suppression window updates even when no webhook is
        // configured, so enabling one later starts from known state.
        if !self.notifier.should_notify(&request.domain, &user_text) {
            debug!(domain = request.domain, "notification suppressed (unchanged user text)");
            return;
        }
        let Some(slack) = &auth.slack else {
            return;
        };

        let response_text = record
            .response_body
            .as_ref()
            .and_then(first_response_text);
        let payload = build_payload(
            slack,
            &request.domain,
            &record.model,
            &user_text,
            response_text.as_deref(),
        );
        self.notifier.deliver(&request.domain, slack, payload).await;
    }

    async fn send_telemetry(&self, record: &RequestRecord) {
        let Some(endpoint) = &self.telemetry_endpoint else {
            return;
        };
        let payload = serde_json::json!({
            "request_id": record.request_id,
            "domain": record.domain,
            "model": record.model,
            "request_type": record.request_type,
            "status": record.response_status,
            "input_tokens": record.usage.input_tokens,
            "output_tokens": record.usage.output_tokens,
            "cache_creation_input_tokens": record.usage.cache_creation_input_tokens,
            "cache_read_input_tokens": record.usage.cache_read_input_tokens,
            "tool_call_count": record.tool_call_count,
            "processing_time_ms": record.processing_time_ms,
        });
        self.post_telemetry(endpoint, payload).await;
    }

    async fn send_error_telemetry(&self, request: &ProxyRequest, error: &BraidError) {
        let Some(endpoint) = &self.telemetry_endpoint else {
            return;
        };
        let payload = serde_json::json!({
            "request_id": request.request_id,
            "domain": request.domain,
            "model": request.model,
            "error": error.code(),
            "message": mask(&error.to_string()),
        });
        self.post_telemetry(endpoint, payload).await;
    }

    async fn post_telemetry(&self, endpoint: &str, payload: Value) {
        let result = tokio::time::timeout(
            TELEMETRY_DEADLINE,
            self.client.post(endpoint).json(&payload).send(),
        )
        .await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "telemetry POST failed"),
            Err(_) => warn!("telemetry POST timed out"),
        }
    }
}

fn first_response_text(body: &Value) -> Option<String> {
    body.get("content")?
        .as_array()?
        .iter()
        .find(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .and_then(|b| b.get("text").and_then(Value::as_str))
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::types::{RequestStatus, RequestType, TokenUsage};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemorySink {
        persisted: Mutex<Vec<RequestRecord>>,
        jobs: Mutex<Vec<(Uuid, String)>>,
    }

    #[async_trait]
    impl RequestSink for MemorySink {
        async fn persist(&self, record: &RequestRecord) -> Result<()> {
            self.persisted.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn enqueue_analysis(&self, conversation_id: Uuid, branch_id: &str) -> Result<()> {
            self.jobs
                .lock()
                .unwrap()
                .push((conversation_id, branch_id.to_string()));
            Ok(())
        }
    }

    fn request(request_type_body: Value) -> ProxyRequest {
        ProxyRequest::from_parts("acme", request_type_body, Vec::new()).unwrap()
    }

    fn record_for(request: &ProxyRequest, request_type: RequestType) -> RequestRecord {
        RequestRecord {
            request_id: request.request_id.clone(),
            domain: request.domain.clone(),
            timestamp: request.timestamp,
            model: request.model.clone(),
            request_type,
            current_message_hash: "h".to_string(),
            parent_message_hash: None,
            system_hash: None,
            conversation_id: Some(Uuid::new_v4()),
            branch_id: "main".to_string(),
            parent_request_id: None,
            parent_task_request_id: None,
            is_subtask: false,
            response_status: 200,
            response_body: None,
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                ..Default::default()
            },
            tool_call_count: 0,
            status: RequestStatus::Completed,
            processing_time_ms: 42,
        }
    }

    fn auth() -> AuthOutcome {
        // A bare outcome with no slack target.
        braid_auth::AuthOutcome {
            auth_type: braid_auth::AuthType::ApiKey,
            headers: Vec::new(),
            opaque_key: "sk-ant-api…".to_string(),
            account_id: None,
            beta_header: None,
            slack: None,
        }
    }

    fn dispatcher(sink: Arc<MemorySink>) -> Dispatcher {
        Dispatcher::new(
            sink,
            Arc::new(TokenTracker::new()),
            SampleCollector::disabled(),
            None,
            true,
        )
    }

    #[tokio::test]
    async fn inference_requests_persist_and_enqueue() {
        let sink = Arc::new(MemorySink::default());
        let dispatcher = dispatcher(sink.clone());
        let request = request(json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}));
        let record = record_for(&request, RequestType::Inference);

        dispatcher.dispatch(&request, &record, &auth()).await.unwrap();
        assert_eq!(sink.persisted.lock().unwrap().len(), 1);
        assert_eq!(sink.jobs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_storable_types_skip_persistence() {
        let sink = Arc::new(MemorySink::default());
        let dispatcher = dispatcher(sink.clone());
        let request = request(json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}));

        for request_type in [RequestType::QueryEvaluation, RequestType::Quota] {
            let record = record_for(&request, request_type);
            dispatcher.dispatch(&request, &record, &auth()).await.unwrap();
        }
        assert!(sink.persisted.lock().unwrap().is_empty());
        assert!(sink.jobs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dispatch_error_records_metric() {
        let sink = Arc::new(MemorySink::default());
        let tracker = Arc::new(TokenTracker::new());
        let dispatcher = Dispatcher::new(
            sink,
            tracker.clone(),
            SampleCollector::disabled(),
            None,
            false,
        );
        let request = request(json!({"model": "m", "messages": []}));
        dispatcher
            .dispatch_error(&request, &BraidError::Internal("boom".into()), None)
            .await;
        assert_eq!(tracker.snapshot()[0].1.error_count, 1);
    }
}
