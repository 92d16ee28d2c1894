use async_trait::async_trait;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use uuid::Uuid;

use braid_auth::CredentialManager;
use braid_core::config::BraidConfig;
use braid_core::types::RequestRecord;
use braid_proxy::{Dispatcher, ProxyService, RequestSink, SampleCollector, TokenTracker};
use braid_store::RequestStore;
use braid_upstream::{BreakerConfig, BreakerRegistry, RetryConfig, UpstreamClient};

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: BraidConfig,
    pub proxy: ProxyService,
    pub store: Arc<RequestStore>,
    pub tracker: Arc<TokenTracker>,
    pub credentials: Arc<CredentialManager>,
    pub breakers: Arc<BreakerRegistry>,
}

/// Adapter wiring the storage layer into the dispatcher's persistence seam.
struct StoreSink(Arc<RequestStore>);

#[async_trait]
impl RequestSink for StoreSink {
    async fn persist(&self, record: &RequestRecord) -> braid_core::Result<()> {
        self.0.insert_request(record)?;
        Ok(())
    }

    async fn enqueue_analysis(
        &self,
        conversation_id: Uuid,
        branch_id: &str,
    ) -> braid_core::Result<()> {
        self.0.enqueue_analysis(conversation_id, branch_id)?;
        Ok(())
    }
}

impl AppState {
    pub fn new(config: BraidConfig) -> anyhow::Result<Self> {
        let store = Arc::new(RequestStore::open(
            &config.storage.path,
            config.storage.slow_query_threshold_ms,
            config.storage.sql_debug,
        )?);
        let tracker = Arc::new(TokenTracker::new());
        let credentials = Arc::new(CredentialManager::new(config.credentials.clone()));
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
        let client = Arc::new(UpstreamClient::new(&config.upstream.base_url)?);

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(StoreSink(store.clone())),
            tracker.clone(),
            SampleCollector::new(config.samples.enabled, &config.samples.dir),
            config.telemetry.endpoint.clone(),
            config.analysis.enabled,
        ));

        let proxy = ProxyService::new(
            &config.upstream.name,
            client,
            credentials.clone(),
            store.clone(),
            dispatcher,
            breakers.clone(),
            RetryConfig::default(),
        );

        Ok(Self {
            config,
            proxy,
            store,
            tracker,
            credentials,
            breakers,
        })
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(crate::http::messages::messages_handler))
        .route("/health", get(crate::http::health::health_handler))
        .route("/stats", get(crate::http::stats::stats_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
