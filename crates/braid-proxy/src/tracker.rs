//! In-memory per-domain token accounting. Eventual consistency is
//! acceptable; each field is last-writer-wins under the entry lock.

use dashmap::DashMap;
use serde::Serialize;

use braid_core::types::{RequestType, TokenUsage};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DomainStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub inference_count: u64,
    pub query_evaluation_count: u64,
    pub quota_count: u64,
    pub tool_calls: u64,
    pub error_count: u64,
}

#[derive(Default)]
pub struct TokenTracker {
    stats: DashMap<String, DomainStats>,
}

impl TokenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        domain: &str,
        request_type: RequestType,
        usage: &TokenUsage,
        tool_calls: u32,
    ) {
        let mut entry = self.stats.entry(domain.to_string()).or_default();
        entry.input_tokens += usage.input_tokens;
        entry.output_tokens += usage.output_tokens;
        entry.cache_creation_input_tokens += usage.cache_creation_input_tokens;
        entry.cache_read_input_tokens += usage.cache_read_input_tokens;
        entry.tool_calls += tool_calls as u64;
        match request_type {
            RequestType::Inference => entry.inference_count += 1,
            RequestType::QueryEvaluation => entry.query_evaluation_count += 1,
            RequestType::Quota => entry.quota_count += 1,
        }
    }

    pub fn record_error(&self, domain: &str) {
        self.stats.entry(domain.to_string()).or_default().error_count += 1;
    }

    pub fn snapshot(&self) -> Vec<(String, DomainStats)> {
        let mut all: Vec<_> = self
            .stats
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_usage_per_domain() {
        let tracker = TokenTracker::new();
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 20,
            ..Default::default()
        };
        tracker.record("acme", RequestType::Inference, &usage, 2);
        tracker.record("acme", RequestType::Inference, &usage, 0);
        tracker.record("acme", RequestType::QueryEvaluation, &usage, 0);
        tracker.record("other", RequestType::Quota, &TokenUsage::default(), 0);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 2);
        let acme = &snapshot[0].1;
        assert_eq!(snapshot[0].0, "acme");
        assert_eq!(acme.input_tokens, 300);
        assert_eq!(acme.output_tokens, 60);
        assert_eq!(acme.inference_count, 2);
        assert_eq!(acme.query_evaluation_count, 1);
        assert_eq!(acme.tool_calls, 2);
        assert_eq!(snapshot[1].1.quota_count, 1);
    }

    #[test]
    fn errors_count_separately() {
        let tracker = TokenTracker::new();
        tracker.record_error("acme");
        tracker.record_error("acme");
        assert_eq!(tracker.snapshot()[0].1.error_count, 2);
    }
}
