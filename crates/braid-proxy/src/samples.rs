//! Test-sample collection — when enabled, keeps one redacted request body
//! per request type for fixture building.

use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, warn};

use braid_core::mask::mask;
use braid_core::types::RequestType;

pub struct SampleCollector {
    enabled: bool,
    dir: PathBuf,
}

impl SampleCollector {
    pub fn new(enabled: bool, dir: &str) -> Self {
        Self {
            enabled,
            dir: PathBuf::from(dir),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::new(),
        }
    }

    /// Write the masked body as `<type>.json`, overwriting the previous
    /// sample of that type. Errors are logged, never raised.
    pub async fn collect(&self, request_type: RequestType, body: &Value) {
        if !self.enabled {
            return;
        }
        let masked = match serde_json::to_string_pretty(body) {
            Ok(json) => mask(&json),
            Err(e) => {
                warn!(error = %e, "sample serialization failed");
                return;
            }
        };
        let path = self.dir.join(format!("{request_type}.json"));
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            warn!(error = %e, "sample dir creation failed");
            return;
        }
        match tokio::fs::write(&path, masked).await {
            Ok(()) => debug!(path = %path.display(), "request sample collected"),
            Err(e) => warn!(error = %e, "sample write failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn writes_masked_sample_per_type() {
        let dir = tempfile::tempdir().unwrap();
        let collector = SampleCollector::new(true, dir.path().to_str().unwrap());
        collector
            .collect(
                RequestType::Inference,
                &json!({"model": "m", "key": "sk-ant-api03-secret1234"}),
            )
            .await;

        let written = std::fs::read_to_string(dir.path().join("inference.json")).unwrap();
        assert!(written.contains("sk-ant-****"));
        assert!(!written.contains("secret1234"));
    }

    #[tokio::test]
    async fn disabled_collector_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let collector = SampleCollector::new(false, dir.path().to_str().unwrap());
        collector.collect(RequestType::Quota, &json!({})).await;
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}
