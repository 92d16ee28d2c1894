use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream error ({status}) {error_type}: {message}")]
    Api {
        status: u16,
        error_type: String,
        message: String,
    },

    #[error("rate limited ({status}): {message}")]
    RateLimited {
        status: u16,
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("upstream timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("circuit open for upstream '{upstream}'")]
    CircuitOpen { upstream: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("operation cancelled")]
    Cancelled,
}

const NETWORK_ERROR_MARKERS: [&str; 3] = ["ECONNREFUSED", "ETIMEDOUT", "ENETUNREACH"];

impl UpstreamError {
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::Api { status, .. } | UpstreamError::RateLimited { status, .. } => {
                Some(*status)
            }
            UpstreamError::Http(e) => e.status().map(|s| s.as_u16()),
            UpstreamError::Timeout { .. } => Some(504),
            UpstreamError::CircuitOpen { .. } => Some(503),
            _ => None,
        }
    }

    fn is_network_error(&self) -> bool {
        match self {
            UpstreamError::Http(e) => {
                if e.is_connect() || e.is_timeout() {
                    return true;
                }
                let text = e.to_string();
                NETWORK_ERROR_MARKERS.iter().any(|m| text.contains(m))
            }
            _ => false,
        }
    }

    /// Retryable per the default retry predicate: timeouts, network errors,
    /// and HTTP 429/502/503/504.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Timeout { .. } | UpstreamError::RateLimited { .. } => true,
            UpstreamError::Api { status, .. } => matches!(status, 429 | 502 | 503 | 504),
            e @ UpstreamError::Http(_) => e.is_network_error(),
            _ => false,
        }
    }

    /// Counts as a circuit-breaker failure: timeouts, network errors, and
    /// 5xx/429 statuses. Client errors (other 4xx) never trip the breaker.
    pub fn is_trip_worthy(&self) -> bool {
        match self {
            UpstreamError::Timeout { .. } | UpstreamError::RateLimited { .. } => true,
            UpstreamError::Api { status, .. } => *status >= 500 || *status == 429,
            e @ UpstreamError::Http(_) => e.is_network_error(),
            _ => false,
        }
    }
}

impl From<UpstreamError> for braid_core::BraidError {
    fn from(e: UpstreamError) -> Self {
        match e {
            UpstreamError::Api {
                status,
                error_type,
                message,
            } => braid_core::BraidError::Upstream {
                status,
                error_type,
                message,
            },
            UpstreamError::RateLimited {
                status,
                retry_after,
                message,
            } => braid_core::BraidError::RateLimited {
                status,
                retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
                message,
            },
            UpstreamError::Timeout { ms } => braid_core::BraidError::Timeout { ms },
            UpstreamError::CircuitOpen { upstream } => {
                braid_core::BraidError::CircuitOpen { upstream }
            }
            other => braid_core::BraidError::Upstream {
                status: other.status().unwrap_or(502),
                error_type: "upstream_error".to_string(),
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, UpstreamError>;
