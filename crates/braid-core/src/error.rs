use thiserror::Error;

#[derive(Debug, Error)]
pub enum BraidError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Upstream error ({status}): {message}")]
    Upstream {
        status: u16,
        error_type: String,
        message: String,
    },

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Rate limited ({status}): {message}")]
    RateLimited {
        status: u16,
        /// Delay requested by the upstream, in milliseconds.
        retry_after_ms: Option<u64>,
        message: String,
    },

    #[error("Circuit open for upstream '{upstream}'")]
    CircuitOpen { upstream: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BraidError {
    /// Short error code string carried in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            BraidError::Config(_) => "CONFIG_ERROR",
            BraidError::Authentication(_) => "AUTHENTICATION_ERROR",
            BraidError::Validation(_) => "VALIDATION_ERROR",
            BraidError::Upstream { .. } => "UPSTREAM_ERROR",
            BraidError::Timeout { .. } => "TIMEOUT",
            BraidError::RateLimited { .. } => "RATE_LIMITED",
            BraidError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            BraidError::Storage(_) => "STORAGE_ERROR",
            BraidError::Serialization(_) => "SERIALIZATION_ERROR",
            BraidError::Io(_) => "IO_ERROR",
            BraidError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status to surface to the client. Upstream statuses pass through;
    /// everything internal maps to 500.
    pub fn http_status(&self) -> u16 {
        match self {
            BraidError::Authentication(_) => 401,
            BraidError::Validation(_) => 400,
            BraidError::Upstream { status, .. } => *status,
            BraidError::Timeout { .. } => 504,
            BraidError::RateLimited { status, .. } => *status,
            BraidError::CircuitOpen { .. } => 503,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, BraidError>;
