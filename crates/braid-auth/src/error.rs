use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid domain '{0}'")]
    InvalidDomain(String),

    #[error("no credentials for domain '{0}'")]
    NotFound(String),

    #[error("credential file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid credential file: {0}")]
    Parse(String),

    #[error("token refresh failed ({status}): {message}")]
    RefreshFailed { status: u16, message: String },

    #[error("refresh in cooldown: {message}")]
    Cooldown { message: String },

    #[error("credential pool '{0}' has no usable members")]
    PoolExhausted(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, AuthError>;

impl From<AuthError> for braid_core::BraidError {
    fn from(e: AuthError) -> Self {
        braid_core::BraidError::Authentication(e.to_string())
    }
}
