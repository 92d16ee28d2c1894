use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    /// The one hard error: a request with no messages cannot be linked.
    #[error("cannot link a request with no messages")]
    EmptyMessages,

    #[error("store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, LinkError>;
