use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid stored value: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for braid_link::LinkError {
    fn from(e: StoreError) -> Self {
        braid_link::LinkError::Store(e.to_string())
    }
}

impl From<StoreError> for braid_core::BraidError {
    fn from(e: StoreError) -> Self {
        braid_core::BraidError::Storage(e.to_string())
    }
}
