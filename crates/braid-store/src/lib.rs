//! SQLite-backed storage: the request log, `Task` invocation index,
//! analysis-job queue, and the executor implementations the linker
//! consumes.

pub mod db;
pub mod error;
pub mod store;

pub use error::{Result, StoreError};
pub use store::RequestStore;
