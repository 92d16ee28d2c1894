//! Per-domain credential resolution: file store, TTL cache, and
//! single-flight OAuth refresh with failure cooldown.

pub mod error;
pub mod manager;
pub mod oauth;
pub mod store;

pub use error::{AuthError, Result};
pub use manager::{AuthOutcome, AuthType, CredentialManager, RefreshMetricsSnapshot};
pub use store::{Credential, CredentialFile, OAuthCredential, PoolCredential, SlackConfig};
