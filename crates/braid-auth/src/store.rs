//! Credential files on disk — one `<domain>.credentials.json` per tenant.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::{AuthError, Result};

fn domain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9.\-:]+$").unwrap())
}

/// Map a tenant domain to its credential file, refusing anything that could
/// escape the credentials directory.
pub fn resolve_credential_path(dir: &Path, domain: &str) -> Result<PathBuf> {
    if domain.is_empty()
        || domain.contains("..")
        || domain.contains('/')
        || domain.contains('\\')
        || !domain_re().is_match(domain)
    {
        return Err(AuthError::InvalidDomain(domain.to_string()));
    }

    let path = dir.join(format!("{domain}.credentials.json"));

    // Containment check on the canonical paths. The file may not exist yet;
    // canonicalize the directory and re-append the file name.
    let canonical_dir = dir
        .canonicalize()
        .map_err(|_| AuthError::NotFound(domain.to_string()))?;
    let canonical = canonical_dir.join(path.file_name().unwrap_or_default());
    if !canonical.starts_with(&canonical_dir) {
        return Err(AuthError::InvalidDomain(domain.to_string()));
    }

    Ok(canonical)
}

/// OAuth credentials as stored on disk. Timestamps are ms since epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthCredential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolStrategy {
    Sticky,
    LeastUsed,
    RoundRobin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolFallback {
    /// Fail when the selected member is unusable.
    Error,
    /// Try the next member in order.
    Cycle,
}

/// A pool credential delegates to member account files in the same
/// credentials directory (`<account_id>.credentials.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolCredential {
    pub pool_id: String,
    pub account_ids: Vec<String>,
    pub strategy: PoolStrategy,
    #[serde(default = "default_fallback")]
    pub fallback: PoolFallback,
}

fn default_fallback() -> PoolFallback {
    PoolFallback::Error
}

/// Per-domain Slack notification target — passed through to the dispatcher
/// as an opaque value object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub icon_emoji: Option<String>,
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

fn bool_true() -> bool {
    true
}

/// The tagged credential payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    ApiKey,
    Oauth,
    Pool,
}

/// One `<domain>.credentials.json` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialFile {
    #[serde(rename = "type")]
    pub credential_type: CredentialType,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub oauth: Option<OAuthCredential>,
    #[serde(default)]
    pub pool: Option<PoolCredential>,
    #[serde(default, rename = "accountId")]
    pub account_id: Option<String>,
    /// Key clients must present to use this domain (checked by the web
    /// layer, carried here for completeness).
    #[serde(default)]
    pub client_api_key: Option<String>,
    #[serde(default)]
    pub slack: Option<SlackConfig>,
}

impl CredentialFile {
    /// Validate the payload matches the declared type.
    pub fn into_credential(self) -> Result<Credential> {
        match self.credential_type {
            CredentialType::ApiKey => {
                let api_key = self
                    .api_key
                    .ok_or_else(|| AuthError::Parse("api_key credential missing key".into()))?;
                Ok(Credential {
                    kind: CredentialKind::ApiKey(api_key),
                    account_id: self.account_id,
                    slack: self.slack,
                })
            }
            CredentialType::Oauth => {
                let oauth = self
                    .oauth
                    .ok_or_else(|| AuthError::Parse("oauth credential missing oauth block".into()))?;
                Ok(Credential {
                    kind: CredentialKind::OAuth(oauth),
                    account_id: self.account_id,
                    slack: self.slack,
                })
            }
            CredentialType::Pool => {
                let pool = self
                    .pool
                    .ok_or_else(|| AuthError::Parse("pool credential missing pool block".into()))?;
                Ok(Credential {
                    kind: CredentialKind::Pool(pool),
                    account_id: self.account_id,
                    slack: self.slack,
                })
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum CredentialKind {
    ApiKey(String),
    OAuth(OAuthCredential),
    Pool(PoolCredential),
}

/// Parsed credential for one domain.
#[derive(Debug, Clone)]
pub struct Credential {
    pub kind: CredentialKind,
    pub account_id: Option<String>,
    pub slack: Option<SlackConfig>,
}

/// Load and validate a credential file.
pub fn load_credential_file(path: &Path) -> Result<Credential> {
    let data = std::fs::read_to_string(path)?;
    let file: CredentialFile =
        serde_json::from_str(&data).map_err(|e| AuthError::Parse(e.to_string()))?;
    file.into_credential()
}

/// Persist a rotated OAuth credential back to its file, preserving the
/// surrounding fields.
pub fn save_oauth_credential(path: &Path, oauth: &OAuthCredential) -> Result<()> {
    let data = std::fs::read_to_string(path)?;
    let mut file: CredentialFile =
        serde_json::from_str(&data).map_err(|e| AuthError::Parse(e.to_string()))?;
    file.oauth = Some(oauth.clone());
    let json = serde_json::to_string_pretty(&file).map_err(|e| AuthError::Parse(e.to_string()))?;
    std::fs::write(path, json)?;
    Ok(())
}
