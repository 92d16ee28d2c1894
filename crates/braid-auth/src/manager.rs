//! Credential manager: TTL cache, single-flight OAuth refresh, and
//! failed-refresh cooldown.
//!
//! Refreshes are serialized per credential path — a second caller arriving
//! while a refresh is pending awaits the same outcome instead of firing a
//! duplicate upstream call. Reads of cached credentials within TTL are
//! lock-free.

use dashmap::DashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use braid_core::config::CredentialsConfig;
use braid_core::mask::opaque_key;

use crate::error::{AuthError, Result};
use crate::oauth;
use crate::store::{
    load_credential_file, resolve_credential_path, save_oauth_credential, Credential,
    CredentialKind, OAuthCredential, PoolCredential, PoolFallback, PoolStrategy, SlackConfig,
};

const OAUTH_BETA: &str = "oauth-2025-04-20";
/// Tokens within this margin of expiry are refreshed eagerly.
const EXPIRY_MARGIN_MS: i64 = 60_000;
/// An in-flight refresh older than this is considered stuck and reclaimed.
const REFRESH_STUCK_SECS: u64 = 60;
/// After a failed refresh, further attempts are rejected for this long.
const REFRESH_COOLDOWN_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    ApiKey,
    Oauth,
}

/// The result of authenticating a domain: everything the upstream client
/// needs, plus the notification target for the dispatcher.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub auth_type: AuthType,
    /// Outbound header name/value pairs. These always win over headers
    /// carried on the inbound request.
    pub headers: Vec<(String, String)>,
    /// Masked key identifier, safe for logs.
    pub opaque_key: String,
    pub account_id: Option<String>,
    pub beta_header: Option<String>,
    pub slack: Option<SlackConfig>,
}

impl AuthOutcome {
    fn api_key(key: &str, account_id: Option<String>, slack: Option<SlackConfig>) -> Self {
        Self {
            auth_type: AuthType::ApiKey,
            headers: vec![("x-api-key".to_string(), key.to_string())],
            opaque_key: opaque_key(key),
            account_id,
            beta_header: None,
            slack,
        }
    }

    fn oauth(token: &str, account_id: Option<String>, slack: Option<SlackConfig>) -> Self {
        Self {
            auth_type: AuthType::Oauth,
            headers: vec![("authorization".to_string(), format!("Bearer {token}"))],
            opaque_key: opaque_key(token),
            account_id,
            beta_header: Some(OAUTH_BETA.to_string()),
            slack,
        }
    }

    fn inbound_bearer(token: &str) -> Self {
        Self {
            auth_type: AuthType::ApiKey,
            headers: vec![("authorization".to_string(), format!("Bearer {token}"))],
            opaque_key: opaque_key(token),
            account_id: None,
            beta_header: None,
            slack: None,
        }
    }
}

struct CachedCredential {
    credential: Credential,
    loaded_at: Instant,
}

struct RefreshSlot {
    started: Instant,
    lock: tokio::sync::Mutex<()>,
}

impl RefreshSlot {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            lock: tokio::sync::Mutex::new(()),
        }
    }
}

struct FailedRefresh {
    at: Instant,
    message: String,
}

#[derive(Default)]
struct RefreshMetrics {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    concurrent_waits: AtomicU64,
    total_refresh_ms: AtomicU64,
}

/// Point-in-time view of refresh activity.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RefreshMetricsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub concurrent_waits: u64,
    pub total_refresh_ms: u64,
    pub in_flight: usize,
    pub cooldowns: usize,
}

pub struct CredentialManager {
    config: CredentialsConfig,
    client: reqwest::Client,
    cache: DashMap<String, CachedCredential>,
    active: DashMap<String, Arc<RefreshSlot>>,
    failed: DashMap<String, FailedRefresh>,
    pool_cursor: DashMap<String, usize>,
    pool_uses: DashMap<String, u64>,
    metrics: RefreshMetrics,
}

impl CredentialManager {
    pub fn new(config: CredentialsConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            cache: DashMap::new(),
            active: DashMap::new(),
            failed: DashMap::new(),
            pool_cursor: DashMap::new(),
            pool_uses: DashMap::new(),
            metrics: RefreshMetrics::default(),
        }
    }

    /// Resolve outbound authentication for a domain.
    ///
    /// Domains containing `personal` fall back to the inbound bearer token
    /// and then the process-wide default key when domain credentials are
    /// missing or unusable; all other domains use domain credentials only.
    pub async fn authenticate(
        &self,
        domain: &str,
        inbound_bearer: Option<&str>,
    ) -> Result<AuthOutcome> {
        let personal = domain.to_ascii_lowercase().contains("personal");

        match self.domain_outcome(domain).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if personal => {
                debug!(domain, error = %e, "personal domain falling back");
                if let Some(token) = inbound_bearer {
                    return Ok(AuthOutcome::inbound_bearer(token));
                }
                if let Some(key) = &self.config.default_api_key {
                    return Ok(AuthOutcome::api_key(key, None, None));
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn domain_outcome(&self, domain: &str) -> Result<AuthOutcome> {
        let dir = Path::new(&self.config.dir);
        let path = resolve_credential_path(dir, domain)?;
        let key = path.to_string_lossy().into_owned();
        let credential = self.load(&key, &path, domain)?;
        self.outcome_for(&key, credential).await
    }

    async fn outcome_for(&self, key: &str, credential: Credential) -> Result<AuthOutcome> {
        match &credential.kind {
            CredentialKind::ApiKey(api_key) => Ok(AuthOutcome::api_key(
                api_key,
                credential.account_id.clone(),
                credential.slack.clone(),
            )),
            CredentialKind::OAuth(oauth) => {
                let fresh = self
                    .ensure_fresh(key, &credential, oauth, |current| {
                        let client = self.client.clone();
                        let current = current.clone();
                        async move { oauth::refresh_access_token(&client, &current).await }
                    })
                    .await?;
                Ok(AuthOutcome::oauth(
                    &fresh.access_token,
                    credential.account_id.clone(),
                    credential.slack.clone(),
                ))
            }
            CredentialKind::Pool(pool) => {
                let pool = pool.clone();
                Box::pin(self.pool_outcome(&pool)).await
            }
        }
    }

    /// Select a pool member and authenticate through its account credential.
    async fn pool_outcome(&self, pool: &PoolCredential) -> Result<AuthOutcome> {
        if pool.account_ids.is_empty() {
            return Err(AuthError::PoolExhausted(pool.pool_id.clone()));
        }

        let start = match pool.strategy {
            PoolStrategy::Sticky => stable_index(&pool.pool_id, pool.account_ids.len()),
            PoolStrategy::RoundRobin => {
                let mut cursor = self.pool_cursor.entry(pool.pool_id.clone()).or_insert(0);
                let index = *cursor % pool.account_ids.len();
                *cursor = cursor.wrapping_add(1);
                index
            }
            PoolStrategy::LeastUsed => pool
                .account_ids
                .iter()
                .enumerate()
                .min_by_key(|(_, id)| self.pool_uses.get(*id).map(|u| *u).unwrap_or(0))
                .map(|(i, _)| i)
                .unwrap_or(0),
        };

        let attempts = match pool.fallback {
            PoolFallback::Error => 1,
            PoolFallback::Cycle => pool.account_ids.len(),
        };

        let dir = Path::new(&self.config.dir).to_path_buf();
        let mut last_err = None;
        for offset in 0..attempts {
            let account_id = &pool.account_ids[(start + offset) % pool.account_ids.len()];
            let result = async {
                let path = resolve_credential_path(&dir, account_id)?;
                let key = path.to_string_lossy().into_owned();
                let credential = self.load(&key, &path, account_id)?;
                if matches!(credential.kind, CredentialKind::Pool(_)) {
                    // Pools do not nest.
                    return Err(AuthError::Parse(format!(
                        "pool member '{account_id}' is itself a pool"
                    )));
                }
                self.outcome_for(&key, credential).await
            }
            .await;

            match result {
                Ok(outcome) => {
                    *self.pool_uses.entry(account_id.clone()).or_insert(0) += 1;
                    return Ok(outcome);
                }
                Err(e) => {
                    warn!(pool = pool.pool_id, account_id, error = %e, "pool member unusable");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| AuthError::PoolExhausted(pool.pool_id.clone())))
    }

    /// Read through the cache, loading from disk on miss or TTL expiry.
    fn load(&self, key: &str, path: &Path, domain: &str) -> Result<Credential> {
        if let Some(credential) = self.cached(key) {
            return Ok(credential);
        }
        if !path.exists() {
            return Err(AuthError::NotFound(domain.to_string()));
        }
        let credential = load_credential_file(path)?;
        self.insert_cache(key, credential.clone());
        Ok(credential)
    }

    fn cached(&self, key: &str) -> Option<Credential> {
        let entry = self.cache.get(key)?;
        if entry.loaded_at.elapsed() > Duration::from_secs(self.config.cache_ttl_secs) {
            drop(entry);
            self.cache.remove(key);
            return None;
        }
        Some(entry.credential.clone())
    }

    fn insert_cache(&self, key: &str, credential: Credential) {
        if self.cache.len() >= self.config.cache_max && !self.cache.contains_key(key) {
            // Evict the least recently loaded entry.
            let oldest = self
                .cache
                .iter()
                .min_by_key(|e| e.loaded_at)
                .map(|e| e.key().clone());
            if let Some(oldest) = oldest {
                self.cache.remove(&oldest);
            }
        }
        self.cache.insert(
            key.to_string(),
            CachedCredential {
                credential,
                loaded_at: Instant::now(),
            },
        );
    }

    /// Drop the cached credential for a path.
    pub fn invalidate(&self, key: &str) {
        self.cache.remove(key);
    }

    /// Explicit reset — clears every cached credential.
    pub fn reset(&self) {
        self.cache.clear();
    }

    pub fn metrics(&self) -> RefreshMetricsSnapshot {
        let cooldown = Duration::from_millis(REFRESH_COOLDOWN_MS);
        RefreshMetricsSnapshot {
            attempts: self.metrics.attempts.load(Ordering::Relaxed),
            successes: self.metrics.successes.load(Ordering::Relaxed),
            failures: self.metrics.failures.load(Ordering::Relaxed),
            concurrent_waits: self.metrics.concurrent_waits.load(Ordering::Relaxed),
            total_refresh_ms: self.metrics.total_refresh_ms.load(Ordering::Relaxed),
            in_flight: self.active.len(),
            cooldowns: self
                .failed
                .iter()
                .filter(|f| f.at.elapsed() < cooldown)
                .count(),
        }
    }

    /// Return a non-expiring access credential, refreshing through the
    /// single-flight slot when the token is near expiry.
    async fn ensure_fresh<F, Fut>(
        &self,
        key: &str,
        credential: &Credential,
        oauth: &OAuthCredential,
        do_refresh: F,
    ) -> Result<OAuthCredential>
    where
        F: FnOnce(&OAuthCredential) -> Fut,
        Fut: Future<Output = Result<OAuthCredential>>,
    {
        let now_ms = chrono::Utc::now().timestamp_millis();
        if oauth.expires_at - EXPIRY_MARGIN_MS > now_ms {
            return Ok(oauth.clone());
        }

        // Cooldown: a recent failure short-circuits with the cached error.
        if let Some(entry) = self.failed.get(key) {
            if entry.at.elapsed() < Duration::from_millis(REFRESH_COOLDOWN_MS) {
                return Err(AuthError::Cooldown {
                    message: entry.message.clone(),
                });
            }
            drop(entry);
            // Entry expired — clean it up and retry.
            self.failed.remove(key);
        }

        // Join or create the per-path refresh slot.
        let (slot, waiter) = {
            use dashmap::mapref::entry::Entry;
            match self.active.entry(key.to_string()) {
                Entry::Occupied(mut occupied) => {
                    if occupied.get().started.elapsed() >= Duration::from_secs(REFRESH_STUCK_SECS) {
                        warn!(path = key, "reclaiming stuck credential refresh");
                        let fresh = Arc::new(RefreshSlot::new());
                        occupied.insert(fresh.clone());
                        (fresh, false)
                    } else {
                        (occupied.get().clone(), true)
                    }
                }
                Entry::Vacant(vacant) => {
                    let fresh = Arc::new(RefreshSlot::new());
                    vacant.insert(fresh.clone());
                    (fresh, false)
                }
            }
        };
        if waiter {
            self.metrics.concurrent_waits.fetch_add(1, Ordering::Relaxed);
        }

        let _guard = slot.lock.lock().await;

        // The leader may have finished while we waited: a fresh cached token
        // means the refresh already happened.
        if let Some(cached) = self.cached(key) {
            if let CredentialKind::OAuth(current) = &cached.kind {
                let now_ms = chrono::Utc::now().timestamp_millis();
                if current.expires_at - EXPIRY_MARGIN_MS > now_ms {
                    return Ok(current.clone());
                }
            }
        }
        if let Some(entry) = self.failed.get(key) {
            if entry.at.elapsed() < Duration::from_millis(REFRESH_COOLDOWN_MS) {
                return Err(AuthError::Cooldown {
                    message: entry.message.clone(),
                });
            }
        }

        self.metrics.attempts.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let result = do_refresh(oauth).await;
        self.metrics
            .total_refresh_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);

        match result {
            Ok(rotated) => {
                self.metrics.successes.fetch_add(1, Ordering::Relaxed);
                info!(path = key, "credential refreshed");

                if let Err(e) = save_oauth_credential(Path::new(key), &rotated) {
                    warn!(path = key, error = %e, "failed to persist refreshed credential");
                }

                // Successful refresh invalidates and repopulates the cache.
                self.invalidate(key);
                self.insert_cache(
                    key,
                    Credential {
                        kind: CredentialKind::OAuth(rotated.clone()),
                        account_id: credential.account_id.clone(),
                        slack: credential.slack.clone(),
                    },
                );
                self.active.remove(key);
                Ok(rotated)
            }
            Err(e) => {
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                warn!(path = key, error = %e, "credential refresh failed");
                self.failed.insert(
                    key.to_string(),
                    FailedRefresh {
                        at: Instant::now(),
                        message: e.to_string(),
                    },
                );
                self.active.remove(key);
                Err(e)
            }
        }
    }
}

/// Deterministic member index for sticky pool routing.
fn stable_index(pool_id: &str, len: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    pool_id.hash(&mut hasher);
    (hasher.finish() as usize) % len
}
