use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Proxy constants — wire-level limits shared across crates
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const UPSTREAM_DEADLINE_SECS: u64 = 600; // hard 10-minute cutoff per request
pub const TELEMETRY_DEADLINE_SECS: u64 = 5; // best-effort telemetry POST budget
pub const CREDENTIAL_CACHE_TTL_SECS: u64 = 3600;
pub const CREDENTIAL_CACHE_MAX: usize = 100;

/// Top-level config (braid.toml + BRAID_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BraidConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub samples: SamplesConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the LLM API (no trailing slash).
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,
    /// Logical upstream name used for circuit-breaker keying.
    #[serde(default = "default_upstream_name")]
    pub name: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base_url(),
            name: default_upstream_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Directory holding `<domain>.credentials.json` files.
    /// Override with env var: CREDENTIALS_DIR.
    #[serde(default = "default_credentials_dir")]
    pub dir: String,
    /// Process-wide fallback API key for personal domains.
    #[serde(default)]
    pub default_api_key: Option<String>,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_max")]
    pub cache_max: usize,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            dir: default_credentials_dir(),
            default_api_key: None,
            cache_ttl_secs: CREDENTIAL_CACHE_TTL_SECS,
            cache_max: CREDENTIAL_CACHE_MAX,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Queries slower than this log a warning. Env: SLOW_QUERY_THRESHOLD_MS.
    #[serde(default = "default_slow_query_threshold_ms")]
    pub slow_query_threshold_ms: u64,
    /// Log every SQL statement at debug level. Env: SQL_DEBUG.
    #[serde(default)]
    pub sql_debug: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            slow_query_threshold_ms: default_slow_query_threshold_ms(),
            sql_debug: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelemetryConfig {
    /// POST endpoint for per-request telemetry. Disabled when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SamplesConfig {
    /// Collect one redacted request sample per request type.
    /// Env: COLLECT_TEST_SAMPLES.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_samples_dir")]
    pub dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnalysisConfig {
    /// Enqueue a conversation-analysis job after each persisted request.
    /// Env: ENABLE_ANALYSIS_JOBS.
    #[serde(default)]
    pub enabled: bool,
}

impl BraidConfig {
    /// Load order: explicit path > BRAID_CONFIG env > ~/.braid/braid.toml,
    /// then BRAID_* env overrides, then the flat legacy env controls.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let mut config: BraidConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("BRAID_").split("_"))
            .extract()
            .map_err(|e| crate::error::BraidError::Config(e.to_string()))?;

        config.apply_flat_env();
        Ok(config)
    }

    /// Flat environment controls that predate the BRAID_ prefix scheme.
    fn apply_flat_env(&mut self) {
        if let Ok(dir) = std::env::var("CREDENTIALS_DIR") {
            self.credentials.dir = dir;
        }
        if let Ok(v) = std::env::var("COLLECT_TEST_SAMPLES") {
            self.samples.enabled = env_truthy(&v);
        }
        if let Ok(v) = std::env::var("SLOW_QUERY_THRESHOLD_MS") {
            if let Ok(ms) = v.parse() {
                self.storage.slow_query_threshold_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("SQL_DEBUG") {
            self.storage.sql_debug = env_truthy(&v);
        }
        if let Ok(v) = std::env::var("ENABLE_ANALYSIS_JOBS") {
            self.analysis.enabled = env_truthy(&v);
        }
    }
}

fn env_truthy(v: &str) -> bool {
    matches!(v.trim(), "1" | "true" | "TRUE" | "yes" | "on")
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.braid/braid.toml", home)
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_upstream_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_upstream_name() -> String {
    "anthropic".to_string()
}
fn default_credentials_dir() -> String {
    "credentials".to_string()
}
fn default_cache_ttl_secs() -> u64 {
    CREDENTIAL_CACHE_TTL_SECS
}
fn default_cache_max() -> usize {
    CREDENTIAL_CACHE_MAX
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.braid/braid.db", home)
}
fn default_slow_query_threshold_ms() -> u64 {
    500
}
fn default_samples_dir() -> String {
    "samples".to_string()
}
