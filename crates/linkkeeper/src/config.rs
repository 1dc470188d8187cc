use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use linkkeeper_protocol::ConnectionOptions;

use crate::cache::{self, CacheConfig};
use crate::recovery::{
    BackoffPolicy, DEFAULT_CIRCUIT_BREAKER_THRESHOLD, ErrorCode, PolicyOverride, PolicyTable,
    backoff,
};

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub cache: CacheSettings,
    /// Sessions started by `serve`.
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("unclosed variable reference '${{' (missing '}}')")]
    UnclosedVarReference,

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    /// Load the config file. A missing file yields defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let expanded = expand_env_vars(&contents)?;
        let config: Self = serde_saphyr::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for tenant in &self.tenants {
            if tenant.id.is_empty() {
                return Err(ConfigError::Invalid("tenant id must not be empty".to_string()));
            }
            if !seen.insert(tenant.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate tenant id '{}'",
                    tenant.id
                )));
            }
        }
        if self.recovery.qr_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "recovery.qr_max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.recovery.jitter) {
            return Err(ConfigError::Invalid(
                "recovery.jitter must be between 0 and 1".to_string(),
            ));
        }
        if self.recovery.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "recovery.backoff_multiplier must be at least 1".to_string(),
            ));
        }
        let table = self.recovery.policy_table();
        for code in self.recovery.policies.keys() {
            let entry = table.get(*code);
            if entry.base_delay_ms > entry.max_delay_ms {
                return Err(ConfigError::Invalid(format!(
                    "recovery.policies.{code}: base_delay_ms ({}) exceeds max_delay_ms ({})",
                    entry.base_delay_ms, entry.max_delay_ms
                )));
            }
        }
        Ok(())
    }

    /// Workspace directory resolved against the config file location.
    pub fn workspace_dir(&self, config_path: &Path) -> PathBuf {
        let workspace = self
            .workspace
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKSPACE));
        resolve_path(config_path, &workspace)
    }
}

/// Resolve a path relative to the config file directory.
///
/// Absolute paths are returned as-is.
pub fn resolve_path(config_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }

    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    config_dir.join(path)
}

// ============================================================================
// Default Paths
// ============================================================================

/// Default workspace directory (relative to config file).
pub const DEFAULT_WORKSPACE: &str = ".linkkeeper";
/// Credential files (relative to workspace).
pub const DEFAULT_AUTH_DIR: &str = "auth";
/// Tenant records (relative to workspace).
pub const DEFAULT_TENANTS_DIR: &str = "tenants";

// ============================================================================
// Connector
// ============================================================================

/// External protocol bridge spawned once per connection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

// ============================================================================
// Connection
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout_ms: u64,
    pub keep_alive_interval_ms: u64,
    pub qr_timeout_ms: u64,
    pub default_query_timeout_ms: u64,
    pub ignored_jid_suffixes: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let options = ConnectionOptions::default();
        Self {
            connect_timeout_ms: options.connect_timeout_ms,
            keep_alive_interval_ms: options.keep_alive_interval_ms,
            qr_timeout_ms: options.qr_timeout_ms,
            default_query_timeout_ms: options.default_query_timeout_ms,
            ignored_jid_suffixes: options.ignored_jid_suffixes,
        }
    }
}

impl ConnectionConfig {
    pub fn options(&self) -> ConnectionOptions {
        ConnectionOptions {
            connect_timeout_ms: self.connect_timeout_ms,
            keep_alive_interval_ms: self.keep_alive_interval_ms,
            qr_timeout_ms: self.qr_timeout_ms,
            default_query_timeout_ms: self.default_query_timeout_ms,
            ignored_jid_suffixes: self.ignored_jid_suffixes.clone(),
        }
    }
}

// ============================================================================
// Recovery
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub circuit_breaker_threshold: u32,
    /// QR codes issued without pairing before credentials are cleared.
    pub qr_max_attempts: u32,
    pub backoff_multiplier: f64,
    pub jitter: f64,
    /// Per-code overrides of the built-in policy table.
    pub policies: HashMap<ErrorCode, PolicyOverride>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            circuit_breaker_threshold: DEFAULT_CIRCUIT_BREAKER_THRESHOLD,
            qr_max_attempts: DEFAULT_QR_MAX_ATTEMPTS,
            backoff_multiplier: backoff::DEFAULT_MULTIPLIER,
            jitter: backoff::DEFAULT_JITTER,
            policies: HashMap::new(),
        }
    }
}

/// Default QR ceiling.
pub const DEFAULT_QR_MAX_ATTEMPTS: u32 = 3;

impl RecoveryConfig {
    pub fn policy_table(&self) -> PolicyTable {
        PolicyTable::with_overrides(&self.policies)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }
}

// ============================================================================
// Cache
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub cold_capacity: usize,
    pub cold_ttl_secs: u64,
    pub hot_capacity: usize,
    pub hot_ttl_secs: u64,
    pub promote_after: u32,
    pub sweep_interval_secs: u64,
    pub max_age_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cold_capacity: cache::DEFAULT_COLD_CAPACITY,
            cold_ttl_secs: cache::DEFAULT_COLD_TTL.as_secs(),
            hot_capacity: cache::DEFAULT_HOT_CAPACITY,
            hot_ttl_secs: cache::DEFAULT_HOT_TTL.as_secs(),
            promote_after: cache::DEFAULT_PROMOTE_AFTER,
            sweep_interval_secs: cache::DEFAULT_SWEEP_INTERVAL.as_secs(),
            max_age_secs: cache::DEFAULT_MAX_AGE.as_secs(),
        }
    }
}

impl CacheSettings {
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            cold_capacity: self.cold_capacity,
            cold_ttl: Duration::from_secs(self.cold_ttl_secs),
            hot_capacity: self.hot_capacity,
            hot_ttl: Duration::from_secs(self.hot_ttl_secs),
            promote_after: self.promote_after.max(1),
            // interval() panics on a zero period
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            max_age: Duration::from_secs(self.max_age_secs),
        }
    }
}

// ============================================================================
// Tenants
// ============================================================================

/// One tenant session to supervise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Session id, unique across the process.
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub name: String,
}

impl TenantConfig {
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            name: name.into(),
        }
    }
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in config text.
///
/// - `${VAR}` is required and errors if unset
/// - `${VAR:-default}` falls back to `default` (which may be empty)
/// - `$$` is a literal `$`
///
/// A `$` not followed by `{` or `$` is kept as-is. Nested references are not
/// supported.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                result.push('$');
            }
            Some('{') => {
                chars.next();
                let mut reference = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    reference.push(c);
                }
                if !closed {
                    return Err(ConfigError::UnclosedVarReference);
                }
                result.push_str(&resolve_reference(&reference)?);
            }
            _ => result.push('$'),
        }
    }

    Ok(result)
}

fn resolve_reference(reference: &str) -> Result<String, ConfigError> {
    let (name, default) = match reference.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (reference, None),
    };

    match (std::env::var(name), default) {
        (Ok(value), _) => Ok(value),
        (Err(_), Some(default)) => Ok(default.to_string()),
        (Err(_), None) => Err(ConfigError::MissingEnvVar(name.to_string())),
    }
}

// ============================================================================
// Tests
// ============================================================================
