//! TOML Configuration
//!
//! Static dispatch configuration, loaded once at startup from
//! `$XDG_CONFIG_HOME/job-dispatch/dispatch.toml` unless another path is
//! given (CLI flag, then `DISPATCH_CONFIG`).
//!
//! Sizes, thresholds, windows and budgets have no built-in defaults. A file
//! that leaves one out is rejected with a validation error naming the key.
//! The optional keys are `call_timeout_secs`, `endpoint`,
//! `retention_secs` (how long finished job records are kept) and the whole
//! `[cache]` section (response cache; both of its keys are required once the
//! section is present).
//!
//! # Priority
//!
//! 1. Environment variables (`DISPATCH_WORKER_POOL_SIZE`, `DISPATCH_QUEUE_MAX_SIZE`,
//!    `DISPATCH_RESOURCE_POOL_SIZE`, `DISPATCH_JOB_BUDGET_SECS`,
//!    `DISPATCH_RETENTION_SECS`)
//! 2. TOML configuration file
//!
//! # Example Configuration
//!
//! ```toml
//! [dispatch]
//! worker_pool_size = 3
//! queue_max_size = 10
//! resource_pool_size = 2
//! job_budget_secs = 900
//! retention_secs = 86400
//!
//! [cache]
//! ttl_secs = 60
//! max_entries = 100
//!
//! [[backends]]
//! id = "haiku"
//! provider = "anthropic"
//! tier = 0
//! unit_price = 0.00025
//! limit = 50
//! window_secs = 60
//! failure_threshold = 3
//! cooldown_secs = 30
//! call_timeout_secs = 120
//!
//! [[ladders]]
//! task_kind = "code_generation"
//! complexity = "simple"
//! backends = ["haiku", "sonnet"]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{Complexity, TaskKind};
use crate::routing::{
    Backend, BreakerConfig, CacheConfig, CostModel, EscalationLadder, LadderError, LadderTable,
    RateLimitConfig,
};

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "DISPATCH_CONFIG";

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Missing or out-of-range value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Invalid escalation ladder: {0}")]
    LadderError(#[from] LadderError),
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[dispatch]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchToml {
    pub worker_pool_size: Option<usize>,
    pub queue_max_size: Option<usize>,
    pub resource_pool_size: Option<usize>,
    pub job_budget_secs: Option<u64>,
    pub retention_secs: Option<u64>,
}

/// `[cache]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheToml {
    pub ttl_secs: Option<u64>,
    pub max_entries: Option<usize>,
}

/// One `[[backends]]` entry
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    pub id: Option<String>,
    pub provider: Option<String>,
    pub tier: Option<u32>,
    pub unit_price: Option<f64>,
    pub limit: Option<u32>,
    pub window_secs: Option<u64>,
    pub failure_threshold: Option<u32>,
    pub cooldown_secs: Option<u64>,
    pub call_timeout_secs: Option<u64>,
    pub endpoint: Option<String>,
}

/// One `[[ladders]]` entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LadderToml {
    pub task_kind: TaskKind,
    pub complexity: Complexity,
    pub backends: Vec<String>,
}

/// Whole configuration file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub dispatch: DispatchToml,
    pub cache: Option<CacheToml>,
    pub backends: Vec<BackendToml>,
    pub ladders: Vec<LadderToml>,
}

// =============================================================================
// Typed Configuration
// =============================================================================

/// Fully specified backend configuration
#[derive(Clone, Debug, PartialEq)]
pub struct BackendConfig {
    pub id: String,
    pub provider: String,
    pub tier: u32,
    pub unit_price: f64,
    pub rate_limit: RateLimitConfig,
    pub breaker: BreakerConfig,
    pub call_timeout: Option<Duration>,

    /// Where the daemon's HTTP adapter sends envelopes
    pub endpoint: Option<String>,
}

impl BackendConfig {
    pub fn new(
        id: impl Into<String>,
        provider: impl Into<String>,
        tier: u32,
        unit_price: f64,
        rate_limit: RateLimitConfig,
        breaker: BreakerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            tier,
            unit_price,
            rate_limit,
            breaker,
            call_timeout: None,
            endpoint: None,
        }
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Runtime descriptor for the router
    #[must_use]
    pub fn descriptor(&self) -> Backend {
        Backend {
            id: self.id.clone(),
            provider: self.provider.clone(),
            tier: self.tier,
            cost: CostModel::new(self.unit_price),
            call_timeout: self.call_timeout,
        }
    }
}

/// Validated dispatch configuration
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchConfig {
    pub worker_pool_size: usize,
    pub queue_max_size: usize,
    pub resource_pool_size: usize,

    /// Wall-clock budget for one whole job
    pub job_budget: Duration,

    /// How long finished job records stay queryable; kept forever when unset
    pub retention: Option<Duration>,

    pub cache: Option<CacheConfig>,
    pub backends: Vec<BackendConfig>,
    pub ladders: Vec<EscalationLadder>,
}

impl DispatchConfig {
    pub fn new(
        worker_pool_size: usize,
        queue_max_size: usize,
        resource_pool_size: usize,
        job_budget: Duration,
    ) -> Self {
        Self {
            worker_pool_size,
            queue_max_size,
            resource_pool_size,
            job_budget,
            retention: None,
            cache: None,
            backends: Vec::new(),
            ladders: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backends.push(backend);
        self
    }

    #[must_use]
    pub fn with_ladder(mut self, task_kind: TaskKind, complexity: Complexity, backends: &[&str]) -> Self {
        self.ladders.push(EscalationLadder::new(
            task_kind,
            complexity,
            backends.iter().map(|b| (*b).to_string()).collect(),
        ));
        self
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        Self::from_file(file)
    }

    /// Convert a parsed file, requiring every sizing value
    pub fn from_file(file: ConfigFile) -> Result<Self, ConfigError> {
        let section = &file.dispatch;
        let mut config = Self::new(
            required(section.worker_pool_size, "dispatch.worker_pool_size")?,
            required(section.queue_max_size, "dispatch.queue_max_size")?,
            required(section.resource_pool_size, "dispatch.resource_pool_size")?,
            Duration::from_secs(required(section.job_budget_secs, "dispatch.job_budget_secs")?),
        );
        config.retention = section.retention_secs.map(Duration::from_secs);

        if let Some(cache) = &file.cache {
            config.cache = Some(CacheConfig::new(
                Duration::from_secs(required(cache.ttl_secs, "cache.ttl_secs")?),
                required(cache.max_entries, "cache.max_entries")?,
            ));
        }

        for (index, backend) in file.backends.iter().enumerate() {
            config.backends.push(backend_from_toml(index, backend)?);
        }

        config.ladders = file
            .ladders
            .into_iter()
            .map(|l| EscalationLadder::new(l.task_kind, l.complexity, l.backends))
            .collect();

        config.validate()?;
        Ok(config)
    }

    /// Check ranges and cross references
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive(self.worker_pool_size as u64, "dispatch.worker_pool_size")?;
        positive(self.queue_max_size as u64, "dispatch.queue_max_size")?;
        positive(self.resource_pool_size as u64, "dispatch.resource_pool_size")?;
        if self.job_budget.is_zero() {
            return Err(ConfigError::ValidationError(
                "dispatch.job_budget_secs must be greater than 0".to_string(),
            ));
        }
        if self.retention.is_some_and(|r| r.is_zero()) {
            return Err(ConfigError::ValidationError(
                "dispatch.retention_secs must be greater than 0".to_string(),
            ));
        }
        if let Some(cache) = &self.cache {
            positive(cache.ttl.as_secs(), "cache.ttl_secs")?;
            positive(cache.max_entries as u64, "cache.max_entries")?;
        }

        if self.backends.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one backend must be configured".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for backend in &self.backends {
            if !ids.insert(backend.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "backend {} is defined twice",
                    backend.id
                )));
            }
            let key = |field: &str| format!("backends.{}.{field}", backend.id);
            positive(u64::from(backend.rate_limit.limit), &key("limit"))?;
            if backend.rate_limit.window.is_zero() {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be greater than 0",
                    key("window_secs")
                )));
            }
            positive(
                u64::from(backend.breaker.failure_threshold),
                &key("failure_threshold"),
            )?;
            if !backend.unit_price.is_finite() || backend.unit_price < 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be a non-negative number",
                    key("unit_price")
                )));
            }
        }

        if self.ladders.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one escalation ladder must be configured".to_string(),
            ));
        }
        self.ladder_table()?;
        Ok(())
    }

    /// Build the validated ladder lookup table
    pub fn ladder_table(&self) -> Result<LadderTable, ConfigError> {
        Ok(LadderTable::build(
            self.ladders.iter().cloned(),
            self.backends.iter().map(|b| b.id.as_str()),
        )?)
    }

    #[must_use]
    pub fn backend(&self, id: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.id == id)
    }
}

fn required<T>(value: Option<T>, key: &str) -> Result<T, ConfigError> {
    value.ok_or_else(|| ConfigError::ValidationError(format!("missing required value: {key}")))
}

fn positive(value: u64, key: &str) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::ValidationError(format!(
            "{key} must be greater than 0"
        )))
    } else {
        Ok(())
    }
}

fn backend_from_toml(index: usize, toml: &BackendToml) -> Result<BackendConfig, ConfigError> {
    let id = required(toml.id.clone(), &format!("backends[{index}].id"))?;
    let key = |field: &str| format!("backends.{id}.{field}");

    let rate_limit = RateLimitConfig::new(
        required(toml.limit, &key("limit"))?,
        Duration::from_secs(required(toml.window_secs, &key("window_secs"))?),
    );
    let breaker = BreakerConfig::new(
        required(toml.failure_threshold, &key("failure_threshold"))?,
        Duration::from_secs(required(toml.cooldown_secs, &key("cooldown_secs"))?),
    );

    let mut backend = BackendConfig::new(
        id.clone(),
        required(toml.provider.clone(), &key("provider"))?,
        required(toml.tier, &key("tier"))?,
        required(toml.unit_price, &key("unit_price"))?,
        rate_limit,
        breaker,
    );
    backend.call_timeout = toml.call_timeout_secs.map(Duration::from_secs);
    backend.endpoint = toml.endpoint.clone();
    Ok(backend)
}

// =============================================================================
// Loading
// =============================================================================

/// Default config file path
///
/// Returns `~/.config/job-dispatch/dispatch.toml` on Linux
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("job-dispatch").join("dispatch.toml"))
}

/// Resolve the config path: explicit argument, then `DISPATCH_CONFIG`, then
/// the XDG default
#[must_use]
pub fn resolve_config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit
        .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
        .or_else(default_config_path)
}

/// Load, apply environment overrides, and validate
pub fn load_config(explicit: Option<PathBuf>) -> Result<DispatchConfig, ConfigError> {
    let path = resolve_config_path(explicit).ok_or_else(|| {
        ConfigError::ValidationError("no configuration path could be determined".to_string())
    })?;
    load_config_from_path(&path, |key| std::env::var(key).ok())
}

/// Load a specific file, reading overrides through `env`
pub fn load_config_from_path(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<DispatchConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;

    let mut file: ConfigFile = toml::from_str(&content)?;
    apply_env_overrides(&mut file.dispatch, env)?;
    let config = DispatchConfig::from_file(file)?;

    tracing::info!(
        path = %path.display(),
        backends = config.backends.len(),
        ladders = config.ladders.len(),
        workers = config.worker_pool_size,
        "Loaded configuration from file"
    );
    Ok(config)
}

/// Overlay `DISPATCH_*` sizing variables onto the `[dispatch]` section
pub fn apply_env_overrides(
    section: &mut DispatchToml,
    env: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
        raw.trim()
            .parse()
            .map_err(|_| ConfigError::ValidationError(format!("{key} is not a valid number: {raw}")))
    }

    if let Some(raw) = env("DISPATCH_WORKER_POOL_SIZE") {
        section.worker_pool_size = Some(parse("DISPATCH_WORKER_POOL_SIZE", &raw)?);
    }
    if let Some(raw) = env("DISPATCH_QUEUE_MAX_SIZE") {
        section.queue_max_size = Some(parse("DISPATCH_QUEUE_MAX_SIZE", &raw)?);
    }
    if let Some(raw) = env("DISPATCH_RESOURCE_POOL_SIZE") {
        section.resource_pool_size = Some(parse("DISPATCH_RESOURCE_POOL_SIZE", &raw)?);
    }
    if let Some(raw) = env("DISPATCH_JOB_BUDGET_SECS") {
        section.job_budget_secs = Some(parse("DISPATCH_JOB_BUDGET_SECS", &raw)?);
    }
    if let Some(raw) = env("DISPATCH_RETENTION_SECS") {
        section.retention_secs = Some(parse("DISPATCH_RETENTION_SECS", &raw)?);
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
