//! Configuration module for Mizuchi Media
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with a letter or underscore and contain only
/// uppercase letters, digits, and underscores.
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("BUCKET_NAME", "media");
/// let result = expand_env_vars("bucket: ${BUCKET_NAME}");
/// assert_eq!(result, "bucket: media");
///
/// let result = expand_env_vars("${REGION:-us-east-1}");
/// assert_eq!(result, "us-east-1");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    let re = match regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return s.to_string(),
    };
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name.as_str()) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);

    result
}

/// Longest lifetime a SigV4 presigned URL may carry (7 days)
const MAX_LINK_TTL_SECS: u64 = 604_800;

/// Upper bound for how long finished sessions are retained (7 days)
pub const MAX_SESSION_RETENTION_SECS: u64 = 604_800;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub links: LinkConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub keys: KeyConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Configuration with the given bucket and region and defaults elsewhere
    pub fn for_bucket(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig {
                bucket: bucket.into(),
                region: region.into(),
                endpoint: None,
                access_key: None,
                secret_key: None,
                retry: RetryConfig::default(),
            },
            links: LinkConfig::default(),
            upload: UploadConfig::default(),
            keys: KeyConfig::default(),
            watch: WatchConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.bucket.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.bucket must be set".into(),
            ));
        }

        if self.storage.region.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.region must be set".into(),
            ));
        }

        if self.storage.access_key.is_some() != self.storage.secret_key.is_some() {
            return Err(ConfigError::ValidationError(
                "storage.access_key and storage.secret_key must be set together".into(),
            ));
        }

        if self.storage.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid backoff multiplier {}: must be at least 1.0",
                self.storage.retry.backoff_multiplier
            )));
        }

        for (name, ttl) in [
            ("put_ttl_secs", self.links.put_ttl_secs),
            ("part_ttl_secs", self.links.part_ttl_secs),
            ("get_ttl_secs", self.links.get_ttl_secs),
        ] {
            if ttl == 0 || ttl > MAX_LINK_TTL_SECS {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid links.{} {}: must be between 1 and {}",
                    name, ttl, MAX_LINK_TTL_SECS
                )));
            }
        }

        if self.upload.min_part_size == 0 || self.upload.part_size == 0 {
            return Err(ConfigError::ValidationError(
                "upload part sizes must be greater than zero".into(),
            ));
        }

        if self.upload.concurrent_parts == 0 {
            return Err(ConfigError::ValidationError(
                "upload.concurrent_parts must be at least 1".into(),
            ));
        }

        if self.upload.max_part_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "upload.max_part_attempts must be at least 1".into(),
            ));
        }

        if self.upload.session_retention_secs > MAX_SESSION_RETENTION_SECS {
            return Err(ConfigError::ValidationError(format!(
                "Invalid upload.session_retention_secs {}: must be at most {}",
                self.upload.session_retention_secs, MAX_SESSION_RETENTION_SECS
            )));
        }

        if self.keys.queue_prefix == self.keys.processed_prefix {
            return Err(ConfigError::ValidationError(format!(
                "keys.queue_prefix and keys.processed_prefix must differ (both '{}')",
                self.keys.queue_prefix
            )));
        }

        if self.watch.poll_interval_ms == 0 || self.watch.poll_interval_ms >= self.watch.timeout_ms
        {
            return Err(ConfigError::ValidationError(format!(
                "Invalid watch timing: poll_interval_ms ({}) must be non-zero and below timeout_ms ({})",
                self.watch.poll_interval_ms, self.watch.timeout_ms
            )));
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_address")]
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
        }
    }
}

fn default_server_address() -> String {
    "0.0.0.0:8080".to_string()
}

/// Object storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Retry behaviour for idempotent storage operations and part transfers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Presigned link lifetimes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default = "default_put_ttl")]
    pub put_ttl_secs: u64,
    #[serde(default = "default_long_ttl")]
    pub part_ttl_secs: u64,
    #[serde(default = "default_long_ttl")]
    pub get_ttl_secs: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            put_ttl_secs: default_put_ttl(),
            part_ttl_secs: default_long_ttl(),
            get_ttl_secs: default_long_ttl(),
        }
    }
}

fn default_put_ttl() -> u64 {
    60
}

fn default_long_ttl() -> u64 {
    3600
}

/// Upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_min_part_size")]
    pub min_part_size: u64,
    #[serde(default = "default_part_size")]
    pub part_size: u64,
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: u64,
    #[serde(default = "default_concurrent_parts")]
    pub concurrent_parts: usize,
    #[serde(default = "default_max_part_attempts")]
    pub max_part_attempts: u32,
    #[serde(default = "default_allowed_content_types")]
    pub allowed_content_types: Vec<String>,
    /// How long finished sessions stay queryable before eviction
    #[serde(default = "default_session_retention")]
    pub session_retention_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            min_part_size: default_min_part_size(),
            part_size: default_part_size(),
            multipart_threshold: default_multipart_threshold(),
            concurrent_parts: default_concurrent_parts(),
            max_part_attempts: default_max_part_attempts(),
            allowed_content_types: default_allowed_content_types(),
            session_retention_secs: default_session_retention(),
        }
    }
}

fn default_min_part_size() -> u64 {
    5 * 1024 * 1024 // 5MiB
}

fn default_part_size() -> u64 {
    8 * 1024 * 1024 // 8MiB
}

fn default_multipart_threshold() -> u64 {
    52428800 // 50MB
}

fn default_concurrent_parts() -> usize {
    4
}

fn default_max_part_attempts() -> u32 {
    3
}

fn default_allowed_content_types() -> Vec<String> {
    vec!["video/".to_string()]
}

fn default_session_retention() -> u64 {
    600
}

/// Object key layout shared by the uploader and the processing pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,
    #[serde(default = "default_processed_prefix")]
    pub processed_prefix: String,
    #[serde(default = "default_extension")]
    pub default_extension: String,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            queue_prefix: default_queue_prefix(),
            processed_prefix: default_processed_prefix(),
            default_extension: default_extension(),
        }
    }
}

fn default_queue_prefix() -> String {
    "queue/".to_string()
}

fn default_processed_prefix() -> String {
    "processed/".to_string()
}

fn default_extension() -> String {
    "mp4".to_string()
}

/// Completion watch defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_watch_timeout_ms")]
    pub timeout_ms: u64,
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            timeout_ms: default_watch_timeout_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_watch_timeout_ms() -> u64 {
    600_000 // 10 minutes
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}
