//! Bootstrap configuration
//!
//! Settings sources, highest priority first:
//! 1. Command-line arguments (applied by the service binary)
//! 2. Environment variables (`PURITY_*`, `GOOGLE_VISION_API_KEY`, `STRIPE_KEY`)
//! 3. TOML configuration file
//! 4. Built-in defaults (code constants)
//!
//! A missing TOML file is not an error: the service starts on defaults and
//! logs a warning. A TOML file that exists but does not parse is fatal.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 8080;

/// Default trial quota (billed images per trial license)
pub const DEFAULT_TRIAL_MAX_USAGE: u64 = 100;

/// Default page size used when forwarding batches to the classifier
pub const DEFAULT_MAX_IMAGES_PER_REQUEST: usize = 16;

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TomlConfig {
    /// Path to SQLite database file. Defaults to the platform data dir.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub filter: FilterConfig,

    #[serde(default)]
    pub vision: VisionConfig,

    #[serde(default)]
    pub billing: BillingConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Classification pipeline limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilterConfig {
    /// Billed images allowed on a trial license
    #[serde(default = "default_trial_max_usage")]
    pub trial_max_usage: u64,

    /// Page size for forwarding batches to the classifier
    #[serde(default = "default_max_images_per_request")]
    pub max_images_per_request: usize,

    /// Deadline for a single provider call
    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,

    /// Total time budget for retrying a locked database write
    #[serde(default = "default_db_lock_wait_ms")]
    pub db_lock_wait_ms: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            trial_max_usage: default_trial_max_usage(),
            max_images_per_request: default_max_images_per_request(),
            provider_timeout_ms: default_provider_timeout_ms(),
            db_lock_wait_ms: default_db_lock_wait_ms(),
        }
    }
}

/// Google Cloud Vision settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VisionConfig {
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_vision_endpoint")]
    pub endpoint: String,

    /// Outbound batch calls allowed per second
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: default_vision_endpoint(),
            requests_per_second: default_requests_per_second(),
        }
    }
}

/// Stripe metered billing settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BillingConfig {
    /// Secret key. Usage metering is disabled when absent.
    #[serde(default)]
    pub stripe_key: Option<String>,

    #[serde(default = "default_stripe_api_base")]
    pub api_base: String,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            stripe_key: None,
            api_base: default_stripe_api_base(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_trial_max_usage() -> u64 {
    DEFAULT_TRIAL_MAX_USAGE
}

fn default_max_images_per_request() -> usize {
    DEFAULT_MAX_IMAGES_PER_REQUEST
}

fn default_provider_timeout_ms() -> u64 {
    30_000
}

fn default_db_lock_wait_ms() -> u64 {
    5_000
}

fn default_vision_endpoint() -> String {
    "https://vision.googleapis.com/v1/images:annotate".to_string()
}

fn default_requests_per_second() -> u32 {
    10
}

fn default_stripe_api_base() -> String {
    "https://api.stripe.com/v1".to_string()
}

impl TomlConfig {
    /// Parse a TOML file. Missing or malformed files are errors.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Load `path` (or the platform default path) if it exists, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let candidate = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path(),
        };

        match candidate {
            Some(p) if p.exists() => {
                info!("Loading configuration from {}", p.display());
                Self::load(&p)
            }
            Some(p) => {
                warn!("Config file {} not found, using defaults", p.display());
                Ok(Self::default())
            }
            None => {
                warn!("Could not determine config directory, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Overlay environment variables on top of file values
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_value("PURITY_DB_PATH") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(host) = env_value("PURITY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_value("PURITY_PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| Error::Config(format!("Invalid PURITY_PORT '{}': {}", port, e)))?;
        }
        if let Some(level) = env_value("PURITY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(max) = env_value("PURITY_TRIAL_MAX_USAGE") {
            self.filter.trial_max_usage = max.parse().map_err(|e| {
                Error::Config(format!("Invalid PURITY_TRIAL_MAX_USAGE '{}': {}", max, e))
            })?;
        }
        if let Some(key) = env_value("GOOGLE_VISION_API_KEY") {
            self.vision.api_key = Some(key);
        }
        if let Some(key) = env_value("STRIPE_KEY") {
            self.billing.stripe_key = Some(key);
        }
        Ok(())
    }

    /// Reject values the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.filter.max_images_per_request == 0 {
            return Err(Error::Config(
                "filter.max_images_per_request must be greater than 0".to_string(),
            ));
        }
        if self.filter.provider_timeout_ms == 0 {
            return Err(Error::Config(
                "filter.provider_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.vision.requests_per_second == 0 {
            return Err(Error::Config(
                "vision.requests_per_second must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Configured database path or the platform default
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(default_database_path)
    }
}

/// `~/.config/purity/config.toml` (platform equivalent elsewhere)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("purity").join("config.toml"))
}

/// OS-dependent default database location
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("purity").join("purity.db"))
        .unwrap_or_else(|| PathBuf::from("./purity_data/purity.db"))
}

/// Non-empty environment variable value
fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
