/*!
 * Configuration support for the billing library
 *
 * Settings are layered: built-in defaults, then an optional TOML file, then
 * `MEDBILL_*` environment variables.
 */

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_BATCH_SIZE, DEFAULT_PAGE_SIZE};
use crate::{BillingError, Result};

/// Environment variable prefix, e.g. `MEDBILL_BATCH_SIZE`
pub const ENV_PREFIX: &str = "MEDBILL";

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Billing records per insert transaction
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Whether to show progress bars during ingestion
    #[serde(default = "default_enable_progress_bar")]
    pub enable_progress_bar: bool,

    /// Ingestion time limit in seconds; `None` or 0 disables it
    #[serde(default = "default_ingest_timeout_secs")]
    pub ingest_timeout_secs: Option<u64>,

    /// Page size used when a search does not ask for one
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            batch_size: default_batch_size(),
            enable_progress_bar: default_enable_progress_bar(),
            ingest_timeout_secs: default_ingest_timeout_secs(),
            default_page_size: default_page_size(),
        }
    }
}

// Default value functions for serde
fn default_database_path() -> PathBuf {
    PathBuf::from("billing.db")
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_enable_progress_bar() -> bool {
    true
}

fn default_ingest_timeout_secs() -> Option<u64> {
    Some(2 * 60 * 60)
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl BillingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingestion time limit, if any
    pub fn ingest_timeout(&self) -> Option<Duration> {
        self.ingest_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Load from the default config file (if present) and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_config_path().as_deref())
    }

    /// Load from an optional TOML file and the environment.
    ///
    /// Priority order, highest first:
    /// 1. `MEDBILL_*` environment variables
    /// 2. The config file (skipped when absent)
    /// 3. Built-in defaults
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let defaults = Self::default();

        let mut builder = config::Config::builder()
            .set_default("database_path", defaults.database_path.to_string_lossy().into_owned())?
            .set_default("batch_size", defaults.batch_size as i64)?
            .set_default("enable_progress_bar", defaults.enable_progress_bar)?
            .set_default("default_page_size", i64::from(defaults.default_page_size))?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&contents).map_err(|e| BillingError::Configuration {
            message: format!("Failed to parse config file: {}", e),
            suggestion: Some("Check that the file is valid TOML format".to_string()),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).map_err(|e| BillingError::Configuration {
            message: format!("Failed to serialize config: {}", e),
            suggestion: None,
        })?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/medbill/config.toml` on Linux
    /// or `%APPDATA%\medbill\config\config.toml` on Windows
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "medbill")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(BillingError::Configuration {
                message: "batch_size must be greater than zero".to_string(),
                suggestion: Some(format!("Use the default of {}", DEFAULT_BATCH_SIZE)),
            });
        }
        if self.default_page_size == 0 {
            return Err(BillingError::Configuration {
                message: "default_page_size must be greater than zero".to_string(),
                suggestion: None,
            });
        }
        Ok(())
    }

    /// Large batches, no progress bar, no time limit
    pub fn performance() -> Self {
        Self {
            batch_size: 50_000,
            enable_progress_bar: false,
            ingest_timeout_secs: None,
            ..Self::default()
        }
    }

    /// Small batches, so a failure loses less uncommitted work
    pub fn safe() -> Self {
        Self {
            batch_size: 1_000,
            enable_progress_bar: true,
            ..Self::default()
        }
    }
}

/// Builder for customizing configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: BillingConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.database_path = path.as_ref().to_path_buf();
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn progress_bar(mut self, enabled: bool) -> Self {
        self.config.enable_progress_bar = enabled;
        self
    }

    /// Time limit for ingestion, rounded up to whole seconds
    pub fn ingest_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.ingest_timeout_secs =
            timeout.map(|t| t.as_secs() + u64::from(t.subsec_nanos() > 0));
        self
    }

    pub fn default_page_size(mut self, size: u32) -> Self {
        self.config.default_page_size = size;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<BillingConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
