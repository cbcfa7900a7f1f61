//! Loader configuration.
//!
//! Every section and field has a default, so an empty TOML document is a
//! valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub decoder: DecoderConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub tail: TailConfig,

    #[serde(default)]
    pub parse: ParsePolicy,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Invalid {
                field: "cache.max_entries",
                reason: "must be at least 1".into(),
            });
        }
        if self.cache.max_bytes == Some(0) {
            return Err(ConfigError::Invalid {
                field: "cache.max_bytes",
                reason: "must be positive when set".into(),
            });
        }
        if self.pipeline.grace_period_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "pipeline.grace_period_ms",
                reason: "must be positive".into(),
            });
        }
        if self.pipeline.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "pipeline.channel_capacity",
                reason: "must be at least 1".into(),
            });
        }
        if self.decoder.detail_chunk == 0 {
            return Err(ConfigError::Invalid {
                field: "decoder.detail_chunk",
                reason: "must be at least 1".into(),
            });
        }
        if self.tail.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "tail.poll_interval_ms",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Where the external decoder binaries live and how they are invoked
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub tshark: PathBuf,
    pub dumpcap: PathBuf,
    pub capinfos: PathBuf,
    /// Appended to every tshark invocation
    pub extra_args: Vec<String>,
    /// Extra summary columns as (title, field) pairs
    pub custom_columns: Vec<CustomColumn>,
    /// Packets decoded per detail request
    pub detail_chunk: u64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            tshark: PathBuf::from("tshark"),
            dumpcap: PathBuf::from("dumpcap"),
            capinfos: PathBuf::from("capinfos"),
            extra_args: Vec::new(),
            custom_columns: Vec::new(),
            detail_chunk: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomColumn {
    pub title: String,
    pub field: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How long a cancelled pipeline gets to exit before it is force-killed
    pub grace_period_ms: u64,
    /// How much of each stage's stderr is kept for error reports
    pub stderr_tail_bytes: usize,
    /// Capacity of the per-generation record channel
    pub channel_capacity: usize,
}

impl PipelineConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 2000,
            stderr_tail_bytes: 4096,
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    /// Optional byte budget on top of the entry count
    pub max_bytes: Option<usize>,
    /// Persist the cache here between runs when set
    pub persist_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_bytes: None,
            persist_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TailConfig {
    /// Growth events closer together than this become one reload
    pub debounce_ms: u64,
    /// Poll period when file notifications are unavailable
    pub poll_interval_ms: u64,
    /// Skip file notifications and always poll
    pub force_poll: bool,
}

impl TailConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            poll_interval_ms: 1000,
            force_poll: false,
        }
    }
}

/// What the structural parser does with a record cut off by end of stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruncatedTail {
    Drop,
    Error,
}

/// What the structural parser does with a malformed record mid-stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Malformed {
    Warn,
    Ignore,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParsePolicy {
    pub truncated_tail: TruncatedTail,
    pub malformed: Malformed,
    pub max_consecutive_errors: usize,
}

impl Default for ParsePolicy {
    fn default() -> Self {
        Self {
            truncated_tail: TruncatedTail::Drop,
            malformed: Malformed::Warn,
            max_consecutive_errors: 16,
        }
    }
}
