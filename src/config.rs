/*!
 * Configuration types for Capsule
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CapsuleError, Result};

/// Default archive bound in GiB
pub const DEFAULT_MAX_ZIP_GIB: f64 = 3.5;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Immutable settings for one pack-and-deliver run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackConfig {
    /// Maximum cumulative uncompressed size per archive, in bytes
    #[serde(default = "default_bound_bytes")]
    pub bound_bytes: u64,

    /// Glob patterns matched against bare file names
    #[serde(default)]
    pub exclusion_patterns: Vec<String>,

    /// Remove member files and the archive once the upload is confirmed
    #[serde(default)]
    pub delete_after_send: bool,

    /// Where archives are staged before upload (None = system temp dir)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,

    /// Deflate level (None = zip default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_level: Option<i64>,

    /// Copy buffer size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            bound_bytes: default_bound_bytes(),
            exclusion_patterns: Vec::new(),
            delete_after_send: false,
            staging_dir: None,
            compression_level: None,
            chunk_size: default_chunk_size(),
        }
    }
}

impl PackConfig {
    /// Create a config with the given bound and defaults for everything else
    pub fn with_bound(bound_bytes: u64) -> Self {
        Self {
            bound_bytes,
            ..Default::default()
        }
    }

    /// Replace the exclusion set, dropping duplicates but keeping first-seen order
    pub fn with_exclusions<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = Vec::new();
        for pattern in patterns {
            let pattern = pattern.into();
            if !seen.contains(&pattern) {
                seen.push(pattern);
            }
        }
        self.exclusion_patterns = seen;
        self
    }

    pub fn with_delete_after_send(mut self, delete: bool) -> Self {
        self.delete_after_send = delete;
        self
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    /// Resolve the staging directory
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("capsule"))
    }

    /// Reject settings the planner cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.bound_bytes == 0 {
            return Err(CapsuleError::Config(
                "Archive bound must be greater than zero".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(CapsuleError::Config(
                "Chunk size must be greater than zero".to_string(),
            ));
        }
        if let Some(level) = self.compression_level {
            if !(0..=9).contains(&level) {
                return Err(CapsuleError::Config(format!(
                    "Compression level {} out of range 0-9",
                    level
                )));
            }
        }
        Ok(())
    }
}

/// Convert a size in GiB (1024^3 bytes) into a byte bound
pub fn gib_to_bytes(gib: f64) -> Result<u64> {
    if !gib.is_finite() || gib <= 0.0 {
        return Err(CapsuleError::Config(format!(
            "Maximum zip size must be a positive number of GiB, got {}",
            gib
        )));
    }
    let bytes = gib * GIB;
    if bytes >= u64::MAX as f64 {
        return Err(CapsuleError::Config(format!(
            "Maximum zip size {} GiB is too large",
            gib
        )));
    }
    Ok(bytes as u64)
}

/// Whole-program configuration: core pack settings plus logging and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapsuleConfig {
    #[serde(flatten)]
    pub pack: PackConfig,

    /// Log level for diagnostic output
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stderr)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for log_level = debug)
    #[serde(default)]
    pub verbose: bool,

    /// Show upload progress bars
    #[serde(default = "default_true")]
    pub show_progress: bool,

    /// OAuth client secrets file
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,

    /// Cached access/refresh token
    #[serde(default = "default_token_cache_path")]
    pub token_cache_path: PathBuf,
}

impl Default for CapsuleConfig {
    fn default() -> Self {
        Self {
            pack: PackConfig::default(),
            log_level: LogLevel::default(),
            log_file: None,
            verbose: false,
            show_progress: true,
            credentials_path: default_credentials_path(),
            token_cache_path: default_token_cache_path(),
        }
    }
}

impl CapsuleConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CapsuleError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&contents).map_err(|e| {
            CapsuleError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| CapsuleError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_bound_bytes() -> u64 {
    (DEFAULT_MAX_ZIP_GIB * GIB) as u64
}

fn default_chunk_size() -> usize {
    1024 * 1024 // 1 MB
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_token_cache_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("capsule"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("token.json")
}
