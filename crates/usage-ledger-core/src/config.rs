//! Configuration management for usage-ledger
//!
//! Handles loading and validation of `usage-ledger.toml` files. Every field
//! has a default, so an empty file (or no file) is a valid configuration.

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::ledger::LedgerKind;
use crate::logging::LogConfig;
use crate::retention::RetentionPolicy;
use crate::schema::{initialize_schema, open_connection};
use crate::snapshot_engine::GenerationSettings;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub logging: LogConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub snapshots: SnapshotsConfig,

    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// How long a writer waits on a locked database
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("usage-ledger.db")
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StorageConfig {
    /// Open the configured database and make sure the schema exists.
    pub fn open(&self) -> Result<Connection> {
        let conn = open_connection(&self.db_path, self.busy_timeout_ms)?;
        initialize_schema(&conn)?;
        Ok(conn)
    }
}

/// Snapshot generation and snapshot cleanup settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotsConfig {
    /// Items per chunk
    #[serde(default = "default_chunk_limit")]
    pub chunk_limit: usize,

    /// Active-resource rows per page
    #[serde(default = "default_fetch_batch_size")]
    pub fetch_batch_size: usize,

    /// Pending chunks per bulk insert
    #[serde(default = "default_insert_batch_size")]
    pub insert_batch_size: usize,

    /// Completed snapshots older than this are deleted by cleanup
    #[serde(default = "default_snapshot_retention_days")]
    pub retention_days: u32,

    /// Placeholders older than this are treated as abandoned
    #[serde(default = "default_stale_after_minutes")]
    pub stale_after_minutes: u32,
}

fn default_chunk_limit() -> usize {
    50
}

fn default_fetch_batch_size() -> usize {
    1000
}

fn default_insert_batch_size() -> usize {
    1000
}

fn default_snapshot_retention_days() -> u32 {
    31
}

fn default_stale_after_minutes() -> u32 {
    60
}

impl Default for SnapshotsConfig {
    fn default() -> Self {
        Self {
            chunk_limit: default_chunk_limit(),
            fetch_batch_size: default_fetch_batch_size(),
            insert_batch_size: default_insert_batch_size(),
            retention_days: default_snapshot_retention_days(),
            stale_after_minutes: default_stale_after_minutes(),
        }
    }
}

impl SnapshotsConfig {
    #[must_use]
    pub fn generation_settings(&self) -> GenerationSettings {
        GenerationSettings {
            chunk_limit: self.chunk_limit,
            fetch_batch_size: self.fetch_batch_size,
            insert_batch_size: self.insert_batch_size,
        }
    }
}

/// Per-ledger retention policies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetentionConfig {
    #[serde(default)]
    pub process_usage: RetentionPolicy,

    #[serde(default)]
    pub service_usage: RetentionPolicy,
}

impl RetentionConfig {
    #[must_use]
    pub fn policy_for(&self, kind: LedgerKind) -> &RetentionPolicy {
        match kind {
            LedgerKind::Process => &self.process_usage,
            LedgerKind::Service => &self.service_usage,
        }
    }
}

impl Config {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config = Self::from_toml(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseFailed(e.to_string()).into())
    }

    /// Reject zero limits and batch sizes.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.snapshots.chunk_limit == 0 {
            problems.push("snapshots.chunk_limit must be greater than 0".to_string());
        }
        if self.snapshots.fetch_batch_size == 0 {
            problems.push("snapshots.fetch_batch_size must be greater than 0".to_string());
        }
        if self.snapshots.insert_batch_size == 0 {
            problems.push("snapshots.insert_batch_size must be greater than 0".to_string());
        }
        for kind in LedgerKind::ALL {
            let policy = self.retention.policy_for(kind);
            if policy.batch_size == 0 {
                problems.push(format!("retention.{}.batch_size must be greater than 0", kind.model().metric_prefix()));
            }
        }
        if self.logging.level.parse::<crate::logging::LogLevel>().is_err() {
            problems.push(format!("logging.level {:?} is not a log level", self.logging.level));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError(problems.join("; ")).into())
        }
    }
}
