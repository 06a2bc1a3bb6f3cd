//! Error types for usage-ledger-core

use std::fmt;
use thiserror::Error;

/// What an operator can do about an error, printed under it by the CLI.
#[derive(Debug, Clone)]
pub struct Remediation {
    pub summary: String,
    /// `(label, command)` pairs.
    pub commands: Vec<(String, String)>,
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push((label.into(), command.into()));
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }
}

impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "To fix:\n  {}", self.summary)?;
        if !self.commands.is_empty() {
            writeln!(f, "  Commands:")?;
            for (label, command) in &self.commands {
                writeln!(f, "    - {label}: {command}")?;
            }
        }
        if !self.alternatives.is_empty() {
            writeln!(f, "  Alternatives:")?;
            for alt in &self.alternatives {
                writeln!(f, "    - {alt}")?;
            }
        }
        Ok(())
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for usage-ledger-core
#[derive(Error, Debug)]
pub enum Error {
    /// Storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Consumer registry errors
    #[error("Consumer error: {0}")]
    Consumer(#[from] ConsumerError),

    /// Snapshot lifecycle errors
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Retention run errors
    #[error("Retention error: {0}")]
    Retention(#[from] RetentionError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (blocking task join failures)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StorageError::Database(err))
    }
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Storage(err) => Some(err.remediation()),
            Self::Consumer(err) => Some(err.remediation()),
            Self::Snapshot(err) => Some(err.remediation()),
            Self::Retention(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the database directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .alternative("Check for trailing commas or invalid UTF-8."),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("A background task failed to complete. Retry the command.")
                    .alternative("If the issue persists, run with RUST_LOG=debug and inspect the logs."),
            ),
        }
    }

    /// Whether this error is a validation failure that must not be retried.
    #[must_use]
    pub fn is_validation_failure(&self) -> bool {
        matches!(self, Self::Consumer(ConsumerError::ValidationFailure { .. }))
    }
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database schema version ({current}) is newer than supported ({supported})")]
    SchemaTooNew { current: i32, supported: i32 },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Database(_) => Remediation::new(
                "Database operation failed. Check the database path and permissions, then retry.",
            )
            .command("Initialize schema", "usage-ledger init")
            .alternative("Ensure no other process holds a long write lock on the database."),
            Self::SchemaTooNew { current, supported } => Remediation::new(format!(
                "Database schema version {current} is newer than supported ({supported}). Upgrade usage-ledger."
            ))
            .alternative("Point --db at a database created by this version."),
            Self::NotFound(_) => Remediation::new("The requested row was not found.")
                .command("Tail events", "usage-ledger events tail process")
                .alternative("Verify the guid exists before referencing it."),
        }
    }
}

/// Consumer registry errors
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Validation failed for {field}: {message}")]
    ValidationFailure { field: &'static str, message: String },

    #[error("Consumer not found: {0}")]
    NotFound(String),
}

impl ConsumerError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::ValidationFailure { field, .. } => Remediation::new(format!(
                "Fix the {field} value and register again."
            ))
            .command("List consumers", "usage-ledger consumer list process")
            .alternative("Consumer guids must be unique, non-empty, and at most 255 characters."),
            Self::NotFound(guid) => Remediation::new(format!(
                "Consumer {guid} is not registered. It may have been removed by size-exceeded cleanup."
            ))
            .command(
                "Re-register",
                format!("usage-ledger consumer register process {guid} <last-processed-guid>"),
            ),
        }
    }
}

/// Snapshot lifecycle errors
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("A {kind} usage snapshot is already being generated")]
    GenerationInProgress { kind: String },

    #[error("Snapshot {0} has already completed")]
    AlreadyComplete(String),

    #[error("Snapshot {0} is still processing")]
    StillProcessing(String),

    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("Generation of snapshot {snapshot_guid} failed: {source}")]
    Generation {
        snapshot_guid: String,
        #[source]
        source: Box<Error>,
    },
}

impl SnapshotError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::GenerationInProgress { kind } => Remediation::new(
                "Wait for the in-progress snapshot to finish, then request a new one.",
            )
            .command("List snapshots", format!("usage-ledger snapshot list --kind {kind}"))
            .alternative("Stale in-progress snapshots are removed by snapshot cleanup after an hour."),
            Self::AlreadyComplete(guid) => Remediation::new(format!(
                "Snapshot {guid} is complete. Request a new snapshot for fresh data."
            )),
            Self::StillProcessing(guid) => Remediation::new(format!(
                "Snapshot {guid} has not finished generating. Retry once it completes."
            ))
            .command("Show snapshot", format!("usage-ledger snapshot show {guid}")),
            Self::NotFound(_) => Remediation::new("The snapshot does not exist or was cleaned up.")
                .command("List snapshots", "usage-ledger snapshot list --kind process"),
            Self::Generation { .. } => Remediation::new(
                "Generation rolled back with no partial chunks. Request a new snapshot to retry.",
            )
            .command("Create snapshot", "usage-ledger snapshot create process")
            .alternative("Run with RUST_LOG=debug to see the failing query."),
        }
    }
}

/// Retention run errors
#[derive(Error, Debug)]
pub enum RetentionError {
    #[error("Failed to estimate row count for {table}: {reason}")]
    Estimation { table: String, reason: String },

    #[error("Failed to delete rows from {table}: {reason}")]
    Deletion { table: String, reason: String },
}

impl RetentionError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Estimation { table, .. } => Remediation::new(format!(
                "Could not size {table}. The run was aborted before deleting anything."
            ))
            .command("Refresh statistics", "sqlite3 <db> 'ANALYZE'")
            .alternative("Retry the run; no rows were removed."),
            Self::Deletion { table, .. } => Remediation::new(format!(
                "Deleting from {table} failed mid-run. Completed batches stay deleted."
            ))
            .command("Retry", "usage-ledger retention run process")
            .alternative("Cleanup is idempotent; the next run continues where this one stopped."),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the TOML syntax and retry.")
                .alternative("Remove unknown keys; every field has a default."),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .alternative("Limits and batch sizes must be greater than zero.")
            }
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    match error.remediation() {
        Some(remediation) => format!("Error: {error}\n\n{remediation}"),
        None => format!("Error: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remediation_available_for_error_variants() {
        let json_err = serde_json::from_str::<serde_json::Value>("").unwrap_err();
        let errors = vec![
            Error::Storage(StorageError::Database(rusqlite::Error::QueryReturnedNoRows)),
            Error::Storage(StorageError::SchemaTooNew {
                current: 9,
                supported: 1,
            }),
            Error::Storage(StorageError::NotFound("evt".to_string())),
            Error::Consumer(ConsumerError::ValidationFailure {
                field: "consumer_guid",
                message: "must be present".to_string(),
            }),
            Error::Consumer(ConsumerError::NotFound("c1".to_string())),
            Error::Snapshot(SnapshotError::GenerationInProgress {
                kind: "process".to_string(),
            }),
            Error::Snapshot(SnapshotError::StillProcessing("s1".to_string())),
            Error::Retention(RetentionError::Deletion {
                table: "process_usage_events".to_string(),
                reason: "locked".to_string(),
            }),
            Error::Config(ConfigError::ValidationError("bad".to_string())),
            Error::Io(std::io::Error::other("disk")),
            Error::Json(json_err),
            Error::Runtime("join".to_string()),
        ];

        for err in errors {
            let remediation = err.remediation().expect("remediation present");
            assert!(!remediation.summary.is_empty(), "{err}");
        }
    }

    #[test]
    fn rusqlite_errors_convert_to_storage() {
        let err: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, Error::Storage(StorageError::Database(_))));
    }

    #[test]
    fn validation_failure_detected() {
        let err = Error::Consumer(ConsumerError::ValidationFailure {
            field: "consumer_guid",
            message: "is taken".to_string(),
        });
        assert!(err.is_validation_failure());
        assert!(!Error::Runtime("x".to_string()).is_validation_failure());
    }

    #[test]
    fn generation_error_keeps_source() {
        let inner = Error::Storage(StorageError::NotFound("x".to_string()));
        let err = SnapshotError::Generation {
            snapshot_guid: "snap".to_string(),
            source: Box::new(inner),
        };
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("Not found"));
    }

    #[test]
    fn display_lists_commands_and_alternatives() {
        let text = Remediation::new("Do the thing")
            .command("Status", "usage-ledger snapshot list --kind process")
            .alternative("Or wait")
            .to_string();
        assert!(text.contains("To fix:"));
        assert!(text.contains("Status: usage-ledger snapshot list --kind process"));
        assert!(text.contains("- Or wait"));
    }

    #[test]
    fn format_error_includes_remediation() {
        let err = Error::Config(ConfigError::FileNotFound("/tmp/x.toml".to_string()));
        let text = format_error_with_remediation(&err);
        assert!(text.starts_with("Error: Config error"));
        assert!(text.contains("--config"));
    }
}
