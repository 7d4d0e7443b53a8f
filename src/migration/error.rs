//! Migration-specific error types

use crate::executor::GuardError;
use crate::transaction::TransactionError;
use std::path::PathBuf;

/// Migration-specific errors
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Database execution error
    #[error("Database error: {0}")]
    Database(#[from] GuardError),

    /// Transaction lifecycle error
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// Script directory or file could not be read
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Script file name is not valid UTF-8
    #[error("Invalid migration script name: {0}")]
    InvalidScriptName(String),

    /// The ledger records scripts that are no longer on disk
    #[error(
        "The following migrations have been applied to the database but are missing from disk: {}\n\
         Suggestion: Ensure all migration scripts are present in the migrations directory",
        .scripts.join(", ")
    )]
    Integrity { scripts: Vec<String> },

    /// A script failed; its transaction was rolled back
    #[error("Failed to apply migration script {script}: {source}")]
    ScriptExecution {
        script: String,
        #[source]
        source: Box<MigrationError>,
    },

    /// The lock slot could not be released and may still be marked held
    #[error(
        "Failed to release migration lock held by '{instance_id}': {source}\n\
         If the lock stays held, clear it manually: \
         UPDATE migration_lock SET is_locked = false, locked_by = NULL, lock_acquired_at = NULL WHERE lock_id = 1{}",
        prior_suffix(.prior)
    )]
    LockRelease {
        instance_id: String,
        #[source]
        source: Box<MigrationError>,
        /// Error raised by the protected work before the release was attempted
        prior: Option<Box<MigrationError>>,
    },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

fn prior_suffix(prior: &Option<Box<MigrationError>>) -> String {
    match prior {
        Some(prior) => format!("\nThe release followed an earlier failure: {prior}"),
        None => String::new(),
    }
}

impl MigrationError {
    /// True when the underlying database error is a serializable conflict.
    pub fn is_serialization_failure(&self) -> bool {
        match self {
            MigrationError::Database(e) => e.is_serialization_failure(),
            MigrationError::Transaction(TransactionError::Native { source, .. }) => {
                source.is_serialization_failure()
            }
            _ => false,
        }
    }

    /// Name of the script this error is about, if any.
    pub fn script(&self) -> Option<&str> {
        match self {
            MigrationError::ScriptExecution { script, .. } => Some(script),
            MigrationError::LockRelease { prior: Some(prior), .. } => prior.script(),
            _ => None,
        }
    }

    /// Attach the error the protected work raised before a failed release.
    pub(crate) fn with_prior(self, earlier: MigrationError) -> MigrationError {
        match self {
            MigrationError::LockRelease {
                instance_id,
                source,
                prior: None,
            } => MigrationError::LockRelease {
                instance_id,
                source,
                prior: Some(Box::new(earlier)),
            },
            other => other,
        }
    }
}
