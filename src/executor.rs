//! Raw SQL execution seam and the crate-wide database error.
//!
//! Migration scripts are opaque SQL text. All the runner needs from a backend
//! is "execute this batch inside the current transaction", which is what
//! [`SqlExecutor`] provides. Typed reads and writes of the bookkeeping tables
//! go through the store traits in [`crate::migration`].

use crate::connection::ConnectionError;
use crate::transaction::Executor;
use may_postgres::error::SqlState;
use may_postgres::Error as PostgresError;

/// Database error shared by every backend.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    /// `PostgreSQL` error from `may_postgres`
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] PostgresError),
    /// Connection could not be established
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// Statement or batch execution failed
    #[error("Query error: {0}")]
    Query(String),
    /// Row parsing/conversion error
    #[error("Parse error: {0}")]
    Parse(String),
    /// A write targeted a row that does not exist
    #[error("Row not found: {0}")]
    NotFound(String),
    /// A concurrent transaction won a serializable conflict
    #[error("Serialization failure: {0}")]
    SerializationFailure(String),
}

impl GuardError {
    /// True when the database aborted the statement because a concurrent
    /// serializable transaction touched the same rows first.
    ///
    /// PostgreSQL reports this as SQLSTATE `40001`; deadlock victims
    /// (`40P01`) are classified the same way.
    pub fn is_serialization_failure(&self) -> bool {
        match self {
            GuardError::SerializationFailure(_) => true,
            GuardError::Postgres(e) => matches!(
                e.code(),
                Some(code) if *code == SqlState::T_R_SERIALIZATION_FAILURE
                    || *code == SqlState::T_R_DEADLOCK_DETECTED
            ),
            _ => false,
        }
    }

    /// True when a `CREATE ... IF NOT EXISTS` raced another session creating
    /// the same object.
    pub fn is_duplicate_object(&self) -> bool {
        match self {
            GuardError::Postgres(e) => matches!(
                e.code(),
                Some(code) if *code == SqlState::UNIQUE_VIOLATION
                    || *code == SqlState::DUPLICATE_TABLE
                    || *code == SqlState::DUPLICATE_OBJECT
            ),
            _ => false,
        }
    }
}

/// Executes raw SQL inside whatever transaction the implementor wraps.
///
/// Implementations must not commit on their own: a batch becomes durable only
/// when the owning [`crate::transaction::Transaction`] commits.
pub trait SqlExecutor {
    /// Execute `sql` as one batch. The text may hold several statements.
    ///
    /// # Errors
    ///
    /// Returns `GuardError` if any statement in the batch fails.
    fn execute_batch(&mut self, sql: &str) -> Result<(), GuardError>;
}

impl<N: SqlExecutor> SqlExecutor for Executor<'_, N> {
    fn execute_batch(&mut self, sql: &str) -> Result<(), GuardError> {
        self.native().execute_batch(sql)
    }
}
