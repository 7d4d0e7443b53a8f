//! Append-only ledger of applied migration scripts

use crate::executor::GuardError;
use crate::transaction::Executor;
use chrono::{DateTime, Utc};

/// One `applied_migrations` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    /// Surrogate identity; insertion order is application order
    pub migration_id: i64,
    /// File name of the script, unique across the ledger
    pub script_name: String,
    /// Instance identifier that executed the script
    pub applied_by: String,
    pub applied_at: DateTime<Utc>,
}

/// Reads and appends ledger rows inside the implementor's transaction.
///
/// Rows are never updated or deleted.
pub trait MigrationLedger {
    /// All rows ordered by `migration_id`.
    fn applied_migrations(&mut self) -> Result<Vec<AppliedMigration>, GuardError>;

    /// True if `script_name` already has a row.
    fn is_recorded(&mut self, script_name: &str) -> Result<bool, GuardError>;

    /// Append a row and return it with its assigned `migration_id`.
    ///
    /// Fails if `script_name` is already recorded.
    fn record_applied(
        &mut self,
        script_name: &str,
        applied_by: &str,
        applied_at: DateTime<Utc>,
    ) -> Result<AppliedMigration, GuardError>;
}

impl<N: MigrationLedger> MigrationLedger for Executor<'_, N> {
    fn applied_migrations(&mut self) -> Result<Vec<AppliedMigration>, GuardError> {
        self.native().applied_migrations()
    }

    fn is_recorded(&mut self, script_name: &str) -> Result<bool, GuardError> {
        self.native().is_recorded(script_name)
    }

    fn record_applied(
        &mut self,
        script_name: &str,
        applied_by: &str,
        applied_at: DateTime<Utc>,
    ) -> Result<AppliedMigration, GuardError> {
        self.native().record_applied(script_name, applied_by, applied_at)
    }
}
