//! Migration status tracking

use crate::migration::{AppliedMigration, MigrationError, MigrationScript};
use std::collections::HashSet;

/// Ledger rows diffed against the scripts on disk
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Applied migrations (from the ledger, in application order)
    pub applied: Vec<AppliedMigration>,

    /// Scripts on disk with no ledger row, in file name order
    pub pending: Vec<MigrationScript>,

    pub applied_count: usize,
    pub pending_count: usize,
}

impl MigrationStatus {
    /// Diff one ledger snapshot against the discovered scripts.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Integrity` listing every ledger row whose
    /// script is no longer on disk.
    pub fn new(
        applied: Vec<AppliedMigration>,
        scripts: Vec<MigrationScript>,
    ) -> Result<Self, MigrationError> {
        let on_disk: HashSet<&str> = scripts.iter().map(|s| s.name.as_str()).collect();
        let missing: Vec<String> = applied
            .iter()
            .filter(|row| !on_disk.contains(row.script_name.as_str()))
            .map(|row| row.script_name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(MigrationError::Integrity { scripts: missing });
        }

        let recorded: HashSet<&str> = applied.iter().map(|row| row.script_name.as_str()).collect();
        let pending: Vec<MigrationScript> = scripts
            .iter()
            .filter(|s| !recorded.contains(s.name.as_str()))
            .cloned()
            .collect();

        Ok(Self {
            applied_count: applied.len(),
            pending_count: pending.len(),
            applied,
            pending,
        })
    }

    /// True if the snapshot has a ledger row for `script_name`.
    #[must_use]
    pub fn already_applied(&self, script_name: &str) -> bool {
        self.applied.iter().any(|row| row.script_name == script_name)
    }

    /// Check if all migrations are applied
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending_count == 0
    }

    #[must_use]
    pub fn next_pending(&self) -> Option<&MigrationScript> {
        self.pending.first()
    }

    #[must_use]
    pub fn last_applied(&self) -> Option<&AppliedMigration> {
        self.applied.last()
    }
}
