//! In-process backend
//!
//! [`MemoryDatabase`] keeps the lock row, the ledger, executed script batches
//! and employee names in shared memory. It follows the same transaction rules
//! as the PostgreSQL backend:
//!
//! - writes are staged per transaction and become visible only on commit
//! - `lock_for_update` takes an exclusive row lock held until the transaction
//!   commits, rolls back or is dropped
//! - `migration_id` values come from a sequence that is not rolled back
//!
//! Fault injection hooks let tests fail script batches, lock writes and lock
//! reads.

use crate::employee::EmployeeStore;
use crate::executor::{GuardError, SqlExecutor};
use crate::migration::{AppliedMigration, LockStore, MigrationLedger, MigrationLock, SchemaBootstrap};
use crate::transaction::{IsolationLevel, NativeTransaction, TransactionService};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

#[derive(Default)]
struct State {
    lock_row: Option<MigrationLock>,
    ledger: Vec<AppliedMigration>,
    last_migration_id: i64,
    executed: Vec<String>,
    employees: BTreeMap<Uuid, String>,
    schema_created: bool,
    failing_markers: Vec<String>,
    /// Lock writes still allowed before they start failing; `None` = no limit
    lock_write_allowance: Option<usize>,
    pending_serialization_failures: usize,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    row_locked: Mutex<bool>,
    row_unlocked: Condvar,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_row(&self) {
        let mut held = self.row_locked.lock().unwrap_or_else(PoisonError::into_inner);
        while *held {
            held = self
                .row_unlocked
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *held = true;
    }

    fn unlock_row(&self) {
        let mut held = self.row_locked.lock().unwrap_or_else(PoisonError::into_inner);
        *held = false;
        self.row_unlocked.notify_one();
    }
}

/// Shared in-memory database; clones refer to the same data.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed lock row
    pub fn lock_row(&self) -> Option<MigrationLock> {
        self.shared.state().lock_row.clone()
    }

    /// Overwrite the committed lock row.
    pub fn set_lock_row(&self, lock: MigrationLock) {
        self.shared.state().lock_row = Some(lock);
    }

    /// Committed ledger rows in insertion order
    pub fn ledger(&self) -> Vec<AppliedMigration> {
        self.shared.state().ledger.clone()
    }

    /// Append a committed ledger row without running any script.
    pub fn seed_ledger_row(&self, script_name: &str, applied_by: &str) -> AppliedMigration {
        let mut state = self.shared.state();
        state.last_migration_id += 1;
        let row = AppliedMigration {
            migration_id: state.last_migration_id,
            script_name: script_name.to_string(),
            applied_by: applied_by.to_string(),
            applied_at: Utc::now(),
        };
        state.ledger.push(row.clone());
        row
    }

    /// Committed script batches in commit order
    pub fn executed_batches(&self) -> Vec<String> {
        self.shared.state().executed.clone()
    }

    pub fn schema_created(&self) -> bool {
        self.shared.state().schema_created
    }

    pub fn insert_employee(&self, employee_id: Uuid, name: &str) {
        self.shared.state().employees.insert(employee_id, name.to_string());
    }

    /// Committed name of an employee
    pub fn employee(&self, employee_id: Uuid) -> Option<String> {
        self.shared.state().employees.get(&employee_id).cloned()
    }

    /// Make every batch containing `marker` fail.
    pub fn fail_batches_containing(&self, marker: &str) {
        self.shared.state().failing_markers.push(marker.to_string());
    }

    /// Make every lock insert/update fail, or stop doing so.
    pub fn fail_lock_writes(&self, fail: bool) {
        self.shared.state().lock_write_allowance = fail.then_some(0);
    }

    /// Allow `allowed` more lock writes, then fail the rest.
    pub fn fail_lock_writes_after(&self, allowed: usize) {
        self.shared.state().lock_write_allowance = Some(allowed);
    }

    /// Make the next `count` lock reads fail with a serialization failure.
    pub fn inject_serialization_failures(&self, count: usize) {
        self.shared.state().pending_serialization_failures = count;
    }
}

impl TransactionService for MemoryDatabase {
    type Native = MemoryTransaction;

    fn begin_native(&self, isolation_level: IsolationLevel) -> Result<MemoryTransaction, GuardError> {
        Ok(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            isolation_level,
            staged: Staged::default(),
            holds_row_lock: false,
        })
    }
}

#[derive(Default)]
struct Staged {
    lock_row: Option<MigrationLock>,
    ledger: Vec<AppliedMigration>,
    executed: Vec<String>,
    employees: BTreeMap<Uuid, String>,
    schema_created: bool,
}

/// One open transaction against a [`MemoryDatabase`]
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    isolation_level: IsolationLevel,
    staged: Staged,
    holds_row_lock: bool,
}

impl MemoryTransaction {
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    fn release_row_lock(&mut self) {
        if self.holds_row_lock {
            self.holds_row_lock = false;
            self.shared.unlock_row();
        }
    }

    fn check_lock_write(&self) -> Result<(), GuardError> {
        let mut state = self.shared.state();
        match state.lock_write_allowance {
            Some(0) => Err(GuardError::Query(
                "could not write migration_lock: injected failure".to_string(),
            )),
            Some(ref mut remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl NativeTransaction for MemoryTransaction {
    fn commit(&mut self) -> Result<(), GuardError> {
        let staged = std::mem::take(&mut self.staged);
        let result = {
            let mut state = self.shared.state();
            let duplicate = staged
                .ledger
                .iter()
                .find(|row| {
                    state
                        .ledger
                        .iter()
                        .any(|existing| existing.script_name == row.script_name)
                })
                .map(|row| row.script_name.clone());
            if let Some(script_name) = duplicate {
                Err(GuardError::Query(format!(
                    "duplicate key value violates unique constraint on script_name: {script_name}"
                )))
            } else {
                if let Some(lock) = staged.lock_row {
                    state.lock_row = Some(lock);
                }
                state.ledger.extend(staged.ledger);
                state.executed.extend(staged.executed);
                state.employees.extend(staged.employees);
                state.schema_created |= staged.schema_created;
                Ok(())
            }
        };
        self.release_row_lock();
        result
    }

    fn rollback(&mut self) -> Result<(), GuardError> {
        self.staged = Staged::default();
        self.release_row_lock();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.release_row_lock();
    }
}

impl SqlExecutor for MemoryTransaction {
    fn execute_batch(&mut self, sql: &str) -> Result<(), GuardError> {
        let state = self.shared.state();
        if let Some(marker) = state.failing_markers.iter().find(|m| sql.contains(m.as_str())) {
            return Err(GuardError::Query(format!("batch rejected at \"{marker}\"")));
        }
        drop(state);
        self.staged.executed.push(sql.to_string());
        Ok(())
    }
}

impl LockStore for MemoryTransaction {
    fn lock_for_update(&mut self, lock_id: i32) -> Result<Option<MigrationLock>, GuardError> {
        if !self.holds_row_lock {
            self.shared.lock_row();
            self.holds_row_lock = true;
        }

        let mut state = self.shared.state();
        if state.pending_serialization_failures > 0 {
            state.pending_serialization_failures -= 1;
            return Err(GuardError::SerializationFailure(
                "could not serialize access due to concurrent update".to_string(),
            ));
        }

        let row = self.staged.lock_row.clone().or_else(|| state.lock_row.clone());
        Ok(row.filter(|row| row.lock_id == lock_id))
    }

    fn read_lock(&mut self, lock_id: i32) -> Result<Option<MigrationLock>, GuardError> {
        let row = self
            .staged
            .lock_row
            .clone()
            .or_else(|| self.shared.state().lock_row.clone());
        Ok(row.filter(|row| row.lock_id == lock_id))
    }

    fn insert_lock(&mut self, lock: &MigrationLock) -> Result<(), GuardError> {
        self.check_lock_write()?;
        let exists = self.staged.lock_row.is_some() || self.shared.state().lock_row.is_some();
        if exists {
            return Err(GuardError::Query(format!(
                "duplicate key value violates unique constraint on lock_id: {}",
                lock.lock_id
            )));
        }
        self.staged.lock_row = Some(lock.clone());
        Ok(())
    }

    fn update_lock(&mut self, lock: &MigrationLock) -> Result<u64, GuardError> {
        self.check_lock_write()?;
        let exists = self.staged.lock_row.is_some() || self.shared.state().lock_row.is_some();
        if !exists {
            return Ok(0);
        }
        self.staged.lock_row = Some(lock.clone());
        Ok(1)
    }
}

impl MigrationLedger for MemoryTransaction {
    fn applied_migrations(&mut self) -> Result<Vec<AppliedMigration>, GuardError> {
        let mut rows = self.shared.state().ledger.clone();
        rows.extend(self.staged.ledger.iter().cloned());
        Ok(rows)
    }

    fn is_recorded(&mut self, script_name: &str) -> Result<bool, GuardError> {
        let committed = self
            .shared
            .state()
            .ledger
            .iter()
            .any(|row| row.script_name == script_name);
        Ok(committed || self.staged.ledger.iter().any(|row| row.script_name == script_name))
    }

    fn record_applied(
        &mut self,
        script_name: &str,
        applied_by: &str,
        applied_at: DateTime<Utc>,
    ) -> Result<AppliedMigration, GuardError> {
        if self.is_recorded(script_name)? {
            return Err(GuardError::Query(format!(
                "duplicate key value violates unique constraint on script_name: {script_name}"
            )));
        }

        let migration_id = {
            let mut state = self.shared.state();
            state.last_migration_id += 1;
            state.last_migration_id
        };
        let row = AppliedMigration {
            migration_id,
            script_name: script_name.to_string(),
            applied_by: applied_by.to_string(),
            applied_at,
        };
        self.staged.ledger.push(row.clone());
        Ok(row)
    }
}

impl SchemaBootstrap for MemoryTransaction {
    fn ensure_migration_schema(&mut self) -> Result<(), GuardError> {
        self.staged.schema_created = true;
        Ok(())
    }
}

impl EmployeeStore for MemoryTransaction {
    fn update_employee_name(&mut self, employee_id: Uuid, name: &str) -> Result<u64, GuardError> {
        let exists = self.staged.employees.contains_key(&employee_id)
            || self.shared.state().employees.contains_key(&employee_id);
        if !exists {
            return Ok(0);
        }
        self.staged.employees.insert(employee_id, name.to_string());
        Ok(1)
    }

    fn employee_name(&mut self, employee_id: Uuid) -> Result<Option<String>, GuardError> {
        if let Some(name) = self.staged.employees.get(&employee_id) {
            return Ok(Some(name.clone()));
        }
        Ok(self.shared.state().employees.get(&employee_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{TransactionError, TransactionState};

    #[test]
    fn test_committed_batch_is_visible() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin().unwrap();
        tx.executor().unwrap().execute_batch("INSERT INTO t VALUES (1)").unwrap();
        assert!(db.executed_batches().is_empty());

        tx.commit().unwrap();
        assert_eq!(db.executed_batches(), vec!["INSERT INTO t VALUES (1)"]);
    }

    #[test]
    fn test_dropped_transaction_discards_writes() {
        let db = MemoryDatabase::new();
        let id = Uuid::new_v4();
        db.insert_employee(id, "Ada");
        {
            let mut tx = db.begin().unwrap();
            let mut store = tx.executor().unwrap();
            store.execute_batch("DELETE FROM projects").unwrap();
            assert_eq!(store.update_employee_name(id, "Grace").unwrap(), 1);
            assert_eq!(store.employee_name(id).unwrap().as_deref(), Some("Grace"));
        }

        let mut reader = db.begin().unwrap();
        assert_eq!(reader.executor().unwrap().employee_name(id).unwrap().as_deref(), Some("Ada"));
        reader.commit().unwrap();
        assert!(db.executed_batches().is_empty());
    }

    #[test]
    fn test_executor_writes_publish_only_on_handle_commit() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin().unwrap();
        tx.executor().unwrap().execute_batch("INSERT INTO t VALUES (1)").unwrap();
        assert_eq!(tx.state(), TransactionState::Open);
        assert!(db.executed_batches().is_empty());

        tx.commit().unwrap();
        assert!(tx.commit().is_err());
        assert_eq!(db.executed_batches(), vec!["INSERT INTO t VALUES (1)"]);
    }

    #[test]
    fn test_second_commit_is_rejected() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin().unwrap();
        tx.commit().unwrap();

        let err = tx.commit().unwrap_err();
        assert!(matches!(
            err,
            TransactionError::InvalidState { state: TransactionState::Committed, .. }
        ));
    }

    #[test]
    fn test_migration_ids_are_not_reused_after_rollback() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin().unwrap();
        let first = tx.executor().unwrap().record_applied("001_a.sql", "A", Utc::now()).unwrap();
        tx.rollback().unwrap();

        let mut tx = db.begin().unwrap();
        let second = tx.executor().unwrap().record_applied("001_a.sql", "A", Utc::now()).unwrap();
        tx.commit().unwrap();

        assert!(second.migration_id > first.migration_id);
        assert_eq!(db.ledger(), vec![second]);
    }

    #[test]
    fn test_record_applied_rejects_duplicate_script() {
        let db = MemoryDatabase::new();
        db.seed_ledger_row("001_a.sql", "A");

        let mut tx = db.begin().unwrap();
        let err = tx
            .executor()
            .unwrap()
            .record_applied("001_a.sql", "B", Utc::now())
            .unwrap_err();
        assert!(err.to_string().contains("duplicate key"));
    }

    #[test]
    fn test_row_lock_is_released_on_drop() {
        let db = MemoryDatabase::new();
        {
            let mut tx = db.begin().unwrap();
            assert!(tx.executor().unwrap().lock_for_update(1).unwrap().is_none());
        }

        let mut tx = db.begin().unwrap();
        assert!(tx.executor().unwrap().lock_for_update(1).unwrap().is_none());
        tx.rollback().unwrap();
    }

    #[test]
    fn test_lock_write_allowance() {
        let db = MemoryDatabase::new();
        db.fail_lock_writes_after(1);

        let mut tx = db.begin().unwrap();
        let mut store = tx.executor().unwrap();
        store.insert_lock(&MigrationLock::released()).unwrap();
        assert!(store.update_lock(&MigrationLock::released()).is_err());
        tx.rollback().unwrap();

        db.fail_lock_writes(false);
        let mut tx = db.begin().unwrap();
        tx.executor().unwrap().insert_lock(&MigrationLock::released()).unwrap();
        tx.commit().unwrap();
        assert_eq!(db.lock_row(), Some(MigrationLock::released()));
    }
}
