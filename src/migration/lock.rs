//! Database-resident migration lock
//!
//! A single row (`lock_id = 1`) in `migration_lock` acts as a mutex shared by
//! every instance that can reach the database. Acquisition is a
//! check-and-set inside a serializable transaction, so two instances can never
//! both observe the slot free and both take it.

use crate::executor::GuardError;
use crate::migration::MigrationError;
use crate::transaction::{Executor, IsolationLevel, Transaction, TransactionService};
use chrono::{DateTime, Utc};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;
#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// Identifier of the only lock slot.
pub const MIGRATION_LOCK_ID: i32 = 1;

/// The `migration_lock` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationLock {
    pub lock_id: i32,
    pub is_locked: bool,
    /// Instance identifier of the current holder
    pub locked_by: Option<String>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
}

impl MigrationLock {
    /// The slot taken by `instance_id` at `acquired_at`.
    #[must_use]
    pub fn held_by(instance_id: &str, acquired_at: DateTime<Utc>) -> Self {
        Self {
            lock_id: MIGRATION_LOCK_ID,
            is_locked: true,
            locked_by: Some(instance_id.to_string()),
            lock_acquired_at: Some(acquired_at),
        }
    }

    /// The free slot.
    #[must_use]
    pub fn released() -> Self {
        Self {
            lock_id: MIGRATION_LOCK_ID,
            is_locked: false,
            locked_by: None,
            lock_acquired_at: None,
        }
    }

    #[must_use]
    pub fn is_held_by(&self, instance_id: &str) -> bool {
        self.is_locked && self.locked_by.as_deref() == Some(instance_id)
    }
}

/// Reads and writes the lock row inside the implementor's transaction.
pub trait LockStore {
    /// Read the lock row and hold a row lock on it until the transaction ends.
    ///
    /// Returns `Ok(None)` if the row has never been created.
    fn lock_for_update(&mut self, lock_id: i32) -> Result<Option<MigrationLock>, GuardError>;

    /// Read the lock row without locking it.
    fn read_lock(&mut self, lock_id: i32) -> Result<Option<MigrationLock>, GuardError>;

    /// Create the lock row.
    fn insert_lock(&mut self, lock: &MigrationLock) -> Result<(), GuardError>;

    /// Overwrite the lock row; returns the number of rows changed.
    fn update_lock(&mut self, lock: &MigrationLock) -> Result<u64, GuardError>;
}

impl<N: LockStore> LockStore for Executor<'_, N> {
    fn lock_for_update(&mut self, lock_id: i32) -> Result<Option<MigrationLock>, GuardError> {
        self.native().lock_for_update(lock_id)
    }

    fn read_lock(&mut self, lock_id: i32) -> Result<Option<MigrationLock>, GuardError> {
        self.native().read_lock(lock_id)
    }

    fn insert_lock(&mut self, lock: &MigrationLock) -> Result<(), GuardError> {
        self.native().insert_lock(lock)
    }

    fn update_lock(&mut self, lock: &MigrationLock) -> Result<u64, GuardError> {
        self.native().update_lock(lock)
    }
}

/// Acquires and releases the migration lock slot.
///
/// There is no waiting or retry: an attempt that finds the slot held returns
/// `false` immediately and the caller decides what to defer.
pub struct LockCoordinator<S> {
    service: S,
}

impl<S> LockCoordinator<S>
where
    S: TransactionService,
    S::Native: LockStore,
{
    pub fn new(service: S) -> Self {
        Self { service }
    }

    /// Try to take the slot for `instance_id`.
    ///
    /// Returns `Ok(true)` if this call took the slot, `Ok(false)` if it is
    /// held by anyone, including `instance_id` itself. A serialization
    /// failure means a concurrent attempt won the race and is reported as
    /// `Ok(false)`; every other error rolls the attempt back and propagates.
    pub fn try_acquire(&self, instance_id: &str) -> Result<bool, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::lock_attempt_span(instance_id).entered();

        let mut tx = self.service.begin_with_isolation(IsolationLevel::Serializable)?;
        let outcome = match Self::check_and_set(&mut tx, instance_id) {
            Ok(true) => tx.commit().map(|()| true).map_err(MigrationError::from),
            Ok(false) => tx.rollback().map(|()| false).map_err(MigrationError::from),
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    log::warn!("rollback of failed lock attempt failed: {rollback_err}");
                }
                Err(e)
            }
        };

        match outcome {
            Ok(true) => {
                log::debug!("migration lock acquired by {instance_id}");
                #[cfg(feature = "metrics")]
                METRICS.record_lock_acquired();
                Ok(true)
            }
            Ok(false) => {
                #[cfg(feature = "metrics")]
                METRICS.record_lock_contention();
                Ok(false)
            }
            Err(e) if e.is_serialization_failure() => {
                log::debug!("lock attempt by {instance_id} lost a serialization race: {e}");
                #[cfg(feature = "metrics")]
                METRICS.record_lock_contention();
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn check_and_set(
        tx: &mut Transaction<S::Native>,
        instance_id: &str,
    ) -> Result<bool, MigrationError> {
        let mut store = tx.executor()?;
        match store.lock_for_update(MIGRATION_LOCK_ID)? {
            None => {
                store.insert_lock(&MigrationLock::held_by(instance_id, Utc::now()))?;
                Ok(true)
            }
            Some(current) if !current.is_locked => {
                store.update_lock(&MigrationLock::held_by(instance_id, Utc::now()))?;
                Ok(true)
            }
            Some(current) => {
                log::debug!(
                    "migration lock held by {} since {:?}",
                    current.locked_by.as_deref().unwrap_or("<unknown>"),
                    current.lock_acquired_at
                );
                Ok(false)
            }
        }
    }

    /// Free the slot.
    ///
    /// Clears the row regardless of who holds it. Releasing a free or
    /// never-created slot is a no-op.
    ///
    /// # Errors
    ///
    /// Every failure is returned as `MigrationError::LockRelease`.
    pub fn release(&self, instance_id: &str) -> Result<(), MigrationError> {
        self.service
            .run_in_transaction(IsolationLevel::ReadCommitted, |tx| {
                let mut store = tx.executor()?;
                match store.lock_for_update(MIGRATION_LOCK_ID)? {
                    Some(current) => {
                        if current.is_locked && !current.is_held_by(instance_id) {
                            log::warn!(
                                "{instance_id} is releasing a migration lock held by {}",
                                current.locked_by.as_deref().unwrap_or("<unknown>")
                            );
                        }
                        store.update_lock(&MigrationLock::released())?;
                    }
                    None => log::debug!("no migration lock row to release"),
                }
                Ok::<(), MigrationError>(())
            })
            .map_err(|source| MigrationError::LockRelease {
                instance_id: instance_id.to_string(),
                source: Box::new(source),
                prior: None,
            })?;

        log::debug!("migration lock released by {instance_id}");
        Ok(())
    }

    /// Current lock row, for inspection.
    ///
    /// A plain read: it never waits on or blocks a concurrent acquirer.
    pub fn current(&self) -> Result<Option<MigrationLock>, MigrationError> {
        self.service
            .run_in_transaction(IsolationLevel::ReadCommitted, |tx| {
                Ok(tx.executor()?.read_lock(MIGRATION_LOCK_ID)?)
            })
    }

    /// Run `work` while holding the slot.
    ///
    /// Returns `Ok(None)` without running `work` when the slot is taken. When
    /// it runs, the slot is released afterwards whether `work` succeeded or
    /// not. A release failure is returned even if `work` succeeded; if both
    /// fail, the release error carries the work error as `prior`.
    pub fn with_lock<T, F>(&self, instance_id: &str, work: F) -> Result<Option<T>, MigrationError>
    where
        F: FnOnce() -> Result<T, MigrationError>,
    {
        if !self.try_acquire(instance_id)? {
            return Ok(None);
        }

        let result = work();
        match (result, self.release(instance_id)) {
            (Ok(value), Ok(())) => Ok(Some(value)),
            (Err(e), Ok(())) => Err(e),
            (Ok(_), Err(release_err)) => Err(release_err),
            (Err(e), Err(release_err)) => Err(release_err.with_prior(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryDatabase;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_first_acquire_creates_row_held_by_caller() {
        let db = MemoryDatabase::new();
        let coordinator = LockCoordinator::new(db.clone());

        assert!(db.lock_row().is_none());
        assert!(coordinator.try_acquire("A").unwrap());

        let row = db.lock_row().unwrap();
        assert!(row.is_held_by("A"));
        assert!(row.lock_acquired_at.is_some());
    }

    #[test]
    fn test_acquire_is_not_reentrant() {
        let db = MemoryDatabase::new();
        let coordinator = LockCoordinator::new(db.clone());

        assert!(coordinator.try_acquire("A").unwrap());
        assert!(!coordinator.try_acquire("A").unwrap());
    }

    #[test]
    fn test_held_lock_rejects_other_instance_without_mutation() {
        let db = MemoryDatabase::new();
        let acquired_at = Utc::now();
        db.set_lock_row(MigrationLock::held_by("A", acquired_at));
        let coordinator = LockCoordinator::new(db.clone());

        assert!(!coordinator.try_acquire("B").unwrap());

        let row = db.lock_row().unwrap();
        assert_eq!(row.locked_by.as_deref(), Some("A"));
        assert_eq!(row.lock_acquired_at, Some(acquired_at));
    }

    #[test]
    fn test_release_then_reacquire() {
        let db = MemoryDatabase::new();
        let coordinator = LockCoordinator::new(db.clone());

        assert!(coordinator.try_acquire("A").unwrap());
        coordinator.release("A").unwrap();
        assert_eq!(db.lock_row(), Some(MigrationLock::released()));

        assert!(coordinator.try_acquire("B").unwrap());
        assert!(db.lock_row().unwrap().is_held_by("B"));
    }

    #[test]
    fn test_release_is_idempotent() {
        let db = MemoryDatabase::new();
        let coordinator = LockCoordinator::new(db.clone());

        coordinator.release("A").unwrap();
        assert!(db.lock_row().is_none());

        assert!(coordinator.try_acquire("A").unwrap());
        coordinator.release("A").unwrap();
        coordinator.release("A").unwrap();
        assert_eq!(db.lock_row(), Some(MigrationLock::released()));
    }

    #[test]
    fn test_failed_acquire_leaves_lock_free() {
        let db = MemoryDatabase::new();
        db.set_lock_row(MigrationLock::released());
        db.fail_lock_writes(true);
        let coordinator = LockCoordinator::new(db.clone());

        let err = coordinator.try_acquire("A").unwrap_err();
        assert!(matches!(err, MigrationError::Database(_)));
        assert_eq!(db.lock_row(), Some(MigrationLock::released()));
    }

    #[test]
    fn test_release_failure_is_reported() {
        let db = MemoryDatabase::new();
        let coordinator = LockCoordinator::new(db.clone());
        assert!(coordinator.try_acquire("A").unwrap());

        db.fail_lock_writes(true);
        let err = coordinator.release("A").unwrap_err();
        assert!(matches!(err, MigrationError::LockRelease { ref instance_id, .. } if instance_id == "A"));
        assert!(db.lock_row().unwrap().is_held_by("A"));
    }

    #[test]
    fn test_serialization_failure_counts_as_contention() {
        let db = MemoryDatabase::new();
        db.inject_serialization_failures(1);
        let coordinator = LockCoordinator::new(db.clone());

        assert!(!coordinator.try_acquire("A").unwrap());
        assert!(db.lock_row().is_none());
        assert!(coordinator.try_acquire("A").unwrap());
    }

    #[test]
    fn test_concurrent_acquire_has_single_winner() {
        let db = MemoryDatabase::new();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = ["A", "B"]
            .into_iter()
            .map(|instance| {
                let coordinator = LockCoordinator::new(db.clone());
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    (instance, coordinator.try_acquire(instance).unwrap())
                })
            })
            .collect();

        let results: Vec<(&str, bool)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners: Vec<&str> = results
            .iter()
            .filter(|(_, acquired)| *acquired)
            .map(|(instance, _)| *instance)
            .collect();
        assert_eq!(winners.len(), 1);
        assert!(db.lock_row().unwrap().is_held_by(winners[0]));

        let coordinator = LockCoordinator::new(db.clone());
        coordinator.release(winners[0]).unwrap();
        let loser = if winners[0] == "A" { "B" } else { "A" };
        assert!(coordinator.try_acquire(loser).unwrap());
    }

    #[test]
    fn test_with_lock_skips_work_when_held() {
        let db = MemoryDatabase::new();
        db.set_lock_row(MigrationLock::held_by("A", Utc::now()));
        let coordinator = LockCoordinator::new(db.clone());

        let mut ran = false;
        let out = coordinator
            .with_lock("B", || {
                ran = true;
                Ok(())
            })
            .unwrap();
        assert!(out.is_none());
        assert!(!ran);
    }

    #[test]
    fn test_with_lock_releases_after_work_fails() {
        let db = MemoryDatabase::new();
        let coordinator = LockCoordinator::new(db.clone());

        let err = coordinator
            .with_lock("A", || -> Result<(), MigrationError> {
                Err(GuardError::Query("work failed".into()).into())
            })
            .unwrap_err();
        assert!(matches!(err, MigrationError::Database(_)));
        assert_eq!(db.lock_row(), Some(MigrationLock::released()));
    }

    #[test]
    fn test_current_reports_holder() {
        let db = MemoryDatabase::new();
        let coordinator = LockCoordinator::new(db.clone());
        assert_eq!(coordinator.current().unwrap(), None);

        assert!(coordinator.try_acquire("A").unwrap());
        assert!(coordinator.current().unwrap().unwrap().is_held_by("A"));
    }

    #[test]
    fn test_current_does_not_wait_for_row_lock() {
        let db = MemoryDatabase::new();
        let coordinator = LockCoordinator::new(db.clone());
        assert!(coordinator.try_acquire("A").unwrap());

        let mut releasing = db.begin().unwrap();
        assert!(releasing.executor().unwrap().lock_for_update(MIGRATION_LOCK_ID).unwrap().is_some());

        assert!(coordinator.current().unwrap().unwrap().is_held_by("A"));
        releasing.rollback().unwrap();
    }

    #[test]
    fn test_with_lock_reports_release_failure_after_successful_work() {
        let db = MemoryDatabase::new();
        db.fail_lock_writes_after(1);
        let coordinator = LockCoordinator::new(db.clone());

        let err = coordinator.with_lock("A", || Ok(7)).unwrap_err();
        assert!(matches!(err, MigrationError::LockRelease { prior: None, .. }));
        assert!(db.lock_row().unwrap().is_held_by("A"));
    }
}
