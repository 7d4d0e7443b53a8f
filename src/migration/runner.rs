//! Migration Runner - applies pending scripts under the migration lock

use crate::migration::{
    discover_scripts, AppliedMigration, LockCoordinator, MigrationError, MigrationScript,
    MigrationStatus, MigrationStore,
};
use crate::transaction::{IsolationLevel, TransactionService};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;
#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// What one `apply_pending` pass did
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    /// Scripts this instance executed and recorded, in order
    pub applied: Vec<AppliedMigration>,
    /// Scripts found recorded once the lock was held; another instance
    /// applied them after the ledger snapshot was taken
    pub applied_elsewhere: Vec<String>,
    /// Scripts left pending because the lock was held elsewhere
    pub deferred: Vec<String>,
}

impl MigrationReport {
    /// True if nothing was deferred to a later pass.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.deferred.is_empty()
    }

    #[must_use]
    pub fn applied_names(&self) -> Vec<&str> {
        self.applied.iter().map(|row| row.script_name.as_str()).collect()
    }
}

enum ScriptOutcome {
    Applied(AppliedMigration),
    AlreadyRecorded,
}

/// Applies the `*.sql` scripts of one directory to one database.
///
/// Every script runs in its own transaction together with its ledger row, and
/// inside its own lock window: acquire, execute and record, commit, release.
pub struct MigrationRunner<S> {
    service: S,
    scripts_dir: PathBuf,
}

impl<S> MigrationRunner<S>
where
    S: TransactionService,
    S::Native: MigrationStore,
{
    pub fn new(service: S, scripts_dir: impl AsRef<Path>) -> Self {
        Self {
            service,
            scripts_dir: scripts_dir.as_ref().to_path_buf(),
        }
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    /// Lock coordinator over the same backend
    pub fn lock(&self) -> LockCoordinator<&S> {
        LockCoordinator::new(&self.service)
    }

    /// Scripts on disk, sorted by file name
    pub fn discover(&self) -> Result<Vec<MigrationScript>, MigrationError> {
        discover_scripts(&self.scripts_dir)
    }

    /// Create the ledger and lock tables if they are missing.
    ///
    /// A concurrent instance creating the same objects first is not an error.
    pub fn ensure_schema(&self) -> Result<(), MigrationError> {
        let result = self
            .service
            .run_in_transaction(IsolationLevel::ReadCommitted, |tx| {
                tx.executor()?.ensure_migration_schema()?;
                Ok::<(), MigrationError>(())
            });

        match result {
            Err(MigrationError::Database(e)) if e.is_duplicate_object() => {
                log::debug!("migration tables were created concurrently: {e}");
                Ok(())
            }
            other => other,
        }
    }

    /// Ledger rows in application order
    pub fn applied_migrations(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.service
            .run_in_transaction(IsolationLevel::ReadCommitted, |tx| {
                Ok(tx.executor()?.applied_migrations()?)
            })
    }

    /// Get migration status (applied vs pending)
    ///
    /// Reads the ledger once and diffs it against the scripts on disk.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Integrity` if the ledger records a script that
    /// is not on disk.
    pub fn status(&self) -> Result<MigrationStatus, MigrationError> {
        let scripts = self.discover()?;
        let applied = self.applied_migrations()?;
        MigrationStatus::new(applied, scripts)
    }

    /// Apply pending scripts in file name order
    ///
    /// For each pending script the lock is acquired, the script and its ledger
    /// row are committed in one transaction, and the lock is released whether
    /// or not the script succeeded. If the lock is held elsewhere the script
    /// and all later ones are deferred to the next pass. Later scripts do not
    /// get their own lock attempt, so no instance applies a script before an
    /// earlier one has been applied.
    ///
    /// # Errors
    ///
    /// - `Integrity` before anything runs if the ledger and the disk disagree
    /// - `ScriptExecution` naming the first script that failed; later
    ///   scripts are not attempted
    /// - `LockRelease` if the lock could not be freed
    pub fn apply_pending(&self, instance_id: &str) -> Result<MigrationReport, MigrationError> {
        let status = self.status()?;
        let mut report = MigrationReport::default();

        if status.is_up_to_date() {
            log::debug!("no pending migrations in {}", self.scripts_dir.display());
            return Ok(report);
        }

        let lock = self.lock();
        let mut pending = status.pending.into_iter();
        while let Some(script) = pending.next() {
            let outcome = lock.with_lock(instance_id, || self.apply_script(&script, instance_id))?;
            match outcome {
                Some(ScriptOutcome::Applied(row)) => report.applied.push(row),
                Some(ScriptOutcome::AlreadyRecorded) => {
                    log::info!("{} was applied by another instance, skipping", script.name);
                    report.applied_elsewhere.push(script.name);
                }
                None => {
                    report.deferred.push(script.name);
                    report.deferred.extend(pending.by_ref().map(|s| s.name));
                    log::info!(
                        "migration lock is held by another instance, deferring {} script(s) to the next run",
                        report.deferred.len()
                    );
                }
            }
        }

        Ok(report)
    }

    fn apply_script(
        &self,
        script: &MigrationScript,
        instance_id: &str,
    ) -> Result<ScriptOutcome, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::apply_script_span(&script.name).entered();

        let start = Instant::now();
        let result = script.read_sql().and_then(|sql| {
            self.service
                .run_in_transaction(IsolationLevel::ReadCommitted, |tx| {
                    let mut store = tx.executor()?;
                    if store.is_recorded(&script.name)? {
                        return Ok(None);
                    }
                    store.execute_batch(&sql)?;
                    let row = store.record_applied(&script.name, instance_id, Utc::now())?;
                    Ok::<_, MigrationError>(Some(row))
                })
        });

        match result {
            Ok(Some(row)) => {
                log::info!("applied migration {} in {:?}", script.name, start.elapsed());
                #[cfg(feature = "metrics")]
                METRICS.record_script_applied(start.elapsed());
                Ok(ScriptOutcome::Applied(row))
            }
            Ok(None) => Ok(ScriptOutcome::AlreadyRecorded),
            Err(source) => {
                log::error!("migration {} failed: {source}", script.name);
                #[cfg(feature = "metrics")]
                METRICS.record_script_failed();
                Err(MigrationError::ScriptExecution {
                    script: script.name.clone(),
                    source: Box::new(source),
                })
            }
        }
    }
}
