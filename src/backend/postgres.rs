//! PostgreSQL backend over `may_postgres`
//!
//! Each [`PgTransactionService::begin`] opens a dedicated connection and issues
//! `BEGIN ISOLATION LEVEL ...` on it; the resulting [`PgTransaction`] owns that
//! connection until it is dropped.

use crate::connection::connect;
use crate::employee::EmployeeStore;
use crate::executor::{GuardError, SqlExecutor};
use crate::migration::schema::bootstrap_statements;
use crate::migration::{AppliedMigration, LockStore, MigrationLedger, MigrationLock, SchemaBootstrap};
use crate::transaction::{IsolationLevel, NativeTransaction, TransactionService};
use chrono::{DateTime, Utc};
use may_postgres::{Client, Row};
use uuid::Uuid;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Begins transactions on fresh connections to one database.
#[derive(Debug, Clone)]
pub struct PgTransactionService {
    url: String,
}

impl PgTransactionService {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl TransactionService for PgTransactionService {
    type Native = PgTransaction;

    fn begin_native(&self, isolation_level: IsolationLevel) -> Result<PgTransaction, GuardError> {
        let client = connect(&self.url)?;
        client.batch_execute(&format!("BEGIN ISOLATION LEVEL {}", isolation_level.to_sql()))?;
        Ok(PgTransaction {
            client,
            isolation_level,
        })
    }
}

/// A connection with an open native transaction
pub struct PgTransaction {
    client: Client,
    isolation_level: IsolationLevel,
}

impl PgTransaction {
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    fn lock_from_row(row: &Row) -> Result<MigrationLock, GuardError> {
        Ok(MigrationLock {
            lock_id: row.try_get("lock_id")?,
            is_locked: row.try_get("is_locked")?,
            locked_by: row.try_get("locked_by")?,
            lock_acquired_at: row.try_get("lock_acquired_at")?,
        })
    }

    fn applied_from_row(row: &Row) -> Result<AppliedMigration, GuardError> {
        Ok(AppliedMigration {
            migration_id: row.try_get("migration_id")?,
            script_name: row.try_get("script_name")?,
            applied_by: row.try_get("applied_by")?,
            applied_at: row.try_get("applied_at")?,
        })
    }
}

impl NativeTransaction for PgTransaction {
    fn commit(&mut self) -> Result<(), GuardError> {
        self.client.batch_execute("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), GuardError> {
        self.client.batch_execute("ROLLBACK")?;
        Ok(())
    }
}

impl SqlExecutor for PgTransaction {
    fn execute_batch(&mut self, sql: &str) -> Result<(), GuardError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_batch_span(sql).entered();

        self.client.batch_execute(sql)?;
        Ok(())
    }
}

impl LockStore for PgTransaction {
    fn lock_for_update(&mut self, lock_id: i32) -> Result<Option<MigrationLock>, GuardError> {
        let rows = self.client.query(
            "SELECT lock_id, is_locked, locked_by, lock_acquired_at \
             FROM migration_lock WHERE lock_id = $1 FOR UPDATE",
            &[&lock_id],
        )?;
        rows.first().map(Self::lock_from_row).transpose()
    }

    fn read_lock(&mut self, lock_id: i32) -> Result<Option<MigrationLock>, GuardError> {
        let rows = self.client.query(
            "SELECT lock_id, is_locked, locked_by, lock_acquired_at \
             FROM migration_lock WHERE lock_id = $1",
            &[&lock_id],
        )?;
        rows.first().map(Self::lock_from_row).transpose()
    }

    fn insert_lock(&mut self, lock: &MigrationLock) -> Result<(), GuardError> {
        self.client.execute(
            "INSERT INTO migration_lock (lock_id, is_locked, locked_by, lock_acquired_at) \
             VALUES ($1, $2, $3, $4)",
            &[
                &lock.lock_id,
                &lock.is_locked,
                &lock.locked_by,
                &lock.lock_acquired_at,
            ],
        )?;
        Ok(())
    }

    fn update_lock(&mut self, lock: &MigrationLock) -> Result<u64, GuardError> {
        let updated = self.client.execute(
            "UPDATE migration_lock \
             SET is_locked = $2, locked_by = $3, lock_acquired_at = $4 \
             WHERE lock_id = $1",
            &[
                &lock.lock_id,
                &lock.is_locked,
                &lock.locked_by,
                &lock.lock_acquired_at,
            ],
        )?;
        Ok(updated)
    }
}

impl MigrationLedger for PgTransaction {
    fn applied_migrations(&mut self) -> Result<Vec<AppliedMigration>, GuardError> {
        let rows = self.client.query(
            "SELECT migration_id, script_name, applied_by, applied_at \
             FROM applied_migrations ORDER BY migration_id",
            &[],
        )?;
        rows.iter().map(Self::applied_from_row).collect()
    }

    fn is_recorded(&mut self, script_name: &str) -> Result<bool, GuardError> {
        let row = self.client.query_one(
            "SELECT EXISTS (SELECT 1 FROM applied_migrations WHERE script_name = $1)",
            &[&script_name],
        )?;
        Ok(row.try_get(0)?)
    }

    fn record_applied(
        &mut self,
        script_name: &str,
        applied_by: &str,
        applied_at: DateTime<Utc>,
    ) -> Result<AppliedMigration, GuardError> {
        let row = self.client.query_one(
            "INSERT INTO applied_migrations (script_name, applied_by, applied_at) \
             VALUES ($1, $2, $3) \
             RETURNING migration_id, script_name, applied_by, applied_at",
            &[&script_name, &applied_by, &applied_at],
        )?;
        Self::applied_from_row(&row)
    }
}

impl SchemaBootstrap for PgTransaction {
    fn ensure_migration_schema(&mut self) -> Result<(), GuardError> {
        for statement in bootstrap_statements() {
            log::debug!("bootstrap: {statement}");
            self.client.batch_execute(&statement)?;
        }
        Ok(())
    }
}

impl EmployeeStore for PgTransaction {
    fn update_employee_name(&mut self, employee_id: Uuid, name: &str) -> Result<u64, GuardError> {
        Ok(self.client.execute(
            "UPDATE employees SET name = $1 WHERE id = $2",
            &[&name, &employee_id],
        )?)
    }

    fn employee_name(&mut self, employee_id: Uuid) -> Result<Option<String>, GuardError> {
        let rows = self
            .client
            .query("SELECT name FROM employees WHERE id = $1", &[&employee_id])?;
        match rows.first() {
            Some(row) => Ok(Some(row.try_get("name")?)),
            None => Ok(None),
        }
    }
}
