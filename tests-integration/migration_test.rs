//! Integration tests for the migration system
//!
//! These tests run against a real PostgreSQL database named by
//! `SCHEMAGUARD_TEST_DATABASE_URL` and are skipped when it is unset. They drop
//! and recreate their own tables, so point them at a scratch database.

use may_postgres::Client;
use schemaguard::backend::PgTransactionService;
use schemaguard::connection::connect;
use schemaguard::employee::{EmployeeError, EmployeeNameUpdate, EmployeeService};
use schemaguard::executor::SqlExecutor;
use schemaguard::migration::{LockCoordinator, MigrationError, MigrationLock, MigrationRunner};
use schemaguard::transaction::TransactionService;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tempfile::TempDir;
use uuid::Uuid;

static SERIAL: Mutex<()> = Mutex::new(());

struct TestDatabase {
    url: String,
    client: Client,
    _serial: MutexGuard<'static, ()>,
}

impl TestDatabase {
    /// Connect and drop every table the tests touch; `None` when no database
    /// is configured.
    fn new() -> Option<Self> {
        let url = env::var("SCHEMAGUARD_TEST_DATABASE_URL").ok()?;
        let serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let client = connect(&url).expect("Failed to connect to test database");
        client
            .batch_execute(
                "DROP TABLE IF EXISTS applied_migrations, migration_lock, \
                 it_widgets, it_gadgets, employees",
            )
            .expect("Failed to reset test tables");
        Some(Self {
            url,
            client,
            _serial: serial,
        })
    }

    fn service(&self) -> PgTransactionService {
        PgTransactionService::new(self.url.clone())
    }

    fn count(&self, sql: &str) -> i64 {
        self.client.query_one(sql, &[]).expect("count query failed").get(0)
    }

    fn table_exists(&self, table: &str) -> bool {
        let row = self
            .client
            .query_one("SELECT to_regclass($1) IS NOT NULL", &[&table])
            .expect("to_regclass failed");
        row.get(0)
    }
}

macro_rules! test_database {
    () => {
        match TestDatabase::new() {
            Some(db) => db,
            None => {
                eprintln!("skipping: SCHEMAGUARD_TEST_DATABASE_URL is not set");
                return;
            }
        }
    };
}

fn write_scripts(dir: &Path, scripts: &[(&str, &str)]) {
    for (name, sql) in scripts {
        fs::write(dir.join(name), sql).expect("Failed to write script");
    }
}

#[test]
fn test_apply_pending_end_to_end() {
    let db = test_database!();
    let dir = TempDir::new().unwrap();
    write_scripts(
        dir.path(),
        &[
            ("001_init.sql", "CREATE TABLE it_widgets (id INT PRIMARY KEY, name TEXT NOT NULL);"),
            ("002_seed.sql", "INSERT INTO it_widgets VALUES (1, 'sprocket'); INSERT INTO it_widgets VALUES (2, 'gear');"),
        ],
    );

    let runner = MigrationRunner::new(db.service(), dir.path());
    runner.ensure_schema().unwrap();
    runner.ensure_schema().unwrap();

    let report = runner.apply_pending("A").unwrap();
    assert_eq!(report.applied_names(), vec!["001_init.sql", "002_seed.sql"]);

    let ledger = runner.applied_migrations().unwrap();
    assert_eq!(ledger.len(), 2);
    assert_eq!(ledger[0].script_name, "001_init.sql");
    assert_eq!(ledger[1].script_name, "002_seed.sql");
    assert!(ledger.iter().all(|row| row.applied_by == "A"));
    assert_eq!(db.count("SELECT count(*) FROM it_widgets"), 2);

    let lock = runner.lock().current().unwrap();
    assert_eq!(lock, Some(MigrationLock::released()));

    let again = runner.apply_pending("B").unwrap();
    assert!(again.applied.is_empty());
    assert_eq!(db.count("SELECT count(*) FROM applied_migrations"), 2);
}

#[test]
fn test_failed_script_rolls_back_script_and_ledger_row() {
    let db = test_database!();
    let dir = TempDir::new().unwrap();
    write_scripts(
        dir.path(),
        &[
            ("001_init.sql", "CREATE TABLE it_widgets (id INT);"),
            ("002_broken.sql", "CREATE TABLE it_gadgets (id INT); SELECT * FROM it_missing_table;"),
            ("003_later.sql", "INSERT INTO it_widgets VALUES (3);"),
        ],
    );

    let runner = MigrationRunner::new(db.service(), dir.path());
    runner.ensure_schema().unwrap();

    let err = runner.apply_pending("A").unwrap_err();
    assert_eq!(err.script(), Some("002_broken.sql"));
    assert!(!db.table_exists("it_gadgets"));
    assert_eq!(db.count("SELECT count(*) FROM it_widgets"), 0);

    let ledger = runner.applied_migrations().unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].script_name, "001_init.sql");
    assert_eq!(runner.lock().current().unwrap(), Some(MigrationLock::released()));
}

#[test]
fn test_recorded_but_missing_script_aborts_run() {
    let db = test_database!();
    let dir = TempDir::new().unwrap();
    write_scripts(dir.path(), &[("001_init.sql", "CREATE TABLE it_widgets (id INT);")]);

    let runner = MigrationRunner::new(db.service(), dir.path());
    runner.ensure_schema().unwrap();
    db.client
        .batch_execute(
            "INSERT INTO applied_migrations (script_name, applied_by, applied_at) \
             VALUES ('005_x.sql', 'old', now())",
        )
        .unwrap();

    let err = runner.apply_pending("A").unwrap_err();
    assert!(matches!(err, MigrationError::Integrity { ref scripts } if scripts == &["005_x.sql"]));
    assert!(!db.table_exists("it_widgets"));
}

#[test]
fn test_concurrent_acquire_has_single_winner() {
    let db = test_database!();
    MigrationRunner::new(db.service(), ".").ensure_schema().unwrap();

    let handles: Vec<_> = ["A", "B"]
        .into_iter()
        .map(|instance| {
            let service = db.service();
            may::go!(move || {
                let coordinator = LockCoordinator::new(service);
                coordinator.try_acquire(instance).expect("try_acquire failed")
            })
        })
        .collect();
    let results: Vec<bool> = handles
        .into_iter()
        .map(|h| h.join().expect("coroutine panicked"))
        .collect();

    assert_eq!(results.iter().filter(|acquired| **acquired).count(), 1);

    let coordinator = LockCoordinator::new(db.service());
    let holder = coordinator.current().unwrap().unwrap();
    assert!(holder.is_locked);

    coordinator.release("A").unwrap();
    assert!(coordinator.try_acquire("B").unwrap());
    assert!(!coordinator.try_acquire("A").unwrap());
    coordinator.release("B").unwrap();
    coordinator.release("B").unwrap();
}

#[test]
fn test_dropped_transaction_is_rolled_back() {
    let db = test_database!();
    db.client.batch_execute("CREATE TABLE it_widgets (id INT)").unwrap();
    let service = db.service();

    {
        let mut tx = service.begin().unwrap();
        tx.executor()
            .unwrap()
            .execute_batch("INSERT INTO it_widgets VALUES (1)")
            .unwrap();
    }
    assert_eq!(db.count("SELECT count(*) FROM it_widgets"), 0);

    let mut tx = service.begin().unwrap();
    tx.executor()
        .unwrap()
        .execute_batch("INSERT INTO it_widgets VALUES (2)")
        .unwrap();
    tx.commit().unwrap();
    assert!(tx.commit().is_err());
    assert_eq!(db.count("SELECT count(*) FROM it_widgets"), 1);
}

#[test]
fn test_two_employee_renames_are_atomic() {
    let db = test_database!();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    db.client
        .batch_execute("CREATE TABLE employees (id UUID PRIMARY KEY, name TEXT NOT NULL)")
        .unwrap();
    for (id, name) in [(a, "Ada"), (b, "Brian")] {
        db.client
            .execute("INSERT INTO employees (id, name) VALUES ($1, $2)", &[&id, &name])
            .unwrap();
    }
    let service = EmployeeService::new(db.service());

    service
        .update_two_employees_in_transaction(
            &EmployeeNameUpdate::new(a, "Ada Lovelace"),
            &EmployeeNameUpdate::new(b, "Brian Kernighan"),
        )
        .unwrap();
    assert_eq!(service.employee_name(a).unwrap().as_deref(), Some("Ada Lovelace"));

    let missing = Uuid::new_v4();
    let err = service
        .update_two_employees_in_transaction(
            &EmployeeNameUpdate::new(b, "Dennis"),
            &EmployeeNameUpdate::new(missing, "Nobody"),
        )
        .unwrap_err();
    assert!(matches!(err, EmployeeError::NotFound(id) if id == missing));
    assert_eq!(service.employee_name(b).unwrap().as_deref(), Some("Brian Kernighan"));
}
