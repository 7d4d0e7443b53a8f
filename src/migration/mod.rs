//! Migration system for SchemaGuard
//!
//! This module provides:
//! - The database-resident migration lock and its [`LockCoordinator`]
//! - The append-only ledger of applied scripts
//! - Discovery of `*.sql` scripts and drift detection
//! - [`MigrationRunner`], which applies pending scripts one lock window at a
//!   time
//!
//! # Example
//!
//! ```rust
//! use schemaguard::backend::memory::MemoryDatabase;
//! use schemaguard::migration::MigrationRunner;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempfile::tempdir()?;
//! std::fs::write(dir.path().join("001_init.sql"), "CREATE TABLE t (id INT);")?;
//!
//! let db = MemoryDatabase::new();
//! let runner = MigrationRunner::new(db.clone(), dir.path());
//! let report = runner.apply_pending("instance-a")?;
//!
//! assert_eq!(report.applied_names(), vec!["001_init.sql"]);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod ledger;
pub mod lock;
pub mod runner;
pub mod schema;
pub mod script;
pub mod startup;
pub mod status;

pub use error::MigrationError;
pub use ledger::{AppliedMigration, MigrationLedger};
pub use lock::{LockCoordinator, LockStore, MigrationLock, MIGRATION_LOCK_ID};
pub use runner::{MigrationReport, MigrationRunner};
pub use schema::{SchemaBootstrap, APPLIED_MIGRATIONS_TABLE, MIGRATION_LOCK_TABLE};
pub use script::{discover_scripts, MigrationScript};
pub use startup::{generate_instance_id, startup_migrations};
pub use status::MigrationStatus;

use crate::executor::SqlExecutor;

/// Everything the runner needs from one backend transaction.
pub trait MigrationStore: SqlExecutor + LockStore + MigrationLedger + SchemaBootstrap {}

impl<T> MigrationStore for T where T: SqlExecutor + LockStore + MigrationLedger + SchemaBootstrap {}
