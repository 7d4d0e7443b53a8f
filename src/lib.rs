//! # SchemaGuard
//!
//! Ordered SQL migrations applied exactly once across a fleet of instances,
//! coordinated through a lock row in the target database, plus a uniform
//! transaction handle over `may_postgres` and an in-memory backend.
//!
//! - [`migration::MigrationRunner`] applies pending `*.sql` scripts, one lock
//!   window per script
//! - [`migration::LockCoordinator`] owns the `migration_lock` slot
//! - [`transaction::Transaction`] commits or rolls back explicitly and never
//!   commits on drop

pub mod backend;
pub mod config;
pub mod connection;
pub mod employee;
pub mod executor;
pub mod metrics;
pub mod migration;
pub mod transaction;

pub use backend::{MemoryDatabase, PgTransactionService};
pub use config::GuardConfig;
pub use executor::{GuardError, SqlExecutor};
pub use migration::{
    startup_migrations, LockCoordinator, MigrationError, MigrationReport, MigrationRunner,
};
pub use transaction::{
    Executor, IsolationLevel, Transaction, TransactionError, TransactionService, TransactionState,
};
