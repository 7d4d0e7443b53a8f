//! Bookkeeping tables for the ledger and the lock slot
//!
//! Both tables are created with `IF NOT EXISTS`, so bootstrapping is safe to
//! run on every startup.

use crate::executor::GuardError;
use crate::transaction::Executor;
use sea_query::{
    ColumnDef, Index, IndexCreateStatement, PostgresQueryBuilder, Table, TableCreateStatement,
};

pub const APPLIED_MIGRATIONS_TABLE: &str = "applied_migrations";
pub const MIGRATION_LOCK_TABLE: &str = "migration_lock";

/// Create the `applied_migrations` ledger table
pub fn create_ledger_table() -> TableCreateStatement {
    Table::create()
        .table(APPLIED_MIGRATIONS_TABLE)
        .if_not_exists()
        .col(
            ColumnDef::new("migration_id")
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(
            ColumnDef::new("script_name")
                .string_len(255)
                .not_null()
                .unique_key(),
        )
        .col(ColumnDef::new("applied_by").string_len(255).not_null())
        .col(
            ColumnDef::new("applied_at")
                .timestamp_with_time_zone()
                .not_null(),
        )
        .to_owned()
}

/// Index on `applied_at` for operator queries
pub fn create_ledger_index() -> IndexCreateStatement {
    Index::create()
        .if_not_exists()
        .name("idx_applied_migrations_applied_at")
        .table(APPLIED_MIGRATIONS_TABLE)
        .col("applied_at")
        .to_owned()
}

/// Create the `migration_lock` table. The row itself is created lazily by the
/// first acquisition attempt.
pub fn create_lock_table() -> TableCreateStatement {
    Table::create()
        .table(MIGRATION_LOCK_TABLE)
        .if_not_exists()
        .col(ColumnDef::new("lock_id").integer().not_null().primary_key())
        .col(
            ColumnDef::new("is_locked")
                .boolean()
                .not_null()
                .default(false),
        )
        .col(ColumnDef::new("locked_by").string_len(255).null())
        .col(
            ColumnDef::new("lock_acquired_at")
                .timestamp_with_time_zone()
                .null(),
        )
        .to_owned()
}

/// The bootstrap DDL as PostgreSQL statements, in execution order.
pub fn bootstrap_statements() -> Vec<String> {
    vec![
        create_ledger_table().to_string(PostgresQueryBuilder),
        create_ledger_index().to_string(PostgresQueryBuilder),
        create_lock_table().to_string(PostgresQueryBuilder),
    ]
}

/// Creates the bookkeeping tables inside the implementor's transaction.
pub trait SchemaBootstrap {
    /// Create both tables and the ledger index if they are missing.
    fn ensure_migration_schema(&mut self) -> Result<(), GuardError>;
}

impl<N: SchemaBootstrap> SchemaBootstrap for Executor<'_, N> {
    fn ensure_migration_schema(&mut self) -> Result<(), GuardError> {
        self.native().ensure_migration_schema()
    }
}
