//! Backing technologies for [`crate::transaction::TransactionService`]
//!
//! - [`postgres`]: PostgreSQL through `may_postgres`, one connection per
//!   transaction
//! - [`memory`]: shared in-process state with the same commit/rollback rules,
//!   for tests and embedding

pub mod memory;
pub mod postgres;

pub use memory::{MemoryDatabase, MemoryTransaction};
pub use postgres::{PgTransaction, PgTransactionService};
