//! Transaction Module
//!
//! A uniform handle over one backend connection and one native transaction.
//!
//! This module provides:
//! - Transaction isolation levels
//! - The [`Transaction`] handle with an explicit `Open → Committed` /
//!   `Open → RolledBack` lifecycle
//! - Roll back on drop for handles that were never finished
//! - [`TransactionService`], which begins handles and runs closures as a unit
//!   of work

use crate::executor::GuardError;
use std::fmt;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Read uncommitted (PostgreSQL treats it as ReadCommitted)
    ReadUncommitted,
    /// Read committed (default)
    #[default]
    ReadCommitted,
    /// Repeatable read
    RepeatableRead,
    /// Serializable
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling used after `ISOLATION LEVEL`
    pub fn to_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Lifecycle of a [`Transaction`]. Both non-`Open` states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Open => write!(f, "open"),
            TransactionState::Committed => write!(f, "committed"),
            TransactionState::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// Transaction error type
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// `commit`/`rollback`/`executor` called on a handle that is no longer open
    #[error("cannot {operation} a transaction that is already {state}")]
    InvalidState {
        operation: &'static str,
        state: TransactionState,
    },
    /// The backend failed to begin, commit or roll back
    #[error("transaction {operation} failed: {source}")]
    Native {
        operation: &'static str,
        #[source]
        source: GuardError,
    },
}

/// Backend side of a transaction: the connection plus its native transaction.
///
/// Implementors only need to finish the native transaction; state tracking
/// and drop safety live in [`Transaction`].
pub trait NativeTransaction {
    /// Make every change since `BEGIN` durable.
    fn commit(&mut self) -> Result<(), GuardError>;

    /// Discard every change since `BEGIN`.
    fn rollback(&mut self) -> Result<(), GuardError>;
}

/// Statement access to an open [`Transaction`].
///
/// Forwards the store traits of the backend (`SqlExecutor`, `LockStore`,
/// `MigrationLedger`, `SchemaBootstrap`, `EmployeeStore`) but not
/// [`NativeTransaction`], so the handle's state always matches the native
/// transaction.
///
/// ```compile_fail
/// use schemaguard::backend::memory::MemoryDatabase;
/// use schemaguard::transaction::{NativeTransaction, TransactionService};
///
/// let db = MemoryDatabase::new();
/// let mut tx = db.begin().unwrap();
/// tx.executor().unwrap().commit().unwrap();
/// ```
pub struct Executor<'a, N> {
    native: &'a mut N,
}

impl<N> Executor<'_, N> {
    pub(crate) fn native(&mut self) -> &mut N {
        &mut *self.native
    }
}

/// A database transaction
///
/// All operations issued through [`Transaction::executor`] are either
/// committed together or rolled back together. Dropping a handle that is
/// still open rolls it back; it never commits implicitly.
///
/// # Examples
///
/// ```
/// use schemaguard::backend::memory::MemoryDatabase;
/// use schemaguard::executor::SqlExecutor;
/// use schemaguard::transaction::{TransactionService, TransactionState};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let db = MemoryDatabase::new();
/// let mut tx = db.begin()?;
/// tx.executor()?.execute_batch("UPDATE employees SET name = 'Ada'")?;
/// tx.commit()?;
/// assert_eq!(tx.state(), TransactionState::Committed);
/// # Ok(())
/// # }
/// ```
pub struct Transaction<N: NativeTransaction> {
    native: N,
    isolation_level: IsolationLevel,
    state: TransactionState,
}

impl<N: NativeTransaction> Transaction<N> {
    /// Wrap a native transaction that the backend has just begun.
    pub fn new(native: N, isolation_level: IsolationLevel) -> Self {
        Self {
            native,
            isolation_level,
            state: TransactionState::Open,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Isolation level the transaction was started with
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    /// Check if the transaction is closed
    pub fn is_closed(&self) -> bool {
        self.state != TransactionState::Open
    }

    /// Borrow the backend's statement capabilities for the next operation.
    ///
    /// The returned [`Executor`] cannot finish the transaction; only
    /// [`Transaction::commit`] and [`Transaction::rollback`] can.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::InvalidState` once the handle is finished.
    pub fn executor(&mut self) -> Result<Executor<'_, N>, TransactionError> {
        self.ensure_open("use")?;
        Ok(Executor {
            native: &mut self.native,
        })
    }

    /// Commit the transaction
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the transaction is not open. If the backend
    /// commit fails the handle attempts a rollback, ends `RolledBack` and
    /// returns `Native`.
    pub fn commit(&mut self) -> Result<(), TransactionError> {
        self.ensure_open("commit")?;

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::commit_transaction_span().entered();

        match self.native.commit() {
            Ok(()) => {
                self.state = TransactionState::Committed;
                Ok(())
            }
            Err(source) => {
                if let Err(rollback_err) = self.native.rollback() {
                    log::warn!("rollback after failed commit also failed: {rollback_err}");
                }
                self.state = TransactionState::RolledBack;
                Err(TransactionError::Native {
                    operation: "commit",
                    source,
                })
            }
        }
    }

    /// Rollback the transaction
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the transaction is not open, `Native` if the
    /// backend rollback fails. The handle ends `RolledBack` either way.
    pub fn rollback(&mut self) -> Result<(), TransactionError> {
        self.ensure_open("roll back")?;

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::rollback_transaction_span().entered();

        self.state = TransactionState::RolledBack;
        self.native
            .rollback()
            .map_err(|source| TransactionError::Native {
                operation: "rollback",
                source,
            })
    }

    fn ensure_open(&self, operation: &'static str) -> Result<(), TransactionError> {
        if self.state == TransactionState::Open {
            Ok(())
        } else {
            Err(TransactionError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }
}

impl<N: NativeTransaction> Drop for Transaction<N> {
    fn drop(&mut self) {
        if self.state != TransactionState::Open {
            return;
        }
        self.state = TransactionState::RolledBack;
        log::debug!("transaction dropped while open, rolling back");
        if let Err(e) = self.native.rollback() {
            log::warn!("rollback on drop failed: {e}");
        }
    }
}

/// Begins transactions against one backend.
///
/// Implemented once per backing technology; see [`crate::backend`].
pub trait TransactionService {
    /// Native transaction type produced by this backend
    type Native: NativeTransaction;

    /// Open a connection and start a native transaction on it.
    fn begin_native(&self, isolation_level: IsolationLevel) -> Result<Self::Native, GuardError>;

    /// Start a transaction with the default isolation level (ReadCommitted).
    fn begin(&self) -> Result<Transaction<Self::Native>, TransactionError> {
        self.begin_with_isolation(IsolationLevel::default())
    }

    /// Start a transaction with a specific isolation level
    fn begin_with_isolation(
        &self,
        isolation_level: IsolationLevel,
    ) -> Result<Transaction<Self::Native>, TransactionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::begin_transaction_span(isolation_level).entered();

        let native = self
            .begin_native(isolation_level)
            .map_err(|source| TransactionError::Native {
                operation: "begin",
                source,
            })?;
        Ok(Transaction::new(native, isolation_level))
    }

    /// Run `work` inside one transaction.
    ///
    /// Commits when `work` returns `Ok`. On `Err` the transaction is rolled
    /// back before the error is returned; a failing rollback is logged and
    /// the error from `work` is returned.
    fn run_in_transaction<T, E, F>(&self, isolation_level: IsolationLevel, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<Self::Native>) -> Result<T, E>,
        E: From<TransactionError>,
    {
        let mut tx = self.begin_with_isolation(isolation_level)?;
        match work(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if !tx.is_closed() {
                    if let Err(rollback_err) = tx.rollback() {
                        log::warn!("rollback after failed unit of work failed: {rollback_err}");
                    }
                }
                Err(e)
            }
        }
    }
}

impl<T: TransactionService + ?Sized> TransactionService for &T {
    type Native = T::Native;

    fn begin_native(&self, isolation_level: IsolationLevel) -> Result<Self::Native, GuardError> {
        (**self).begin_native(isolation_level)
    }
}
