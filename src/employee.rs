//! Employee renames as a unit of work
//!
//! Two renames either both commit or neither does. This is the pattern any
//! caller follows to compose several writes in one [`Transaction`].
//!
//! [`Transaction`]: crate::transaction::Transaction

use crate::executor::GuardError;
use crate::transaction::{Executor, IsolationLevel, TransactionError, TransactionService};
use uuid::Uuid;

/// Employee writes inside the implementor's transaction.
pub trait EmployeeStore {
    /// Rename an employee; returns the number of rows changed.
    fn update_employee_name(&mut self, employee_id: Uuid, name: &str) -> Result<u64, GuardError>;

    fn employee_name(&mut self, employee_id: Uuid) -> Result<Option<String>, GuardError>;
}

impl<N: EmployeeStore> EmployeeStore for Executor<'_, N> {
    fn update_employee_name(&mut self, employee_id: Uuid, name: &str) -> Result<u64, GuardError> {
        self.native().update_employee_name(employee_id, name)
    }

    fn employee_name(&mut self, employee_id: Uuid) -> Result<Option<String>, GuardError> {
        self.native().employee_name(employee_id)
    }
}

/// One rename request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmployeeNameUpdate {
    pub employee_id: Uuid,
    pub name: String,
}

impl EmployeeNameUpdate {
    pub fn new(employee_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            employee_id,
            name: name.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EmployeeError {
    #[error("Employee {0} does not exist")]
    NotFound(Uuid),
    #[error("Database error: {0}")]
    Database(#[from] GuardError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

pub struct EmployeeService<S> {
    service: S,
}

impl<S> EmployeeService<S>
where
    S: TransactionService,
    S::Native: EmployeeStore,
{
    pub fn new(service: S) -> Self {
        Self { service }
    }

    /// Apply both renames in one transaction.
    ///
    /// If either employee is missing or a write fails, the transaction is
    /// rolled back and neither rename is visible.
    pub fn update_two_employees_in_transaction(
        &self,
        first: &EmployeeNameUpdate,
        second: &EmployeeNameUpdate,
    ) -> Result<(), EmployeeError> {
        self.service
            .run_in_transaction(IsolationLevel::ReadCommitted, |tx| {
                let mut store = tx.executor()?;
                for update in [first, second] {
                    if store.update_employee_name(update.employee_id, &update.name)? == 0 {
                        return Err(EmployeeError::NotFound(update.employee_id));
                    }
                }
                Ok::<(), EmployeeError>(())
            })?;

        log::debug!(
            "renamed employees {} and {}",
            first.employee_id,
            second.employee_id
        );
        Ok(())
    }

    /// Committed name of an employee
    pub fn employee_name(&self, employee_id: Uuid) -> Result<Option<String>, EmployeeError> {
        self.service
            .run_in_transaction(IsolationLevel::ReadCommitted, |tx| {
                Ok(tx.executor()?.employee_name(employee_id)?)
            })
    }
}
