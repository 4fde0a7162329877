//! Executor error types

use super::lock::LockError;
use super::planner::PlanError;
use super::profile::ProfileError;
use crate::workflow::StoreError;

/// Errors that stop an invocation before its scripts report results
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Invalid invocation: {0}")]
    Plan(#[from] PlanError),

    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Graph store error: {0}")]
    Store(#[from] StoreError),
}

impl ExecutorError {
    /// Whether the error comes from the request, the profile or the graph
    /// rather than from the environment
    pub fn is_configuration(&self) -> bool {
        !matches!(self, ExecutorError::Lock(_))
    }
}
