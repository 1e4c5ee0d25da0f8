// Automation error types

use nurture_shared::StepValidationIssue;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Record not found: {0}")]
    NotFound(Uuid),
    /// A second open enrollment for the same (workflow, subject) pair
    #[error("Conflict: {0}")]
    Conflict(String),
    /// The caller no longer holds the enrollment lease
    #[error("Lease lost on enrollment {0}")]
    LeaseLost(Uuid),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(Uuid),
    #[error("Enrollment not found: {0}")]
    EnrollmentNotFound(Uuid),
    #[error("Workflow definition has {} issue(s)", issues.len())]
    InvalidDefinition { issues: Vec<StepValidationIssue> },
    #[error("Cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("Workflow is active; pause it before editing its steps")]
    WorkflowActive(Uuid),
    #[error("Enrollment {0} is being processed, try again shortly")]
    EnrollmentBusy(Uuid),
    #[error("Collaborator call failed: {0}")]
    Collaborator(#[from] DispatchError),
    #[error("Event queue is shut down")]
    QueueClosed,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure reported by an action collaborator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Timeouts, rate limits, upstream outages; retried with backoff
    #[error("transient: {0}")]
    Transient(String),
    /// Invalid recipient, validation rejection; fails the enrollment at once
    #[error("permanent: {0}")]
    Permanent(String),
}

impl DispatchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatchError::Transient(_))
    }
}

pub type AutomationResult<T> = Result<T, AutomationError>;
