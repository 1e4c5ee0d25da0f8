// Automation persistence - workflow documents and enrollment records

mod memory;
mod postgres;

pub use memory::InMemoryAutomationStore;
pub use postgres::PgAutomationStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use nurture_shared::EnrollmentStatusCounts;
use uuid::Uuid;

use super::definition::Workflow;
use super::enrollments::{Enrollment, EnrollmentStatus};
use super::errors::StoreError;

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError>;

    /// Insert or replace the document, bumping its version. Returns the stored copy.
    async fn save_workflow(&self, workflow: &Workflow) -> Result<Workflow, StoreError>;

    /// Active workflows, optionally restricted to one tenant
    async fn list_active_workflows(&self, tenant_id: Option<Uuid>) -> Result<Vec<Workflow>, StoreError>;
}

#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    /// Fails with `StoreError::Conflict` if the subject already has an
    /// active or paused enrollment in the workflow.
    async fn insert_enrollment(&self, enrollment: &Enrollment) -> Result<(), StoreError>;

    async fn get_enrollment(&self, id: Uuid) -> Result<Option<Enrollment>, StoreError>;

    async fn find_open_enrollment(
        &self,
        workflow_id: Uuid,
        subject_id: Uuid,
    ) -> Result<Option<Enrollment>, StoreError>;

    async fn has_terminal_enrollment(&self, workflow_id: Uuid, subject_id: Uuid) -> Result<bool, StoreError>;

    async fn count_active(&self, workflow_id: Uuid) -> Result<i64, StoreError>;

    async fn status_counts(&self, workflow_id: Uuid) -> Result<EnrollmentStatusCounts, StoreError>;

    /// One page of enrollments, newest first, plus the filtered total
    async fn list_enrollments(
        &self,
        workflow_id: Uuid,
        status: Option<EnrollmentStatus>,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<Enrollment>, i64), StoreError>;

    /// Open enrollments that need a wake-up: due waits, orphaned drives whose
    /// lease expired, and pending exit requests. Leased ones are skipped.
    async fn due_enrollments(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, StoreError>;

    /// Claim the lease when it is free or expired; returns the leased record.
    async fn try_acquire_lease(
        &self,
        id: Uuid,
        holder: Uuid,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Enrollment>, StoreError>;

    /// Extend a held lease to `until`. An expired lease that nobody else has
    /// claimed still belongs to `holder`; any other holder means `LeaseLost`.
    async fn renew_lease(
        &self,
        id: Uuid,
        holder: Uuid,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Write the lease-holder-owned fields. Never clears `exit_requested`.
    async fn save_leased(&self, enrollment: &Enrollment, holder: Uuid) -> Result<(), StoreError>;

    async fn release_lease(&self, id: Uuid, holder: Uuid) -> Result<(), StoreError>;

    /// Flag an enrollment for cooperative exit; any caller may set it.
    async fn request_exit(&self, id: Uuid) -> Result<(), StoreError>;

    async fn is_exit_requested(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Record that a date trigger fired for the subject on `qualifying_date`.
    /// Returns false when it already had.
    async fn record_date_trigger_run(
        &self,
        workflow_id: Uuid,
        subject_id: Uuid,
        qualifying_date: NaiveDate,
    ) -> Result<bool, StoreError>;
}
