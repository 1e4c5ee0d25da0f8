// Enrollment Manager - Enrollment records and their lifecycle

use chrono::{DateTime, Duration, Utc};
use nurture_shared::{EnrollmentPage, EnrollmentSummary, StepValidationIssue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::definition::{Workflow, WorkflowStatus};
use super::errors::{AutomationError, AutomationResult, StoreError};
use super::store::EnrollmentStore;
use super::timing::Clock;
use crate::pagination::PageRequest;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
    Exited,
    Failed,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Paused => "paused",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Exited => "exited",
            EnrollmentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EnrollmentStatus::Completed | EnrollmentStatus::Exited | EnrollmentStatus::Failed
        )
    }

    /// Active and paused enrollments count against the one-open-enrollment rule
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }
}

impl FromStr for EnrollmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(EnrollmentStatus::Active),
            "paused" => Ok(EnrollmentStatus::Paused),
            "completed" => Ok(EnrollmentStatus::Completed),
            "exited" => Ok(EnrollmentStatus::Exited),
            "failed" => Ok(EnrollmentStatus::Failed),
            other => Err(format!("unknown enrollment status '{}'", other)),
        }
    }
}

/// Reason codes recorded when an enrollment fails
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ConfigurationError,
    PermanentDispatchFailure,
    RetriesExhausted,
    GraphCycleSuspected,
    WorkflowUnavailable,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ConfigurationError => "configuration_error",
            FailureReason::PermanentDispatchFailure => "permanent_dispatch_failure",
            FailureReason::RetriesExhausted => "retries_exhausted",
            FailureReason::GraphCycleSuspected => "graph_cycle_suspected",
            FailureReason::WorkflowUnavailable => "workflow_unavailable",
        }
    }
}

/// How the subject got into the workflow
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentSource {
    #[default]
    Event,
    Manual,
    Form,
    DateTrigger,
}

/// One executed step in the enrollment's history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub step_id: String,
    pub kind: String,
    pub outcome: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Enrollment {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub tenant_id: Uuid,
    pub subject_id: Uuid,
    pub status: EnrollmentStatus,
    pub current_step_id: Option<String>,
    /// Number of steps advanced so far
    pub current_step_index: i64,
    /// Failed dispatch attempts on the current step
    pub attempt: u32,
    pub enrolled_at: DateTime<Utc>,
    /// Set only while waiting (wait step, retry backoff, paused workflow)
    pub next_step_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<FailureReason>,
    pub last_error: Option<String>,
    /// Recorded random split picks, keyed by split step id
    #[serde(default)]
    pub split_choices: HashMap<String, String>,
    #[serde(default)]
    pub history: Vec<StepRecord>,
    #[serde(default)]
    pub exit_requested: bool,
    pub lease_holder: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: EnrollmentSource,
}

impl Enrollment {
    pub fn new(workflow: &Workflow, subject_id: Uuid, entry_step_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            tenant_id: workflow.tenant_id,
            subject_id,
            status: EnrollmentStatus::Active,
            current_step_id: Some(entry_step_id.to_string()),
            current_step_index: 0,
            attempt: 0,
            enrolled_at: now,
            next_step_at: None,
            completed_at: None,
            exited_at: None,
            failure_reason: None,
            last_error: None,
            split_choices: HashMap::new(),
            history: Vec::new(),
            exit_requested: false,
            lease_holder: None,
            lease_expires_at: None,
            source: EnrollmentSource::Event,
        }
    }

    pub fn lease_is_free(&self, now: DateTime<Utc>) -> bool {
        match (self.lease_holder, self.lease_expires_at) {
            (None, _) => true,
            (Some(_), Some(expires)) => expires <= now,
            (Some(_), None) => false,
        }
    }

    pub fn record(&mut self, step_id: &str, kind: &str, outcome: &str, at: DateTime<Utc>, detail: Option<String>) {
        self.history.push(StepRecord {
            step_id: step_id.to_string(),
            kind: kind.to_string(),
            outcome: outcome.to_string(),
            at,
            detail,
        });
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = EnrollmentStatus::Completed;
        self.completed_at = Some(now);
        self.next_step_at = None;
    }

    pub fn mark_exited(&mut self, now: DateTime<Utc>) {
        self.status = EnrollmentStatus::Exited;
        self.exited_at = Some(now);
        self.next_step_at = None;
    }

    pub fn mark_failed(&mut self, reason: FailureReason, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = EnrollmentStatus::Failed;
        self.failure_reason = Some(reason);
        self.last_error = Some(error.into());
        self.completed_at = Some(now);
        self.next_step_at = None;
    }

    pub fn summary(&self) -> EnrollmentSummary {
        EnrollmentSummary {
            id: self.id,
            workflow_id: self.workflow_id,
            subject_id: self.subject_id,
            status: self.status.as_str().to_string(),
            current_step_id: self.current_step_id.clone(),
            current_step_index: self.current_step_index,
            enrolled_at: self.enrolled_at,
            next_step_at: self.next_step_at,
            completed_at: self.completed_at,
            exited_at: self.exited_at,
            failure_reason: self.failure_reason.map(|r| r.as_str().to_string()),
            last_error: self.last_error.clone(),
        }
    }
}

/// Result of an enrollment request. Everything except `Enrolled` is a normal
/// rejection, not an error.
#[derive(Debug, Clone)]
pub enum EnrollOutcome {
    /// Created; the returned enrollment still holds its creation lease
    Enrolled(Enrollment),
    AlreadyEnrolled(Enrollment),
    LimitReached,
    ReEnrollmentBlocked,
    WorkflowInactive,
    FilteredOut,
}

impl EnrollOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollOutcome::Enrolled(_) => "enrolled",
            EnrollOutcome::AlreadyEnrolled(_) => "already_enrolled",
            EnrollOutcome::LimitReached => "limit_reached",
            EnrollOutcome::ReEnrollmentBlocked => "re_enrollment_blocked",
            EnrollOutcome::WorkflowInactive => "workflow_inactive",
            EnrollOutcome::FilteredOut => "filtered_out",
        }
    }

    pub fn enrollment(&self) -> Option<&Enrollment> {
        match self {
            EnrollOutcome::Enrolled(e) | EnrollOutcome::AlreadyEnrolled(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_enrolled(&self) -> bool {
        matches!(self, EnrollOutcome::Enrolled(_))
    }
}

pub struct EnrollmentManager {
    store: Arc<dyn EnrollmentStore>,
    clock: Arc<dyn Clock>,
    lease_ttl: Duration,
}

impl EnrollmentManager {
    pub fn new(store: Arc<dyn EnrollmentStore>, clock: Arc<dyn Clock>, lease_ttl: Duration) -> Self {
        Self { store, clock, lease_ttl }
    }

    /// Create an enrollment if the uniqueness, re-enrollment and limit rules allow it.
    pub async fn enroll(
        &self,
        workflow: &Workflow,
        subject_id: Uuid,
        source: EnrollmentSource,
    ) -> AutomationResult<EnrollOutcome> {
        if workflow.status != WorkflowStatus::Active {
            return Ok(EnrollOutcome::WorkflowInactive);
        }

        if let Some(open) = self.store.find_open_enrollment(workflow.id, subject_id).await? {
            debug!(workflow_id = %workflow.id, subject_id = %subject_id, "Subject already enrolled");
            return Ok(EnrollOutcome::AlreadyEnrolled(open));
        }

        if !workflow.settings.allow_re_enrollment
            && self.store.has_terminal_enrollment(workflow.id, subject_id).await?
        {
            info!(workflow_id = %workflow.id, subject_id = %subject_id, "Enrollment rejected: re-enrollment not allowed");
            return Ok(EnrollOutcome::ReEnrollmentBlocked);
        }

        if let Some(limit) = workflow.settings.enrollment_limit {
            let active = self.store.count_active(workflow.id).await?;
            if active >= i64::from(limit) {
                info!(workflow_id = %workflow.id, active, limit, "Enrollment rejected: limit reached");
                return Ok(EnrollOutcome::LimitReached);
            }
        }

        let entry = workflow.entry_step_id().ok_or_else(|| AutomationError::InvalidDefinition {
            issues: vec![StepValidationIssue::workflow("steps", "workflow has no steps")],
        })?;

        let now = self.clock.now();
        let mut enrollment = Enrollment::new(workflow, subject_id, entry, now);
        enrollment.source = source;
        enrollment.lease_holder = Some(Uuid::new_v4());
        enrollment.lease_expires_at = Some(now + self.lease_ttl);

        match self.store.insert_enrollment(&enrollment).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                // Lost a race against a concurrent enrollment of the same subject
                return match self.store.find_open_enrollment(workflow.id, subject_id).await? {
                    Some(open) => Ok(EnrollOutcome::AlreadyEnrolled(open)),
                    None => Ok(EnrollOutcome::ReEnrollmentBlocked),
                };
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            workflow_id = %workflow.id,
            enrollment_id = %enrollment.id,
            subject_id = %subject_id,
            source = ?source,
            "Enrollment created"
        );
        Ok(EnrollOutcome::Enrolled(enrollment))
    }

    pub async fn get(&self, enrollment_id: Uuid) -> AutomationResult<Enrollment> {
        self.store
            .get_enrollment(enrollment_id)
            .await?
            .ok_or(AutomationError::EnrollmentNotFound(enrollment_id))
    }

    /// Claim the enrollment for exclusive processing. `None` means another
    /// worker holds an unexpired lease.
    pub async fn acquire(&self, enrollment_id: Uuid) -> AutomationResult<Option<Enrollment>> {
        let now = self.clock.now();
        let holder = Uuid::new_v4();
        Ok(self
            .store
            .try_acquire_lease(enrollment_id, holder, now + self.lease_ttl, now)
            .await?)
    }

    /// Push a held lease out by another TTL. Fails with `LeaseLost` once
    /// another worker has claimed the enrollment.
    pub async fn renew(&self, enrollment: &mut Enrollment) -> AutomationResult<()> {
        let holder = enrollment.lease_holder.ok_or(StoreError::LeaseLost(enrollment.id))?;
        let now = self.clock.now();
        let until = now + self.lease_ttl;
        self.store.renew_lease(enrollment.id, holder, until, now).await?;
        enrollment.lease_expires_at = Some(until);
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Persist the leased enrollment and give up the lease.
    pub async fn release(&self, enrollment: &mut Enrollment) -> AutomationResult<()> {
        let Some(holder) = enrollment.lease_holder else {
            return Ok(());
        };
        self.store.save_leased(enrollment, holder).await?;
        self.store.release_lease(enrollment.id, holder).await?;
        enrollment.lease_holder = None;
        enrollment.lease_expires_at = None;
        Ok(())
    }

    /// Operator removal. Idempotent for terminal enrollments; when another
    /// worker holds the lease, the exit lands before its next step.
    pub async fn exit(&self, enrollment_id: Uuid) -> AutomationResult<Enrollment> {
        let current = self.get(enrollment_id).await?;
        if current.status.is_terminal() {
            return Ok(current);
        }

        self.store.request_exit(enrollment_id).await?;

        match self.acquire(enrollment_id).await? {
            Some(mut leased) => {
                if !leased.status.is_terminal() {
                    leased.mark_exited(self.clock.now());
                    info!(enrollment_id = %enrollment_id, workflow_id = %leased.workflow_id, "Enrollment exited");
                }
                self.release(&mut leased).await?;
                Ok(leased)
            }
            None => {
                info!(enrollment_id = %enrollment_id, "Exit requested while enrollment is in flight");
                self.get(enrollment_id).await
            }
        }
    }

    pub async fn pause(&self, enrollment_id: Uuid) -> AutomationResult<Enrollment> {
        self.transition_operator(enrollment_id, EnrollmentStatus::Active, EnrollmentStatus::Paused)
            .await
    }

    pub async fn resume(&self, enrollment_id: Uuid) -> AutomationResult<Enrollment> {
        self.transition_operator(enrollment_id, EnrollmentStatus::Paused, EnrollmentStatus::Active)
            .await
    }

    async fn transition_operator(
        &self,
        enrollment_id: Uuid,
        from: EnrollmentStatus,
        to: EnrollmentStatus,
    ) -> AutomationResult<Enrollment> {
        let current = self.get(enrollment_id).await?;
        if current.status == to {
            return Ok(current);
        }
        if current.status != from {
            return Err(AutomationError::InvalidTransition {
                from: current.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        let mut leased = self
            .acquire(enrollment_id)
            .await?
            .ok_or(AutomationError::EnrollmentBusy(enrollment_id))?;

        if leased.status != from {
            let status = leased.status;
            self.release(&mut leased).await?;
            return Err(AutomationError::InvalidTransition {
                from: status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        leased.status = to;
        if to == EnrollmentStatus::Active && leased.next_step_at.is_none() {
            leased.next_step_at = Some(self.clock.now());
        }
        self.release(&mut leased).await?;

        info!(enrollment_id = %enrollment_id, status = to.as_str(), "Enrollment status changed by operator");
        Ok(leased)
    }

    pub async fn list(
        &self,
        workflow_id: Uuid,
        status: Option<EnrollmentStatus>,
        page: &PageRequest,
    ) -> AutomationResult<EnrollmentPage> {
        let (rows, total) = self
            .store
            .list_enrollments(workflow_id, status, page.offset(), page.limit())
            .await?;
        let counts = self.store.status_counts(workflow_id).await?;

        Ok(EnrollmentPage {
            enrollments: rows.iter().map(Enrollment::summary).collect(),
            counts,
            page: page.page(),
            page_size: page.limit(),
            total,
            total_pages: page.total_pages(total),
        })
    }
}
