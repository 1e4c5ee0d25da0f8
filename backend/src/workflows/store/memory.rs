use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use nurture_shared::EnrollmentStatusCounts;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{EnrollmentStore, WorkflowStore};
use crate::workflows::definition::{Workflow, WorkflowStatus};
use crate::workflows::enrollments::{Enrollment, EnrollmentStatus};
use crate::workflows::errors::StoreError;

/// Process-local store with the same semantics as the Postgres one
#[derive(Default)]
pub struct InMemoryAutomationStore {
    workflows: RwLock<HashMap<Uuid, Workflow>>,
    enrollments: RwLock<HashMap<Uuid, Enrollment>>,
    date_runs: RwLock<HashSet<(Uuid, Uuid, NaiveDate)>>,
}

impl InMemoryAutomationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryAutomationStore {
    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        Ok(self.workflows.read().await.get(&id).cloned())
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<Workflow, StoreError> {
        let mut workflows = self.workflows.write().await;
        let mut stored = workflow.clone();
        stored.version = workflows.get(&workflow.id).map(|w| w.version).unwrap_or(0) + 1;
        workflows.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn list_active_workflows(&self, tenant_id: Option<Uuid>) -> Result<Vec<Workflow>, StoreError> {
        let workflows = self.workflows.read().await;
        let mut active: Vec<Workflow> = workflows
            .values()
            .filter(|w| w.status == WorkflowStatus::Active)
            .filter(|w| tenant_id.is_none_or(|t| w.tenant_id == t))
            .cloned()
            .collect();
        active.sort_by_key(|w| w.created_at);
        Ok(active)
    }
}

#[async_trait]
impl EnrollmentStore for InMemoryAutomationStore {
    async fn insert_enrollment(&self, enrollment: &Enrollment) -> Result<(), StoreError> {
        let mut enrollments = self.enrollments.write().await;
        let duplicate = enrollments.values().any(|e| {
            e.workflow_id == enrollment.workflow_id
                && e.subject_id == enrollment.subject_id
                && e.status.is_open()
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "subject {} already enrolled in workflow {}",
                enrollment.subject_id, enrollment.workflow_id
            )));
        }
        enrollments.insert(enrollment.id, enrollment.clone());
        Ok(())
    }

    async fn get_enrollment(&self, id: Uuid) -> Result<Option<Enrollment>, StoreError> {
        Ok(self.enrollments.read().await.get(&id).cloned())
    }

    async fn find_open_enrollment(
        &self,
        workflow_id: Uuid,
        subject_id: Uuid,
    ) -> Result<Option<Enrollment>, StoreError> {
        Ok(self
            .enrollments
            .read()
            .await
            .values()
            .find(|e| e.workflow_id == workflow_id && e.subject_id == subject_id && e.status.is_open())
            .cloned())
    }

    async fn has_terminal_enrollment(&self, workflow_id: Uuid, subject_id: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .enrollments
            .read()
            .await
            .values()
            .any(|e| e.workflow_id == workflow_id && e.subject_id == subject_id && e.status.is_terminal()))
    }

    async fn count_active(&self, workflow_id: Uuid) -> Result<i64, StoreError> {
        Ok(self
            .enrollments
            .read()
            .await
            .values()
            .filter(|e| e.workflow_id == workflow_id && e.status == EnrollmentStatus::Active)
            .count() as i64)
    }

    async fn status_counts(&self, workflow_id: Uuid) -> Result<EnrollmentStatusCounts, StoreError> {
        let enrollments = self.enrollments.read().await;
        let mut counts = EnrollmentStatusCounts::default();
        for e in enrollments.values().filter(|e| e.workflow_id == workflow_id) {
            match e.status {
                EnrollmentStatus::Active => counts.active += 1,
                EnrollmentStatus::Paused => counts.paused += 1,
                EnrollmentStatus::Completed => counts.completed += 1,
                EnrollmentStatus::Exited => counts.exited += 1,
                EnrollmentStatus::Failed => counts.failed += 1,
            }
            counts.total += 1;
        }
        Ok(counts)
    }

    async fn list_enrollments(
        &self,
        workflow_id: Uuid,
        status: Option<EnrollmentStatus>,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<Enrollment>, i64), StoreError> {
        let enrollments = self.enrollments.read().await;
        let mut matching: Vec<&Enrollment> = enrollments
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .filter(|e| status.is_none_or(|s| e.status == s))
            .collect();
        matching.sort_by(|a, b| b.enrolled_at.cmp(&a.enrolled_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn due_enrollments(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, StoreError> {
        let enrollments = self.enrollments.read().await;
        let mut due: Vec<&Enrollment> = enrollments
            .values()
            .filter(|e| e.lease_is_free(now))
            .filter(|e| match e.status {
                EnrollmentStatus::Active => {
                    e.exit_requested || e.next_step_at.is_none_or(|at| at <= now)
                }
                EnrollmentStatus::Paused => e.exit_requested,
                _ => false,
            })
            .collect();
        due.sort_by_key(|e| e.next_step_at.unwrap_or(e.enrolled_at));
        Ok(due.into_iter().take(limit.max(0) as usize).map(|e| e.id).collect())
    }

    async fn try_acquire_lease(
        &self,
        id: Uuid,
        holder: Uuid,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Enrollment>, StoreError> {
        let mut enrollments = self.enrollments.write().await;
        let Some(enrollment) = enrollments.get_mut(&id) else {
            return Err(StoreError::NotFound(id));
        };
        if !enrollment.lease_is_free(now) {
            return Ok(None);
        }
        enrollment.lease_holder = Some(holder);
        enrollment.lease_expires_at = Some(until);
        Ok(Some(enrollment.clone()))
    }

    async fn renew_lease(
        &self,
        id: Uuid,
        holder: Uuid,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut enrollments = self.enrollments.write().await;
        let stored = enrollments.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if stored.lease_holder != Some(holder) {
            return Err(StoreError::LeaseLost(id));
        }
        stored.lease_expires_at = Some(until.max(now));
        Ok(())
    }

    async fn save_leased(&self, enrollment: &Enrollment, holder: Uuid) -> Result<(), StoreError> {
        let mut enrollments = self.enrollments.write().await;
        let Some(stored) = enrollments.get_mut(&enrollment.id) else {
            return Err(StoreError::NotFound(enrollment.id));
        };
        if stored.lease_holder != Some(holder) {
            return Err(StoreError::LeaseLost(enrollment.id));
        }
        let exit_requested = stored.exit_requested;
        let lease_expires_at = stored.lease_expires_at;
        *stored = enrollment.clone();
        stored.exit_requested = exit_requested;
        stored.lease_holder = Some(holder);
        stored.lease_expires_at = lease_expires_at;
        Ok(())
    }

    async fn release_lease(&self, id: Uuid, holder: Uuid) -> Result<(), StoreError> {
        let mut enrollments = self.enrollments.write().await;
        if let Some(stored) = enrollments.get_mut(&id) {
            if stored.lease_holder == Some(holder) {
                stored.lease_holder = None;
                stored.lease_expires_at = None;
            }
        }
        Ok(())
    }

    async fn request_exit(&self, id: Uuid) -> Result<(), StoreError> {
        let mut enrollments = self.enrollments.write().await;
        let stored = enrollments.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        stored.exit_requested = true;
        Ok(())
    }

    async fn is_exit_requested(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .enrollments
            .read()
            .await
            .get(&id)
            .is_some_and(|e| e.exit_requested))
    }

    async fn record_date_trigger_run(
        &self,
        workflow_id: Uuid,
        subject_id: Uuid,
        qualifying_date: NaiveDate,
    ) -> Result<bool, StoreError> {
        Ok(self
            .date_runs
            .write()
            .await
            .insert((workflow_id, subject_id, qualifying_date)))
    }
}
