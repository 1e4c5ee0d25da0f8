// Workflow Engine - Entry points for activation, events, enrollments and passes

use chrono::{Duration, Utc};
use nurture_shared::{ActivationReport, EnrollmentPage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::actions::{ActionDispatcher, Collaborators};
use super::definition::{Workflow, WorkflowDocument, WorkflowStatus};
use super::enrollments::{EnrollOutcome, Enrollment, EnrollmentManager, EnrollmentStatus};
use super::errors::{AutomationError, AutomationResult};
use super::executor::{ExecutorConfig, StepGraphExecutor};
use super::matcher::TriggerMatcher;
use super::retry::RetryPolicy;
use super::scheduler::{DatePassReport, Scheduler, SchedulerConfig, WakePassReport};
use super::store::{EnrollmentStore, WorkflowStore};
use super::timing::Clock;
use super::triggers::DomainEvent;
use crate::pagination::PageRequest;

/// Tunables for the engine, normally read from the environment by `config`
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    pub event_queue_capacity: usize,
    pub scheduler_interval_secs: u64,
    pub scheduler_batch_size: i64,
    pub lease_ttl_secs: i64,
    pub dispatch_timeout_secs: u64,
    pub retry: RetryPolicy,
    pub hop_limit_floor: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            event_queue_capacity: 1024,
            scheduler_interval_secs: 30,
            scheduler_batch_size: 200,
            lease_ttl_secs: 300,
            dispatch_timeout_secs: 30,
            retry: RetryPolicy::default(),
            hop_limit_floor: 50,
        }
    }
}

pub struct WorkflowEngine {
    workflows: Arc<dyn WorkflowStore>,
    manager: Arc<EnrollmentManager>,
    matcher: TriggerMatcher,
    executor: Arc<StepGraphExecutor>,
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        enrollments: Arc<dyn EnrollmentStore>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let dispatch_timeout = effective_dispatch_timeout(&config);
        if dispatch_timeout < config.dispatch_timeout_secs {
            warn!(
                requested = config.dispatch_timeout_secs,
                capped = dispatch_timeout,
                lease_ttl_secs = config.lease_ttl_secs,
                "Dispatch timeout capped to half the lease TTL"
            );
        }
        let dispatcher = Arc::new(ActionDispatcher::new(
            collaborators,
            std::time::Duration::from_secs(dispatch_timeout),
        ));
        let manager = Arc::new(EnrollmentManager::new(
            enrollments.clone(),
            clock.clone(),
            Duration::seconds(config.lease_ttl_secs.max(1)),
        ));
        let executor = Arc::new(StepGraphExecutor::new(
            workflows.clone(),
            enrollments.clone(),
            manager.clone(),
            dispatcher.clone(),
            clock.clone(),
            ExecutorConfig {
                retry: config.retry.clone(),
                hop_limit_floor: config.hop_limit_floor,
                ..ExecutorConfig::default()
            },
        ));
        let matcher = TriggerMatcher::new(workflows.clone(), manager.clone(), dispatcher.clone());
        let scheduler = Scheduler::new(
            workflows.clone(),
            enrollments,
            manager.clone(),
            executor.clone(),
            dispatcher,
            clock.clone(),
            SchedulerConfig {
                batch_size: config.scheduler_batch_size,
                concurrency: config.workers,
            },
        );

        Self {
            workflows,
            manager,
            matcher,
            executor,
            scheduler,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<StepGraphExecutor> {
        &self.executor
    }

    pub async fn get_workflow(&self, id: Uuid) -> AutomationResult<Workflow> {
        self.workflows
            .get_workflow(id)
            .await?
            .ok_or(AutomationError::WorkflowNotFound(id))
    }

    /// Parse and store an editor document. Structural edits are refused while
    /// the workflow is active; the stored status is kept otherwise.
    pub async fn save_definition(&self, doc: WorkflowDocument) -> AutomationResult<Workflow> {
        let mut workflow =
            Workflow::from_document(doc).map_err(|issues| AutomationError::InvalidDefinition { issues })?;

        if let Some(existing) = self.workflows.get_workflow(workflow.id).await? {
            match existing.status {
                WorkflowStatus::Active => return Err(AutomationError::WorkflowActive(existing.id)),
                WorkflowStatus::Archived => {
                    return Err(AutomationError::InvalidTransition {
                        from: existing.status.as_str().to_string(),
                        to: WorkflowStatus::Draft.as_str().to_string(),
                    });
                }
                WorkflowStatus::Draft | WorkflowStatus::Paused => {}
            }
            workflow.status = existing.status;
            workflow.created_at = existing.created_at;
            workflow.updated_at = Some(self.clock.now());
        } else {
            workflow.created_at = self.clock.now();
        }

        let stored = self.workflows.save_workflow(&workflow).await?;
        info!(workflow_id = %stored.id, version = stored.version, "Workflow definition saved");
        Ok(stored)
    }

    /// Validation report without changing status
    pub async fn check_activation(&self, id: Uuid) -> AutomationResult<ActivationReport> {
        let workflow = self.get_workflow(id).await?;
        let issues = workflow.validate();
        Ok(ActivationReport {
            workflow_id: id,
            status: workflow.status.as_str().to_string(),
            activated: false,
            issues,
            checked_at: self.clock.now(),
        })
    }

    pub async fn activate(&self, id: Uuid) -> AutomationResult<ActivationReport> {
        let mut workflow = self.get_workflow(id).await?;
        if workflow.status == WorkflowStatus::Active {
            return Ok(self.report(&workflow, true));
        }
        ensure_transition(&workflow, WorkflowStatus::Active)?;

        let issues = workflow.validate();
        if !issues.is_empty() {
            info!(workflow_id = %id, issues = issues.len(), "Workflow activation rejected");
            return Err(AutomationError::InvalidDefinition { issues });
        }

        workflow.status = WorkflowStatus::Active;
        workflow.updated_at = Some(self.clock.now());
        let stored = self.workflows.save_workflow(&workflow).await?;
        info!(workflow_id = %id, version = stored.version, "Workflow activated");
        Ok(self.report(&stored, true))
    }

    pub async fn pause_workflow(&self, id: Uuid) -> AutomationResult<Workflow> {
        self.transition(id, WorkflowStatus::Paused).await
    }

    pub async fn archive_workflow(&self, id: Uuid) -> AutomationResult<Workflow> {
        self.transition(id, WorkflowStatus::Archived).await
    }

    async fn transition(&self, id: Uuid, to: WorkflowStatus) -> AutomationResult<Workflow> {
        let mut workflow = self.get_workflow(id).await?;
        if workflow.status == to {
            return Ok(workflow);
        }
        ensure_transition(&workflow, to)?;
        workflow.status = to;
        workflow.updated_at = Some(self.clock.now());
        let stored = self.workflows.save_workflow(&workflow).await?;
        info!(workflow_id = %id, status = to.as_str(), "Workflow status changed");
        Ok(stored)
    }

    fn report(&self, workflow: &Workflow, activated: bool) -> ActivationReport {
        ActivationReport {
            workflow_id: workflow.id,
            status: workflow.status.as_str().to_string(),
            activated,
            issues: Vec::new(),
            checked_at: self.clock.now(),
        }
    }

    /// Match an event and run every resulting enrollment up to its first
    /// suspension point.
    pub async fn handle_event(&self, event: &DomainEvent) -> AutomationResult<Vec<(Uuid, EnrollOutcome)>> {
        let matches = self.matcher.match_event(event).await?;
        let mut outcomes = Vec::with_capacity(matches.len());
        for (workflow, outcome) in matches {
            let outcome = self.start(&workflow, outcome).await;
            outcomes.push((workflow.id, outcome));
        }
        debug!(event_id = %event.event_id, enrollments = outcomes.len(), "Event handled");
        Ok(outcomes)
    }

    pub async fn enroll_manually(&self, workflow_id: Uuid, subject_id: Uuid) -> AutomationResult<EnrollOutcome> {
        let workflow = self.get_workflow(workflow_id).await?;
        let outcome = self.matcher.enroll_manually(&workflow, subject_id).await?;
        Ok(self.start(&workflow, outcome).await)
    }

    /// Forms collaborator entry point
    pub async fn submit_form(
        &self,
        tenant_id: Uuid,
        subject_id: Uuid,
        form_id: &str,
        fields: serde_json::Value,
    ) -> AutomationResult<Vec<(Uuid, EnrollOutcome)>> {
        let event = DomainEvent::form_submitted(tenant_id, subject_id, form_id, fields);
        self.handle_event(&event).await
    }

    /// Drive a fresh enrollment. A failed first drive leaves the enrollment
    /// leased; it is picked up again once the lease expires.
    async fn start(&self, workflow: &Workflow, outcome: EnrollOutcome) -> EnrollOutcome {
        let EnrollOutcome::Enrolled(enrollment) = outcome else {
            return outcome;
        };
        let id = enrollment.id;
        match self.executor.drive(workflow, enrollment.clone()).await {
            Ok(driven) => EnrollOutcome::Enrolled(driven),
            Err(e) => {
                error!(enrollment_id = %id, workflow_id = %workflow.id, error = %e, "Initial drive failed");
                EnrollOutcome::Enrolled(enrollment)
            }
        }
    }

    pub async fn list_enrollments(
        &self,
        workflow_id: Uuid,
        status: Option<EnrollmentStatus>,
        page: &PageRequest,
    ) -> AutomationResult<EnrollmentPage> {
        self.get_workflow(workflow_id).await?;
        self.manager.list(workflow_id, status, page).await
    }

    pub async fn get_enrollment(&self, id: Uuid) -> AutomationResult<Enrollment> {
        self.manager.get(id).await
    }

    pub async fn exit_enrollment(&self, id: Uuid) -> AutomationResult<Enrollment> {
        self.manager.exit(id).await
    }

    pub async fn pause_enrollment(&self, id: Uuid) -> AutomationResult<Enrollment> {
        self.manager.pause(id).await
    }

    pub async fn resume_enrollment(&self, id: Uuid) -> AutomationResult<Enrollment> {
        self.manager.resume(id).await
    }

    pub async fn run_due_pass(&self) -> AutomationResult<WakePassReport> {
        self.scheduler.run_due_pass().await
    }

    pub async fn run_date_trigger_pass(&self) -> AutomationResult<DatePassReport> {
        self.scheduler.run_date_trigger_pass().await
    }
}

fn ensure_transition(workflow: &Workflow, to: WorkflowStatus) -> AutomationResult<()> {
    if workflow.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(AutomationError::InvalidTransition {
            from: workflow.status.as_str().to_string(),
            to: to.as_str().to_string(),
        })
    }
}

/// Bounded event queue drained by a fixed set of workers. Events for one
/// subject always land on the same worker, so they are handled in arrival order.
pub struct WorkerPool {
    shards: Vec<mpsc::Sender<DomainEvent>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(engine: Arc<WorkflowEngine>) -> Self {
        let workers = engine.config.workers.max(1);
        let per_shard = (engine.config.event_queue_capacity / workers).max(1);

        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, mut rx) = mpsc::channel::<DomainEvent>(per_shard);
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let Err(e) = engine.handle_event(&event).await {
                        error!(worker, event_id = %event.event_id, error = %e, "Event handling failed");
                    }
                }
                debug!(worker, "Event worker stopped");
            }));
            shards.push(tx);
        }

        info!(workers, queue_per_worker = per_shard, "Event worker pool started");
        Self { shards, handles }
    }

    /// Cloneable submission handle for request handlers
    pub fn queue(&self) -> EventQueue {
        EventQueue {
            shards: self.shards.clone(),
        }
    }

    /// Stop accepting events and wait for queued ones to finish. Outstanding
    /// `EventQueue` clones must be dropped first.
    pub async fn shutdown(self) {
        drop(self.shards);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Event worker panicked");
            }
        }
        info!(at = %Utc::now(), "Event worker pool drained");
    }
}

#[derive(Clone)]
pub struct EventQueue {
    shards: Vec<mpsc::Sender<DomainEvent>>,
}

impl EventQueue {
    fn shard_for(&self, subject_id: Uuid) -> usize {
        (subject_id.as_u128() % self.shards.len() as u128) as usize
    }

    /// Queue an event; waits while the subject's shard is full.
    pub async fn submit(&self, event: DomainEvent) -> AutomationResult<()> {
        let shard = self.shard_for(event.subject_id);
        self.shards[shard]
            .send(event)
            .await
            .map_err(|_| AutomationError::QueueClosed)
    }
}

/// Dispatch timeout in seconds, clamped to `1..=lease_ttl / 2`
pub fn effective_dispatch_timeout(config: &EngineConfig) -> u64 {
    let ceiling = (config.lease_ttl_secs.max(1) as u64 / 2).max(1);
    config.dispatch_timeout_secs.clamp(1, ceiling)
}
