// Step Graph Executor - Drives one leased enrollment through the step graph

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::actions::ActionDispatcher;
use super::definition::{StepGraph, Workflow, WorkflowStatus};
use super::enrollments::{Enrollment, EnrollmentManager, EnrollmentStatus, FailureReason};
use super::errors::{AutomationError, AutomationResult, DispatchError, StoreError};
use super::retry::RetryPolicy;
use super::steps::{Branch, SplitMode, Step, StepId, StepKind};
use super::store::{EnrollmentStore, WorkflowStore};
use super::timing::{Clock, MAX_WAIT_SECS};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub retry: RetryPolicy,
    /// Minimum number of steps allowed per pass
    pub hop_limit_floor: usize,
    /// How long to park enrollments of a paused workflow before checking again
    pub paused_workflow_recheck: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            hop_limit_floor: 50,
            paused_workflow_recheck: Duration::minutes(15),
        }
    }
}

impl ExecutorConfig {
    pub fn hop_limit(&self, step_count: usize) -> usize {
        self.hop_limit_floor.max(step_count.saturating_mul(2))
    }
}

/// Everything a single step evaluation may look at. Built per pass, never shared.
pub struct ExecutionContext<'a> {
    pub workflow: &'a Workflow,
    pub graph: StepGraph<'a>,
    pub enrollment: Enrollment,
    pub holder: Uuid,
    pub dispatcher: &'a ActionDispatcher,
    /// Subject record as of the start of the pass
    pub record: serde_json::Value,
    pub now: DateTime<Utc>,
}

/// What one step asks the driver to do next
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Move on now; `None` means the graph is exhausted
    Advance(Option<StepId>),
    /// Park until `until`, then resume at `next`
    Suspend { until: DateTime<Utc>, next: Option<StepId> },
    /// Transient failure with attempts left; retry the same step at `at`
    Retry { at: DateTime<Utc>, attempt: u32, error: String },
    Complete,
    Fail { reason: FailureReason, error: String },
}

/// Result of a scheduler wake-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    /// The pass ran; the enrollment ended in this status
    Driven(EnrollmentStatus),
    /// Another worker holds the lease
    Busy,
    /// Not due yet, paused, or already terminal
    Skipped,
    /// Workflow paused; wake-up pushed back
    Deferred,
}

pub struct StepGraphExecutor {
    workflows: Arc<dyn WorkflowStore>,
    enrollments: Arc<dyn EnrollmentStore>,
    manager: Arc<EnrollmentManager>,
    dispatcher: Arc<ActionDispatcher>,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
    /// Enrollments with a pass running in this process
    in_flight: Mutex<HashSet<Uuid>>,
}

/// Marks an enrollment as being driven until dropped
struct InFlight<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap_or_else(|e| e.into_inner()).remove(&self.id);
    }
}

impl StepGraphExecutor {
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        enrollments: Arc<dyn EnrollmentStore>,
        manager: Arc<EnrollmentManager>,
        dispatcher: Arc<ActionDispatcher>,
        clock: Arc<dyn Clock>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            workflows,
            enrollments,
            manager,
            dispatcher,
            clock,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, enrollment_id: Uuid) -> Option<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(enrollment_id) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            id: enrollment_id,
        })
    }

    /// Scheduler entry point: lease the enrollment and continue it if it is due.
    pub async fn wake(&self, enrollment_id: Uuid) -> AutomationResult<WakeOutcome> {
        // A pass already running here may have outlived its lease; leave it be
        let Some(_claim) = self.claim(enrollment_id) else {
            debug!(enrollment_id = %enrollment_id, "Wake-up skipped: pass already running");
            return Ok(WakeOutcome::Busy);
        };
        let Some(mut enrollment) = self.manager.acquire(enrollment_id).await? else {
            debug!(enrollment_id = %enrollment_id, "Wake-up skipped: lease held elsewhere");
            return Ok(WakeOutcome::Busy);
        };
        let now = self.clock.now();

        if enrollment.status.is_open() && enrollment.exit_requested {
            enrollment.mark_exited(now);
            self.manager.release(&mut enrollment).await?;
            info!(enrollment_id = %enrollment_id, "Enrollment exited on wake-up");
            return Ok(WakeOutcome::Driven(EnrollmentStatus::Exited));
        }

        let not_due = enrollment.next_step_at.is_some_and(|at| at > now);
        if enrollment.status != EnrollmentStatus::Active || not_due {
            self.manager.release(&mut enrollment).await?;
            return Ok(WakeOutcome::Skipped);
        }

        let Some(workflow) = self.workflows.get_workflow(enrollment.workflow_id).await? else {
            enrollment.mark_failed(FailureReason::WorkflowUnavailable, "workflow no longer exists", now);
            self.manager.release(&mut enrollment).await?;
            return Ok(WakeOutcome::Driven(EnrollmentStatus::Failed));
        };

        match workflow.status {
            WorkflowStatus::Active => {}
            WorkflowStatus::Archived => {
                enrollment.mark_exited(now);
                self.manager.release(&mut enrollment).await?;
                info!(enrollment_id = %enrollment_id, workflow_id = %workflow.id, "Enrollment exited: workflow archived");
                return Ok(WakeOutcome::Driven(EnrollmentStatus::Exited));
            }
            WorkflowStatus::Paused | WorkflowStatus::Draft => {
                enrollment.next_step_at = Some(now + self.config.paused_workflow_recheck);
                self.manager.release(&mut enrollment).await?;
                debug!(enrollment_id = %enrollment_id, workflow_id = %workflow.id, "Wake-up deferred: workflow not active");
                return Ok(WakeOutcome::Deferred);
            }
        }

        enrollment.next_step_at = None;
        let driven = self.drive_claimed(&workflow, enrollment).await?;
        Ok(WakeOutcome::Driven(driven.status))
    }

    /// Run the enrollment forward until it suspends or terminates, persisting
    /// after every transition. The enrollment must carry its lease.
    pub async fn drive(&self, workflow: &Workflow, enrollment: Enrollment) -> AutomationResult<Enrollment> {
        let Some(_claim) = self.claim(enrollment.id) else {
            return Err(AutomationError::EnrollmentBusy(enrollment.id));
        };
        self.drive_claimed(workflow, enrollment).await
    }

    async fn drive_claimed(&self, workflow: &Workflow, enrollment: Enrollment) -> AutomationResult<Enrollment> {
        let holder = enrollment.lease_holder.ok_or(StoreError::LeaseLost(enrollment.id))?;
        let now = self.clock.now();

        let record = match self.dispatcher.fetch_record(enrollment.subject_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(enrollment_id = %enrollment.id, error = %e, "Subject record unavailable");
                let mut enrollment = enrollment;
                let outcome = self.failure_outcome(&enrollment, e, now);
                self.apply_terminal_or_retry(&mut enrollment, outcome, now);
                self.manager.release(&mut enrollment).await?;
                return Ok(enrollment);
            }
        };

        let mut ctx = ExecutionContext {
            workflow,
            graph: StepGraph::new(workflow),
            enrollment,
            holder,
            dispatcher: &self.dispatcher,
            record,
            now,
        };

        self.run(&mut ctx).await?;

        let mut enrollment = ctx.enrollment;
        self.manager.release(&mut enrollment).await?;
        Ok(enrollment)
    }

    async fn run(&self, ctx: &mut ExecutionContext<'_>) -> AutomationResult<()> {
        let hop_limit = self.config.hop_limit(ctx.graph.len());
        let mut hops = 0usize;

        loop {
            ctx.now = self.clock.now();

            if self.enrollments.is_exit_requested(ctx.enrollment.id).await? {
                ctx.enrollment.mark_exited(ctx.now);
                info!(enrollment_id = %ctx.enrollment.id, "Enrollment exited before next step");
                return Ok(());
            }

            let Some(step_id) = ctx.enrollment.current_step_id.clone() else {
                self.complete(ctx);
                return Ok(());
            };

            let Some(step) = ctx.graph.get(&step_id) else {
                let message = format!("step '{}' does not exist", step_id);
                error!(enrollment_id = %ctx.enrollment.id, workflow_id = %ctx.workflow.id, step_id = %step_id, "Unresolved step reference");
                ctx.enrollment.mark_failed(FailureReason::ConfigurationError, message, ctx.now);
                return Ok(());
            };

            // Every step counts, so plain action chains cannot loop forever
            hops += 1;
            if hops > hop_limit {
                warn!(
                    enrollment_id = %ctx.enrollment.id,
                    workflow_id = %ctx.workflow.id,
                    hop_limit,
                    "Loop guard tripped"
                );
                ctx.enrollment.mark_failed(
                    FailureReason::GraphCycleSuspected,
                    format!("more than {} steps in one pass", hop_limit),
                    ctx.now,
                );
                return Ok(());
            }

            if let Err(e) = self.manager.renew(&mut ctx.enrollment).await {
                warn!(enrollment_id = %ctx.enrollment.id, step_id = %step.id, error = %e, "Lease lost; abandoning pass");
                return Err(e);
            }

            let (outcome, action_detail) = self.execute_step(step, ctx).await;
            debug!(
                enrollment_id = %ctx.enrollment.id,
                step_id = %step.id,
                step_kind = step.kind.name(),
                index = ctx.enrollment.current_step_index,
                outcome = ?outcome,
                "Step executed"
            );

            match outcome {
                StepOutcome::Advance(next) => {
                    let label = if step.kind.is_action() { "succeeded" } else { "evaluated" };
                    ctx.enrollment.record(&step.id, step.kind.name(), label, ctx.now, action_detail);
                    ctx.enrollment.current_step_id = next;
                    ctx.enrollment.current_step_index += 1;
                    ctx.enrollment.attempt = 0;
                    ctx.enrollment.last_error = None;
                    self.enrollments.save_leased(&ctx.enrollment, ctx.holder).await?;
                }
                StepOutcome::Suspend { until, next } => {
                    ctx.enrollment.record(&step.id, step.kind.name(), "scheduled", ctx.now, Some(until.to_rfc3339()));
                    ctx.enrollment.current_step_id = next;
                    ctx.enrollment.current_step_index += 1;
                    ctx.enrollment.attempt = 0;
                    ctx.enrollment.next_step_at = Some(until);
                    info!(enrollment_id = %ctx.enrollment.id, step_id = %step.id, due_at = %until, "Wait scheduled");
                    return Ok(());
                }
                StepOutcome::Complete => {
                    ctx.enrollment.record(&step.id, step.kind.name(), "completed", ctx.now, None);
                    self.complete(ctx);
                    return Ok(());
                }
                outcome @ (StepOutcome::Retry { .. } | StepOutcome::Fail { .. }) => {
                    ctx.enrollment.record(&step.id, step.kind.name(), "failed", ctx.now, outcome_error(&outcome));
                    let now = ctx.now;
                    self.apply_terminal_or_retry(&mut ctx.enrollment, outcome, now);
                    return Ok(());
                }
            }
        }
    }

    /// Evaluate one step. Successful actions also hand back their result as
    /// a history detail.
    async fn execute_step(&self, step: &Step, ctx: &mut ExecutionContext<'_>) -> (StepOutcome, Option<String>) {
        if step.kind.is_action() {
            return match ctx
                .dispatcher
                .dispatch(&step.kind, ctx.enrollment.subject_id, &ctx.record, ctx.now)
                .await
            {
                Ok(result) => {
                    debug!(step_id = %step.id, duration_ms = result.duration_ms, "Action dispatched");
                    let detail = result.output.map(|output| output.to_string());
                    (StepOutcome::Advance(step.next_step_id.clone()), detail)
                }
                Err(e) => (self.failure_outcome(&ctx.enrollment, e, ctx.now), None),
            };
        }
        (self.evaluate_control(step, ctx), None)
    }

    fn evaluate_control(&self, step: &Step, ctx: &mut ExecutionContext<'_>) -> StepOutcome {
        match &step.kind {
            StepKind::Wait(config) => {
                let delay = config.unit.duration(config.amount);
                let until = if delay.num_seconds() > MAX_WAIT_SECS {
                    None
                } else {
                    ctx.now.checked_add_signed(delay)
                };
                let Some(mut until) = until else {
                    return StepOutcome::Fail {
                        reason: FailureReason::ConfigurationError,
                        error: format!("wait step '{}' is longer than the maximum wait", step.id),
                    };
                };
                if config.working_hours_only {
                    if let Some(hours) = &ctx.workflow.settings.working_hours {
                        until = hours.clamp_forward(until, ctx.workflow.settings.offset());
                    }
                }
                StepOutcome::Suspend {
                    until,
                    next: step.next_step_id.clone(),
                }
            }
            StepKind::Condition => {
                let next = step
                    .branches
                    .iter()
                    .find(|b| b.predicate.as_ref().is_none_or(|p| p.evaluate(&ctx.record)))
                    .map(|b| b.next_step_id.clone())
                    .unwrap_or_else(|| step.next_step_id.clone());
                StepOutcome::Advance(next)
            }
            StepKind::Split(config) => match choose_split_branch(step, config.mode, &mut ctx.enrollment) {
                Some(branch) => StepOutcome::Advance(branch.next_step_id.clone()),
                None => StepOutcome::Fail {
                    reason: FailureReason::ConfigurationError,
                    error: format!("split step '{}' has no branches", step.id),
                },
            },
            StepKind::Jump(config) => StepOutcome::Advance(Some(config.target_step_id.clone())),
            StepKind::End => StepOutcome::Complete,
            // Action kinds are dispatched by execute_step
            _ => StepOutcome::Fail {
                reason: FailureReason::ConfigurationError,
                error: format!("unsupported step kind '{}'", step.kind.name()),
            },
        }
    }

    fn failure_outcome(&self, enrollment: &Enrollment, error: DispatchError, now: DateTime<Utc>) -> StepOutcome {
        let failures = enrollment.attempt + 1;
        match error {
            DispatchError::Transient(message) if self.config.retry.has_attempts_remaining(failures) => {
                StepOutcome::Retry {
                    at: now + self.config.retry.delay_after_failure(failures),
                    attempt: failures,
                    error: message,
                }
            }
            DispatchError::Transient(message) => StepOutcome::Fail {
                reason: FailureReason::RetriesExhausted,
                error: format!("{} (after {} attempts)", message, failures),
            },
            DispatchError::Permanent(message) => StepOutcome::Fail {
                reason: FailureReason::PermanentDispatchFailure,
                error: message,
            },
        }
    }

    fn apply_terminal_or_retry(&self, enrollment: &mut Enrollment, outcome: StepOutcome, now: DateTime<Utc>) {
        match outcome {
            StepOutcome::Retry { at, attempt, error } => {
                enrollment.attempt = attempt;
                enrollment.next_step_at = Some(at);
                enrollment.last_error = Some(error);
                info!(
                    enrollment_id = %enrollment.id,
                    step_id = ?enrollment.current_step_id,
                    attempt,
                    retry_at = %at,
                    "Retry scheduled"
                );
            }
            StepOutcome::Fail { reason, error } => {
                warn!(
                    enrollment_id = %enrollment.id,
                    step_id = ?enrollment.current_step_id,
                    reason = reason.as_str(),
                    error = %error,
                    "Enrollment failed"
                );
                enrollment.mark_failed(reason, error, now);
            }
            _ => {}
        }
    }

    fn complete(&self, ctx: &mut ExecutionContext<'_>) {
        ctx.enrollment.mark_completed(ctx.now);
        info!(
            enrollment_id = %ctx.enrollment.id,
            workflow_id = %ctx.workflow.id,
            steps = ctx.enrollment.current_step_index,
            "Enrollment completed"
        );
    }
}

fn outcome_error(outcome: &StepOutcome) -> Option<String> {
    match outcome {
        StepOutcome::Retry { error, .. } | StepOutcome::Fail { error, .. } => Some(error.clone()),
        _ => None,
    }
}

/// Stable bucket in `0..100` for an enrollment at a given split step
pub fn split_bucket(enrollment_id: Uuid, step_id: &str) -> u32 {
    let mut hasher = Sha1::new();
    hasher.update(enrollment_id.as_bytes());
    hasher.update(step_id.as_bytes());
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) % 100
}

/// Pick the split branch for this enrollment. Percentage splits are a pure
/// function of the enrollment id; random picks are recorded on first use.
fn choose_split_branch<'s>(step: &'s Step, mode: SplitMode, enrollment: &mut Enrollment) -> Option<&'s Branch> {
    if step.branches.is_empty() {
        return None;
    }

    if let Some(chosen) = enrollment.split_choices.get(&step.id) {
        if let Some(branch) = step.branches.iter().find(|b| &b.id == chosen) {
            return Some(branch);
        }
    }

    let branch = match mode {
        SplitMode::Percentage => {
            let bucket = split_bucket(enrollment.id, &step.id);
            let mut upper = 0u32;
            step.branches
                .iter()
                .find(|b| {
                    upper = upper.saturating_add(b.percentage.unwrap_or(0));
                    bucket < upper
                })
                .or_else(|| step.branches.last())?
        }
        SplitMode::Random => {
            let index = rand::thread_rng().gen_range(0..step.branches.len());
            &step.branches[index]
        }
    };

    enrollment.split_choices.insert(step.id.clone(), branch.id.clone());
    Some(branch)
}
