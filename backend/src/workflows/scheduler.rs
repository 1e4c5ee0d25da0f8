// Scheduler - Periodic wake-up of due enrollments and date-based triggers

use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::actions::ActionDispatcher;
use super::definition::Workflow;
use super::enrollments::{EnrollOutcome, EnrollmentManager, EnrollmentSource, EnrollmentStatus};
use super::errors::AutomationResult;
use super::executor::{StepGraphExecutor, WakeOutcome};
use super::store::{EnrollmentStore, WorkflowStore};
use super::timing::Clock;
use super::triggers::{DateTriggerConfig, TriggerSpec};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum enrollments examined per wake-up pass
    pub batch_size: i64,
    /// Enrollments driven in parallel within a pass
    pub concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WakePassReport {
    pub examined: usize,
    pub driven: usize,
    pub completed: usize,
    pub failed: usize,
    pub busy: usize,
    pub deferred: usize,
    pub skipped: usize,
    /// Wake-ups that returned an error (store or lease problems)
    pub errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatePassReport {
    pub workflows_evaluated: usize,
    pub subjects_matched: usize,
    pub enrolled: usize,
    pub errors: usize,
}

pub struct Scheduler {
    workflows: Arc<dyn WorkflowStore>,
    enrollments: Arc<dyn EnrollmentStore>,
    manager: Arc<EnrollmentManager>,
    executor: Arc<StepGraphExecutor>,
    dispatcher: Arc<ActionDispatcher>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    /// Local date each date-triggered workflow last ran on
    date_runs: Mutex<HashMap<Uuid, NaiveDate>>,
}

impl Scheduler {
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        enrollments: Arc<dyn EnrollmentStore>,
        manager: Arc<EnrollmentManager>,
        executor: Arc<StepGraphExecutor>,
        dispatcher: Arc<ActionDispatcher>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            workflows,
            enrollments,
            manager,
            executor,
            dispatcher,
            clock,
            config,
            date_runs: Mutex::new(HashMap::new()),
        }
    }

    /// Wake every due enrollment. One enrollment's error never aborts the pass.
    pub async fn run_due_pass(&self) -> AutomationResult<WakePassReport> {
        let now = self.clock.now();
        let due = self.enrollments.due_enrollments(now, self.config.batch_size).await?;

        let mut report = WakePassReport {
            examined: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        let results: Vec<(Uuid, AutomationResult<WakeOutcome>)> = stream::iter(due)
            .map(|id| async move { (id, self.executor.wake(id).await) })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for (id, result) in results {
            match result {
                Ok(WakeOutcome::Driven(status)) => {
                    report.driven += 1;
                    match status {
                        EnrollmentStatus::Completed => report.completed += 1,
                        EnrollmentStatus::Failed => report.failed += 1,
                        _ => {}
                    }
                }
                Ok(WakeOutcome::Busy) => report.busy += 1,
                Ok(WakeOutcome::Deferred) => report.deferred += 1,
                Ok(WakeOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    report.errors += 1;
                    error!(enrollment_id = %id, error = %e, "Wake-up failed");
                }
            }
        }

        info!(
            examined = report.examined,
            driven = report.driven,
            completed = report.completed,
            failed = report.failed,
            errors = report.errors,
            "Scheduler pass finished"
        );
        Ok(report)
    }

    /// Enroll subjects of date-based workflows whose run time has come today
    /// in the workflow's timezone. Each workflow runs at most once per local date.
    pub async fn run_date_trigger_pass(&self) -> AutomationResult<DatePassReport> {
        let now = self.clock.now();
        let mut report = DatePassReport::default();

        for workflow in self.workflows.list_active_workflows(None).await? {
            let TriggerSpec::DateBased(config) = &workflow.trigger.event else {
                continue;
            };

            let local = now.with_timezone(&workflow.settings.offset());
            let today = local.date_naive();
            if local.time() < config.run_at {
                continue;
            }
            if self.date_runs.lock().await.get(&workflow.id) == Some(&today) {
                continue;
            }

            report.workflows_evaluated += 1;
            match self.fire_date_trigger(&workflow, config, today, now).await {
                Ok((matched, enrolled)) => {
                    report.subjects_matched += matched;
                    report.enrolled += enrolled;
                    self.date_runs.lock().await.insert(workflow.id, today);
                }
                Err(e) => {
                    // Not marked as run, so the next pass retries it
                    report.errors += 1;
                    warn!(workflow_id = %workflow.id, error = %e, "Date trigger evaluation failed");
                }
            }
        }

        if report.workflows_evaluated > 0 {
            info!(
                workflows = report.workflows_evaluated,
                matched = report.subjects_matched,
                enrolled = report.enrolled,
                "Date trigger pass finished"
            );
        }
        Ok(report)
    }

    async fn fire_date_trigger(
        &self,
        workflow: &Workflow,
        config: &DateTriggerConfig,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> AutomationResult<(usize, usize)> {
        let target = config.qualifying_date(today);
        let subjects = self
            .dispatcher
            .directory()
            .subjects_with_date(workflow.tenant_id, &config.date_field, target, config.recurring_yearly)
            .await?;

        debug!(workflow_id = %workflow.id, date = %target, subjects = subjects.len(), at = %now, "Date trigger fired");

        let mut enrolled = 0;
        for subject_id in &subjects {
            if !workflow.trigger.filters.is_empty() {
                match self.dispatcher.fetch_record(*subject_id).await {
                    Ok(record) if workflow.trigger.filters_match(&record) => {}
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(workflow_id = %workflow.id, subject_id = %subject_id, error = %e, "Date trigger filter skipped");
                        continue;
                    }
                }
            }

            if !self
                .enrollments
                .record_date_trigger_run(workflow.id, *subject_id, target)
                .await?
            {
                continue;
            }

            match self.manager.enroll(workflow, *subject_id, EnrollmentSource::DateTrigger).await {
                Ok(EnrollOutcome::Enrolled(enrollment)) => {
                    enrolled += 1;
                    if let Err(e) = self.executor.drive(workflow, enrollment).await {
                        error!(workflow_id = %workflow.id, subject_id = %subject_id, error = %e, "Initial drive failed");
                    }
                }
                Ok(outcome) => {
                    debug!(workflow_id = %workflow.id, subject_id = %subject_id, outcome = outcome.as_str(), "Date enrollment not created");
                }
                Err(e) => {
                    error!(workflow_id = %workflow.id, subject_id = %subject_id, error = %e, "Date enrollment failed");
                }
            }
        }

        Ok((subjects.len(), enrolled))
    }
}
