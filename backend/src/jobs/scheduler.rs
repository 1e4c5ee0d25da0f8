// Job Scheduler - Cron jobs driving the automation engine's periodic passes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::workflows::engine::{EngineConfig, WorkflowEngine};
use crate::workflows::errors::AutomationError;

const MAX_EXECUTION_LOGS: usize = 100;

pub const WAKE_UP_JOB: &str = "enrollment_wake_up";
pub const DATE_TRIGGER_JOB: &str = "date_triggers";

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] JobSchedulerError),
    #[error("Automation error: {0}")]
    Automation(#[from] AutomationError),
    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Period of the due-enrollment wake-up pass
    pub wake_up_interval_secs: u64,
    /// Cron expression for the date-trigger pass
    pub date_trigger_cron: String,
    pub date_triggers_enabled: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            wake_up_interval_secs: 30,
            date_trigger_cron: "0 * * * * *".to_string(),
            date_triggers_enabled: true,
        }
    }
}

impl From<&EngineConfig> for JobConfig {
    fn from(engine: &EngineConfig) -> Self {
        Self {
            wake_up_interval_secs: engine.scheduler_interval_secs,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub items_processed: usize,
    pub errors: Vec<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Completed,
    Failed,
    PartialFailure,
}

type ExecutionLogs = Arc<RwLock<Vec<JobExecutionLog>>>;

pub struct JobScheduler {
    scheduler: TokioScheduler,
    engine: Arc<WorkflowEngine>,
    config: JobConfig,
    execution_logs: ExecutionLogs,
}

impl JobScheduler {
    pub async fn new(engine: Arc<WorkflowEngine>, config: JobConfig) -> JobResult<Self> {
        if config.wake_up_interval_secs == 0 {
            return Err(JobError::Configuration(
                "wake-up interval must be at least one second".to_string(),
            ));
        }
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            engine,
            config,
            execution_logs: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting automation job scheduler");

        self.schedule_wake_up().await?;
        self.schedule_date_triggers().await?;

        self.scheduler.start().await?;

        info!("Automation job scheduler started");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> JobResult<()> {
        info!("Shutting down automation job scheduler");
        self.scheduler.shutdown().await?;
        Ok(())
    }

    async fn schedule_wake_up(&self) -> JobResult<()> {
        let period = wake_up_period(self.config.wake_up_interval_secs);
        let engine = self.engine.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_repeated_async(period, move |_uuid, _lock| {
            let engine = engine.clone();
            let logs = logs.clone();

            Box::pin(async move {
                run_wake_up(&engine, &logs).await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!(interval_secs = period.as_secs(), "Scheduled enrollment wake-up pass");

        Ok(())
    }

    async fn schedule_date_triggers(&self) -> JobResult<()> {
        if !self.config.date_triggers_enabled {
            info!("Date triggers are disabled, skipping date-trigger job");
            return Ok(());
        }

        let cron_expr = self.config.date_trigger_cron.clone();
        let engine = self.engine.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let engine = engine.clone();
            let logs = logs.clone();

            Box::pin(async move {
                run_date_triggers(&engine, &logs).await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!(cron = %cron_expr, "Scheduled date-trigger pass");

        Ok(())
    }

    pub async fn get_execution_logs(&self) -> Vec<JobExecutionLog> {
        self.execution_logs.read().await.clone()
    }

    /// Run a job immediately, outside its schedule
    pub async fn run_job_now(&self, job_name: &str) -> JobResult<JobExecutionLog> {
        let log = match job_name {
            WAKE_UP_JOB => run_wake_up(&self.engine, &self.execution_logs).await,
            DATE_TRIGGER_JOB => run_date_triggers(&self.engine, &self.execution_logs).await,
            _ => return Err(JobError::Configuration(format!("Unknown job: {}", job_name))),
        };
        Ok(log)
    }
}

async fn run_wake_up(engine: &WorkflowEngine, logs: &ExecutionLogs) -> JobExecutionLog {
    let started_at = Utc::now();
    let log = match engine.run_due_pass().await {
        Ok(report) => {
            let errors = if report.errors > 0 {
                vec![format!("{} enrollment(s) failed to wake", report.errors)]
            } else {
                Vec::new()
            };
            finished(WAKE_UP_JOB, started_at, report.examined, errors)
        }
        Err(e) => {
            error!(error = %e, "Enrollment wake-up pass failed");
            failed(WAKE_UP_JOB, started_at, e.to_string())
        }
    };
    push_log(logs, log.clone()).await;
    log
}

async fn run_date_triggers(engine: &WorkflowEngine, logs: &ExecutionLogs) -> JobExecutionLog {
    let started_at = Utc::now();
    let log = match engine.run_date_trigger_pass().await {
        Ok(report) => {
            let errors = if report.errors > 0 {
                vec![format!("{} workflow(s) could not be evaluated", report.errors)]
            } else {
                Vec::new()
            };
            finished(DATE_TRIGGER_JOB, started_at, report.subjects_matched, errors)
        }
        Err(e) => {
            error!(error = %e, "Date-trigger pass failed");
            failed(DATE_TRIGGER_JOB, started_at, e.to_string())
        }
    };
    push_log(logs, log.clone()).await;
    log
}

fn finished(job_name: &str, started_at: DateTime<Utc>, items: usize, errors: Vec<String>) -> JobExecutionLog {
    let completed_at = Utc::now();
    if !errors.is_empty() {
        warn!(job = job_name, errors = errors.len(), "Job finished with errors");
    }
    JobExecutionLog {
        id: Uuid::new_v4(),
        job_name: job_name.to_string(),
        started_at,
        completed_at: Some(completed_at),
        status: if errors.is_empty() {
            JobStatus::Completed
        } else {
            JobStatus::PartialFailure
        },
        items_processed: items,
        errors,
        duration_ms: Some((completed_at - started_at).num_milliseconds()),
    }
}

fn failed(job_name: &str, started_at: DateTime<Utc>, error: String) -> JobExecutionLog {
    let completed_at = Utc::now();
    JobExecutionLog {
        id: Uuid::new_v4(),
        job_name: job_name.to_string(),
        started_at,
        completed_at: Some(completed_at),
        status: JobStatus::Failed,
        items_processed: 0,
        errors: vec![error],
        duration_ms: Some((completed_at - started_at).num_milliseconds()),
    }
}

async fn push_log(logs: &ExecutionLogs, log: JobExecutionLog) {
    let mut logs = logs.write().await;
    logs.push(log);
    if logs.len() > MAX_EXECUTION_LOGS {
        logs.remove(0);
    }
}

/// Fixed period between wake-up passes, counted from scheduler start
pub fn wake_up_period(secs: u64) -> std::time::Duration {
    std::time::Duration::from_secs(secs.max(1))
}
