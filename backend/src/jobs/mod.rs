// Background Jobs Service
//
// Cron jobs that keep the automation engine moving without incoming events:
// the wake-up pass for due enrollments and the date-trigger pass.

pub mod scheduler;

pub use scheduler::{JobConfig, JobError, JobExecutionLog, JobResult, JobScheduler, JobStatus};
