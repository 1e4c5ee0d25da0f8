use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentSummary {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub subject_id: Uuid,
    pub status: String, // active, paused, completed, exited, failed
    pub current_step_id: Option<String>,
    pub current_step_index: i64,
    pub enrolled_at: DateTime<Utc>,
    pub next_step_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub last_error: Option<String>,
}

/// Per-status breakdown shown above the enrollment list.
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentStatusCounts {
    pub active: i64,
    pub paused: i64,
    pub completed: i64,
    pub exited: i64,
    pub failed: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentPage {
    pub enrollments: Vec<EnrollmentSummary>,
    pub counts: EnrollmentStatusCounts,
    pub page: i64,
    pub page_size: i64,
    pub total: i64,
    pub total_pages: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepValidationIssue {
    /// Step the issue belongs to; `None` for trigger/settings issues.
    pub step_id: Option<String>,
    pub field: String,
    pub message: String,
}

impl StepValidationIssue {
    pub fn step(step_id: &str, field: &str, message: impl Into<String>) -> Self {
        Self {
            step_id: Some(step_id.to_string()),
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn workflow(field: &str, message: impl Into<String>) -> Self {
        Self {
            step_id: None,
            field: field.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationReport {
    pub workflow_id: Uuid,
    pub status: String,
    pub activated: bool,
    pub issues: Vec<StepValidationIssue>,
    pub checked_at: DateTime<Utc>,
}

/// Body of `POST /api/v1/automation-events`, produced by the CRM record layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationEventRequest {
    pub kind: String,
    pub tenant_id: Uuid,
    pub subject_id: Uuid,
    pub record_type: Option<String>,
    #[serde(default)]
    pub changed_fields: Vec<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualEnrollmentRequest {
    pub subject_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentResponse {
    pub outcome: String, // enrolled, already_enrolled, limit_reached, re_enrollment_blocked, workflow_inactive, filtered_out
    pub enrollment: Option<EnrollmentSummary>,
}
