//! Standardized error handling for the automation API
//!
//! Every endpoint answers failures with the same `ApiError` JSON envelope.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use nurture_shared::StepValidationIssue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::workflows::errors::{AutomationError, StoreError};

/// Standard API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code (e.g., "VALIDATION_ERROR", "NOT_FOUND", "CONFLICT")
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Field-level errors; step issues are keyed `steps.<step_id>.<field>`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, Vec<String>>>,
    /// ISO 8601 timestamp
    pub timestamp: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: HashMap<String, Vec<String>>) -> Self {
        self.details = Some(details);
        self
    }
}

/// Application error type that can be converted to HTTP responses
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    Conflict(String),
    ValidationError { details: HashMap<String, Vec<String>> },
    BadRequest(String),
    ServiceUnavailable(String),
    InternalError(String),
    DatabaseError(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ValidationError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalError(_) | Self::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::InternalError(_) => "INTERNAL_ERROR",
            Self::DatabaseError(_) => "DATABASE_ERROR",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::NotFound(resource) => format!("{} not found", resource),
            Self::Conflict(msg) => msg.clone(),
            Self::ValidationError { .. } => "Validation failed".to_string(),
            Self::BadRequest(msg) => msg.clone(),
            Self::ServiceUnavailable(msg) => msg.clone(),
            Self::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                "An internal error occurred".to_string()
            }
            Self::DatabaseError(msg) => {
                tracing::error!("Database error: {}", msg);
                "A database error occurred".to_string()
            }
        }
    }

    /// Validation error built from definition issues
    pub fn from_issues(issues: &[StepValidationIssue]) -> Self {
        let mut details: HashMap<String, Vec<String>> = HashMap::new();
        for issue in issues {
            let key = match &issue.step_id {
                Some(step_id) => format!("steps.{}.{}", step_id, issue.field),
                None => issue.field.clone(),
            };
            details.entry(key).or_default().push(issue.message.clone());
        }
        Self::ValidationError { details }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut error = ApiError::new(self.error_code(), self.message());

        if let Self::ValidationError { details } = self {
            error = error.with_details(details);
        }

        (status, Json(error)).into_response()
    }
}

impl From<AutomationError> for AppError {
    fn from(err: AutomationError) -> Self {
        match err {
            AutomationError::WorkflowNotFound(id) => Self::NotFound(format!("Workflow {}", id)),
            AutomationError::EnrollmentNotFound(id) => Self::NotFound(format!("Enrollment {}", id)),
            AutomationError::Store(StoreError::NotFound(id)) => Self::NotFound(format!("Record {}", id)),
            AutomationError::InvalidDefinition { issues } => Self::from_issues(&issues),
            AutomationError::InvalidTransition { .. }
            | AutomationError::WorkflowActive(_)
            | AutomationError::EnrollmentBusy(_) => Self::Conflict(err.to_string()),
            AutomationError::Store(StoreError::Conflict(msg)) => Self::Conflict(msg),
            AutomationError::QueueClosed => Self::ServiceUnavailable(err.to_string()),
            AutomationError::Store(StoreError::Database(e)) => Self::DatabaseError(e.to_string()),
            AutomationError::Store(other) => Self::InternalError(other.to_string()),
            AutomationError::Collaborator(e) => Self::InternalError(e.to_string()),
            AutomationError::Serialization(e) => Self::InternalError(e.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let details = errors
            .field_errors()
            .into_iter()
            .map(|(field, errs)| {
                let messages = errs
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| e.code.to_string())
                    })
                    .collect();
                (field.to_string(), messages)
            })
            .collect();
        Self::ValidationError { details }
    }
}

/// Result type alias for handlers
pub type ApiResult<T> = Result<T, AppError>;
