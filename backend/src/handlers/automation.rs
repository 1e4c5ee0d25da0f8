//! Automation Handlers
//!
//! Thin HTTP surface over the workflow engine: definition lifecycle,
//! enrollment inspection and control, and event ingestion.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use nurture_shared::{
    ActivationReport, AutomationEventRequest, EnrollmentPage, EnrollmentResponse, EnrollmentSummary,
    ManualEnrollmentRequest,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::pagination::{PageRequest, DEFAULT_PAGE, DEFAULT_PAGE_SIZE};
use crate::workflows::definition::{Workflow, WorkflowDocument};
use crate::workflows::enrollments::{EnrollOutcome, EnrollmentStatus};
use crate::workflows::triggers::{DomainEvent, EventKind, RecordType};
use crate::{ApiResult, AppError, AppState};

// ==================== Structs ====================

#[derive(Debug, Deserialize)]
pub struct EnrollmentListQuery {
    pub status: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

impl EnrollmentListQuery {
    fn status(&self) -> ApiResult<Option<EnrollmentStatus>> {
        self.status
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<EnrollmentStatus>().map_err(AppError::BadRequest))
            .transpose()
    }

    fn page(&self) -> PageRequest {
        PageRequest::new(
            self.page.unwrap_or(DEFAULT_PAGE),
            self.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        )
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct FormSubmissionRequest {
    pub tenant_id: Uuid,
    pub subject_id: Uuid,
    #[validate(length(min = 1, max = 128, message = "form_id must be 1-128 characters"))]
    pub form_id: String,
    #[serde(default)]
    pub fields: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct EventAccepted {
    pub event_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct WorkflowEnrollmentOutcome {
    pub workflow_id: Uuid,
    #[serde(flatten)]
    pub result: EnrollmentResponse,
}

// ==================== Routes ====================

pub fn automation_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(save_workflow))
        .route("/:id", get(get_workflow).put(update_workflow))
        .route("/:id/validation", get(check_activation))
        .route("/:id/activate", post(activate_workflow))
        .route("/:id/pause", post(pause_workflow))
        .route("/:id/archive", post(archive_workflow))
        .route("/:id/enrollments", get(list_enrollments).post(enroll_subject))
}

pub fn enrollment_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id", get(get_enrollment))
        .route("/:id/exit", post(exit_enrollment))
        .route("/:id/pause", post(pause_enrollment))
        .route("/:id/resume", post(resume_enrollment))
}

pub fn event_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(ingest_event))
        .route("/forms", post(submit_form))
}

// ==================== Workflow Handlers ====================

async fn save_workflow(
    State(state): State<Arc<AppState>>,
    Json(doc): Json<WorkflowDocument>,
) -> ApiResult<(StatusCode, Json<Workflow>)> {
    let workflow = state.engine.save_definition(doc).await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

async fn update_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(mut doc): Json<WorkflowDocument>,
) -> ApiResult<Json<Workflow>> {
    doc.id = Some(id);
    Ok(Json(state.engine.save_definition(doc).await?))
}

async fn get_workflow(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<Json<Workflow>> {
    Ok(Json(state.engine.get_workflow(id).await?))
}

async fn check_activation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ActivationReport>> {
    Ok(Json(state.engine.check_activation(id).await?))
}

async fn activate_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ActivationReport>> {
    Ok(Json(state.engine.activate(id).await?))
}

async fn pause_workflow(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<Json<Workflow>> {
    Ok(Json(state.engine.pause_workflow(id).await?))
}

async fn archive_workflow(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<Json<Workflow>> {
    Ok(Json(state.engine.archive_workflow(id).await?))
}

// ==================== Enrollment Handlers ====================

async fn list_enrollments(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<EnrollmentListQuery>,
) -> ApiResult<Json<EnrollmentPage>> {
    let status = query.status()?;
    let page = state.engine.list_enrollments(id, status, &query.page()).await?;
    Ok(Json(page))
}

async fn enroll_subject(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ManualEnrollmentRequest>,
) -> ApiResult<(StatusCode, Json<EnrollmentResponse>)> {
    let outcome = state.engine.enroll_manually(id, req.subject_id).await?;
    let status = if outcome.is_enrolled() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(enrollment_response(&outcome))))
}

async fn get_enrollment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<EnrollmentSummary>> {
    Ok(Json(state.engine.get_enrollment(id).await?.summary()))
}

async fn exit_enrollment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<EnrollmentSummary>> {
    Ok(Json(state.engine.exit_enrollment(id).await?.summary()))
}

async fn pause_enrollment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<EnrollmentSummary>> {
    Ok(Json(state.engine.pause_enrollment(id).await?.summary()))
}

async fn resume_enrollment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<EnrollmentSummary>> {
    Ok(Json(state.engine.resume_enrollment(id).await?.summary()))
}

// ==================== Event Handlers ====================

/// Queue a CRM event; matching and enrollment happen on the worker pool
async fn ingest_event(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AutomationEventRequest>,
) -> ApiResult<(StatusCode, Json<EventAccepted>)> {
    let event = domain_event(req)?;
    let event_id = event.event_id;
    state.events.submit(event).await?;
    Ok((StatusCode::ACCEPTED, Json(EventAccepted { event_id })))
}

/// Forms collaborator entry point; enrolls synchronously so the caller sees outcomes
async fn submit_form(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FormSubmissionRequest>,
) -> ApiResult<Json<Vec<WorkflowEnrollmentOutcome>>> {
    req.validate()?;
    let outcomes = state
        .engine
        .submit_form(req.tenant_id, req.subject_id, &req.form_id, req.fields)
        .await?;
    info!(form_id = %req.form_id, subject_id = %req.subject_id, workflows = outcomes.len(), "Form submission handled");

    Ok(Json(
        outcomes
            .into_iter()
            .map(|(workflow_id, outcome)| WorkflowEnrollmentOutcome {
                workflow_id,
                result: enrollment_response(&outcome),
            })
            .collect(),
    ))
}

fn domain_event(req: AutomationEventRequest) -> ApiResult<DomainEvent> {
    let kind: EventKind = req.kind.parse().map_err(AppError::BadRequest)?;
    let record_type = match req.record_type.as_deref() {
        None | Some("contact") => RecordType::Contact,
        Some("deal") => RecordType::Deal,
        Some(other) => return Err(AppError::BadRequest(format!("unknown record type '{}'", other))),
    };

    let payload = if req.payload.is_null() {
        serde_json::json!({})
    } else {
        req.payload
    };
    let mut event = DomainEvent::new(kind, req.tenant_id, req.subject_id, payload);
    event.record_type = record_type;
    event.changed_fields = req.changed_fields;
    Ok(event)
}

fn enrollment_response(outcome: &EnrollOutcome) -> EnrollmentResponse {
    EnrollmentResponse {
        outcome: outcome.as_str().to_string(),
        enrollment: outcome.enrollment().map(|e| e.summary()),
    }
}
