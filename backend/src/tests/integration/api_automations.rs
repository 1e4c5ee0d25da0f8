use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use crate::handlers::api_router;
use crate::tests::fixtures::*;
use crate::tests::helpers::{contact, TestHarness};
use crate::workflows::engine::WorkerPool;
use crate::workflows::enrollments::EnrollmentStatus;

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn id_of(value: &Value) -> String {
    value["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_workflow_definition_lifecycle() {
    let harness = TestHarness::new();
    let pool = WorkerPool::start(harness.engine.clone());
    let app = api_router(harness.app_state(&pool));

    let (status, created) = send(&app, "POST", "/api/v1/automations", Some(welcome_document(Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "draft");
    let id = id_of(&created);

    let (status, report) = send(&app, "GET", &format!("/api/v1/automations/{}/validation", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["activated"], false);
    assert_eq!(report["issues"], json!([]));

    let (status, report) = send(&app, "POST", &format!("/api/v1/automations/{}/activate", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["activated"], true);
    assert_eq!(report["status"], "active");

    // Structural edits need the workflow paused first
    let mut edited = welcome_document(created["tenant_id"].as_str().unwrap().parse().unwrap());
    edited["name"] = json!("Welcome series v2");
    let (status, error) = send(&app, "PUT", &format!("/api/v1/automations/{}", id), Some(edited.clone())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["code"], "CONFLICT");

    let (status, _) = send(&app, "POST", &format!("/api/v1/automations/{}/pause", id), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, updated) = send(&app, "PUT", &format!("/api/v1/automations/{}", id), Some(edited)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["name"], "Welcome series v2");
    assert_eq!(updated["status"], "paused");

    let (status, archived) = send(&app, "POST", &format!("/api/v1/automations/{}/archive", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(archived["status"], "archived");

    let (status, _) = send(&app, "POST", &format!("/api/v1/automations/{}/activate", id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    drop(app);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_activation_reports_dangling_references_per_step() {
    let harness = TestHarness::new();
    let pool = WorkerPool::start(harness.engine.clone());
    let app = api_router(harness.app_state(&pool));

    let mut doc = welcome_document(Uuid::new_v4());
    doc["steps"][0]["next_step_id"] = json!("missing");
    let (status, created) = send(&app, "POST", "/api/v1/automations", Some(doc)).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = id_of(&created);

    let (status, error) = send(&app, "POST", &format!("/api/v1/automations/{}/activate", id), None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error["code"], "VALIDATION_ERROR");
    assert!(error["details"]["steps.welcome.next_step_id"].is_array());

    let (_, stored) = send(&app, "GET", &format!("/api/v1/automations/{}", id), None).await;
    assert_eq!(stored["status"], "draft");

    drop(app);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_malformed_documents_are_rejected() {
    let harness = TestHarness::new();
    let pool = WorkerPool::start(harness.engine.clone());
    let app = api_router(harness.app_state(&pool));

    let mut doc = welcome_document(Uuid::new_v4());
    doc["steps"][0]["kind"]["config"]["body"] = json!("");
    let (status, error) = send(&app, "POST", "/api/v1/automations", Some(doc)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(error["details"]["steps.welcome.config"].is_array());

    let (status, error) = send(&app, "GET", &format!("/api/v1/automations/{}", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["code"], "NOT_FOUND");

    drop(app);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_enrollment_endpoints() {
    let harness = TestHarness::new();
    let workflow = harness.install(lead_nurture(Uuid::new_v4())).await;
    let pool = WorkerPool::start(harness.engine.clone());
    let app = api_router(harness.app_state(&pool));
    let enroll_uri = format!("/api/v1/automations/{}/enrollments", workflow.id);
    let subject = Uuid::new_v4();

    let (status, first) = send(&app, "POST", &enroll_uri, Some(json!({ "subject_id": subject }))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["outcome"], "enrolled");
    assert_eq!(first["enrollment"]["current_step_id"], "send-x");
    let enrollment_id = first["enrollment"]["id"].as_str().unwrap().to_string();

    let (status, second) = send(&app, "POST", &enroll_uri, Some(json!({ "subject_id": subject }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["outcome"], "already_enrolled");
    assert_eq!(second["enrollment"]["id"], enrollment_id.as_str());

    let (status, page) = send(&app, "GET", &format!("{}?status=active&page=1&page_size=10", enroll_uri), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 1);
    assert_eq!(page["counts"]["active"], 1);

    let (status, _) = send(&app, "GET", &format!("{}?status=sleeping", enroll_uri), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let enrollment_uri = format!("/api/v1/enrollments/{}", enrollment_id);
    let (status, paused) = send(&app, "POST", &format!("{}/pause", enrollment_uri), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paused["status"], "paused");

    let (status, resumed) = send(&app, "POST", &format!("{}/resume", enrollment_uri), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resumed["status"], "active");

    let (status, exited) = send(&app, "POST", &format!("{}/exit", enrollment_uri), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(exited["status"], "exited");

    let (status, fetched) = send(&app, "GET", &enrollment_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["status"], "exited");

    let (status, error) = send(&app, "POST", &format!("{}/resume", enrollment_uri), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["code"], "CONFLICT");

    let (status, _) = send(&app, "GET", &format!("/api/v1/enrollments/{}", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    drop(app);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_ingested_events_are_enrolled_by_workers() {
    let harness = TestHarness::new();
    let tenant_id = Uuid::new_v4();
    let doc: crate::workflows::definition::WorkflowDocument =
        serde_json::from_value(welcome_document(tenant_id)).unwrap();
    let workflow = harness.install(crate::workflows::definition::Workflow::from_document(doc).unwrap()).await;
    let subject = Uuid::new_v4();
    harness.crm.set_record(subject, contact("ada@example.com", "lead"));

    let pool = WorkerPool::start(harness.engine.clone());
    let app = api_router(harness.app_state(&pool));

    let event = json!({
        "kind": "tag_added",
        "tenant_id": tenant_id,
        "subject_id": subject,
        "payload": { "tag_id": "newsletter" }
    });
    let (status, accepted) = send(&app, "POST", "/api/v1/automation-events", Some(event)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(accepted["event_id"].is_string());

    let (status, error) = send(
        &app,
        "POST",
        "/api/v1/automation-events",
        Some(json!({ "kind": "record_deleted", "tenant_id": tenant_id, "subject_id": subject })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["code"], "BAD_REQUEST");

    // Drain the queue before looking at the store
    drop(app);
    pool.shutdown().await;

    let enrollments = harness.enrollments_of(workflow.id).await;
    assert_eq!(enrollments.len(), 1);
    assert_eq!(enrollments[0].status, EnrollmentStatus::Active);
    assert_eq!(enrollments[0].current_step_id.as_deref(), Some("finish"));
    assert_eq!(harness.crm.messages_to(subject), 1);
}

#[tokio::test]
async fn test_form_submissions_enroll_synchronously() {
    let harness = TestHarness::new();
    let tenant_id = Uuid::new_v4();
    let mut doc = welcome_document(tenant_id);
    doc["trigger"] = json!({
        "event": { "type": "form_submitted", "config": { "form_id": "newsletter-signup" } }
    });
    let doc: crate::workflows::definition::WorkflowDocument = serde_json::from_value(doc).unwrap();
    let workflow = harness.install(crate::workflows::definition::Workflow::from_document(doc).unwrap()).await;

    let pool = WorkerPool::start(harness.engine.clone());
    let app = api_router(harness.app_state(&pool));
    let subject = Uuid::new_v4();

    let (status, outcomes) = send(
        &app,
        "POST",
        "/api/v1/automation-events/forms",
        Some(json!({
            "tenant_id": tenant_id,
            "subject_id": subject,
            "form_id": "newsletter-signup",
            "fields": { "email": "ada@example.com" }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcomes[0]["workflow_id"], workflow.id.to_string());
    assert_eq!(outcomes[0]["outcome"], "enrolled");

    let (status, error) = send(
        &app,
        "POST",
        "/api/v1/automation-events/forms",
        Some(json!({ "tenant_id": tenant_id, "subject_id": subject, "form_id": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(error["details"]["form_id"].is_array());

    drop(app);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_health_reports_memory_store() {
    let harness = TestHarness::new();
    let pool = WorkerPool::start(harness.engine.clone());
    let app = api_router(harness.app_state(&pool));

    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], "memory");
    assert_eq!(body["workers"], 2);

    drop(app);
    pool.shutdown().await;
}
