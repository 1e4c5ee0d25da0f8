use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use std::sync::Arc;

use crate::AppState;

pub mod automation;

pub use automation::{automation_routes, enrollment_routes, event_routes};

/// Full API router; `main` adds the CORS and tracing layers
pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1/automations", automation_routes())
        .nest("/api/v1/enrollments", enrollment_routes())
        .nest("/api/v1/automation-events", event_routes())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let database = match &state.db_pool {
        Some(pool) => crate::database::health_check(pool).await,
        None => true,
    };
    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if database { "ok" } else { "degraded" },
            "store": if state.db_pool.is_some() { "postgres" } else { "memory" },
            "workers": state.engine.config().workers,
        })),
    )
}
