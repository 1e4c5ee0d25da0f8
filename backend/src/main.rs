use axum::http::Method;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod collaborators;
mod config;
mod database;
mod error;
mod handlers;
mod jobs;
mod pagination;
mod workflows;

pub use error::{ApiError, ApiResult, AppError};
pub use pagination::PageRequest;

#[cfg(test)]
mod tests;

use config::StoreBackend;
use workflows::engine::{EventQueue, WorkerPool, WorkflowEngine};
use workflows::store::{EnrollmentStore, InMemoryAutomationStore, PgAutomationStore, WorkflowStore};
use workflows::timing::SystemClock;

pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    pub events: EventQueue,
    /// `None` when running on the in-memory store
    pub db_pool: Option<sqlx::PgPool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;

    let (workflow_store, enrollment_store, db_pool): (Arc<dyn WorkflowStore>, Arc<dyn EnrollmentStore>, _) =
        match config.store {
            StoreBackend::Postgres => {
                let pool = database::create_pool(&config.database_url).await?;
                database::migrate(&pool).await?;
                let store = Arc::new(PgAutomationStore::new(pool.clone()));
                (store.clone(), store, Some(pool))
            }
            StoreBackend::Memory => {
                tracing::warn!("Using the in-memory automation store; state is lost on restart");
                let store = Arc::new(InMemoryAutomationStore::new());
                (store.clone(), store, None)
            }
        };

    let engine = Arc::new(WorkflowEngine::new(
        workflow_store,
        enrollment_store,
        collaborators::LoggingCollaborators::collaborators(),
        Arc::new(SystemClock),
        config.engine.clone(),
    ));

    let pool = WorkerPool::start(engine.clone());
    let mut job_scheduler = jobs::JobScheduler::new(engine.clone(), jobs::JobConfig::from(&config.engine)).await?;
    job_scheduler.start().await?;

    let app_state = Arc::new(AppState {
        engine,
        events: pool.queue(),
        db_pool,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers(Any);

    let app = handlers::api_router(app_state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors),
    );

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!(addr = %config.server_addr, store = ?config.store, "Automation server running");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Router (and its queue handle) is dropped once serve returns
    job_scheduler.shutdown().await?;
    pool.shutdown().await;
    tracing::info!("Automation server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
