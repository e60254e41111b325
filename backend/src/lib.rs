use axum::{http::Method, routing::get, Router};
use sqlx::PgPool;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod pagination;
pub mod workflows;

pub use error::{ApiError, ApiResult, AppError};

use workflows::{
    Clock, Collaborators, LoggingBusinessActions, PgRoleDirectory, PgTaskService, PgWorkflowStore,
    SystemClock, WorkflowCatalog, WorkflowEngine,
};

pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    /// Absent when the engine runs on the in-memory store
    pub db_pool: Option<PgPool>,
}

/// Registry + fmt layer, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Engine backed by Postgres for state, tasks and role lookups.
pub fn postgres_engine(
    db_pool: PgPool,
    catalog: WorkflowCatalog,
    config: &config::WorkflowConfig,
) -> Arc<WorkflowEngine> {
    let collaborators = Collaborators {
        tasks: Arc::new(PgTaskService::new(db_pool.clone())),
        roles: Arc::new(PgRoleDirectory::new(db_pool.clone())),
        actions: Arc::new(LoggingBusinessActions),
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    Arc::new(WorkflowEngine::new(
        Arc::new(catalog),
        Arc::new(PgWorkflowStore::new(db_pool)),
        collaborators,
        clock,
        config.engine_config(),
    ))
}

pub fn app_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "Ledgerflow Workflow API v0.1.0" }))
        .route("/health", get(handlers::health_check))
        .nest("/api/v1/workflows", handlers::workflow_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}
