use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::json;
use std::sync::Arc;

use crate::AppState;
use crate::database;

pub mod workflows;

pub use workflows::workflow_routes;

pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let Some(pool) = &state.db_pool else {
        return (StatusCode::OK, Json(json!({"status": "healthy", "service": "ledgerflow-api", "database": "none"})));
    };

    if database::health_check(pool).await {
        (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "service": "ledgerflow-api",
                "database": "ok",
                "pool": database::get_pool_stats(pool)
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "degraded", "service": "ledgerflow-api", "database": "unreachable"})),
        )
    }
}
