use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::json;
use std::sync::Arc;

use crate::AppState;

pub mod workflows;

pub use workflows::workflow_routes;

pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let database = crate::database::health_check(&state.db_pool).await;

    let status = if database { "healthy" } else { "degraded" };

    Ok(Json(json!({
        "status": status,
        "service": "nurture-backend",
        "database": database,
    })))
}
