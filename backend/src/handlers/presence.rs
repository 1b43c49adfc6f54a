use axum::{extract::State, Json};
use serde::Serialize;

use crate::{error::AppError, state::AppState};

/// `{"success": true, "data": ...}` envelope used by the dashboard's REST API.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ActiveCountResponse {
    pub active_count: i64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// GET /api/presence
pub async fn get_active_count(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<ActiveCountResponse>>, AppError> {
    let active_count = state.presence.get_active_count().await?;
    Ok(Json(ApiResponse::ok(ActiveCountResponse { active_count })))
}

/// GET /api/health
pub async fn health() -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::ok(HealthResponse { status: "ok" }))
}
