//! The fleet estimate endpoints.

use axum::extract::State;
use refundry_api::error::ApiError;
use refundry_api::server::{ApiJson, ApiQuery};
use refundry_engine::estimate::{
    self, EstimateState, UserEstimateReport, UserEstimateRequest,
};
use serde::{Deserialize, Serialize};

use crate::state::{AdminGuard, AppState};

#[derive(Debug, Deserialize)]
pub struct StateQuery {
    pub autostart: Option<String>,
}

/// `GET /api/refund-estimate`. `?autostart=1` kicks off a computation if
/// none is running.
pub async fn state(
    State(state): State<AppState>,
    _admin: AdminGuard,
    ApiQuery(query): ApiQuery<StateQuery>,
) -> Result<ApiJson<EstimateState>, ApiError> {
    if query.autostart.as_deref() == Some("1") {
        state.estimate.start();
    }
    Ok(ApiJson(state.estimate.snapshot()))
}

#[derive(Debug, Serialize)]
pub struct RecomputeResponse {
    /// Whether this request started a new computation (false: one was
    /// already running).
    pub started: bool,
    #[serde(flatten)]
    pub state: EstimateState,
}

/// `POST /api/refund-estimate/recompute`. No-op while one is running.
pub async fn recompute(
    State(state): State<AppState>,
    _admin: AdminGuard,
) -> Result<ApiJson<RecomputeResponse>, ApiError> {
    let started = state.estimate.start();
    Ok(ApiJson(RecomputeResponse {
        started,
        state: state.estimate.snapshot(),
    }))
}

/// `POST /api/refund-estimate/users`: the on-demand per-user estimate.
pub async fn users(
    State(state): State<AppState>,
    _admin: AdminGuard,
    ApiJson(request): ApiJson<UserEstimateRequest>,
) -> Result<ApiJson<UserEstimateReport>, ApiError> {
    let report = estimate::estimate_users(&state.deps, &request).await?;
    Ok(ApiJson(report))
}
