//! User search, quote, and refund execution.

use axum::extract::{Path, State};
use refundry_api::error::ApiError;
use refundry_api::server::{ApiJson, ApiQuery};
use refundry_core::ids::UserId;
use refundry_core::user::User;
use refundry_engine::execute::{
    self, ExecutionReport, RefundExecutionRequest,
};
use refundry_engine::quote::{self, Quote};
use refundry_store::BusinessStore as _;
use serde::{Deserialize, Serialize};

use crate::state::{AdminGuard, AppState};

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub users: Vec<User>,
}

pub async fn search(
    State(state): State<AppState>,
    _admin: AdminGuard,
    ApiQuery(query): ApiQuery<SearchQuery>,
) -> Result<ApiJson<SearchResponse>, ApiError> {
    let q = query.q.unwrap_or_default();
    if q.trim().is_empty() {
        return Err(ApiError::validation(
            "invalid_query",
            "q must be an email fragment or a numeric user id",
        ));
    }
    let users = state
        .deps
        .business
        .search_users(q.trim())
        .await
        .map_err(|e| ApiError::internal(e))?;
    Ok(ApiJson(SearchResponse { users }))
}

pub async fn refund_quote(
    State(state): State<AppState>,
    _admin: AdminGuard,
    Path(uid): Path<String>,
) -> Result<ApiJson<Quote>, ApiError> {
    let user_id = parse_uid(&uid)?;
    let ctx = quote::build(&state.deps, user_id).await?;
    Ok(ApiJson(ctx.quote))
}

pub async fn refund(
    State(state): State<AppState>,
    AdminGuard(identity): AdminGuard,
    Path(uid): Path<String>,
    ApiJson(request): ApiJson<RefundExecutionRequest>,
) -> Result<ApiJson<ExecutionReport>, ApiError> {
    let user_id = parse_uid(&uid)?;
    let report =
        execute::execute(&state.deps, user_id, &request, identity.actor())
            .await?;
    Ok(ApiJson(report))
}

fn parse_uid(raw: &str) -> Result<UserId, ApiError> {
    raw.parse::<UserId>()
        .ok()
        .filter(|uid| uid.as_i64() > 0)
        .ok_or_else(|| {
            ApiError::validation(
                "invalid_user_id",
                format!("bad user id: {raw:?}"),
            )
        })
}
