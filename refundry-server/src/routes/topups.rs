//! `GET /api/topups` and `GET /api/topups/{trade_no}`.

use axum::extract::{Path, State};
use refundry_api::error::ApiError;
use refundry_api::server::{ApiJson, ApiQuery};
use refundry_core::topup::{PaymentMethod, TopUp, TopUpStatus};
use refundry_core::user::User;
use refundry_store::{BusinessStore as _, TopUpFilter};
use serde::{Deserialize, Serialize};

use crate::state::{AdminGuard, AppState};

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub q: Option<String>,
    pub status: Option<String>,
    pub payment_method: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub topups: Vec<TopUp>,
    pub limit: u32,
    pub offset: u32,
}

pub async fn list(
    State(state): State<AppState>,
    _admin: AdminGuard,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> Result<ApiJson<ListResponse>, ApiError> {
    let filter = TopUpFilter {
        q: query.q,
        status: super::parse_param::<TopUpStatus>(
            "status",
            query.status.as_deref(),
        )?,
        payment_method: super::parse_param::<PaymentMethod>(
            "payment_method",
            query.payment_method.as_deref(),
        )?,
        limit: super::clamp_limit(query.limit, DEFAULT_LIMIT, MAX_LIMIT),
        offset: query.offset.unwrap_or(0),
    };
    let topups = state
        .deps
        .business
        .list_topups(&filter)
        .await
        .map_err(|e| ApiError::internal(e))?;
    Ok(ApiJson(ListResponse {
        topups,
        limit: filter.limit,
        offset: filter.offset,
    }))
}

#[derive(Debug, Serialize)]
pub struct DetailResponse {
    pub topup: TopUp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

pub async fn get_one(
    State(state): State<AppState>,
    _admin: AdminGuard,
    Path(trade_no): Path<String>,
) -> Result<ApiJson<DetailResponse>, ApiError> {
    let topup = state
        .deps
        .business
        .get_topup(&trade_no)
        .await
        .map_err(|e| ApiError::internal(e))?
        .ok_or_else(|| ApiError::not_found("topup"))?;
    let user = state
        .deps
        .business
        .get_user(topup.user_id)
        .await
        .map_err(|e| ApiError::internal(e))?;
    Ok(ApiJson(DetailResponse { topup, user }))
}
