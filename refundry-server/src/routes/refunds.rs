//! Refund log listing and the legacy single-top-up refund.

use axum::extract::{Path, State};
use chrono::{DateTime, Utc};
use refundry_api::error::ApiError;
use refundry_api::server::{ApiJson, ApiQuery};
use refundry_core::ids::UserId;
use refundry_core::refund_log::{RefundLog, RefundStatus};
use refundry_core::topup::PaymentMethod;
use refundry_engine::single::{
    self, SingleRefundReport, SingleRefundRequest,
};
use refundry_store::{AuditStore as _, RefundLogFilter};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{AdminGuard, AppState};

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// The business-database user id; named for the audit store column.
    pub mysql_user_id: Option<i64>,
    pub status: Option<String>,
    pub payment_method: Option<String>,
    /// RFC 3339.
    pub start_at: Option<String>,
    pub end_at: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub refunds: Vec<RefundLog>,
    pub limit: u32,
    pub offset: u32,
}

pub async fn list(
    State(state): State<AppState>,
    _admin: AdminGuard,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> Result<ApiJson<ListResponse>, ApiError> {
    let filter = RefundLogFilter {
        user_id: query.mysql_user_id.map(UserId::new),
        status: super::parse_param::<RefundStatus>(
            "status",
            query.status.as_deref(),
        )?,
        payment_method: super::parse_param::<PaymentMethod>(
            "payment_method",
            query.payment_method.as_deref(),
        )?,
        start_at: parse_time("start_at", query.start_at.as_deref())?,
        end_at: parse_time("end_at", query.end_at.as_deref())?,
        limit: super::clamp_limit(query.limit, DEFAULT_LIMIT, MAX_LIMIT),
        offset: query.offset.unwrap_or(0),
    };
    let refunds = state
        .deps
        .audit
        .list(&filter)
        .await
        .map_err(|e| ApiError::external("supabase_error", e.to_string()))?;
    Ok(ApiJson(ListResponse {
        refunds,
        limit: filter.limit,
        offset: filter.offset,
    }))
}

pub async fn get_one(
    State(state): State<AppState>,
    _admin: AdminGuard,
    Path(id): Path<String>,
) -> Result<ApiJson<RefundLog>, ApiError> {
    let id = parse_refund_id(&id)?;
    let row = state
        .deps
        .audit
        .get(id)
        .await
        .map_err(|e| ApiError::external("supabase_error", e.to_string()))?
        .ok_or_else(|| ApiError::not_found("refund"))?;
    Ok(ApiJson(row))
}

/// `POST /api/refund` (legacy single-top-up path).
pub async fn single(
    State(state): State<AppState>,
    AdminGuard(identity): AdminGuard,
    ApiJson(request): ApiJson<SingleRefundRequest>,
) -> Result<ApiJson<SingleRefundReport>, ApiError> {
    if request.trade_no.trim().is_empty() {
        return Err(ApiError::validation(
            "invalid_trade_no",
            "trade_no must not be empty",
        ));
    }
    let report = single::refund_single_topup(
        &state.deps,
        request.trade_no.trim(),
        identity.actor(),
    )
    .await?;
    Ok(ApiJson(report))
}

pub(super) fn parse_refund_id(raw: &str) -> Result<Uuid, ApiError> {
    raw.parse::<Uuid>().map_err(|_| {
        ApiError::validation(
            "invalid_refund_id",
            format!("bad refund id: {raw:?}"),
        )
    })
}

fn parse_time(
    name: &'static str,
    value: Option<&str>,
) -> Result<Option<DateTime<Utc>>, ApiError> {
    value
        .filter(|v| !v.is_empty())
        .map(|v| {
            DateTime::parse_from_rfc3339(v)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| {
                    ApiError::validation(
                        "invalid_query",
                        format!("bad value for {name}: {e}"),
                    )
                })
        })
        .transpose()
}
