//! The public activity view: a redacted, never-cached projection of the
//! refund log. Unauthenticated by design; redaction is the security
//! boundary, so the full rows never reach this module's responses.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use http::header::{HeaderValue, CACHE_CONTROL};
use refundry_api::error::ApiError;
use refundry_api::server::{ApiJson, ApiQuery};
use refundry_core::redact::redact_value;
use refundry_store::{AuditStore as _, RefundLogFilter};
use serde::Deserialize;
use serde_json::json;

use crate::state::AppState;

const DEFAULT_LIMIT: u32 = 20;
const MAX_LIMIT: u32 = 50;

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub async fn activity_list(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<ActivityQuery>,
) -> Result<Response, ApiError> {
    let filter = RefundLogFilter {
        limit: super::clamp_limit(query.limit, DEFAULT_LIMIT, MAX_LIMIT),
        offset: query.offset.unwrap_or(0),
        ..RefundLogFilter::default()
    };
    let rows = state
        .deps
        .audit
        .list(&filter)
        .await
        .map_err(|_| ApiError::internal("activity unavailable"))?;

    let activity: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            serde_json::to_value(row)
                .map(|value| redact_value(&value))
                .unwrap_or(json!({}))
        })
        .collect();
    Ok(no_store(ApiJson(json!({
        "activity": activity,
        "limit": filter.limit,
        "offset": filter.offset,
    }))))
}

pub async fn activity_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = super::refunds::parse_refund_id(&id)?;
    let row = state
        .deps
        .audit
        .get(id)
        .await
        .map_err(|_| ApiError::internal("activity unavailable"))?
        .ok_or_else(|| ApiError::not_found("refund"))?;

    let redacted = serde_json::to_value(&row)
        .map(|value| redact_value(&value))
        .unwrap_or(json!({}));
    Ok(no_store(ApiJson(redacted)))
}

fn no_store(body: impl IntoResponse) -> Response {
    let mut response = body.into_response();
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}
