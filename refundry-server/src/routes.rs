//! The HTTP surface.

use axum::routing::{get, post};
use axum::Router;
use refundry_api::error::ApiError;

use crate::state::AppState;

mod estimate;
mod public;
mod refunds;
mod topups;
mod users;

/// Build the full router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/topups", get(topups::list))
        .route("/api/topups/{trade_no}", get(topups::get_one))
        .route("/api/users", get(users::search))
        .route("/api/users/{uid}/refund-quote", get(users::refund_quote))
        .route("/api/users/{uid}/refund", post(users::refund))
        .route("/api/refund", post(refunds::single))
        .route("/api/refunds", get(refunds::list))
        .route("/api/refunds/{id}", get(refunds::get_one))
        .route("/api/refund-estimate", get(estimate::state))
        .route(
            "/api/refund-estimate/recompute",
            post(estimate::recompute),
        )
        .route("/api/refund-estimate/users", post(estimate::users))
        .route(
            "/api/public/refunds/activity",
            get(public::activity_list),
        )
        .route(
            "/api/public/refunds/activity/{id}",
            get(public::activity_detail),
        )
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Clamp a pagination limit into `1..=max`, with a default for 0/absent.
fn clamp_limit(limit: Option<u32>, default: u32, max: u32) -> u32 {
    match limit {
        None | Some(0) => default,
        Some(limit) => limit.min(max),
    }
}

/// Parse an optional enum-ish query value, mapping failures to a
/// validation error naming the parameter.
fn parse_param<T: std::str::FromStr>(
    name: &'static str,
    value: Option<&str>,
) -> Result<Option<T>, ApiError> {
    value
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse::<T>().map_err(|_| {
                ApiError::validation(
                    "invalid_query",
                    format!("bad value for {name}: {v:?}"),
                )
            })
        })
        .transpose()
}
