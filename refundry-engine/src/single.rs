//! The legacy single-top-up refund path (`POST /api/refund`).
//!
//! Refunds one specific top-up in full inside a business-database
//! transaction: the top-up row is locked `FOR UPDATE`, verified to still be
//! `success`, the provider is called, and the status flip plus the full
//! grant's quota decrement commit together. The audit row is settled outside
//! the transaction, same idempotency key discipline as the batch path.

use std::time::{SystemTime, UNIX_EPOCH};

use refundry_api::error::ApiError;
use refundry_core::ids::{BatchId, OutRefundNo, Provider, UserId};
use refundry_core::money::{Cents, Quota};
use refundry_core::refund_log::{NewRefundLog, RefundSettle};
use refundry_core::topup::TopUpStatus;
use refundry_core::trace::CalcTrace;
use refundry_providers::{
    RefundProvider as _, RefundRequest, RefundTarget,
};
use refundry_store::{
    AuditStore as _, BusinessStore as _, SingleRefundGuard as _, StoreError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::execute::provider_error_to_api;
use crate::quote::SETTLEMENT_CURRENCY;
use crate::EngineDeps;

/// Request body for the legacy path.
#[derive(Clone, Debug, Deserialize)]
pub struct SingleRefundRequest {
    pub trade_no: String,
}

/// Success response for the legacy path.
#[derive(Clone, Debug, Serialize)]
pub struct SingleRefundReport {
    pub trade_no: String,
    pub user_id: UserId,
    pub refund_cents: Cents,
    pub refund_yuan: String,
    pub quota_delta: Quota,
    pub refund_log_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_refund_no: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Refund one top-up in full.
#[instrument(skip(deps), name = "(single-refund)")]
pub async fn refund_single_topup(
    deps: &EngineDeps,
    trade_no: &str,
    performed_by: &str,
) -> Result<SingleRefundReport, ApiError> {
    let guard = deps
        .business
        .begin_single_refund(trade_no)
        .await
        .map_err(|e| ApiError::internal(e))?
        .ok_or_else(|| ApiError::not_found("topup"))?;

    let topup = guard.topup().clone();
    let user = guard.user().clone();

    if topup.status != TopUpStatus::Success {
        let _ = guard.rollback().await;
        return Err(ApiError::state_conflict(
            "topup_not_refundable",
            format!("topup {trade_no} is {status}", status = topup.status),
        ));
    }

    let refund_cents = topup.money;
    if !refund_cents.is_positive() {
        let _ = guard.rollback().await;
        return Err(ApiError::state_conflict(
            "nothing_to_refund",
            format!("topup {trade_no} paid {refund_cents}"),
        ));
    }
    let quota_delta = topup.original_grant_quota();

    let unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    let batch_id = BatchId::derive(user.id, unix_ms);

    // The card processor keys refunds by charge / payment-intent id; the
    // stored trade_no is whichever the checkout produced.
    let (provider, target) = if topup.payment_method.is_aggregator() {
        (
            Provider::Aggregator,
            RefundTarget::AggregatorOrder {
                order_no: topup.trade_no.clone(),
                use_out_trade_no: false,
            },
        )
    } else if topup.trade_no.starts_with("pi_") {
        (
            Provider::Card,
            RefundTarget::CardPaymentIntent {
                payment_intent_id: topup.trade_no.clone(),
            },
        )
    } else {
        (
            Provider::Card,
            RefundTarget::CardCharge {
                charge_id: topup.trade_no.clone(),
            },
        )
    };
    let out_refund_no =
        OutRefundNo::derive(provider, &batch_id, target.id(), refund_cents);

    let mut trace = CalcTrace::new();
    trace.push(
        "inputs",
        &json!({
            "path": "single_topup",
            "trade_no": trade_no,
            "user_id": user.id,
            "performed_by": performed_by,
        }),
    );
    trace.push(
        "op",
        &json!({
            "provider": provider,
            "target": &target,
            "amount_cents": refund_cents,
            "quota_delta": quota_delta,
            "out_refund_no": &out_refund_no,
        }),
    );

    let new_log = NewRefundLog {
        user_id: user.id,
        topup_trade_no: Some(topup.trade_no.clone()),
        card_charge_id: match &target {
            RefundTarget::CardCharge { charge_id } =>
                Some(charge_id.clone()),
            _ => None,
        },
        card_payment_intent: match &target {
            RefundTarget::CardPaymentIntent { payment_intent_id } =>
                Some(payment_intent_id.clone()),
            _ => None,
        },
        payment_method: topup.payment_method,
        currency: SETTLEMENT_CURRENCY.to_owned(),
        refund_money: refund_cents.to_yuan_string(),
        refund_money_minor: refund_cents,
        quota_delta,
        provider,
        out_refund_no: out_refund_no.clone(),
        performed_by: Some(performed_by.to_owned()),
        raw_request: trace.to_json(),
    };
    let log_id = match deps.audit.insert_pending(&new_log).await {
        Ok(id) => id,
        Err(e) => {
            let _ = guard.rollback().await;
            return Err(ApiError::external(
                "supabase_error",
                format!("couldn't persist pending refund log: {e}"),
            ));
        }
    };

    let refund_request = RefundRequest {
        target,
        amount: Some(refund_cents),
        expect_customer: match provider {
            Provider::Card => user.card_customer_id.clone(),
            Provider::Aggregator => None,
        },
    };
    let outcome =
        match deps.provider(provider).refund(&refund_request, &out_refund_no).await
        {
            Ok(outcome) => outcome,
            Err(provider_err) => {
                let _ = guard.rollback().await;
                let settle = RefundSettle::Failed {
                    error_message: provider_err.to_string(),
                    raw_response: serde_json::Value::Null,
                };
                if let Err(e) = deps.audit.settle(log_id, &settle).await {
                    warn!("refund log {log_id} left pending: {e}");
                }
                return Err(provider_error_to_api(provider_err));
            }
        };

    let mut warnings = Vec::new();

    // Status flip + quota decrement commit together. If the commit fails
    // the business side rolled back: the user's quota was never
    // decremented, so the audit row must not claim a quota_delta was
    // applied. The external refund is already durable; record it on the
    // failed row and surface the conflict.
    if let Err(commit_err) = guard.commit_refunded(quota_delta).await {
        let message = format!(
            "provider refund completed but the business transaction \
             failed: {commit_err}"
        );
        warn!("topup {trade_no}: {message}");
        let settle = RefundSettle::Failed {
            error_message: message.clone(),
            raw_response: outcome.raw_response,
        };
        if let Err(e) = deps.audit.settle(log_id, &settle).await {
            warn!("refund log {log_id} left pending: {e}");
        }
        return Err(match commit_err {
            StoreError::Conflict(_) => ApiError::integrity_conflict(
                "topup_already_updated",
                message,
            ),
            other => ApiError::internal(other),
        });
    }

    let settle = RefundSettle::Succeeded {
        provider_refund_no: outcome.provider_refund_no.clone(),
        raw_response: outcome.raw_response,
    };
    if let Err(e) = deps.audit.settle(log_id, &settle).await {
        warnings.push(format!("refund_log {log_id} left pending: {e}"));
    }

    Ok(SingleRefundReport {
        trade_no: trade_no.to_owned(),
        user_id: user.id,
        refund_cents,
        refund_yuan: refund_cents.to_yuan_string(),
        quota_delta,
        refund_log_id: log_id,
        provider_refund_no: outcome.provider_refund_no,
        warnings,
    })
}
