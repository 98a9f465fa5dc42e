//! The batch refund execution pipeline.
//!
//! A batch turns a quote plus operator directives into a sequence of legs,
//! one external refund each, under a per-leg reserve -> log -> call -> settle
//! protocol:
//!
//! 1. **Reserve**: conditionally decrement the user's quota
//!    (`WHERE quota >= delta`); an unexpected row count aborts the batch.
//! 2. **Log pending**: persist the audit row (and with it the idempotency
//!    key) before any external call.
//! 3. **Provider call** with the idempotency key.
//! 4. **Settle**: mark the row succeeded, or release the reserve and mark it
//!    failed.
//!
//! Legs are strictly serialized; a failure in leg N leaves legs 1..N-1
//! durably refunded and surfaces the error.

use std::time::{SystemTime, UNIX_EPOCH};

use refundry_api::error::ApiError;
use refundry_core::fee::{self, parse_fee_percent};
use refundry_core::ids::{BatchId, OutRefundNo, Provider, UserId};
use refundry_core::money::{Cents, Quota};
use refundry_core::refund_log::{NewRefundLog, RefundSettle};
use refundry_core::topup::PaymentMethod;
use refundry_core::trace::CalcTrace;
use refundry_providers::{
    ProviderError, RefundProvider as _, RefundRequest, RefundTarget,
};
use refundry_store::{AuditStore as _, BusinessStore as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::quote::{self, Quote, QuoteContext, SETTLEMENT_CURRENCY};
use crate::EngineDeps;

/// Operator directives for one refund execution (`POST
/// /api/users/{uid}/refund`).
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RefundExecutionRequest {
    /// Override the due amount (it is clamped to the due amount).
    #[serde(
        default,
        with = "refundry_core::serde_helpers::opt_string_or_number"
    )]
    pub amount_yuan: Option<String>,
    /// Merchant-retained fee percent, default 5.
    #[serde(
        default,
        with = "refundry_core::serde_helpers::opt_string_or_number"
    )]
    pub fee_percent: Option<String>,
    #[serde(
        default,
        with = "refundry_core::serde_helpers::opt_string_or_number"
    )]
    pub min_refund_yuan: Option<String>,
    #[serde(
        default,
        with = "refundry_core::serde_helpers::opt_string_or_number"
    )]
    pub max_refund_yuan: Option<String>,
    /// Subtract the user's whole balance (instead of the gross amount's
    /// quota equivalent) on success.
    #[serde(default)]
    pub clear_balance: bool,
    #[serde(default)]
    pub dry_run: bool,
}

/// One executed leg, as reported to the operator.
#[derive(Clone, Debug, Serialize)]
pub struct LegReport {
    pub provider: Provider,
    pub target_id: String,
    pub amount_cents: Cents,
    pub amount_yuan: String,
    pub quota_delta: Quota,
    pub refund_log_id: Uuid,
    pub provider_refund_no: Option<String>,
}

/// The success response for an execution (including dry runs).
#[derive(Clone, Debug, Serialize)]
pub struct ExecutionReport {
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    pub due_yuan: String,
    pub gross_cents: Cents,
    pub gross_yuan: String,
    pub fee_bps: u32,
    pub fee_cents: Cents,
    pub fee_yuan: String,
    pub net_cents: Cents,
    pub net_yuan: String,
    pub target_quota_delta: Quota,
    pub legs: Vec<LegReport>,
    /// Non-fatal anomalies, e.g. an audit settle that failed after the
    /// external refund already went through.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub quote: Quote,
}

/// Everything derived before any side effect.
struct Derivation {
    ctx: QuoteContext,
    fee_bps: u32,
    gross: Cents,
    fee: Cents,
    net: Cents,
    target_quota_delta: Quota,
    trace: CalcTrace,
}

/// One leg waiting to run.
struct PlannedLeg {
    provider: Provider,
    target: RefundTarget,
    payment_method: PaymentMethod,
    /// How much this leg can refund at most.
    cap: Cents,
    topup_trade_no: Option<String>,
    card_charge_id: Option<String>,
    card_payment_intent: Option<String>,
}

/// Execute (or dry-run) a refund batch for one user.
#[instrument(skip(deps, request), name = "(execute-refund)")]
pub async fn execute(
    deps: &EngineDeps,
    user_id: UserId,
    request: &RefundExecutionRequest,
    performed_by: &str,
) -> Result<ExecutionReport, ApiError> {
    let ctx = quote::build(deps, user_id).await?;
    let derivation = derive(ctx, request, performed_by)?;

    if request.dry_run {
        return Ok(report_for(&derivation, None, Vec::new(), Vec::new()));
    }

    run_batch(deps, derivation, request, performed_by).await
}

/// Pure derivation of the amounts a batch will move (§ the quote algorithm
/// plus operator overrides). No side effects.
fn derive(
    ctx: QuoteContext,
    request: &RefundExecutionRequest,
    performed_by: &str,
) -> Result<Derivation, ApiError> {
    let due = ctx.breakdown.due_cents;

    let mut trace = CalcTrace::new();
    trace.push(
        "inputs",
        &json!({
            "user_id": ctx.user.id,
            "amount_yuan": &request.amount_yuan,
            "fee_percent": &request.fee_percent,
            "min_refund_yuan": &request.min_refund_yuan,
            "max_refund_yuan": &request.max_refund_yuan,
            "clear_balance": request.clear_balance,
            "dry_run": request.dry_run,
            "performed_by": performed_by,
        }),
    );
    trace.push("quote.user", &ctx.quote.user);
    trace.push("quote.quota", &ctx.quote.balance);
    trace.push("quote.aggregator", &ctx.quote.aggregator);
    trace.push("quote.card", &ctx.quote.card);
    trace.push(
        "quote.due",
        &json!({
            "due_cents": due,
            "due_yuan": &ctx.quote.due_yuan,
            "formula": "due = floor(sum(max(0, paid_quota - consumed)) \
                        / 5000), clamped to net paid",
            "plan": &ctx.quote.plan,
            "sorted_orders": &ctx.quote.orders,
            "gift_pool_quota": ctx.quote.gift_pool_quota,
        }),
    );

    let fee_bps = parse_fee_percent(request.fee_percent.as_deref())
        .map_err(|e| {
            ApiError::validation("invalid_fee_percent", e.to_string())
        })?;

    let gross = match request.amount_yuan.as_deref() {
        Some(s) => {
            let requested = Cents::from_yuan_str(s).map_err(|e| {
                ApiError::validation("invalid_amount", e.to_string())
            })?;
            if !requested.is_positive() {
                return Err(ApiError::validation(
                    "invalid_amount",
                    format!("refund amount must be positive, got {requested}"),
                ));
            }
            requested.min(due)
        }
        None => due,
    };
    if !gross.is_positive() {
        return Err(ApiError::state_conflict(
            "nothing_to_refund",
            format!("due amount is {due}"),
        ));
    }
    trace.push(
        "amount_override",
        &json!({
            "requested_yuan": &request.amount_yuan,
            "gross_cents": gross,
        }),
    );

    let fee = fee::fee_cents(gross, fee_bps);
    let net = gross.saturating_refundable_sub(fee);
    if !net.is_positive() {
        return Err(ApiError::state_conflict(
            "fee_too_high",
            format!("fee {fee} leaves nothing to refund of {gross}"),
        ));
    }
    trace.push(
        "fee",
        &json!({ "fee_bps": fee_bps, "fee_cents": fee, "net_cents": net }),
    );

    check_range(
        net,
        request.min_refund_yuan.as_deref(),
        request.max_refund_yuan.as_deref(),
    )?;

    let target_quota_delta = if request.clear_balance {
        ctx.user.quota
    } else {
        gross.to_quota()
    };
    trace.push(
        "quota_delta",
        &json!({
            "clear_balance": request.clear_balance,
            "target_quota_delta": target_quota_delta,
        }),
    );

    Ok(Derivation {
        ctx,
        fee_bps,
        gross,
        fee,
        net,
        target_quota_delta,
        trace,
    })
}

fn check_range(
    net: Cents,
    min_yuan: Option<&str>,
    max_yuan: Option<&str>,
) -> Result<(), ApiError> {
    let parse = |s: &str| {
        Cents::from_yuan_str(s).map_err(|e| {
            ApiError::state_conflict(
                "invalid_refund_amount_range",
                e.to_string(),
            )
        })
    };
    let min = min_yuan.map(parse).transpose()?;
    let max = max_yuan.map(parse).transpose()?;
    if let (Some(min), Some(max)) = (min, max) {
        if min > max {
            return Err(ApiError::state_conflict(
                "invalid_refund_amount_range",
                format!("min {min} exceeds max {max}"),
            ));
        }
    }
    let below = min.is_some_and(|min| net < min);
    let above = max.is_some_and(|max| net > max);
    if below || above {
        return Err(ApiError::state_conflict(
            "refund_amount_out_of_range",
            format!("net refund {net} is outside the configured range"),
        ));
    }
    Ok(())
}

/// Order the legs: card charges newest first, then aggregator top-ups newest
/// first, each capped at its remaining refundable amount.
fn plan_legs(ctx: &QuoteContext) -> Vec<PlannedLeg> {
    let mut legs = Vec::new();

    let mut charges = ctx.charges.clone();
    charges.sort_by_key(|c| std::cmp::Reverse((c.created, c.id.clone())));
    for charge in charges {
        legs.push(PlannedLeg {
            provider: Provider::Card,
            target: RefundTarget::CardCharge {
                charge_id: charge.id.clone(),
            },
            payment_method: PaymentMethod::Card,
            cap: charge.remaining(),
            topup_trade_no: None,
            card_charge_id: Some(charge.id),
            card_payment_intent: charge.payment_intent,
        });
    }

    let mut topups = ctx.aggregator_topups.clone();
    topups.sort_by_key(|(t, _)| std::cmp::Reverse((t.create_time, t.id)));
    for (topup, net_paid) in topups {
        legs.push(PlannedLeg {
            provider: Provider::Aggregator,
            target: RefundTarget::AggregatorOrder {
                order_no: topup.trade_no.clone(),
                use_out_trade_no: false,
            },
            payment_method: topup.payment_method,
            cap: net_paid,
            topup_trade_no: Some(topup.trade_no),
            card_charge_id: None,
            card_payment_intent: None,
        });
    }

    legs
}

async fn run_batch(
    deps: &EngineDeps,
    derivation: Derivation,
    request: &RefundExecutionRequest,
    performed_by: &str,
) -> Result<ExecutionReport, ApiError> {
    let user_id = derivation.ctx.user.id;
    let unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    let batch_id = BatchId::derive(user_id, unix_ms);

    let planned = plan_legs(&derivation.ctx);
    let mut base_trace = derivation.trace.clone();
    base_trace.push(
        "execution.init",
        &json!({
            "batch_id": &batch_id,
            "net_cents": derivation.net,
            "target_quota_delta": derivation.target_quota_delta,
            "planned_legs": planned.len(),
        }),
    );

    let mut remaining_cents = derivation.net;
    let mut remaining_quota = derivation.target_quota_delta;
    let mut legs: Vec<LegReport> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    for leg in planned {
        if !remaining_cents.is_positive() {
            break;
        }
        let amount = leg.cap.min(remaining_cents);
        if !amount.is_positive() {
            continue;
        }

        // Proportional quota for this leg; the final leg absorbs the
        // truncation remainder via the >= branch.
        let delta_quota = if amount >= remaining_cents {
            remaining_quota
        } else {
            Quota::new(
                remaining_quota.as_i128() * i128::from(amount.as_i64())
                    / i128::from(remaining_cents.as_i64()),
            )
        };

        // 1. Reserve.
        let reserved = deps
            .business
            .try_reserve_quota(user_id, delta_quota)
            .await
            .map_err(|e| ApiError::internal(e))?;
        if !reserved {
            return Err(ApiError::integrity_conflict(
                "insufficient_user_quota",
                format!(
                    "couldn't reserve {delta_quota} quota for leg of {amount}"
                ),
            )
            .with_details(progress_details(&batch_id, &legs, &warnings)));
        }

        // 2. Log pending. The idempotency key is durable from here on.
        let out_refund_no = OutRefundNo::derive(
            leg.provider,
            &batch_id,
            leg.target.id(),
            amount,
        );
        let mut leg_trace = base_trace.clone();
        leg_trace.push(
            "op",
            &json!({
                "provider": leg.provider,
                "target": &leg.target,
                "amount_cents": amount,
                "delta_quota": delta_quota,
                "remaining_cents_before": remaining_cents,
                "remaining_quota_before": remaining_quota,
                "out_refund_no": &out_refund_no,
            }),
        );
        let new_log = NewRefundLog {
            user_id,
            topup_trade_no: leg.topup_trade_no.clone(),
            card_charge_id: leg.card_charge_id.clone(),
            card_payment_intent: leg.card_payment_intent.clone(),
            payment_method: leg.payment_method,
            currency: SETTLEMENT_CURRENCY.to_owned(),
            refund_money: amount.to_yuan_string(),
            refund_money_minor: amount,
            quota_delta: delta_quota,
            provider: leg.provider,
            out_refund_no: out_refund_no.clone(),
            performed_by: Some(performed_by.to_owned()),
            raw_request: leg_trace.to_json(),
        };
        let log_id = match deps.audit.insert_pending(&new_log).await {
            Ok(id) => id,
            Err(e) => {
                // Nothing external happened yet; release and abort.
                release_reserve(
                    deps,
                    user_id,
                    delta_quota,
                    &mut warnings,
                )
                .await;
                return Err(ApiError::external(
                    "supabase_error",
                    format!("couldn't persist pending refund log: {e}"),
                )
                .with_details(progress_details(&batch_id, &legs, &warnings)));
            }
        };

        // 3. Provider call.
        let provider = deps.provider(leg.provider);
        let refund_request = RefundRequest {
            target: leg.target.clone(),
            amount: Some(amount),
            expect_customer: match leg.provider {
                Provider::Card =>
                    derivation.ctx.user.card_customer_id.clone(),
                Provider::Aggregator => None,
            },
        };
        let call_result =
            provider.refund(&refund_request, &out_refund_no).await;

        // 4. Settle.
        match call_result {
            Ok(outcome) => {
                let settle = RefundSettle::Succeeded {
                    provider_refund_no: outcome.provider_refund_no.clone(),
                    raw_response: outcome.raw_response,
                };
                if let Err(e) = deps.audit.settle(log_id, &settle).await {
                    // The external side already refunded; the leg counts.
                    // The pending row plus idempotency key let a retry
                    // resolve the discrepancy.
                    warn!(
                        "refund log {log_id} succeeded externally but \
                         couldn't be settled: {e}"
                    );
                    warnings.push(format!(
                        "refund_log {log_id} left pending: {e}"
                    ));
                }
                info!(
                    "leg ok: {provider} {target} {amount}",
                    provider = leg.provider,
                    target = leg.target.id(),
                );
                legs.push(LegReport {
                    provider: leg.provider,
                    target_id: leg.target.id().to_owned(),
                    amount_cents: amount,
                    amount_yuan: amount.to_yuan_string(),
                    quota_delta: delta_quota,
                    refund_log_id: log_id,
                    provider_refund_no: outcome.provider_refund_no,
                });
                remaining_cents =
                    remaining_cents.saturating_refundable_sub(amount);
                remaining_quota =
                    remaining_quota.saturating_refundable_sub(delta_quota);
            }
            Err(provider_err) => {
                release_reserve(deps, user_id, delta_quota, &mut warnings)
                    .await;
                let settle = RefundSettle::Failed {
                    error_message: provider_err.to_string(),
                    raw_response: serde_json::Value::Null,
                };
                if let Err(e) = deps.audit.settle(log_id, &settle).await {
                    warnings.push(format!(
                        "refund_log {log_id} left pending after provider \
                         failure: {e}"
                    ));
                }
                return Err(provider_error_to_api(provider_err)
                    .with_details(progress_details(
                        &batch_id, &legs, &warnings,
                    )));
            }
        }
    }

    if remaining_cents.is_positive() {
        // Residual reserved quota from proportional truncation stays
        // reserved on an incomplete batch; releasing it would make the
        // audit rows disagree with the user's actual decrement.
        return Err(ApiError::new(
            refundry_api::error::ErrorKind::PartialSuccess,
            "refund_incomplete",
            format!(
                "{remaining} could not be allocated to any payment",
                remaining = remaining_cents.to_yuan_string(),
            ),
        )
        .with_details(progress_details(&batch_id, &legs, &warnings)));
    }

    info!(
        "batch {batch_id} done: {count} legs, net {net}",
        count = legs.len(),
        net = derivation.net,
    );
    Ok(report_for(&derivation, Some(batch_id), legs, warnings))
}

async fn release_reserve(
    deps: &EngineDeps,
    user_id: UserId,
    delta_quota: Quota,
    warnings: &mut Vec<String>,
) {
    if let Err(e) = deps.business.release_quota(user_id, delta_quota).await {
        // The reserve is now leaked; only a human can reconcile.
        warn!("couldn't release reserved quota {delta_quota}: {e}");
        warnings.push(format!(
            "compensation failed, {delta_quota} quota still reserved: {e}"
        ));
    }
}

fn progress_details(
    batch_id: &BatchId,
    legs: &[LegReport],
    warnings: &[String],
) -> serde_json::Value {
    json!({
        "batch_id": batch_id,
        "succeeded_legs": legs,
        "warnings": warnings,
    })
}

pub(crate) fn provider_error_to_api(err: ProviderError) -> ApiError {
    match err {
        ProviderError::CustomerMismatch => ApiError::integrity_conflict(
            "customer_mismatch",
            "payment belongs to a different customer",
        ),
        ProviderError::NotSucceeded(state) => ApiError::integrity_conflict(
            "not_succeeded",
            format!("payment is not refundable in state {state:?}"),
        ),
        ProviderError::BadSignature => ApiError::external(
            "signature_verification_failed",
            "provider response signature did not verify",
        ),
        ProviderError::InvalidRequest(msg) => ApiError::internal(msg),
        ProviderError::Rejected(msg) =>
            ApiError::external("provider_error", msg),
        ProviderError::InvalidResponse(msg) =>
            ApiError::external("provider_error", msg),
        ProviderError::Rest(e) =>
            ApiError::external("provider_error", e.to_string()),
    }
}

fn report_for(
    derivation: &Derivation,
    batch_id: Option<BatchId>,
    legs: Vec<LegReport>,
    warnings: Vec<String>,
) -> ExecutionReport {
    ExecutionReport {
        dry_run: batch_id.is_none(),
        batch_id,
        due_yuan: derivation.ctx.quote.due_yuan.clone(),
        gross_cents: derivation.gross,
        gross_yuan: derivation.gross.to_yuan_string(),
        fee_bps: derivation.fee_bps,
        fee_cents: derivation.fee,
        fee_yuan: derivation.fee.to_yuan_string(),
        net_cents: derivation.net,
        net_yuan: derivation.net.to_yuan_string(),
        target_quota_delta: derivation.target_quota_delta,
        legs,
        warnings,
        quote: derivation.ctx.quote.clone(),
    }
}
