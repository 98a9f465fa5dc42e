//! Quote building: gather a user's payment history, net it against the
//! refund ledger, enforce the currency guard, and run the pure quote
//! algorithm.

use refundry_api::error::ApiError;
use refundry_core::charge::CardCharge;
use refundry_core::ids::UserId;
use refundry_core::money::{Cents, MoneyError, Quota};
use refundry_core::quote::{
    self, OrderId, OrderInput, QuoteBreakdown, RefundPlan,
};
use refundry_core::topup::TopUp;
use refundry_core::user::{User, UserSnapshot};
use refundry_providers::ChargeSource as _;
use refundry_store::{
    AuditStore as _, BusinessStore as _, RefundedTotals, UserRefundTotals,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::EngineDeps;

/// The only currency this system moves.
pub const SETTLEMENT_CURRENCY: &str = "cny";

/// Quote-level failures.
#[derive(Debug, thiserror::Error)]
pub enum QuoteError {
    /// The card processor reports charges in more than one currency for
    /// this customer. No mixing.
    #[error("card charges span multiple currencies")]
    MultipleCurrencies,
    /// The single card currency is not CNY.
    #[error("card charges are in {0:?}, not cny")]
    NonCny(String),
    #[error(transparent)]
    Money(#[from] MoneyError),
}

impl QuoteError {
    /// The stable code for the per-user API path.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MultipleCurrencies => "stripe_multiple_currencies",
            Self::NonCny(_) => "stripe_non_cny_currency",
            Self::Money(_) => "internal",
        }
    }
}

impl From<QuoteError> for ApiError {
    fn from(err: QuoteError) -> Self {
        match &err {
            QuoteError::MultipleCurrencies | QuoteError::NonCny(_) =>
                ApiError::state_conflict(err.code(), err.to_string()),
            QuoteError::Money(e) => ApiError::internal(e),
        }
    }
}

/// Per-channel paid aggregates, all in minor units with yuan renderings.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChannelTotals {
    pub gross_cents: Cents,
    pub refunded_cents: Cents,
    pub net_cents: Cents,
    pub gross_yuan: String,
    pub refunded_yuan: String,
    pub net_yuan: String,
}

impl ChannelTotals {
    fn new(gross: Cents, refunded: Cents) -> Self {
        let net = gross.saturating_refundable_sub(refunded);
        Self {
            gross_cents: gross,
            refunded_cents: refunded,
            net_cents: net,
            gross_yuan: gross.to_yuan_string(),
            refunded_yuan: refunded.to_yuan_string(),
            net_yuan: net.to_yuan_string(),
        }
    }
}

/// The user's balance in quota units and yuan equivalents.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BalanceView {
    pub remaining_quota: Quota,
    pub used_quota: Quota,
    pub remaining_yuan: String,
    pub used_yuan: String,
    pub total_yuan: String,
}

/// The plan split with yuan renderings.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PlanView {
    pub card_cents: Cents,
    pub aggregator_cents: Cents,
    pub card_yuan: String,
    pub aggregator_yuan: String,
}

impl PlanView {
    fn from_plan(plan: RefundPlan) -> Self {
        Self {
            card_cents: plan.card_cents,
            aggregator_cents: plan.aggregator_cents,
            card_yuan: plan.card_cents.to_yuan_string(),
            aggregator_yuan: plan.aggregator_cents.to_yuan_string(),
        }
    }
}

/// The wire quote returned by `GET /api/users/{uid}/refund-quote` and
/// embedded in computation traces.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub user: UserSnapshot,
    pub balance: BalanceView,
    pub aggregator: ChannelTotals,
    pub card: ChannelTotals,
    pub due_cents: Cents,
    pub due_yuan: String,
    pub plan: PlanView,
    /// Per-order computation view, in consumption-allocation order.
    pub orders: Vec<refundry_core::quote::OrderAllocation>,
    pub gift_pool_quota: Quota,
}

/// A quote plus the execution inputs derived alongside it.
#[derive(Debug)]
pub struct QuoteContext {
    pub user: User,
    pub quote: Quote,
    pub breakdown: QuoteBreakdown,
    /// Settled card charges, for card legs. Unordered.
    pub charges: Vec<CardCharge>,
    /// Aggregator top-ups paired with their net refundable paid amount,
    /// for aggregator legs. Unordered.
    pub aggregator_topups: Vec<(TopUp, Cents)>,
}

/// Assemble a quote from already-gathered inputs. CPU-only.
pub fn assemble(
    user: &User,
    topups: &[TopUp],
    totals: &UserRefundTotals,
    charges: &[CardCharge],
) -> Result<QuoteContext, QuoteError> {
    // Only charges that actually moved money participate.
    let settled: Vec<&CardCharge> =
        charges.iter().filter(|c| c.is_settled()).collect();

    // Currency guard: one currency, and it must be CNY.
    let mut currency: Option<&str> = None;
    for charge in &settled {
        match currency {
            None => currency = Some(&charge.currency),
            Some(seen) if seen != charge.currency =>
                return Err(QuoteError::MultipleCurrencies),
            Some(_) => {}
        }
    }
    if let Some(seen) = currency {
        if seen != SETTLEMENT_CURRENCY {
            return Err(QuoteError::NonCny(seen.to_owned()));
        }
    }

    let zero_totals = RefundedTotals::default();
    let mut inputs = Vec::new();

    // Aggregator orders, netted against the refund ledger by trade_no.
    let mut aggregator_topups = Vec::new();
    let mut aggregator_gross = Cents::ZERO;
    let mut aggregator_refunded = Cents::ZERO;
    for topup in topups {
        if !topup.payment_method.is_aggregator() {
            continue;
        }
        let refunded = totals
            .by_trade_no
            .get(&topup.trade_no)
            .unwrap_or(&zero_totals);
        let paid = topup.money.saturating_refundable_sub(refunded.money_minor);
        let grant = topup
            .original_grant_quota()
            .saturating_refundable_sub(refunded.quota);
        aggregator_gross = aggregator_gross
            .checked_add(topup.money)
            .unwrap_or(aggregator_gross);
        aggregator_refunded = aggregator_refunded
            .checked_add(refunded.money_minor)
            .unwrap_or(aggregator_refunded);
        inputs.push(OrderInput {
            id: OrderId::TopUp(topup.id),
            paid_cents: paid,
            grant_quota: grant,
            created_at: topup.create_time,
        });
        aggregator_topups.push((topup.clone(), paid));
    }

    // Card orders: the processor's ledger is authoritative for cash; the
    // grant comes from the matching top-up row, falling back to the paid
    // amount when no row matches.
    let mut card_gross = Cents::ZERO;
    let mut card_refunded = Cents::ZERO;
    for charge in &settled {
        let refunded = totals
            .by_charge_id
            .get(&charge.id)
            .unwrap_or(&zero_totals);
        let matching_topup = topups.iter().find(|t| {
            t.trade_no == charge.id
                || charge
                    .payment_intent
                    .as_deref()
                    .is_some_and(|pi| t.trade_no == pi)
        });
        let original_grant = match matching_topup {
            Some(topup) => topup.original_grant_quota(),
            // Known under-estimate: promotional grants on unmatched card
            // top-ups are invisible here.
            None => charge.amount.to_quota(),
        };
        let grant = original_grant.saturating_refundable_sub(refunded.quota);
        card_gross =
            card_gross.checked_add(charge.amount).unwrap_or(card_gross);
        card_refunded = card_refunded
            .checked_add(charge.amount_refunded)
            .unwrap_or(card_refunded);
        inputs.push(OrderInput {
            id: OrderId::Charge(charge.id.clone()),
            paid_cents: charge.remaining(),
            grant_quota: grant,
            created_at: charge.created,
        });
    }

    let breakdown = quote::compute(user.quota, user.used_quota, inputs)?;

    let balance_total = user
        .quota
        .checked_add(user.used_quota)
        .unwrap_or(user.quota);
    let balance = BalanceView {
        remaining_quota: user.quota,
        used_quota: user.used_quota,
        remaining_yuan: user.quota.to_cents_floor()?.to_yuan_string(),
        used_yuan: user.used_quota.to_cents_floor()?.to_yuan_string(),
        total_yuan: balance_total.to_cents_floor()?.to_yuan_string(),
    };

    let quote = Quote {
        user: UserSnapshot::from(user),
        balance,
        aggregator: ChannelTotals::new(aggregator_gross, aggregator_refunded),
        card: ChannelTotals::new(card_gross, card_refunded),
        due_cents: breakdown.due_cents,
        due_yuan: breakdown.due_cents.to_yuan_string(),
        plan: PlanView::from_plan(breakdown.plan),
        orders: breakdown.orders.clone(),
        gift_pool_quota: breakdown.gift_pool_quota,
    };

    Ok(QuoteContext {
        user: user.clone(),
        quote,
        breakdown,
        charges: settled.into_iter().cloned().collect(),
        aggregator_topups,
    })
}

/// Gather everything and build the quote for one user.
///
/// Fails `user_not_found` for unknown users and with the currency-guard
/// codes for card customers the system refuses to quote.
#[instrument(skip(deps), name = "(build-quote)")]
pub async fn build(
    deps: &EngineDeps,
    user_id: UserId,
) -> Result<QuoteContext, ApiError> {
    let user = deps
        .business
        .get_user(user_id)
        .await
        .map_err(|e| ApiError::internal(e))?
        .ok_or_else(|| ApiError::not_found("user"))?;

    let topups = deps
        .business
        .user_topups(user_id)
        .await
        .map_err(|e| ApiError::internal(e))?;

    let totals = deps
        .audit
        .user_refund_totals(user_id)
        .await
        .map_err(|e| ApiError::external("supabase_error", e.to_string()))?;

    let charges = match &user.card_customer_id {
        Some(customer_id) => deps
            .charges
            .list_customer_charges(customer_id)
            .await
            .map_err(|e| {
                ApiError::external(
                    "provider_error",
                    format!("couldn't list card charges: {e}"),
                )
            })?,
        None => Vec::new(),
    };

    assemble(&user, &topups, &totals, &charges).map_err(ApiError::from)
}

#[cfg(test)]
mod test {
    use refundry_core::topup::{PaymentMethod, TopUpStatus};

    use super::*;

    fn user(quota: i128, used: i128) -> User {
        User {
            id: UserId::new(1),
            email: Some("u@example.com".to_owned()),
            card_customer_id: Some("cus_1".to_owned()),
            quota: Quota::new(quota),
            used_quota: Quota::new(used),
        }
    }

    fn aggregator_topup(id: i64, trade_no: &str, money: i64) -> TopUp {
        TopUp {
            id,
            user_id: UserId::new(1),
            money: Cents::new(money),
            amount: None,
            trade_no: trade_no.to_owned(),
            create_time: 1000 + id,
            payment_method: PaymentMethod::Alipay,
            status: TopUpStatus::Success,
        }
    }

    fn charge(id: &str, amount: i64, refunded: i64, currency: &str) -> CardCharge {
        CardCharge {
            id: id.to_owned(),
            created: 500,
            currency: currency.to_owned(),
            amount: Cents::new(amount),
            amount_refunded: Cents::new(refunded),
            payment_intent: Some(format!("pi_{id}")),
            paid: true,
            status: "succeeded".to_owned(),
        }
    }

    #[test]
    fn multi_currency_is_rejected() {
        let err = assemble(
            &user(0, 0),
            &[],
            &UserRefundTotals::default(),
            &[charge("ch_1", 100, 0, "cny"), charge("ch_2", 100, 0, "usd")],
        )
        .unwrap_err();
        assert_eq!(err.code(), "stripe_multiple_currencies");
    }

    #[test]
    fn non_cny_is_rejected() {
        let err = assemble(
            &user(0, 0),
            &[],
            &UserRefundTotals::default(),
            &[charge("ch_1", 100, 0, "usd")],
        )
        .unwrap_err();
        assert_eq!(err.code(), "stripe_non_cny_currency");
    }

    #[test]
    fn ledger_netting_applies() {
        // Paid 10.00, previously refunded 4.00 (and 2_000_000 quota).
        let mut totals = UserRefundTotals::default();
        totals.by_trade_no.insert(
            "T1".to_owned(),
            RefundedTotals {
                money_minor: Cents::new(400),
                quota: Quota::new(2_000_000),
            },
        );
        let ctx = assemble(
            &user(3_000_000, 0),
            &[aggregator_topup(1, "T1", 1000)],
            &totals,
            &[],
        )
        .unwrap();
        assert_eq!(ctx.quote.aggregator.net_cents, Cents::new(600));
        assert_eq!(ctx.quote.due_cents, Cents::new(600));
        assert_eq!(ctx.quote.plan.aggregator_cents, Cents::new(600));
        assert_eq!(ctx.aggregator_topups[0].1, Cents::new(600));
    }

    #[test]
    fn unsettled_charges_are_ignored() {
        let mut pending = charge("ch_p", 1000, 0, "cny");
        pending.status = "pending".to_owned();
        let ctx = assemble(
            &user(500_000 * 10, 0),
            &[],
            &UserRefundTotals::default(),
            &[pending, charge("ch_ok", 1000, 0, "cny")],
        )
        .unwrap();
        assert_eq!(ctx.charges.len(), 1);
        assert_eq!(ctx.quote.card.gross_cents, Cents::new(1000));
        assert_eq!(ctx.quote.due_cents, Cents::new(1000));
        assert_eq!(ctx.quote.plan.card_cents, Cents::new(1000));
    }
}
