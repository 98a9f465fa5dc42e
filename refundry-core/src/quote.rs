//! The refund quote algorithm.
//!
//! Given a user's balance counters and their (already netted) top-up history,
//! decide how much money the user is entitled to reclaim right now and how
//! the refund splits across the two provider channels.
//!
//! The computation is pure and CPU-only: callers gather every input before
//! invoking [`compute`], and all comparisons are cross-multiplied integer
//! comparisons in `i128`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::ids::Provider;
use crate::money::{Cents, MoneyError, Quota};

/// Identifies one order in the quote: a business-database top-up (aggregator
/// channel), a card-processor charge (card channel), or the synthetic gift
/// pool.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderId {
    TopUp(i64),
    Charge(String),
    GiftPool,
}

impl OrderId {
    /// The provider channel a refund against this order settles through.
    /// The gift pool has none: it absorbs consumption but is never refunded.
    pub fn channel(&self) -> Option<Provider> {
        match self {
            Self::TopUp(_) => Some(Provider::Aggregator),
            Self::Charge(_) => Some(Provider::Card),
            Self::GiftPool => None,
        }
    }
}

/// One order fed into the quote, already netted against prior refunds:
/// `paid_cents` is paid-minus-refunded cash, `grant_quota` is
/// granted-minus-refunded quota.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OrderInput {
    pub id: OrderId,
    pub paid_cents: Cents,
    pub grant_quota: Quota,
    /// Unix seconds. The synthetic gift pool uses 0.
    pub created_at: i64,
}

/// One order after consumption allocation, in quote order.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OrderAllocation {
    pub id: OrderId,
    pub paid_cents: Cents,
    /// `paid_cents * 5000`.
    pub paid_quota: Quota,
    pub grant_quota: Quota,
    pub created_at: i64,
    /// Consumption assigned to this order: `u`.
    pub consumed_quota: Quota,
    /// Refundable quota left on this order: `max(0, paid_quota - u)`.
    pub refundable_quota: Quota,
}

/// The split of the due amount across the provider channels.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RefundPlan {
    pub card_cents: Cents,
    pub aggregator_cents: Cents,
}

/// Everything [`compute`] derives. The `orders` vec is the forensic
/// per-order view rendered in the computation trace.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct QuoteBreakdown {
    /// All orders (including the synthetic gift pool, if any), in
    /// consumption-allocation order.
    pub orders: Vec<OrderAllocation>,
    /// Grant quota of the synthetic gift pool order, zero if none was
    /// needed.
    pub gift_pool_quota: Quota,
    /// Total refundable quota `F` across all orders.
    pub refundable_quota: Quota,
    /// `floor(F / 5000)`, clamped to `total_net_paid_cents`.
    pub due_cents: Cents,
    pub total_net_paid_cents: Cents,
    pub card_net_paid_cents: Cents,
    pub aggregator_net_paid_cents: Cents,
    pub plan: RefundPlan,
}

/// Sort key fragments for one order.
///
/// The promotional ratio `r = (g - p_quota) / g` (or `0/1` when `g = 0`) is
/// kept as an exact fraction; its positive denominator makes the
/// cross-multiplied comparison sign-correct.
fn ratio(alloc: &OrderAllocation) -> (i128, i128) {
    let g = alloc.grant_quota.as_i128();
    if g > 0 {
        (g - alloc.paid_quota.as_i128(), g)
    } else {
        (0, 1)
    }
}

/// Total order over quote orders: promotional ratio descending, grant
/// descending, creation time ascending, id ascending.
///
/// A high ratio means mostly-promotional quota, which the merchant prefers
/// to spend the user's consumption against first: refunding it pays back
/// little cash per quota consumed.
fn cmp_orders(a: &OrderAllocation, b: &OrderAllocation) -> Ordering {
    let (na, da) = ratio(a);
    let (nb, db) = ratio(b);
    // r descending: r_a > r_b  <=>  na * db > nb * da  (da, db > 0)
    (nb * da)
        .cmp(&(na * db))
        .then_with(|| b.grant_quota.cmp(&a.grant_quota))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Run the quote over netted order inputs.
///
/// Fails only on arithmetic overflow of the due amount, which no realistic
/// ledger can reach.
pub fn compute(
    quota: Quota,
    used_quota: Quota,
    inputs: Vec<OrderInput>,
) -> Result<QuoteBreakdown, MoneyError> {
    // Channel aggregates over the real orders.
    let mut total_net_paid = Cents::ZERO;
    let mut card_net_paid = Cents::ZERO;
    let mut aggregator_net_paid = Cents::ZERO;
    let mut total_grant = Quota::ZERO;
    for input in &inputs {
        total_net_paid = total_net_paid
            .checked_add(input.paid_cents)
            .ok_or_else(|| MoneyError::OutOfRange("total paid".to_owned()))?;
        match input.id.channel() {
            Some(Provider::Card) => {
                card_net_paid = card_net_paid
                    .checked_add(input.paid_cents)
                    .unwrap_or(card_net_paid);
            }
            Some(Provider::Aggregator) => {
                aggregator_net_paid = aggregator_net_paid
                    .checked_add(input.paid_cents)
                    .unwrap_or(aggregator_net_paid);
            }
            None => {}
        }
        total_grant = total_grant
            .checked_add(input.grant_quota)
            .ok_or_else(|| MoneyError::OutOfRange("total grant".to_owned()))?;
    }

    let mut orders: Vec<OrderAllocation> = inputs
        .into_iter()
        .map(|input| OrderAllocation {
            paid_quota: input.paid_cents.to_quota(),
            consumed_quota: Quota::ZERO,
            refundable_quota: Quota::ZERO,
            id: input.id,
            paid_cents: input.paid_cents,
            grant_quota: input.grant_quota,
            created_at: input.created_at,
        })
        .collect();

    // Historical grants that no longer map to any payment (promotional
    // credits, manual adjustments) become one synthetic order which can
    // absorb consumption but can never be refunded.
    let balance_total = quota
        .checked_add(used_quota)
        .ok_or_else(|| MoneyError::OutOfRange("balance total".to_owned()))?;
    let gift_pool_quota = balance_total.saturating_refundable_sub(total_grant);
    if gift_pool_quota.is_positive() {
        orders.push(OrderAllocation {
            id: OrderId::GiftPool,
            paid_cents: Cents::ZERO,
            paid_quota: Quota::ZERO,
            grant_quota: gift_pool_quota,
            created_at: 0,
            consumed_quota: Quota::ZERO,
            refundable_quota: Quota::ZERO,
        });
    }

    orders.sort_by(cmp_orders);

    // Walk the sorted orders, spending the user's consumption against the
    // most-promotional grants first.
    let mut unallocated = used_quota;
    let mut refundable_total = Quota::ZERO;
    for order in &mut orders {
        let consumed = order.grant_quota.min(unallocated).max(Quota::ZERO);
        order.consumed_quota = consumed;
        unallocated = unallocated.saturating_refundable_sub(consumed);
        order.refundable_quota =
            order.paid_quota.saturating_refundable_sub(consumed);
        refundable_total = refundable_total
            .checked_add(order.refundable_quota)
            .ok_or_else(|| {
                MoneyError::OutOfRange("refundable total".to_owned())
            })?;
    }

    let due_cents =
        refundable_total.to_cents_floor()?.min(total_net_paid).max(Cents::ZERO);

    // Card first: card refunds are faster to reconcile and cheaper
    // operationally.
    let card_cents = due_cents.min(card_net_paid).max(Cents::ZERO);
    let aggregator_cents = due_cents
        .checked_sub(card_cents)
        .ok_or_else(|| MoneyError::OutOfRange("plan split".to_owned()))?;

    Ok(QuoteBreakdown {
        orders,
        gift_pool_quota,
        refundable_quota: refundable_total,
        due_cents,
        total_net_paid_cents: total_net_paid,
        card_net_paid_cents: card_net_paid,
        aggregator_net_paid_cents: aggregator_net_paid,
        plan: RefundPlan {
            card_cents,
            aggregator_cents,
        },
    })
}

#[cfg(test)]
mod test {
    use proptest::collection::vec;
    use proptest::{prop_assert, prop_assert_eq, proptest, strategy::Strategy};

    use super::*;
    use crate::money::QUOTA_PER_YUAN;

    fn topup(id: i64, paid_cents: i64, grant_quota: i128, at: i64) -> OrderInput {
        OrderInput {
            id: OrderId::TopUp(id),
            paid_cents: Cents::new(paid_cents),
            grant_quota: Quota::new(grant_quota),
            created_at: at,
        }
    }

    fn charge(id: &str, paid_cents: i64, grant_quota: i128, at: i64) -> OrderInput {
        OrderInput {
            id: OrderId::Charge(id.to_owned()),
            paid_cents: Cents::new(paid_cents),
            grant_quota: Quota::new(grant_quota),
            created_at: at,
        }
    }

    /// One aggregator top-up of 10.00, nothing consumed: the full payment is
    /// due, all on the aggregator channel.
    #[test]
    fn full_balance_single_topup() {
        let quote = compute(
            Quota::new(5 * QUOTA_PER_YUAN * 2),
            Quota::ZERO,
            vec![topup(1, 1000, 10 * QUOTA_PER_YUAN, 100)],
        )
        .unwrap();
        assert_eq!(quote.due_cents, Cents::new(1000));
        assert_eq!(quote.plan.aggregator_cents, Cents::new(1000));
        assert_eq!(quote.plan.card_cents, Cents::ZERO);
        assert_eq!(quote.gift_pool_quota, Quota::ZERO);
    }

    /// A half-promotional top-up (paid 10, granted 20) with half the grant
    /// consumed: consumption eats the whole paid portion, nothing is due.
    #[test]
    fn promotion_partially_consumed() {
        let quote = compute(
            Quota::new(10 * QUOTA_PER_YUAN),
            Quota::new(10 * QUOTA_PER_YUAN),
            vec![topup(1, 1000, 20 * QUOTA_PER_YUAN, 100)],
        )
        .unwrap();
        let order = &quote.orders[0];
        assert_eq!(order.consumed_quota, Quota::new(10 * QUOTA_PER_YUAN));
        assert_eq!(order.refundable_quota, Quota::ZERO);
        assert_eq!(quote.due_cents, Cents::ZERO);
    }

    /// Two orders: X paid 10 granted 10 (r = 0), Y paid 5 granted 15
    /// (r = 2/3). Consumption of 5 yuan worth lands entirely on Y, so X
    /// stays fully refundable.
    #[test]
    fn consumption_prefers_promotional_order() {
        let quote = compute(
            Quota::new(20 * QUOTA_PER_YUAN),
            Quota::new(5 * QUOTA_PER_YUAN),
            vec![
                topup(1, 1000, 10 * QUOTA_PER_YUAN, 100),
                topup(2, 500, 15 * QUOTA_PER_YUAN, 200),
            ],
        )
        .unwrap();

        assert_eq!(quote.orders[0].id, OrderId::TopUp(2));
        assert_eq!(
            quote.orders[0].consumed_quota,
            Quota::new(5 * QUOTA_PER_YUAN),
        );
        assert_eq!(quote.orders[0].refundable_quota, Quota::ZERO);
        assert_eq!(
            quote.orders[1].refundable_quota,
            Quota::new(10 * QUOTA_PER_YUAN),
        );
        assert_eq!(quote.due_cents, Cents::new(1000));
        assert_eq!(quote.plan.aggregator_cents, Cents::new(1000));
    }

    /// Card money is refunded before aggregator money.
    #[test]
    fn plan_prefers_card_channel() {
        let quote = compute(
            Quota::new(40 * QUOTA_PER_YUAN),
            Quota::new(15 * QUOTA_PER_YUAN),
            vec![
                charge("ch_new", 2000, 20 * QUOTA_PER_YUAN, 300),
                charge("ch_old", 1000, 10 * QUOTA_PER_YUAN, 200),
                topup(1, 1000, 10 * QUOTA_PER_YUAN, 100),
            ],
        )
        .unwrap();
        assert_eq!(quote.due_cents, Cents::new(2500));
        assert_eq!(quote.plan.card_cents, Cents::new(2500));
        assert_eq!(quote.plan.aggregator_cents, Cents::ZERO);
    }

    /// When grants no longer map to any payment, the synthetic gift pool
    /// absorbs consumption first and the real orders stay refundable.
    #[test]
    fn gift_pool_absorbs_consumption() {
        let no_consumption = compute(
            Quota::new(30 * QUOTA_PER_YUAN),
            Quota::ZERO,
            vec![topup(1, 1000, 10 * QUOTA_PER_YUAN, 100)],
        )
        .unwrap();

        // 20 yuan worth of grants came from promotions; the user consumed
        // exactly that much.
        let consumed_promos = compute(
            Quota::new(10 * QUOTA_PER_YUAN),
            Quota::new(20 * QUOTA_PER_YUAN),
            vec![topup(1, 1000, 10 * QUOTA_PER_YUAN, 100)],
        )
        .unwrap();

        assert_eq!(
            consumed_promos.gift_pool_quota,
            Quota::new(20 * QUOTA_PER_YUAN),
        );
        assert_eq!(consumed_promos.due_cents, no_consumption.due_cents);
        assert_eq!(consumed_promos.due_cents, Cents::new(1000));
    }

    /// A user with no paying history has nothing to refund, regardless of
    /// balance.
    #[test]
    fn no_paying_history() {
        let quote = compute(
            Quota::new(7 * QUOTA_PER_YUAN),
            Quota::new(3 * QUOTA_PER_YUAN),
            Vec::new(),
        )
        .unwrap();
        assert_eq!(quote.gift_pool_quota, Quota::new(10 * QUOTA_PER_YUAN));
        assert_eq!(quote.due_cents, Cents::ZERO);
        assert_eq!(quote.plan, RefundPlan::default());
    }

    /// Fully consumed balance leaves nothing due.
    #[test]
    fn zero_quota_consistent_ledger() {
        let quote = compute(
            Quota::ZERO,
            Quota::new(10 * QUOTA_PER_YUAN),
            vec![topup(1, 1000, 10 * QUOTA_PER_YUAN, 100)],
        )
        .unwrap();
        assert_eq!(quote.due_cents, Cents::ZERO);
    }

    fn arb_orders() -> impl Strategy<Value = Vec<OrderInput>> {
        // Ids are drawn from a wide range so ties below the id tiebreaker
        // are between identical orders.
        let order = (
            0i64..1_000_000_000,
            0i64..1_000_000,
            0i128..5_000_000_000,
            0i64..2_000_000_000,
            proptest::bool::ANY,
        )
            .prop_map(|(id, paid, grant, at, card)| {
                if card {
                    charge(&format!("ch_{id}"), paid, grant, at)
                } else {
                    topup(id, paid, grant, at)
                }
            });
        vec(order, 0..12)
    }

    /// due is always within `[0, total_net_paid]`.
    #[test]
    fn due_bounded_by_net_paid() {
        proptest!(|(
            quota in 0i128..10_000_000_000,
            used in 0i128..10_000_000_000,
            orders in arb_orders(),
        )| {
            let quote = compute(
                Quota::new(quota),
                Quota::new(used),
                orders,
            ).unwrap();
            prop_assert!(quote.due_cents >= Cents::ZERO);
            prop_assert!(quote.due_cents <= quote.total_net_paid_cents);
            let plan_total = quote.plan.card_cents
                .checked_add(quote.plan.aggregator_cents)
                .unwrap();
            prop_assert_eq!(plan_total, quote.due_cents);
        });
    }

    /// The sort is total: any input permutation quotes identically.
    #[test]
    fn sort_is_total_under_permutation() {
        proptest!(|(
            quota in 0i128..10_000_000_000,
            used in 0i128..10_000_000_000,
            orders in arb_orders(),
            seed in 0usize..1000,
        )| {
            let mut shuffled = orders.clone();
            // Cheap deterministic shuffle.
            let len = shuffled.len();
            if len > 1 {
                for i in 0..len {
                    shuffled.swap(i, (i * 7 + seed) % len);
                }
            }
            let a = compute(Quota::new(quota), Quota::new(used), orders)
                .unwrap();
            let b = compute(Quota::new(quota), Quota::new(used), shuffled)
                .unwrap();
            prop_assert_eq!(a, b);
        });
    }

    /// With no consumption and no prior refunds, the full net paid amount is
    /// due (identity under full balance).
    #[test]
    fn full_balance_identity() {
        proptest!(|(orders in arb_orders())| {
            let total_grant: i128 = orders
                .iter()
                .map(|o| o.grant_quota.as_i128())
                .sum();
            let total_paid: i64 = orders
                .iter()
                .map(|o| o.paid_cents.as_i64())
                .sum();
            let quote = compute(
                Quota::new(total_grant),
                Quota::ZERO,
                orders,
            ).unwrap();
            // Refundable is the paid portion in full, clamped by net paid.
            prop_assert_eq!(quote.due_cents, Cents::new(total_paid));
        });
    }
}
