//! End-to-end engine scenarios against the in-memory stores and the mock
//! provider.

use std::sync::Arc;

use refundry_core::charge::CardCharge;
use refundry_core::ids::UserId;
use refundry_core::money::{Cents, Quota, QUOTA_PER_YUAN};
use refundry_core::refund_log::RefundStatus;
use refundry_core::topup::{PaymentMethod, TopUp, TopUpStatus};
use refundry_core::user::User;
use refundry_providers::mock::MockProvider;
use refundry_providers::{RefundProvider, RefundRequest, RefundTarget};
use refundry_store::memory::{MemoryAuditStore, MemoryBusinessStore};
use refundry_core::ids::{BatchId, OutRefundNo, Provider};

use crate::execute::{self, RefundExecutionRequest};
use crate::{estimate, quote, single, EngineDeps};

struct Harness {
    business: Arc<MemoryBusinessStore>,
    audit: Arc<MemoryAuditStore>,
    provider: Arc<MockProvider>,
    deps: EngineDeps,
}

fn harness() -> Harness {
    let business = Arc::new(MemoryBusinessStore::new());
    let audit = Arc::new(MemoryAuditStore::new());
    let provider = Arc::new(MockProvider::new());
    let deps = EngineDeps {
        business: business.clone(),
        audit: audit.clone(),
        aggregator: provider.clone(),
        card: provider.clone(),
        charges: provider.clone(),
    };
    Harness {
        business,
        audit,
        provider,
        deps,
    }
}

fn user(id: i64, quota: i128, used: i128, customer: Option<&str>) -> User {
    User {
        id: UserId::new(id),
        email: Some(format!("user{id}@example.com")),
        card_customer_id: customer.map(str::to_owned),
        quota: Quota::new(quota),
        used_quota: Quota::new(used),
    }
}

fn aggregator_topup(
    id: i64,
    user_id: i64,
    trade_no: &str,
    money_cents: i64,
    amount_cents: Option<i64>,
) -> TopUp {
    TopUp {
        id,
        user_id: UserId::new(user_id),
        money: Cents::new(money_cents),
        amount: amount_cents.map(Cents::new),
        trade_no: trade_no.to_owned(),
        create_time: 1_000 + id,
        payment_method: PaymentMethod::Alipay,
        status: TopUpStatus::Success,
    }
}

fn settled_charge(id: &str, created: i64, amount_cents: i64) -> CardCharge {
    CardCharge {
        id: id.to_owned(),
        created,
        currency: "cny".to_owned(),
        amount: Cents::new(amount_cents),
        amount_refunded: Cents::ZERO,
        payment_intent: Some(format!("pi_{id}")),
        paid: true,
        status: "succeeded".to_owned(),
    }
}

/// Single aggregator top-up, nothing consumed: the quote is the full paid
/// amount and `clear_balance` zeroes the counter after one 9.50 leg
/// (default 5% fee on 10.00).
#[tokio::test]
async fn single_topup_clear_balance() {
    let h = harness();
    h.business.insert_user(user(1, 500_000, 0, None)).await;
    h.business
        .insert_topup(aggregator_topup(1, 1, "T1", 1000, Some(1000)))
        .await;

    let ctx = quote::build(&h.deps, UserId::new(1)).await.unwrap();
    assert_eq!(ctx.quote.due_yuan, "10.00");
    assert_eq!(ctx.quote.plan.aggregator_yuan, "10.00");
    assert_eq!(ctx.quote.plan.card_yuan, "0.00");

    let request = RefundExecutionRequest {
        clear_balance: true,
        ..RefundExecutionRequest::default()
    };
    let report = execute::execute(&h.deps, UserId::new(1), &request, "ops")
        .await
        .unwrap();

    assert!(!report.dry_run);
    assert_eq!(report.gross_cents, Cents::new(1000));
    assert_eq!(report.fee_cents, Cents::new(50));
    assert_eq!(report.net_cents, Cents::new(950));
    assert_eq!(report.legs.len(), 1);
    assert_eq!(report.legs[0].amount_yuan, "9.50");
    assert_eq!(report.legs[0].quota_delta, Quota::new(500_000));

    let after = h.business.user(UserId::new(1)).await.unwrap();
    assert_eq!(after.quota, Quota::ZERO);

    let rows = h.audit.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, RefundStatus::Succeeded);
    assert_eq!(rows[0].refund_money, "9.50");
    assert_eq!(rows[0].refund_money_minor, Cents::new(950));
    assert_eq!(rows[0].performed_by.as_deref(), Some("ops"));
    assert_eq!(rows[0].raw_request["schema_version"], 2);
}

/// Card-first split: card money is refunded newest charge first, and the
/// aggregator channel is only touched for the remainder.
#[tokio::test]
async fn card_first_split_walks_newest_first() {
    let h = harness();
    // Paid 40.00 total (20 + 10 card, 10 aggregator), all grants 1:1;
    // 15.00 worth consumed leaves 25.00 due.
    h.business
        .insert_user(user(4, 12_500_000, 7_500_000, Some("cus_d")))
        .await;
    h.business
        .insert_topup(aggregator_topup(1, 4, "T4", 1000, None))
        .await;
    h.provider.set_charges(
        "cus_d",
        vec![
            settled_charge("ch_new", 200, 2000),
            settled_charge("ch_old", 100, 1000),
        ],
    );

    let ctx = quote::build(&h.deps, UserId::new(4)).await.unwrap();
    assert_eq!(ctx.quote.due_cents, Cents::new(2500));
    assert_eq!(ctx.quote.plan.card_cents, Cents::new(2500));
    assert_eq!(ctx.quote.plan.aggregator_cents, Cents::ZERO);

    // Zero fee so the legs are exactly the plan.
    let request = RefundExecutionRequest {
        fee_percent: Some("0".to_owned()),
        ..RefundExecutionRequest::default()
    };
    let report = execute::execute(&h.deps, UserId::new(4), &request, "ops")
        .await
        .unwrap();

    assert_eq!(report.legs.len(), 2);
    assert_eq!(report.legs[0].target_id, "ch_new");
    assert_eq!(report.legs[0].amount_cents, Cents::new(2000));
    assert_eq!(report.legs[1].target_id, "ch_old");
    assert_eq!(report.legs[1].amount_cents, Cents::new(500));

    // Proportional quota split: 2000/2500 of the 12_500_000 target, then
    // the remainder.
    assert_eq!(report.legs[0].quota_delta, Quota::new(10_000_000));
    assert_eq!(report.legs[1].quota_delta, Quota::new(2_500_000));

    let after = h.business.user(UserId::new(4)).await.unwrap();
    assert_eq!(after.quota, Quota::ZERO);
}

/// Provider failure mid-batch: earlier legs stay refunded, the failing
/// leg's reserve is released, and the audit log shows one succeeded and one
/// failed row.
#[tokio::test]
async fn provider_failure_compensates_the_failing_leg() {
    let h = harness();
    h.business
        .insert_user(user(5, 12_500_000, 7_500_000, Some("cus_e")))
        .await;
    h.business
        .insert_topup(aggregator_topup(1, 5, "T5", 1000, None))
        .await;
    h.provider.set_charges(
        "cus_e",
        vec![
            settled_charge("ch_new", 200, 2000),
            settled_charge("ch_old", 100, 1000),
        ],
    );
    h.provider.fail_target("ch_old", "card declined");

    let request = RefundExecutionRequest {
        fee_percent: Some("0".to_owned()),
        ..RefundExecutionRequest::default()
    };
    let err = execute::execute(&h.deps, UserId::new(5), &request, "ops")
        .await
        .unwrap_err();
    assert_eq!(err.code, "provider_error");
    let details = err.details.unwrap();
    assert_eq!(details["succeeded_legs"].as_array().unwrap().len(), 1);

    // Only the first leg's quota stays reserved.
    let after = h.business.user(UserId::new(5)).await.unwrap();
    assert_eq!(after.quota, Quota::new(12_500_000 - 10_000_000));

    let rows = h.audit.rows().await;
    assert_eq!(rows.len(), 2);
    let failed = rows.iter().find(|r| r.status == RefundStatus::Failed);
    let succeeded =
        rows.iter().find(|r| r.status == RefundStatus::Succeeded);
    assert_eq!(
        succeeded.unwrap().card_charge_id.as_deref(),
        Some("ch_new"),
    );
    let failed = failed.unwrap();
    assert_eq!(failed.card_charge_id.as_deref(), Some("ch_old"));
    assert!(failed.error_message.as_deref().unwrap().contains("declined"));
}

/// Dry run: the full derivation, zero side effects.
#[tokio::test]
async fn dry_run_has_no_side_effects() {
    let h = harness();
    h.business
        .insert_user(user(6, 12_500_000, 7_500_000, Some("cus_f")))
        .await;
    h.provider
        .set_charges("cus_f", vec![settled_charge("ch_1", 100, 2000)]);

    let request = RefundExecutionRequest {
        dry_run: true,
        ..RefundExecutionRequest::default()
    };
    let report = execute::execute(&h.deps, UserId::new(6), &request, "ops")
        .await
        .unwrap();

    assert!(report.dry_run);
    assert!(report.batch_id.is_none());
    assert!(report.legs.is_empty());
    assert!(h.audit.rows().await.is_empty());
    assert_eq!(h.provider.calls().len(), 0);
    let after = h.business.user(UserId::new(6)).await.unwrap();
    assert_eq!(after.quota, Quota::new(12_500_000));
}

/// The reserve predicate guards the batch: if the user's quota can't cover
/// a leg's delta, the batch aborts with `insufficient_user_quota`.
#[tokio::test]
async fn insufficient_quota_aborts() {
    let h = harness();
    // Inconsistent ledger: paid history but an already-empty counter.
    h.business.insert_user(user(7, 0, 0, None)).await;
    h.business
        .insert_topup(aggregator_topup(1, 7, "T7", 1000, None))
        .await;

    let err = execute::execute(
        &h.deps,
        UserId::new(7),
        &RefundExecutionRequest::default(),
        "ops",
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, "insufficient_user_quota");
    assert!(h.audit.rows().await.is_empty());
}

/// An audit settle failure after the provider refunded is a warning, not a
/// rollback: the external side already moved money.
#[tokio::test]
async fn settle_failure_counts_the_leg() {
    let h = harness();
    h.business.insert_user(user(8, 5_000_000, 0, None)).await;
    h.business
        .insert_topup(aggregator_topup(1, 8, "T8", 1000, None))
        .await;
    h.audit.fail_next_settle().await;

    let request = RefundExecutionRequest {
        fee_percent: Some("0".to_owned()),
        ..RefundExecutionRequest::default()
    };
    let report = execute::execute(&h.deps, UserId::new(8), &request, "ops")
        .await
        .unwrap();

    assert_eq!(report.legs.len(), 1);
    assert_eq!(report.warnings.len(), 1);

    // The row is still pending; the durable idempotency key resolves it.
    let rows = h.audit.rows().await;
    assert_eq!(rows[0].status, RefundStatus::Pending);
    let after = h.business.user(UserId::new(8)).await.unwrap();
    assert_eq!(after.quota, Quota::ZERO);
}

/// `nothing_to_refund` for users whose due is zero.
#[tokio::test]
async fn nothing_to_refund() {
    let h = harness();
    h.business.insert_user(user(9, 500_000, 0, None)).await;

    let err = execute::execute(
        &h.deps,
        UserId::new(9),
        &RefundExecutionRequest::default(),
        "ops",
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, "nothing_to_refund");
}

/// A 100% fee refunds nothing and is rejected.
#[tokio::test]
async fn full_fee_is_rejected() {
    let h = harness();
    h.business.insert_user(user(10, 5_000_000, 0, None)).await;
    h.business
        .insert_topup(aggregator_topup(1, 10, "T10", 1000, None))
        .await;

    let request = RefundExecutionRequest {
        fee_percent: Some("100".to_owned()),
        ..RefundExecutionRequest::default()
    };
    let err = execute::execute(&h.deps, UserId::new(10), &request, "ops")
        .await
        .unwrap_err();
    assert_eq!(err.code, "fee_too_high");
}

/// `amount_yuan = "0"` is malformed input, not a no-op.
#[tokio::test]
async fn zero_amount_override_is_invalid() {
    let h = harness();
    h.business.insert_user(user(11, 5_000_000, 0, None)).await;
    h.business
        .insert_topup(aggregator_topup(1, 11, "T11", 1000, None))
        .await;

    let request = RefundExecutionRequest {
        amount_yuan: Some("0".to_owned()),
        ..RefundExecutionRequest::default()
    };
    let err = execute::execute(&h.deps, UserId::new(11), &request, "ops")
        .await
        .unwrap_err();
    assert_eq!(err.code, "invalid_amount");
}

/// The range guard applies to the net amount.
#[tokio::test]
async fn range_guard_applies_to_net() {
    let h = harness();
    h.business.insert_user(user(12, 5_000_000, 0, None)).await;
    h.business
        .insert_topup(aggregator_topup(1, 12, "T12", 1000, None))
        .await;

    // net = 9.50 after the default fee; require at least 9.60.
    let request = RefundExecutionRequest {
        min_refund_yuan: Some("9.60".to_owned()),
        ..RefundExecutionRequest::default()
    };
    let err = execute::execute(&h.deps, UserId::new(12), &request, "ops")
        .await
        .unwrap_err();
    assert_eq!(err.code, "refund_amount_out_of_range");

    let request = RefundExecutionRequest {
        min_refund_yuan: Some("5".to_owned()),
        max_refund_yuan: Some("4".to_owned()),
        ..RefundExecutionRequest::default()
    };
    let err = execute::execute(&h.deps, UserId::new(12), &request, "ops")
        .await
        .unwrap_err();
    assert_eq!(err.code, "invalid_refund_amount_range");
}

/// Replaying a leg with the same idempotency key must not double-refund.
#[tokio::test]
async fn provider_is_idempotent_by_key() {
    let h = harness();
    let batch = BatchId::derive(UserId::new(1), 1_700_000_000_000);
    let key = OutRefundNo::derive(
        Provider::Aggregator,
        &batch,
        "T1",
        Cents::new(950),
    );
    let request = RefundRequest {
        target: RefundTarget::AggregatorOrder {
            order_no: "T1".to_owned(),
            use_out_trade_no: false,
        },
        amount: Some(Cents::new(950)),
        expect_customer: None,
    };

    let first = h.provider.refund(&request, &key).await.unwrap();
    let second = h.provider.refund(&request, &key).await.unwrap();
    assert_eq!(first.provider_refund_no, second.provider_refund_no);
    assert_eq!(h.provider.external_refund_count(), 1);
    assert_eq!(h.provider.calls().len(), 2);
}

/// The legacy single-top-up path: full refund, status flip, quota
/// decrement by the full grant.
#[tokio::test]
async fn legacy_single_topup_refund() {
    let h = harness();
    h.business.insert_user(user(13, 10_000_000, 0, None)).await;
    h.business
        .insert_topup(aggregator_topup(1, 13, "T13", 1000, Some(2000)))
        .await;

    let report = single::refund_single_topup(&h.deps, "T13", "ops")
        .await
        .unwrap();
    assert_eq!(report.refund_yuan, "10.00");
    assert_eq!(report.quota_delta, Quota::new(10_000_000));

    let topup = h.business.topup("T13").await.unwrap();
    assert_eq!(topup.status, TopUpStatus::Refund);
    let after = h.business.user(UserId::new(13)).await.unwrap();
    assert_eq!(after.quota, Quota::ZERO);

    // A second attempt finds the top-up no longer refundable.
    let err = single::refund_single_topup(&h.deps, "T13", "ops")
        .await
        .unwrap_err();
    assert_eq!(err.code, "topup_not_refundable");
}

/// If the top-up row changed under the legacy path's transaction, the
/// refund reports `topup_already_updated` and records a failed audit row
/// instead of claiming a quota decrement that never committed.
#[tokio::test]
async fn legacy_commit_conflict_is_surfaced() {
    let h = harness();
    h.business.insert_user(user(14, 5_000_000, 0, None)).await;
    h.business
        .insert_topup(aggregator_topup(1, 14, "T14", 1000, None))
        .await;
    h.business.fail_next_commit().await;

    let err = single::refund_single_topup(&h.deps, "T14", "ops")
        .await
        .unwrap_err();
    assert_eq!(err.code, "topup_already_updated");

    let rows = h.audit.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, RefundStatus::Failed);
    // The provider response is preserved on the failed row so the external
    // refund can be reconciled.
    assert!(!rows[0].raw_response.is_null());
    assert!(rows[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("business transaction"));

    // Nothing on the business side moved.
    let after = h.business.user(UserId::new(14)).await.unwrap();
    assert_eq!(after.quota, Quota::new(5_000_000));
    let topup = h.business.topup("T14").await.unwrap();
    assert_eq!(topup.status, TopUpStatus::Success);
}

/// The fleet estimate is single-flight and sums per-user dues.
#[tokio::test]
async fn fleet_estimate_totals() {
    let h = harness();
    h.business.insert_user(user(20, 5_000_000, 0, None)).await;
    h.business
        .insert_topup(aggregator_topup(1, 20, "T20", 1000, None))
        .await;
    h.business
        .insert_user(user(21, 10_000_000, 0, Some("cus_21")))
        .await;
    h.provider
        .set_charges("cus_21", vec![settled_charge("ch_21", 100, 2000)]);
    // A free user contributes nothing.
    h.business.insert_user(user(22, QUOTA_PER_YUAN, 0, None)).await;

    let job = estimate::EstimateJob::new(h.deps.clone());
    assert!(job.start());
    assert!(!job.start(), "second start while running must be a no-op");

    let result = loop {
        let snapshot = job.snapshot();
        match snapshot.status.0 {
            estimate::EstimateStatus::Ready =>
                break snapshot.result.unwrap(),
            estimate::EstimateStatus::Error =>
                panic!("estimate failed: {:?}", snapshot.error),
            _ => tokio::time::sleep(std::time::Duration::from_millis(2))
                .await,
        }
    };

    assert_eq!(result.counts.users_total, 3);
    assert_eq!(result.counts.paying_users, 2);
    assert_eq!(result.counts.refundable_users, 2);
    assert_eq!(result.counts.users_with_card_customer, 1);
    assert_eq!(result.totals.total_cents, Cents::new(3000));
    assert_eq!(result.totals.card_cents, Cents::new(2000));
    assert_eq!(result.totals.aggregator_cents, Cents::new(1000));

    // A rerun preserves the last result while running.
    assert!(job.start());
    let snapshot = job.snapshot();
    assert!(snapshot.last_result.is_some());
}

/// The on-demand estimate reports invalid / duplicate / missing ids.
#[tokio::test]
async fn on_demand_estimate_validates_ids() {
    let h = harness();
    h.business.insert_user(user(30, 5_000_000, 0, None)).await;
    h.business
        .insert_topup(aggregator_topup(1, 30, "T30", 1000, None))
        .await;

    let request = estimate::UserEstimateRequest {
        user_ids: vec![serde_json::json!(30), serde_json::json!("30")],
        user_ids_text: Some("31,\n 32".to_owned()),
    };
    let report =
        estimate::estimate_users(&h.deps, &request).await.unwrap();
    assert_eq!(report.requested, 4);
    assert_eq!(report.duplicate_user_ids, vec![30]);
    assert_eq!(report.user_ids_not_found, vec![31, 32]);
    assert_eq!(report.estimated, 1);
    assert_eq!(report.items[0].due_yuan, "10.00");
    assert_eq!(report.totals.total_cents, Cents::new(1000));

    let request = estimate::UserEstimateRequest {
        user_ids: vec![serde_json::json!("abc")],
        user_ids_text: None,
    };
    let err =
        estimate::estimate_users(&h.deps, &request).await.unwrap_err();
    assert_eq!(err.code, "invalid_user_ids");
}

/// A multi-currency card customer fails the per-user quote but only warns
/// in the on-demand estimate.
#[tokio::test]
async fn multi_currency_guard() {
    let h = harness();
    h.business
        .insert_user(user(40, 5_000_000, 0, Some("cus_40")))
        .await;
    let mut usd = settled_charge("ch_usd", 100, 1000);
    usd.currency = "usd".to_owned();
    h.provider
        .set_charges("cus_40", vec![settled_charge("ch_cny", 200, 1000), usd]);

    let err = quote::build(&h.deps, UserId::new(40)).await.unwrap_err();
    assert_eq!(err.code, "stripe_multiple_currencies");

    let request = estimate::UserEstimateRequest {
        user_ids: vec![serde_json::json!(40)],
        user_ids_text: None,
    };
    let report =
        estimate::estimate_users(&h.deps, &request).await.unwrap();
    assert_eq!(report.items[0].warning.as_deref(), Some("multi_currency"));
}
