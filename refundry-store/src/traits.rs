//! Trait seams over the business database and the audit store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refundry_api::rest::RestError;
use refundry_core::ids::UserId;
use refundry_core::money::{Cents, Quota};
use refundry_core::refund_log::{
    NewRefundLog, RefundLog, RefundSettle, RefundStatus,
};
use refundry_core::topup::{PaymentMethod, TopUp, TopUpStatus};
use refundry_core::user::User;
use uuid::Uuid;

/// Errors surfaced by either store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("business database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("audit store error: {0}")]
    Audit(String),
    #[error(transparent)]
    Rest(#[from] RestError),
    #[error("couldn't decode stored row: {0}")]
    Decode(String),
    /// A guarded update observed a concurrent change, e.g. a top-up leaving
    /// `success` between the lock and the update.
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Filters for `GET /api/topups`.
#[derive(Clone, Debug, Default)]
pub struct TopUpFilter {
    /// Matches `trade_no` exactly, or the user id when numeric.
    pub q: Option<String>,
    pub status: Option<TopUpStatus>,
    pub payment_method: Option<PaymentMethod>,
    pub limit: u32,
    pub offset: u32,
}

/// Filters for `GET /api/refunds`.
#[derive(Clone, Debug, Default)]
pub struct RefundLogFilter {
    pub user_id: Option<UserId>,
    pub status: Option<RefundStatus>,
    pub payment_method: Option<PaymentMethod>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub limit: u32,
    pub offset: u32,
}

/// Already-refunded aggregates for one top-up or charge, summed over
/// `pending` and `succeeded` rows (failed rows released their reserve and
/// don't count).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RefundedTotals {
    pub money_minor: Cents,
    pub quota: Quota,
}

/// A user's refund history aggregated for the quote: by aggregator trade_no
/// and by card charge id.
#[derive(Clone, Debug, Default)]
pub struct UserRefundTotals {
    pub by_trade_no: HashMap<String, RefundedTotals>,
    pub by_charge_id: HashMap<String, RefundedTotals>,
}

/// The business database: users and top-ups.
#[async_trait]
pub trait BusinessStore: Send + Sync {
    async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError>;

    /// Search by email substring, or by id when `q` parses as a number.
    async fn search_users(&self, q: &str) -> Result<Vec<User>, StoreError>;

    /// All users, for the fleet estimate. Read-only.
    async fn all_users(&self) -> Result<Vec<User>, StoreError>;

    async fn list_topups(
        &self,
        filter: &TopUpFilter,
    ) -> Result<Vec<TopUp>, StoreError>;

    async fn get_topup(
        &self,
        trade_no: &str,
    ) -> Result<Option<TopUp>, StoreError>;

    /// All of a user's top-ups, newest first.
    async fn user_topups(
        &self,
        user_id: UserId,
    ) -> Result<Vec<TopUp>, StoreError>;

    /// Conditionally reserve quota for a refund leg:
    /// `UPDATE users SET quota = quota - ? WHERE id = ? AND quota >= ?`.
    /// Returns whether exactly one row was affected. This predicate is the
    /// only concurrency primitive on the user row.
    async fn try_reserve_quota(
        &self,
        user_id: UserId,
        delta: Quota,
    ) -> Result<bool, StoreError>;

    /// Compensate a failed leg: `UPDATE users SET quota = quota + ?`.
    async fn release_quota(
        &self,
        user_id: UserId,
        delta: Quota,
    ) -> Result<(), StoreError>;

    /// Open the legacy single-top-up refund transaction: locks the top-up
    /// row (`SELECT ... FOR UPDATE`) and the owning user. The caller
    /// verifies state, performs the provider call, then commits or rolls
    /// back.
    async fn begin_single_refund(
        &self,
        trade_no: &str,
    ) -> Result<Option<Box<dyn SingleRefundGuard>>, StoreError>;
}

/// A locked single-top-up refund in progress.
#[async_trait]
pub trait SingleRefundGuard: Send {
    fn topup(&self) -> &TopUp;
    fn user(&self) -> &User;

    /// Mark the top-up `refund`, decrement the user's quota by
    /// `quota_delta`, and commit.
    async fn commit_refunded(
        self: Box<Self>,
        quota_delta: Quota,
    ) -> Result<(), StoreError>;

    /// Abandon the transaction.
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// The audit store: refund logs and the admins table.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Insert a `pending` row, returning its id. Always persisted before
    /// the provider call so idempotency keys survive process crashes.
    async fn insert_pending(
        &self,
        new: &NewRefundLog,
    ) -> Result<Uuid, StoreError>;

    /// Settle a pending row to `succeeded` or `failed`.
    async fn settle(
        &self,
        id: Uuid,
        settle: &RefundSettle,
    ) -> Result<(), StoreError>;

    async fn list(
        &self,
        filter: &RefundLogFilter,
    ) -> Result<Vec<RefundLog>, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<RefundLog>, StoreError>;

    /// Aggregate a user's pending + succeeded refunds for the quote.
    async fn user_refund_totals(
        &self,
        user_id: UserId,
    ) -> Result<UserRefundTotals, StoreError>;

    /// Whether `sub` appears in the admins table.
    async fn is_admin(&self, sub: &str) -> Result<bool, StoreError>;
}
