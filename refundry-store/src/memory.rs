//! In-memory store impls backing engine and server tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use refundry_core::ids::UserId;
use refundry_core::money::Quota;
use refundry_core::refund_log::{
    NewRefundLog, RefundLog, RefundSettle, RefundStatus,
};
use refundry_core::topup::{TopUp, TopUpStatus};
use refundry_core::user::User;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::traits::{
    AuditStore, BusinessStore, RefundLogFilter, SingleRefundGuard,
    StoreError, TopUpFilter, UserRefundTotals,
};

/// In-memory business database.
#[derive(Default)]
pub struct MemoryBusinessStore {
    state: Arc<Mutex<BusinessState>>,
}

#[derive(Default)]
struct BusinessState {
    users: HashMap<i64, User>,
    topups: Vec<TopUp>,
    /// Scripted conflict for the next single-refund commit, simulating the
    /// top-up row changing under the transaction.
    fail_next_commit: bool,
}

impl MemoryBusinessStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: User) {
        let mut state = self.state.lock().await;
        state.users.insert(user.id.as_i64(), user);
    }

    pub async fn insert_topup(&self, topup: TopUp) {
        let mut state = self.state.lock().await;
        state.topups.push(topup);
    }

    /// Read a user back, for assertions.
    pub async fn user(&self, id: UserId) -> Option<User> {
        self.state.lock().await.users.get(&id.as_i64()).cloned()
    }

    /// Make the next single-refund commit fail with a conflict, as if the
    /// top-up row changed mid-transaction.
    pub async fn fail_next_commit(&self) {
        self.state.lock().await.fail_next_commit = true;
    }

    /// Read a top-up back, for assertions.
    pub async fn topup(&self, trade_no: &str) -> Option<TopUp> {
        self.state
            .lock()
            .await
            .topups
            .iter()
            .find(|t| t.trade_no == trade_no)
            .cloned()
    }
}

#[async_trait]
impl BusinessStore for MemoryBusinessStore {
    async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.state.lock().await.users.get(&id.as_i64()).cloned())
    }

    async fn search_users(&self, q: &str) -> Result<Vec<User>, StoreError> {
        let state = self.state.lock().await;
        if let Ok(id) = q.parse::<i64>() {
            return Ok(state.users.get(&id).cloned().into_iter().collect());
        }
        let mut matches: Vec<User> = state
            .users
            .values()
            .filter(|u| {
                u.email.as_deref().is_some_and(|email| email.contains(q))
            })
            .cloned()
            .collect();
        matches.sort_by_key(|u| u.id);
        Ok(matches)
    }

    async fn all_users(&self) -> Result<Vec<User>, StoreError> {
        let state = self.state.lock().await;
        let mut users: Vec<User> = state.users.values().cloned().collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    async fn list_topups(
        &self,
        filter: &TopUpFilter,
    ) -> Result<Vec<TopUp>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<TopUp> = state
            .topups
            .iter()
            .filter(|t| {
                filter.status.is_none_or(|s| t.status == s)
                    && filter
                        .payment_method
                        .is_none_or(|m| t.payment_method == m)
                    && filter.q.as_deref().filter(|q| !q.is_empty()).is_none_or(
                        |q| {
                            t.trade_no == q
                                || q.parse::<i64>().is_ok_and(|id| {
                                    t.user_id.as_i64() == id
                                })
                        },
                    )
            })
            .cloned()
            .collect();
        rows.sort_by_key(|t| std::cmp::Reverse(t.create_time));
        Ok(rows
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect())
    }

    async fn get_topup(
        &self,
        trade_no: &str,
    ) -> Result<Option<TopUp>, StoreError> {
        Ok(self.topup(trade_no).await)
    }

    async fn user_topups(
        &self,
        user_id: UserId,
    ) -> Result<Vec<TopUp>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<TopUp> = state
            .topups
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by_key(|t| std::cmp::Reverse(t.create_time));
        Ok(rows)
    }

    async fn try_reserve_quota(
        &self,
        user_id: UserId,
        delta: Quota,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(user) = state.users.get_mut(&user_id.as_i64()) else {
            return Ok(false);
        };
        if user.quota < delta {
            return Ok(false);
        }
        user.quota = user
            .quota
            .checked_sub(delta)
            .expect("checked by predicate above");
        Ok(true)
    }

    async fn release_quota(
        &self,
        user_id: UserId,
        delta: Quota,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(user) = state.users.get_mut(&user_id.as_i64()) {
            user.quota =
                user.quota.checked_add(delta).unwrap_or(user.quota);
        }
        Ok(())
    }

    async fn begin_single_refund(
        &self,
        trade_no: &str,
    ) -> Result<Option<Box<dyn SingleRefundGuard>>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let Some(topup) =
            guard.topups.iter().find(|t| t.trade_no == trade_no).cloned()
        else {
            return Ok(None);
        };
        let Some(user) = guard.users.get(&topup.user_id.as_i64()).cloned()
        else {
            return Ok(None);
        };
        Ok(Some(Box::new(MemorySingleRefund { guard, topup, user })))
    }
}

struct MemorySingleRefund {
    guard: OwnedMutexGuard<BusinessState>,
    topup: TopUp,
    user: User,
}

#[async_trait]
impl SingleRefundGuard for MemorySingleRefund {
    fn topup(&self) -> &TopUp {
        &self.topup
    }

    fn user(&self) -> &User {
        &self.user
    }

    async fn commit_refunded(
        mut self: Box<Self>,
        quota_delta: Quota,
    ) -> Result<(), StoreError> {
        if self.guard.fail_next_commit {
            self.guard.fail_next_commit = false;
            return Err(StoreError::Conflict(
                "topup status changed mid-transaction".to_owned(),
            ));
        }
        let trade_no = self.topup.trade_no.clone();
        let user_id = self.user.id.as_i64();
        let row = self
            .guard
            .topups
            .iter_mut()
            .find(|t| t.trade_no == trade_no)
            .ok_or_else(|| {
                StoreError::Conflict("topup disappeared".to_owned())
            })?;
        if row.status != TopUpStatus::Success {
            return Err(StoreError::Conflict(
                "topup status changed mid-transaction".to_owned(),
            ));
        }
        row.status = TopUpStatus::Refund;
        if let Some(user) = self.guard.users.get_mut(&user_id) {
            user.quota = user
                .quota
                .checked_sub(quota_delta)
                .unwrap_or(Quota::ZERO);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory audit store.
#[derive(Default)]
pub struct MemoryAuditStore {
    state: Arc<Mutex<AuditState>>,
}

#[derive(Default)]
struct AuditState {
    rows: Vec<RefundLog>,
    admins: Vec<String>,
    /// Scripted failure for the next settle call, for crash-window tests.
    fail_next_settle: bool,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_admin(&self, sub: &str) {
        self.state.lock().await.admins.push(sub.to_owned());
    }

    /// Make the next `settle` call fail, simulating an audit store outage
    /// between the provider call and the settle write.
    pub async fn fail_next_settle(&self) {
        self.state.lock().await.fail_next_settle = true;
    }

    /// All rows, newest first, for assertions.
    pub async fn rows(&self) -> Vec<RefundLog> {
        let state = self.state.lock().await;
        let mut rows = state.rows.clone();
        rows.reverse();
        rows
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn insert_pending(
        &self,
        new: &NewRefundLog,
    ) -> Result<Uuid, StoreError> {
        let mut state = self.state.lock().await;
        let id = Uuid::new_v4();
        state.rows.push(RefundLog {
            id,
            created_at: Utc::now(),
            user_id: new.user_id,
            topup_trade_no: new.topup_trade_no.clone(),
            card_charge_id: new.card_charge_id.clone(),
            card_payment_intent: new.card_payment_intent.clone(),
            payment_method: new.payment_method,
            currency: new.currency.clone(),
            refund_money: new.refund_money.clone(),
            refund_money_minor: new.refund_money_minor,
            quota_delta: new.quota_delta,
            provider: new.provider,
            out_refund_no: new.out_refund_no.clone(),
            provider_refund_no: None,
            status: RefundStatus::Pending,
            error_message: None,
            performed_by: new.performed_by.clone(),
            executed_at: None,
            raw_request: new.raw_request.clone(),
            raw_response: serde_json::Value::Null,
        });
        Ok(id)
    }

    async fn settle(
        &self,
        id: Uuid,
        settle: &RefundSettle,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.fail_next_settle {
            state.fail_next_settle = false;
            return Err(StoreError::Audit("scripted settle failure".into()));
        }
        let row = state
            .rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::Audit("no such row".to_owned()))?;
        match settle {
            RefundSettle::Succeeded {
                provider_refund_no,
                raw_response,
            } => {
                row.status = RefundStatus::Succeeded;
                row.provider_refund_no = provider_refund_no.clone();
                row.raw_response = raw_response.clone();
            }
            RefundSettle::Failed {
                error_message,
                raw_response,
            } => {
                row.status = RefundStatus::Failed;
                row.error_message = Some(error_message.clone());
                row.raw_response = raw_response.clone();
            }
        }
        row.executed_at = Some(Utc::now());
        Ok(())
    }

    async fn list(
        &self,
        filter: &RefundLogFilter,
    ) -> Result<Vec<RefundLog>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<RefundLog> = state
            .rows
            .iter()
            .filter(|r| {
                filter.user_id.is_none_or(|u| r.user_id == u)
                    && filter.status.is_none_or(|s| r.status == s)
                    && filter
                        .payment_method
                        .is_none_or(|m| r.payment_method == m)
                    && filter.start_at.is_none_or(|t| r.created_at >= t)
                    && filter.end_at.is_none_or(|t| r.created_at <= t)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        Ok(rows
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RefundLog>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.rows.iter().find(|r| r.id == id).cloned())
    }

    async fn user_refund_totals(
        &self,
        user_id: UserId,
    ) -> Result<UserRefundTotals, StoreError> {
        let state = self.state.lock().await;
        let mut totals = UserRefundTotals::default();
        for row in state.rows.iter().filter(|r| {
            r.user_id == user_id
                && matches!(
                    r.status,
                    RefundStatus::Pending | RefundStatus::Succeeded,
                )
        }) {
            if let Some(trade_no) = &row.topup_trade_no {
                let slot =
                    totals.by_trade_no.entry(trade_no.clone()).or_default();
                slot.money_minor = slot
                    .money_minor
                    .checked_add(row.refund_money_minor)
                    .unwrap_or(slot.money_minor);
                slot.quota = slot
                    .quota
                    .checked_add(row.quota_delta)
                    .unwrap_or(slot.quota);
            }
            if let Some(charge_id) = &row.card_charge_id {
                let slot =
                    totals.by_charge_id.entry(charge_id.clone()).or_default();
                slot.money_minor = slot
                    .money_minor
                    .checked_add(row.refund_money_minor)
                    .unwrap_or(slot.money_minor);
                slot.quota = slot
                    .quota
                    .checked_add(row.quota_delta)
                    .unwrap_or(slot.quota);
            }
        }
        Ok(totals)
    }

    async fn is_admin(&self, sub: &str) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state.admins.iter().any(|a| a == sub))
    }
}
