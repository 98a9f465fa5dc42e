//! The MySQL business store.
//!
//! Monetary columns (`money`, `amount`) are DECIMAL(10,2) in MySQL; they are
//! selected as strings and parsed by the exact yuan parser so no float ever
//! touches a value. Quota columns are BIGINT.

use async_trait::async_trait;
use refundry_core::ids::UserId;
use refundry_core::money::{Cents, Quota};
use refundry_core::topup::{PaymentMethod, TopUp, TopUpStatus};
use refundry_core::user::User;
use sqlx::mysql::{MySqlPool, MySqlRow};
use sqlx::{MySql, QueryBuilder, Row, Transaction};
use tracing::instrument;

use crate::traits::{
    BusinessStore, SingleRefundGuard, StoreError, TopUpFilter,
};

const USER_COLUMNS: &str =
    "id, email, stripe_customer_id, quota, used_quota";
const TOPUP_COLUMNS: &str = "id, user_id, CAST(money AS CHAR) AS money, \
     CAST(amount AS CHAR) AS amount, trade_no, create_time, \
     payment_method, status";

/// Cap on unfiltered user searches.
const SEARCH_LIMIT: u32 = 20;

pub struct MySqlBusinessStore {
    pool: MySqlPool,
}

impl MySqlBusinessStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

fn user_from_row(row: &MySqlRow) -> Result<User, StoreError> {
    let quota: i64 = row.try_get("quota")?;
    let used_quota: i64 = row.try_get("used_quota")?;
    Ok(User {
        id: UserId::new(row.try_get("id")?),
        email: row.try_get("email")?,
        card_customer_id: row.try_get("stripe_customer_id")?,
        quota: Quota::new(i128::from(quota)),
        used_quota: Quota::new(i128::from(used_quota)),
    })
}

fn topup_from_row(row: &MySqlRow) -> Result<TopUp, StoreError> {
    let money: String = row.try_get("money")?;
    let amount: Option<String> = row.try_get("amount")?;
    let payment_method: String = row.try_get("payment_method")?;
    let status: String = row.try_get("status")?;

    let parse_yuan = |s: &str| {
        Cents::from_yuan_str(s)
            .map_err(|e| StoreError::Decode(format!("bad money column: {e}")))
    };

    Ok(TopUp {
        id: row.try_get("id")?,
        user_id: UserId::new(row.try_get("user_id")?),
        money: parse_yuan(&money)?,
        amount: amount.as_deref().map(parse_yuan).transpose()?,
        trade_no: row.try_get("trade_no")?,
        create_time: row.try_get("create_time")?,
        payment_method: payment_method.parse().map_err(|_| {
            StoreError::Decode(format!(
                "unknown payment_method: {payment_method:?}"
            ))
        })?,
        status: status.parse().map_err(|_| {
            StoreError::Decode(format!("unknown topup status: {status:?}"))
        })?,
    })
}

/// Quota deltas cross the wire as BIGINT; anything larger is a logic error
/// upstream.
fn quota_to_db(delta: Quota) -> Result<i64, StoreError> {
    i64::try_from(delta.as_i128()).map_err(|_| {
        StoreError::Decode(format!("quota delta out of range: {delta}"))
    })
}

#[async_trait]
impl BusinessStore for MySqlBusinessStore {
    async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ?"
        ))
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn search_users(&self, q: &str) -> Result<Vec<User>, StoreError> {
        let rows = if let Ok(id) = q.parse::<i64>() {
            sqlx::query(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE id = ?"
            ))
            .bind(id)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {USER_COLUMNS} FROM users \
                 WHERE email LIKE ? ORDER BY id LIMIT ?"
            ))
            .bind(format!("%{}%", escape_like(q)))
            .bind(SEARCH_LIMIT)
            .fetch_all(&self.pool)
            .await?
        };
        rows.iter().map(user_from_row).collect()
    }

    async fn all_users(&self) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn list_topups(
        &self,
        filter: &TopUpFilter,
    ) -> Result<Vec<TopUp>, StoreError> {
        let mut query = QueryBuilder::<MySql>::new(format!(
            "SELECT {TOPUP_COLUMNS} FROM topups WHERE 1 = 1"
        ));
        if let Some(q) = filter.q.as_deref().filter(|q| !q.is_empty()) {
            if let Ok(user_id) = q.parse::<i64>() {
                query
                    .push(" AND (trade_no = ")
                    .push_bind(q.to_owned())
                    .push(" OR user_id = ")
                    .push_bind(user_id)
                    .push(")");
            } else {
                query.push(" AND trade_no = ").push_bind(q.to_owned());
            }
        }
        if let Some(status) = filter.status {
            query
                .push(" AND status = ")
                .push_bind(status.to_string());
        }
        if let Some(method) = filter.payment_method {
            query
                .push(" AND payment_method = ")
                .push_bind(method.to_string());
        }
        query
            .push(" ORDER BY create_time DESC LIMIT ")
            .push_bind(filter.limit)
            .push(" OFFSET ")
            .push_bind(filter.offset);

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(topup_from_row).collect()
    }

    async fn get_topup(
        &self,
        trade_no: &str,
    ) -> Result<Option<TopUp>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TOPUP_COLUMNS} FROM topups WHERE trade_no = ?"
        ))
        .bind(trade_no)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(topup_from_row).transpose()
    }

    async fn user_topups(
        &self,
        user_id: UserId,
    ) -> Result<Vec<TopUp>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TOPUP_COLUMNS} FROM topups \
             WHERE user_id = ? ORDER BY create_time DESC"
        ))
        .bind(user_id.as_i64())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(topup_from_row).collect()
    }

    #[instrument(skip(self), name = "(reserve-quota)")]
    async fn try_reserve_quota(
        &self,
        user_id: UserId,
        delta: Quota,
    ) -> Result<bool, StoreError> {
        let delta = quota_to_db(delta)?;
        let result = sqlx::query(
            "UPDATE users SET quota = quota - ? \
             WHERE id = ? AND quota >= ?",
        )
        .bind(delta)
        .bind(user_id.as_i64())
        .bind(delta)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), name = "(release-quota)")]
    async fn release_quota(
        &self,
        user_id: UserId,
        delta: Quota,
    ) -> Result<(), StoreError> {
        let delta = quota_to_db(delta)?;
        sqlx::query("UPDATE users SET quota = quota + ? WHERE id = ?")
            .bind(delta)
            .bind(user_id.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn begin_single_refund(
        &self,
        trade_no: &str,
    ) -> Result<Option<Box<dyn SingleRefundGuard>>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let topup_row = sqlx::query(&format!(
            "SELECT {TOPUP_COLUMNS} FROM topups \
             WHERE trade_no = ? FOR UPDATE"
        ))
        .bind(trade_no)
        .fetch_optional(&mut *tx)
        .await?;
        let topup = match topup_row.as_ref().map(topup_from_row).transpose()? {
            Some(topup) => topup,
            None => {
                tx.rollback().await?;
                return Ok(None);
            }
        };

        let user_row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ? FOR UPDATE"
        ))
        .bind(topup.user_id.as_i64())
        .fetch_optional(&mut *tx)
        .await?;
        let user = match user_row.as_ref().map(user_from_row).transpose()? {
            Some(user) => user,
            None => {
                tx.rollback().await?;
                return Ok(None);
            }
        };

        Ok(Some(Box::new(MySqlSingleRefund { tx, topup, user })))
    }
}

/// Escape `%` and `_` in LIKE patterns.
fn escape_like(q: &str) -> String {
    q.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

struct MySqlSingleRefund {
    tx: Transaction<'static, MySql>,
    topup: TopUp,
    user: User,
}

#[async_trait]
impl SingleRefundGuard for MySqlSingleRefund {
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
        let delta = quota_to_db(quota_delta)?;

        let updated = sqlx::query(
            "UPDATE topups SET status = 'refund' \
             WHERE id = ? AND status = 'success'",
        )
        .bind(self.topup.id)
        .execute(&mut *self.tx)
        .await?;
        if updated.rows_affected() != 1 {
            self.tx.rollback().await?;
            return Err(StoreError::Conflict(
                "topup status changed mid-transaction".to_owned(),
            ));
        }

        sqlx::query("UPDATE users SET quota = quota - ? WHERE id = ?")
            .bind(delta)
            .bind(self.user.id.as_i64())
            .execute(&mut *self.tx)
            .await?;

        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn like_patterns_are_escaped() {
        assert_eq!(escape_like("a%b_c"), "a\\%b\\_c");
        assert_eq!(escape_like("plain"), "plain");
    }
}
