//! The audit store client.
//!
//! The refund log lives in a PostgREST-style REST service authenticated by a
//! service-role key. Rows are inserted as `pending` before any provider call
//! and settled afterwards; aggregation for the quote is done client-side
//! over the user's pending + succeeded rows.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use refundry_api::rest::{RestClient, GET, PATCH, POST};
use refundry_core::ids::{OutRefundNo, Provider, UserId};
use refundry_core::money::{Cents, Quota};
use refundry_core::refund_log::{
    NewRefundLog, RefundLog, RefundSettle, RefundStatus,
};
use refundry_core::topup::PaymentMethod;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::traits::{
    AuditStore, RefundLogFilter, RefundedTotals, StoreError,
    UserRefundTotals,
};

/// Configuration for [`RestAuditStore`].
pub struct AuditConfig {
    /// Base url of the audit service, without a trailing slash.
    pub base_url: String,
    /// The service-role key; bypasses row-level security.
    pub service_role_key: String,
}

pub struct RestAuditStore {
    rest: RestClient,
    config: AuditConfig,
}

/// The audit store's column layout. The store predates this service and
/// names the business-database user id `mysql_user_id` and the card columns
/// `stripe_*`; the mapping is contained here.
#[derive(Debug, Serialize, Deserialize)]
struct AuditRowWire {
    #[serde(default, skip_serializing)]
    id: Option<Uuid>,
    #[serde(default, skip_serializing)]
    created_at: Option<DateTime<Utc>>,
    mysql_user_id: i64,
    topup_trade_no: Option<String>,
    stripe_charge_id: Option<String>,
    stripe_payment_intent: Option<String>,
    payment_method: String,
    currency: String,
    refund_money: String,
    refund_money_minor: i64,
    quota_delta: i64,
    provider: String,
    out_refund_no: String,
    provider_refund_no: Option<String>,
    status: String,
    error_message: Option<String>,
    performed_by: Option<String>,
    executed_at: Option<DateTime<Utc>>,
    raw_request: serde_json::Value,
    raw_response: serde_json::Value,
}

impl AuditRowWire {
    fn from_new(new: &NewRefundLog) -> Result<Self, StoreError> {
        Ok(Self {
            id: None,
            created_at: None,
            mysql_user_id: new.user_id.as_i64(),
            topup_trade_no: new.topup_trade_no.clone(),
            stripe_charge_id: new.card_charge_id.clone(),
            stripe_payment_intent: new.card_payment_intent.clone(),
            payment_method: new.payment_method.to_string(),
            currency: new.currency.clone(),
            refund_money: new.refund_money.clone(),
            refund_money_minor: new.refund_money_minor.as_i64(),
            quota_delta: i64::try_from(new.quota_delta.as_i128()).map_err(
                |_| {
                    StoreError::Decode(format!(
                        "quota delta out of range: {}",
                        new.quota_delta
                    ))
                },
            )?,
            provider: new.provider.to_string(),
            out_refund_no: new.out_refund_no.as_str().to_owned(),
            provider_refund_no: None,
            status: RefundStatus::Pending.to_string(),
            error_message: None,
            performed_by: new.performed_by.clone(),
            executed_at: None,
            raw_request: new.raw_request.clone(),
            raw_response: serde_json::Value::Null,
        })
    }

    fn into_domain(self) -> Result<RefundLog, StoreError> {
        let decode = |what: &str| {
            StoreError::Decode(format!("bad audit column: {what}"))
        };
        Ok(RefundLog {
            id: self.id.ok_or_else(|| decode("id"))?,
            created_at: self.created_at.ok_or_else(|| decode("created_at"))?,
            user_id: UserId::new(self.mysql_user_id),
            topup_trade_no: self.topup_trade_no,
            card_charge_id: self.stripe_charge_id,
            card_payment_intent: self.stripe_payment_intent,
            payment_method: self
                .payment_method
                .parse::<PaymentMethod>()
                .map_err(|_| decode("payment_method"))?,
            currency: self.currency,
            refund_money: self.refund_money,
            refund_money_minor: Cents::new(self.refund_money_minor),
            quota_delta: Quota::new(i128::from(self.quota_delta)),
            provider: self
                .provider
                .parse::<Provider>()
                .map_err(|_| decode("provider"))?,
            out_refund_no: OutRefundNo::from_stored(self.out_refund_no),
            provider_refund_no: self.provider_refund_no,
            status: self
                .status
                .parse::<RefundStatus>()
                .map_err(|_| decode("status"))?,
            error_message: self.error_message,
            performed_by: self.performed_by,
            executed_at: self.executed_at,
            raw_request: self.raw_request,
            raw_response: self.raw_response,
        })
    }
}

#[derive(Debug, Serialize)]
struct SettleWire {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider_refund_no: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    executed_at: DateTime<Utc>,
    raw_response: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AdminRowWire {
    #[allow(dead_code)]
    id: String,
}

impl RestAuditStore {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            rest: RestClient::new("engine", "audit-store"),
            config,
        }
    }

    fn headers(&self, write: bool) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(key) = HeaderValue::from_str(&self.config.service_role_key)
        {
            headers.insert("apikey", key);
        }
        let bearer = format!("Bearer {}", self.config.service_role_key);
        if let Ok(value) = HeaderValue::from_str(&bearer) {
            headers.insert(AUTHORIZATION, value);
        }
        if write {
            headers.insert(
                "Prefer",
                HeaderValue::from_static("return=representation"),
            );
        }
        headers
    }

    fn table_url(&self, query: &str) -> String {
        format!(
            "{}/rest/v1/refund_logs?{query}",
            self.config.base_url,
        )
    }
}

#[async_trait]
impl AuditStore for RestAuditStore {
    async fn insert_pending(
        &self,
        new: &NewRefundLog,
    ) -> Result<Uuid, StoreError> {
        let wire = AuditRowWire::from_new(new)?;
        let url = self.table_url("select=id");
        let inserted: Vec<InsertedId> = self
            .rest
            .request_json(POST, &url, self.headers(true), Some(&[wire]))
            .await?;
        inserted
            .first()
            .map(|row| row.id)
            .ok_or_else(|| {
                StoreError::Audit(
                    "insert returned no representation".to_owned(),
                )
            })
    }

    async fn settle(
        &self,
        id: Uuid,
        settle: &RefundSettle,
    ) -> Result<(), StoreError> {
        let wire = match settle {
            RefundSettle::Succeeded {
                provider_refund_no,
                raw_response,
            } => SettleWire {
                status: RefundStatus::Succeeded.to_string(),
                provider_refund_no: provider_refund_no.clone(),
                error_message: None,
                executed_at: Utc::now(),
                raw_response: raw_response.clone(),
            },
            RefundSettle::Failed {
                error_message,
                raw_response,
            } => SettleWire {
                status: RefundStatus::Failed.to_string(),
                provider_refund_no: None,
                error_message: Some(error_message.clone()),
                executed_at: Utc::now(),
                raw_response: raw_response.clone(),
            },
        };
        let url = self.table_url(&format!("id=eq.{id}&select=id"));
        let _updated: Vec<InsertedId> = self
            .rest
            .request_json(PATCH, &url, self.headers(true), Some(&wire))
            .await?;
        Ok(())
    }

    async fn list(
        &self,
        filter: &RefundLogFilter,
    ) -> Result<Vec<RefundLog>, StoreError> {
        let mut query =
            String::from("select=*&order=created_at.desc");
        if let Some(user_id) = filter.user_id {
            query.push_str(&format!("&mysql_user_id=eq.{user_id}"));
        }
        if let Some(status) = filter.status {
            query.push_str(&format!("&status=eq.{status}"));
        }
        if let Some(method) = filter.payment_method {
            query.push_str(&format!("&payment_method=eq.{method}"));
        }
        if let Some(start_at) = filter.start_at {
            query.push_str(&format!(
                "&created_at=gte.{}",
                start_at.to_rfc3339(),
            ));
        }
        if let Some(end_at) = filter.end_at {
            query.push_str(&format!(
                "&created_at=lte.{}",
                end_at.to_rfc3339(),
            ));
        }
        query.push_str(&format!(
            "&limit={}&offset={}",
            filter.limit, filter.offset,
        ));

        let url = self.table_url(&query);
        let rows: Vec<AuditRowWire> = self
            .rest
            .request_json(GET, &url, self.headers(false), None::<&()>)
            .await?;
        rows.into_iter().map(AuditRowWire::into_domain).collect()
    }

    async fn get(&self, id: Uuid) -> Result<Option<RefundLog>, StoreError> {
        let url = self.table_url(&format!("select=*&id=eq.{id}&limit=1"));
        let rows: Vec<AuditRowWire> = self
            .rest
            .request_json(GET, &url, self.headers(false), None::<&()>)
            .await?;
        rows.into_iter().next().map(AuditRowWire::into_domain).transpose()
    }

    async fn user_refund_totals(
        &self,
        user_id: UserId,
    ) -> Result<UserRefundTotals, StoreError> {
        let url = self.table_url(&format!(
            "select=topup_trade_no,stripe_charge_id,refund_money_minor,\
             quota_delta&mysql_user_id=eq.{user_id}\
             &status=in.(pending,succeeded)",
        ));
        #[derive(Deserialize)]
        struct TotalsRow {
            topup_trade_no: Option<String>,
            stripe_charge_id: Option<String>,
            refund_money_minor: i64,
            quota_delta: i64,
        }
        let rows: Vec<TotalsRow> = self
            .rest
            .request_json(GET, &url, self.headers(false), None::<&()>)
            .await?;

        let mut totals = UserRefundTotals::default();
        for row in rows {
            let entry = |map: &mut HashMap<String, RefundedTotals>,
                         key: String| {
                let slot = map.entry(key).or_default();
                slot.money_minor = slot
                    .money_minor
                    .checked_add(Cents::new(row.refund_money_minor))
                    .unwrap_or(slot.money_minor);
                slot.quota = slot
                    .quota
                    .checked_add(Quota::new(i128::from(row.quota_delta)))
                    .unwrap_or(slot.quota);
            };
            if let Some(trade_no) = row.topup_trade_no.clone() {
                entry(&mut totals.by_trade_no, trade_no);
            }
            if let Some(charge_id) = row.stripe_charge_id.clone() {
                entry(&mut totals.by_charge_id, charge_id);
            }
        }
        Ok(totals)
    }

    async fn is_admin(&self, sub: &str) -> Result<bool, StoreError> {
        // Conservative: reject subjects that could smuggle PostgREST
        // operators into the filter.
        if !sub
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Ok(false);
        }
        let url = format!(
            "{}/rest/v1/admins?select=id&id=eq.{sub}&limit=1",
            self.config.base_url,
        );
        let rows: Vec<AdminRowWire> = self
            .rest
            .request_json(GET, &url, self.headers(false), None::<&()>)
            .await?;
        Ok(!rows.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct InsertedId {
    id: Uuid,
}
