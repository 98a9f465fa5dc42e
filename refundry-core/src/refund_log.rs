//! Refund audit rows.
//!
//! The audit store is append-mostly: a row is inserted as `pending` before
//! the provider is called and settled to `succeeded` or `failed` afterwards.
//! `quota_delta` on a pending or succeeded row is the authoritative amount
//! already removed from the user's quota; failed rows do not count against
//! balance because the engine released the reserve.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use uuid::Uuid;

use crate::ids::{OutRefundNo, Provider, UserId};
use crate::money::{Cents, Quota};
use crate::topup::PaymentMethod;

/// Refund attempt lifecycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(SerializeDisplay, DeserializeFromStr)]
#[derive(strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum RefundStatus {
    Pending,
    Succeeded,
    Failed,
}

/// One audited refund attempt (one leg of a batch, or one legacy
/// single-top-up refund).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefundLog {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topup_trade_no: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_charge_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_payment_intent: Option<String>,
    pub payment_method: PaymentMethod,
    /// Lowercase ISO currency code. Always `"cny"` today.
    pub currency: String,
    /// Refunded amount as a yuan string, for human consumption.
    pub refund_money: String,
    /// Refunded amount in minor units. Authoritative.
    pub refund_money_minor: Cents,
    /// Quota subtracted from the user for this leg.
    pub quota_delta: Quota,
    pub provider: Provider,
    /// Our idempotency key, persisted before the provider call.
    pub out_refund_no: OutRefundNo,
    /// The provider's refund id, echoed back on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_refund_no: Option<String>,
    pub status: RefundStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    /// The computation trace that produced this leg.
    pub raw_request: serde_json::Value,
    /// The provider's response, verbatim.
    pub raw_response: serde_json::Value,
}

/// Fields for inserting a new `pending` row. The store assigns `id` and
/// `created_at`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewRefundLog {
    pub user_id: UserId,
    pub topup_trade_no: Option<String>,
    pub card_charge_id: Option<String>,
    pub card_payment_intent: Option<String>,
    pub payment_method: PaymentMethod,
    pub currency: String,
    pub refund_money: String,
    pub refund_money_minor: Cents,
    pub quota_delta: Quota,
    pub provider: Provider,
    pub out_refund_no: OutRefundNo,
    pub performed_by: Option<String>,
    pub raw_request: serde_json::Value,
}

/// Settlement of a pending row after the provider call.
#[derive(Clone, Debug, PartialEq)]
pub enum RefundSettle {
    Succeeded {
        provider_refund_no: Option<String>,
        raw_response: serde_json::Value,
    },
    Failed {
        error_message: String,
        raw_response: serde_json::Value,
    },
}
