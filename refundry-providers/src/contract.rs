//! The polymorphic refund-sink contract shared by both providers.

use async_trait::async_trait;
use refundry_api::rest::RestError;
use refundry_core::charge::CardCharge;
use refundry_core::ids::OutRefundNo;
use refundry_core::money::Cents;
use serde::{Deserialize, Serialize};

/// Which prior payment a refund is issued against.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundTarget {
    /// An aggregator order, addressed by their order no (`trade_no`) or by
    /// our order no (`out_trade_no`).
    AggregatorOrder {
        order_no: String,
        use_out_trade_no: bool,
    },
    /// A card charge.
    CardCharge { charge_id: String },
    /// A card payment intent.
    CardPaymentIntent { payment_intent_id: String },
}

impl RefundTarget {
    /// The id embedded into idempotency keys for this target.
    pub fn id(&self) -> &str {
        match self {
            Self::AggregatorOrder { order_no, .. } => order_no,
            Self::CardCharge { charge_id } => charge_id,
            Self::CardPaymentIntent { payment_intent_id } =>
                payment_intent_id,
        }
    }
}

/// One refund to issue against a specific prior payment.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub target: RefundTarget,
    /// Minor units. `None` asks the card processor for a full-remaining
    /// refund; the aggregator always requires an amount.
    pub amount: Option<Cents>,
    /// If set, the card adapter verifies the target belongs to this
    /// customer and is in `succeeded` state before refunding.
    pub expect_customer: Option<String>,
}

/// What a provider reports back for a successful refund.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefundOutcome {
    /// The provider's own refund id, when they echo one.
    pub provider_refund_no: Option<String>,
    /// The provider response verbatim, for the audit row.
    pub raw_response: serde_json::Value,
}

/// Errors surfaced by provider adapters.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The target payment belongs to a different customer.
    #[error("customer_mismatch")]
    CustomerMismatch,
    /// The target payment is not in `succeeded` state.
    #[error("not_succeeded:{0}")]
    NotSucceeded(String),
    /// The provider understood the request and said no.
    #[error("provider rejected refund: {0}")]
    Rejected(String),
    /// A signed provider response failed verification.
    #[error("response signature verification failed")]
    BadSignature,
    /// The provider response couldn't be understood.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    /// The request was malformed before it left the process.
    #[error("invalid refund request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Rest(#[from] RestError),
}

/// A refund sink. Implementations must be idempotent in `idempotency_key`.
#[async_trait]
pub trait RefundProvider: Send + Sync {
    async fn refund(
        &self,
        req: &RefundRequest,
        idempotency_key: &OutRefundNo,
    ) -> Result<RefundOutcome, ProviderError>;
}

/// Read-only access to a customer's charge history at the card processor.
#[async_trait]
pub trait ChargeSource: Send + Sync {
    /// All charges for the customer, newest first, regardless of paid /
    /// succeeded state; filtering is the caller's responsibility.
    async fn list_customer_charges(
        &self,
        customer_id: &str,
    ) -> Result<Vec<CardCharge>, ProviderError>;
}
