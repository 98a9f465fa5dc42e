//! The card processor refund adapter.
//!
//! A REST client keyed by our secret key. Refunds are issued against a
//! charge or a payment intent (exactly one), carry the caller's idempotency
//! key in the client-level `Idempotency-Key` header, and return the refund
//! object verbatim for the audit row. Charge listing paginates with a
//! forward cursor until the processor reports no more.

use async_trait::async_trait;
use http::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use refundry_api::rest::{RestClient, GET, POST};
use refundry_core::charge::CardCharge;
use refundry_core::ids::OutRefundNo;
use refundry_core::money::Cents;
use serde::Deserialize;
use serde_json::Value;
use tracing::instrument;

use crate::contract::{
    ChargeSource, ProviderError, RefundOutcome, RefundProvider,
    RefundRequest, RefundTarget,
};

/// Page size for charge listing.
const LIST_PAGE_SIZE: usize = 100;
/// Hard cap on listing pages per customer, to bound a misbehaving cursor.
const LIST_MAX_PAGES: usize = 200;

/// Configuration for [`CardProcessorClient`].
pub struct CardConfig {
    /// Our secret API key.
    pub secret_key: String,
    /// API base url, e.g. `https://api.stripe.com/v1`.
    pub api_base: String,
}

/// The card processor refund sink and charge source.
pub struct CardProcessorClient {
    rest: RestClient,
    config: CardConfig,
}

/// The wire shape of a charge row; mapped into [`CardCharge`].
#[derive(Debug, Deserialize)]
struct ChargeWire {
    id: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    currency: String,
    #[serde(default)]
    amount: i64,
    #[serde(default)]
    amount_refunded: i64,
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    customer: Option<String>,
    #[serde(default)]
    paid: bool,
    #[serde(default)]
    status: String,
}

impl From<ChargeWire> for CardCharge {
    fn from(wire: ChargeWire) -> Self {
        Self {
            id: wire.id,
            created: wire.created,
            currency: wire.currency,
            amount: Cents::new(wire.amount),
            amount_refunded: Cents::new(wire.amount_refunded),
            payment_intent: wire.payment_intent,
            paid: wire.paid,
            status: wire.status,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChargeListWire {
    #[serde(default)]
    data: Vec<ChargeWire>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct PaymentIntentWire {
    #[serde(default)]
    customer: Option<String>,
    #[serde(default)]
    status: String,
}

impl CardProcessorClient {
    pub fn new(config: CardConfig) -> Self {
        Self {
            rest: RestClient::new("engine", "card-processor"),
            config,
        }
    }

    fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let bearer = format!("Bearer {}", self.config.secret_key);
        if let Ok(value) = HeaderValue::from_str(&bearer) {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }

    /// Verify the target belongs to `customer_id` and is refundable.
    async fn preflight(
        &self,
        target: &RefundTarget,
        customer_id: &str,
    ) -> Result<(), ProviderError> {
        match target {
            RefundTarget::CardCharge { charge_id } => {
                let url = format!(
                    "{}/charges/{charge_id}",
                    self.config.api_base,
                );
                let charge: ChargeWire = self
                    .rest
                    .request_json(GET, &url, self.auth_headers(), None::<&()>)
                    .await?;
                if charge.customer.as_deref() != Some(customer_id) {
                    return Err(ProviderError::CustomerMismatch);
                }
                if charge.status != "succeeded" {
                    return Err(ProviderError::NotSucceeded(charge.status));
                }
            }
            RefundTarget::CardPaymentIntent { payment_intent_id } => {
                let url = format!(
                    "{}/payment_intents/{payment_intent_id}",
                    self.config.api_base,
                );
                let intent: PaymentIntentWire = self
                    .rest
                    .request_json(GET, &url, self.auth_headers(), None::<&()>)
                    .await?;
                if intent.customer.as_deref() != Some(customer_id) {
                    return Err(ProviderError::CustomerMismatch);
                }
                if intent.status != "succeeded" {
                    return Err(ProviderError::NotSucceeded(intent.status));
                }
            }
            RefundTarget::AggregatorOrder { .. } => {}
        }
        Ok(())
    }
}

#[async_trait]
impl RefundProvider for CardProcessorClient {
    #[instrument(skip_all, name = "(card-refund)")]
    async fn refund(
        &self,
        req: &RefundRequest,
        idempotency_key: &OutRefundNo,
    ) -> Result<RefundOutcome, ProviderError> {
        let target_param = match &req.target {
            RefundTarget::CardCharge { charge_id } =>
                ("charge", charge_id.as_str()),
            RefundTarget::CardPaymentIntent { payment_intent_id } =>
                ("payment_intent", payment_intent_id.as_str()),
            other @ RefundTarget::AggregatorOrder { .. } => {
                return Err(ProviderError::InvalidRequest(format!(
                    "card processor can't refund target {other:?}"
                )))
            }
        };

        if let Some(customer_id) = &req.expect_customer {
            self.preflight(&req.target, customer_id).await?;
        }

        let mut form: Vec<(&str, String)> =
            vec![(target_param.0, target_param.1.to_owned())];
        // Absent amount means full-remaining refund.
        if let Some(amount) = req.amount {
            if !amount.is_positive() {
                return Err(ProviderError::InvalidRequest(format!(
                    "card refund amount must be positive, got {amount}"
                )));
            }
            form.push(("amount", amount.as_i64().to_string()));
        }

        let mut headers = self.auth_headers();
        if let Ok(value) = HeaderValue::from_str(idempotency_key.as_str()) {
            headers.insert("Idempotency-Key", value);
        }

        let url = format!("{}/refunds", self.config.api_base);
        let body = self.rest.request_form(POST, &url, headers, &form).await?;

        let response: Value = serde_json::from_slice(&body).map_err(|e| {
            ProviderError::InvalidResponse(format!(
                "non-JSON card processor response: {e}"
            ))
        })?;

        let provider_refund_no = response
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_owned);

        Ok(RefundOutcome {
            provider_refund_no,
            raw_response: response,
        })
    }
}

#[async_trait]
impl ChargeSource for CardProcessorClient {
    #[instrument(skip_all, name = "(card-list-charges)")]
    async fn list_customer_charges(
        &self,
        customer_id: &str,
    ) -> Result<Vec<CardCharge>, ProviderError> {
        let mut charges = Vec::new();
        let mut starting_after: Option<String> = None;

        for _ in 0..LIST_MAX_PAGES {
            let mut url = format!(
                "{}/charges?customer={customer_id}&limit={LIST_PAGE_SIZE}",
                self.config.api_base,
            );
            if let Some(cursor) = &starting_after {
                url.push_str("&starting_after=");
                url.push_str(cursor);
            }

            let page: ChargeListWire = self
                .rest
                .request_json(GET, &url, self.auth_headers(), None::<&()>)
                .await?;

            let page_len = page.data.len();
            charges.extend(page.data.into_iter().map(CardCharge::from));

            if !page.has_more || page_len == 0 {
                return Ok(charges);
            }
            starting_after = charges.last().map(|c| c.id.clone());
        }

        Err(ProviderError::InvalidResponse(format!(
            "charge listing for customer exceeded {LIST_MAX_PAGES} pages"
        )))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn charge_wire_maps_to_domain() {
        let json = serde_json::json!({
            "id": "ch_1",
            "object": "charge",
            "created": 1700000000,
            "currency": "cny",
            "amount": 2000,
            "amount_refunded": 500,
            "payment_intent": "pi_9",
            "customer": "cus_3",
            "paid": true,
            "status": "succeeded",
            "unknown_field": 42,
        });
        let wire: ChargeWire = serde_json::from_value(json).unwrap();
        let charge = CardCharge::from(wire);
        assert_eq!(charge.id, "ch_1");
        assert_eq!(charge.remaining(), Cents::new(1500));
        assert!(charge.is_settled());
    }
}
