//! A scriptable in-memory provider for engine and server tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use refundry_core::charge::CardCharge;
use refundry_core::ids::OutRefundNo;
use serde_json::json;

use crate::contract::{
    ChargeSource, ProviderError, RefundOutcome, RefundProvider, RefundRequest,
};

/// One recorded provider call.
#[derive(Clone, Debug)]
pub struct RecordedRefund {
    pub request: RefundRequest,
    pub idempotency_key: String,
}

/// In-memory refund sink + charge source.
///
/// - Refunds succeed unless the target id was scripted to fail.
/// - Idempotency is honored: a repeated key returns the first outcome
///   without recording a second external refund.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    /// Target ids scripted to fail, with their error message.
    fail_targets: HashMap<String, String>,
    /// Charges per customer id, newest first.
    charges: HashMap<String, Vec<CardCharge>>,
    /// External refunds actually performed, by idempotency key.
    refunds_by_key: HashMap<String, RefundOutcome>,
    calls: Vec<RecordedRefund>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the given target id to fail with `message`.
    pub fn fail_target(&self, target_id: &str, message: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .fail_targets
            .insert(target_id.to_owned(), message.to_owned());
    }

    /// Seed the charge list for a customer (newest first).
    pub fn set_charges(&self, customer_id: &str, charges: Vec<CardCharge>) {
        let mut state = self.state.lock().unwrap();
        state.charges.insert(customer_id.to_owned(), charges);
    }

    /// Every refund call made, in order, including idempotent replays.
    pub fn calls(&self) -> Vec<RecordedRefund> {
        self.state.lock().unwrap().calls.clone()
    }

    /// The number of distinct external refunds performed.
    pub fn external_refund_count(&self) -> usize {
        self.state.lock().unwrap().refunds_by_key.len()
    }
}

#[async_trait]
impl RefundProvider for MockProvider {
    async fn refund(
        &self,
        req: &RefundRequest,
        idempotency_key: &OutRefundNo,
    ) -> Result<RefundOutcome, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RecordedRefund {
            request: req.clone(),
            idempotency_key: idempotency_key.as_str().to_owned(),
        });

        if let Some(message) = state.fail_targets.get(req.target.id()) {
            return Err(ProviderError::Rejected(message.clone()));
        }

        // At-most-once per key: replays return the original outcome.
        let key = idempotency_key.as_str().to_owned();
        if let Some(existing) = state.refunds_by_key.get(&key) {
            return Ok(existing.clone());
        }

        let outcome = RefundOutcome {
            provider_refund_no: Some(format!("mockref_{key}")),
            raw_response: json!({
                "id": format!("mockref_{key}"),
                "status": "succeeded",
                "target": req.target.id(),
                "amount": req.amount,
            }),
        };
        state.refunds_by_key.insert(key, outcome.clone());
        Ok(outcome)
    }
}

#[async_trait]
impl ChargeSource for MockProvider {
    async fn list_customer_charges(
        &self,
        customer_id: &str,
    ) -> Result<Vec<CardCharge>, ProviderError> {
        let state = self.state.lock().unwrap();
        if let Some(message) = state.fail_targets.get(customer_id) {
            return Err(ProviderError::Rejected(message.clone()));
        }
        Ok(state.charges.get(customer_id).cloned().unwrap_or_default())
    }
}
