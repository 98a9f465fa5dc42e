//! The refund engine: quote building, batch execution, the legacy
//! single-top-up path, and the fleet estimate job.

// Enforce disallowed methods clippy lint
#![deny(clippy::disallowed_methods)]

use std::sync::Arc;

use refundry_providers::{ChargeSource, RefundProvider};
use refundry_store::{AuditStore, BusinessStore};

/// The fleet estimate job.
pub mod estimate;
#[cfg(test)]
mod tests;
/// The batch refund execution pipeline.
pub mod execute;
/// Quote building: input gathering, the currency guard, and assembly.
pub mod quote;
/// The legacy single-top-up refund path.
pub mod single;

/// Everything the engine talks to. Handlers and jobs share one of these.
#[derive(Clone)]
pub struct EngineDeps {
    pub business: Arc<dyn BusinessStore>,
    pub audit: Arc<dyn AuditStore>,
    pub aggregator: Arc<dyn RefundProvider>,
    pub card: Arc<dyn RefundProvider>,
    pub charges: Arc<dyn ChargeSource>,
}

impl EngineDeps {
    /// The refund sink for the given channel.
    pub fn provider(
        &self,
        provider: refundry_core::ids::Provider,
    ) -> &Arc<dyn RefundProvider> {
        match provider {
            refundry_core::ids::Provider::Aggregator => &self.aggregator,
            refundry_core::ids::Provider::Card => &self.card,
        }
    }
}
