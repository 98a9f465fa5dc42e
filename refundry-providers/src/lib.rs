//! The two refund sinks behind a common contract: the Chinese payment
//! aggregator (RSA-signed form requests) and the international card
//! processor (REST with idempotency headers).
//!
//! Both adapters are idempotent by a caller-supplied key: repeated calls
//! with the same key must not double-refund.

// Enforce disallowed methods clippy lint
#![deny(clippy::disallowed_methods)]

/// The aggregator adapter.
pub mod aggregator;
/// The card processor adapter.
pub mod card;
/// The shared provider contract and error type.
pub mod contract;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use contract::{
    ChargeSource, ProviderError, RefundOutcome, RefundProvider,
    RefundRequest, RefundTarget,
};
