//! Persistence seams and their production implementations.
//!
//! Two stores back the refund engine:
//!
//! - the **business database** (MySQL): owns users and top-ups, and is where
//!   quota is reserved and released;
//! - the **audit store** (a PostgREST-style REST service): owns the refund
//!   log and the admins table.
//!
//! The engine only sees the [`BusinessStore`] / [`AuditStore`] traits;
//! in-memory impls behind the `test-utils` feature back the engine tests.

// Enforce disallowed methods clippy lint
#![deny(clippy::disallowed_methods)]

/// The audit store REST client.
pub mod audit;
/// The MySQL business store.
pub mod business;
/// Store trait seams and filter types.
pub mod traits;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use traits::{
    AuditStore, BusinessStore, RefundLogFilter, RefundedTotals,
    SingleRefundGuard, StoreError, TopUpFilter, UserRefundTotals,
};
