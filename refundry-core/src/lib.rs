//! Pure domain logic for the refundry service: money primitives, domain
//! types, the refund quote algorithm, the computation trace, and the public
//! view redaction walker.
//!
//! Nothing in this crate performs I/O or suspends; everything is exact
//! integer arithmetic over `i64` cents and `i128` quota.

// Enforce disallowed methods clippy lint
#![deny(clippy::disallowed_methods)]

/// Domain rows fetched from the card processor.
pub mod charge;
/// Fee percent parsing.
pub mod fee;
/// Identifier newtypes, batch ids, and idempotency keys.
pub mod ids;
/// `Cents` and `Quota` newtypes and unit conversions.
pub mod money;
/// The refund quote algorithm.
pub mod quote;
/// Public activity view redaction.
pub mod redact;
/// Refund audit log rows.
pub mod refund_log;
/// Serde helpers shared across wire types.
pub mod serde_helpers;
/// Domain rows owned by the business database.
pub mod topup;
/// The versioned refund computation trace.
pub mod trace;
/// User rows owned by the business database.
pub mod user;
