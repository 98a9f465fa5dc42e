//! API plumbing shared by the refundry server and its internal HTTP clients:
//! the error taxonomy and wire envelope, axum server utilities, a thin REST
//! client over `reqwest`, and admin bearer-token authentication.

// Enforce disallowed methods clippy lint
#![deny(clippy::disallowed_methods)]

/// Admin bearer-token authentication.
pub mod auth;
/// Error taxonomy, stable error codes, and the wire envelope.
pub mod error;
/// Thin REST client over `reqwest`.
pub mod rest;
/// Axum server utilities: extractors and graceful serving.
pub mod server;

pub use error::{ApiError, ErrorEnvelope, ErrorKind};
