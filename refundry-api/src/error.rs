//! Serializable API error types returned by the refundry service.
//!
//! Every error that crosses the HTTP boundary is a stable snake_case string
//! code plus an optional human-readable message and optional structured
//! details. Codes are load-bearing (the admin UI switches on them); messages
//! are not.

// Deny suspicious match names that are probably non-existent variants.
#![deny(non_snake_case)]

use std::borrow::Cow;
use std::fmt::{self, Display};

use http::StatusCode;
use serde::{Deserialize, Serialize};

// Associated constants can't be imported.
pub const CLIENT_400_BAD_REQUEST: StatusCode = StatusCode::BAD_REQUEST;
pub const CLIENT_401_UNAUTHORIZED: StatusCode = StatusCode::UNAUTHORIZED;
pub const CLIENT_403_FORBIDDEN: StatusCode = StatusCode::FORBIDDEN;
pub const CLIENT_404_NOT_FOUND: StatusCode = StatusCode::NOT_FOUND;
pub const CLIENT_409_CONFLICT: StatusCode = StatusCode::CONFLICT;
pub const SERVER_500_INTERNAL_SERVER_ERROR: StatusCode =
    StatusCode::INTERNAL_SERVER_ERROR;

/// The taxonomy bucket an [`ApiError`] belongs to. The kind determines the
/// HTTP status; the code determines client behavior.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Malformed input: bad user id, bad yuan string, bad fee percent...
    Validation,
    /// Missing/invalid bearer token.
    Unauthorized,
    /// Valid token, but not an admin.
    Forbidden,
    /// User, top-up, or refund does not exist.
    NotFound,
    /// The request is well-formed but the domain state rejects it:
    /// `nothing_to_refund`, `fee_too_high`, `stripe_multiple_currencies`...
    StateConflict,
    /// A consistency predicate failed mid-flight: `insufficient_user_quota`,
    /// `customer_mismatch`...
    IntegrityConflict,
    /// An external collaborator failed: provider HTTP, signature
    /// verification, the audit store.
    External,
    /// Some legs succeeded, some did not run: `refund_incomplete`.
    PartialSuccess,
    /// Everything else.
    Internal,
}

impl ErrorKind {
    pub fn to_http_status(self) -> StatusCode {
        match self {
            Self::Validation => CLIENT_400_BAD_REQUEST,
            Self::Unauthorized => CLIENT_401_UNAUTHORIZED,
            Self::Forbidden => CLIENT_403_FORBIDDEN,
            Self::NotFound => CLIENT_404_NOT_FOUND,
            Self::StateConflict => CLIENT_409_CONFLICT,
            Self::IntegrityConflict => CLIENT_409_CONFLICT,
            Self::External => SERVER_500_INTERNAL_SERVER_ERROR,
            Self::PartialSuccess => SERVER_500_INTERNAL_SERVER_ERROR,
            Self::Internal => SERVER_500_INTERNAL_SERVER_ERROR,
        }
    }
}

/// The JSON-serialized representation of every [`ApiError`]. It is the only
/// error struct actually sent across the wire.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Stable snake_case code, e.g. `"nothing_to_refund"`.
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// An error on the refundry API surface.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    /// Stable snake_case code.
    pub code: Cow<'static, str>,
    /// Human-readable; may include yuan values but never raw provider
    /// payloads.
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(
        kind: ErrorKind,
        code: impl Into<Cow<'static, str>>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    // --- Constructors by kind --- //

    pub fn validation(
        code: impl Into<Cow<'static, str>>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::Validation, code, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, "unauthorized", message)
    }

    pub fn forbidden() -> Self {
        Self::new(ErrorKind::Forbidden, "not_admin", "not an administrator")
    }

    pub fn not_found(what: &'static str) -> Self {
        Self::new(
            ErrorKind::NotFound,
            format!("{what}_not_found"),
            format!("{what} not found"),
        )
    }

    pub fn state_conflict(
        code: impl Into<Cow<'static, str>>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::StateConflict, code, message)
    }

    pub fn integrity_conflict(
        code: impl Into<Cow<'static, str>>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::IntegrityConflict, code, message)
    }

    pub fn external(
        code: impl Into<Cow<'static, str>>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::External, code, message)
    }

    pub fn internal(message: impl Display) -> Self {
        Self::new(
            ErrorKind::Internal,
            "internal",
            format!("internal error: {message}"),
        )
    }

    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: self.code.clone().into_owned(),
            message: (!self.message.is_empty()).then(|| self.message.clone()),
            details: self.details.clone(),
        }
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{code}: {msg}", code = self.code, msg = self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{err:#}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn envelope_shape() {
        let err = ApiError::state_conflict(
            "nothing_to_refund",
            "due amount is 0.00",
        );
        let json = serde_json::to_value(err.to_envelope()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "error": "nothing_to_refund",
                "message": "due amount is 0.00",
            }),
        );
    }

    #[test]
    fn statuses() {
        assert_eq!(
            ApiError::validation("invalid_amount", "")
                .kind
                .to_http_status(),
            CLIENT_400_BAD_REQUEST,
        );
        assert_eq!(
            ApiError::not_found("user").kind.to_http_status(),
            CLIENT_404_NOT_FOUND,
        );
        assert_eq!(
            ApiError::integrity_conflict("insufficient_user_quota", "")
                .kind
                .to_http_status(),
            CLIENT_409_CONFLICT,
        );
        assert_eq!(ApiError::not_found("user").code, "user_not_found");
    }
}
