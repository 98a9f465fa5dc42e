//! Shared handler state.

use refundry_api::auth::{AdminAuthenticator, AdminIdentity, TokenCheck};
use refundry_api::error::ApiError;
use refundry_engine::estimate::EstimateJob;
use refundry_engine::EngineDeps;
use refundry_store::AuditStore as _;

/// Everything the route handlers need. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub deps: EngineDeps,
    pub estimate: EstimateJob,
    pub auth: AdminAuthenticator,
}

/// Extractor that admits only administrators.
///
/// Shared-secret and allowlisted-email bearers pass without I/O; other JWT
/// bearers are checked against the audit store's admins table.
pub struct AdminGuard(pub AdminIdentity);

impl axum::extract::FromRequestParts<AppState> for AdminGuard {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut http::request::Parts,
        state: &AppState,
    ) -> Result<Self, ApiError> {
        match state.auth.check_headers(&parts.headers)? {
            TokenCheck::Admin(identity) => Ok(Self(identity)),
            TokenCheck::NeedsAdminLookup { sub, actor } => {
                let is_admin = state
                    .deps
                    .audit
                    .is_admin(&sub)
                    .await
                    .map_err(|e| ApiError::internal(e))?;
                if is_admin {
                    Ok(Self(AdminIdentity::Jwt { actor }))
                } else {
                    Err(ApiError::forbidden())
                }
            }
        }
    }
}
