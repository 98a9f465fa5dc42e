//! Admin bearer-token authentication.
//!
//! Admin routes accept `Authorization: Bearer <token>` where the token is
//! either the configured shared secret (`ADMIN_API_KEY`) or an HS256 JWT
//! signed with the audit store's secret. A JWT bearer still has to prove
//! adminship: their email claim must be allowlisted, or their subject must
//! appear in the audit store's admins table (checked by the caller, since it
//! requires I/O).

use http::header::AUTHORIZATION;
use http::HeaderMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::ApiError;

/// Who a validated bearer token belongs to. Recorded as `performed_by` on
/// refund logs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AdminIdentity {
    /// The shared `ADMIN_API_KEY` secret.
    ApiKey,
    /// A JWT bearer; the label is their email, falling back to their
    /// subject.
    Jwt { actor: String },
}

impl AdminIdentity {
    /// The attribution string written to refund logs.
    pub fn actor(&self) -> &str {
        match self {
            Self::ApiKey => "api-key",
            Self::Jwt { actor } => actor,
        }
    }
}

/// The JWT claims we care about. Audit-store JWTs carry more; everything
/// else is ignored.
#[derive(Clone, Debug, Deserialize)]
pub struct AdminClaims {
    pub sub: Option<String>,
    pub email: Option<String>,
}

/// What a bearer token proved before any I/O: either full admin (shared
/// secret or allowlisted email), or a JWT subject that still needs an
/// admins-table lookup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TokenCheck {
    Admin(AdminIdentity),
    /// Valid JWT, not allowlisted; `sub` must be checked against the admins
    /// table.
    NeedsAdminLookup { sub: String, actor: String },
}

/// Admin authenticator configuration.
#[derive(Clone)]
pub struct AdminAuthenticator {
    /// The `ADMIN_API_KEY` shared secret, if configured.
    shared_secret: Option<String>,
    /// HS256 decoding key for audit-store JWTs, if configured.
    jwt_key: Option<DecodingKey>,
    /// Emails that are admins regardless of the admins table.
    email_allowlist: Vec<String>,
}

impl AdminAuthenticator {
    pub fn new(
        shared_secret: Option<String>,
        jwt_secret: Option<&str>,
        email_allowlist: Vec<String>,
    ) -> Self {
        Self {
            shared_secret,
            jwt_key: jwt_secret
                .map(|secret| DecodingKey::from_secret(secret.as_bytes())),
            email_allowlist,
        }
    }

    /// Check the `Authorization` header. Pure; the caller resolves
    /// [`TokenCheck::NeedsAdminLookup`] against the admins table.
    pub fn check_headers(
        &self,
        headers: &HeaderMap,
    ) -> Result<TokenCheck, ApiError> {
        let token = bearer_token(headers)?;

        if let Some(secret) = &self.shared_secret {
            if token == secret.as_str() {
                return Ok(TokenCheck::Admin(AdminIdentity::ApiKey));
            }
        }

        let jwt_key = self.jwt_key.as_ref().ok_or_else(|| {
            ApiError::unauthorized("token is not the admin api key")
        })?;

        let mut validation = Validation::new(Algorithm::HS256);
        // Audit-store JWTs set `aud` to values we don't control.
        validation.validate_aud = false;
        let claims =
            jsonwebtoken::decode::<AdminClaims>(token, jwt_key, &validation)
                .map_err(|e| {
                    ApiError::unauthorized(format!("invalid token: {e}"))
                })?
                .claims;

        let email = claims.email.clone().unwrap_or_default();
        let actor = if email.is_empty() {
            claims.sub.clone().unwrap_or_default()
        } else {
            email.clone()
        };
        if actor.is_empty() {
            return Err(ApiError::unauthorized("token has no subject"));
        }

        if !email.is_empty()
            && self
                .email_allowlist
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(&email))
        {
            return Ok(TokenCheck::Admin(AdminIdentity::Jwt { actor }));
        }

        match claims.sub {
            Some(sub) if !sub.is_empty() =>
                Ok(TokenCheck::NeedsAdminLookup { sub, actor }),
            _ => Err(ApiError::forbidden()),
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
    let value = value
        .to_str()
        .map_err(|_| ApiError::unauthorized("malformed bearer token"))?;
    value
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::unauthorized("malformed bearer token"))
}

#[cfg(test)]
mod test {
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    use super::*;

    #[derive(Serialize)]
    struct TestClaims<'a> {
        sub: &'a str,
        email: &'a str,
        exp: u64,
    }

    fn headers_with(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        headers
    }

    fn jwt(secret: &str, sub: &str, email: &str) -> String {
        encode(
            &Header::default(),
            &TestClaims {
                sub,
                email,
                // Far future; these tokens only live inside this test.
                exp: 33_000_000_000,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn shared_secret_wins() {
        let auth = AdminAuthenticator::new(
            Some("sekret".to_owned()),
            None,
            Vec::new(),
        );
        let check = auth.check_headers(&headers_with("sekret")).unwrap();
        assert_eq!(check, TokenCheck::Admin(AdminIdentity::ApiKey));

        assert!(auth.check_headers(&headers_with("wrong")).is_err());
        assert!(auth.check_headers(&HeaderMap::new()).is_err());
    }

    #[test]
    fn allowlisted_email_is_admin() {
        let auth = AdminAuthenticator::new(
            None,
            Some("jwtsecret"),
            vec!["Ops@Example.com".to_owned()],
        );
        let token = jwt("jwtsecret", "uid-1", "ops@example.com");
        let check = auth.check_headers(&headers_with(&token)).unwrap();
        assert_eq!(
            check,
            TokenCheck::Admin(AdminIdentity::Jwt {
                actor: "ops@example.com".to_owned(),
            }),
        );
    }

    #[test]
    fn unknown_email_needs_lookup() {
        let auth = AdminAuthenticator::new(None, Some("jwtsecret"), Vec::new());
        let token = jwt("jwtsecret", "uid-2", "someone@example.com");
        let check = auth.check_headers(&headers_with(&token)).unwrap();
        assert_eq!(
            check,
            TokenCheck::NeedsAdminLookup {
                sub: "uid-2".to_owned(),
                actor: "someone@example.com".to_owned(),
            },
        );
    }

    #[test]
    fn bad_signature_is_rejected() {
        let auth = AdminAuthenticator::new(None, Some("jwtsecret"), Vec::new());
        let token = jwt("other-secret", "uid-3", "x@example.com");
        assert!(auth.check_headers(&headers_with(&token)).is_err());
    }
}
