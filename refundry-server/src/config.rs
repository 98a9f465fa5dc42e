//! Environment configuration.
//!
//! All configuration comes from the environment (optionally seeded from a
//! `.env` file in dev). Parsing is hand-rolled: every function returns an
//! `anyhow::Result` with the variable name in the error chain.

use std::env;

use anyhow::Context;

/// The default service port.
const DEFAULT_PORT: u16 = 8787;

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    /// Origin allowed to call the admin API from a browser.
    pub admin_cors_origin: Option<String>,
    pub db: DbConfig,
    pub audit: AuditStoreConfig,
    /// Emails that are admins regardless of the admins table.
    pub admin_emails: Vec<String>,
    pub aggregator: AggregatorEnv,
    pub card_secret_key: String,
    /// Shared-secret bearer token, if configured.
    pub admin_api_key: Option<String>,
}

#[derive(Clone, Debug)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

#[derive(Clone, Debug)]
pub struct AuditStoreConfig {
    pub url: String,
    pub service_role_key: String,
    pub jwt_secret: String,
}

#[derive(Clone, Debug)]
pub struct AggregatorEnv {
    pub base_url: String,
    pub pid: String,
    /// PEM, base64 of PEM, or base64 DER.
    pub private_key: String,
    pub public_key: Option<String>,
    /// `RSA2` (default) or `RSA`.
    pub sign_type: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            port: optional("PORT")?
                .map(|s| s.parse::<u16>().context("PORT must be a port"))
                .transpose()?
                .unwrap_or(DEFAULT_PORT),
            admin_cors_origin: optional("ADMIN_CORS_ORIGIN")?,
            db: DbConfig {
                host: required("DB_HOST")?,
                port: optional("DB_PORT")?
                    .map(|s| {
                        s.parse::<u16>().context("DB_PORT must be a port")
                    })
                    .transpose()?
                    .unwrap_or(3306),
                user: required("DB_USER")?,
                password: required("DB_PASSWORD")?,
                database: required("DB_NAME")?,
            },
            audit: AuditStoreConfig {
                url: trim_trailing_slash(required("AUDIT_STORE_URL")?),
                service_role_key: required("AUDIT_SERVICE_ROLE_KEY")?,
                jwt_secret: required("AUDIT_JWT_SECRET")?,
            },
            admin_emails: optional("ADMIN_EMAILS")?
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|e| !e.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
            aggregator: AggregatorEnv {
                base_url: trim_trailing_slash(required(
                    "AGGREGATOR_BASE_URL",
                )?),
                pid: required("AGGREGATOR_PID")?,
                private_key: required("AGGREGATOR_PRIVATE_KEY")?,
                public_key: optional("AGGREGATOR_PUBLIC_KEY")?,
                sign_type: optional("AGGREGATOR_SIGN_TYPE")?,
            },
            card_secret_key: required("CARD_SECRET_KEY")?,
            admin_api_key: optional("ADMIN_API_KEY")?,
        })
    }
}

fn required(name: &'static str) -> anyhow::Result<String> {
    env::var(name).with_context(|| format!("{name} must be set"))
}

/// Unset and empty both mean "not configured".
fn optional(name: &'static str) -> anyhow::Result<Option<String>> {
    match env::var(name) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("{name} is not unicode")),
    }
}

fn trim_trailing_slash(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}
