//! The refundry admin service binary.

// Enforce disallowed methods clippy lint
#![deny(clippy::disallowed_methods)]

use std::sync::Arc;

use anyhow::Context;
use refundry_api::auth::AdminAuthenticator;
use refundry_api::server::serve_with_graceful_shutdown;
use refundry_engine::estimate::EstimateJob;
use refundry_engine::EngineDeps;
use refundry_providers::aggregator::{
    self, AggregatorClient, AggregatorConfig, SignType,
};
use refundry_providers::card::{CardConfig, CardProcessorClient};
use refundry_store::audit::{AuditConfig, RestAuditStore};
use refundry_store::business::MySqlBusinessStore;
use refundry_tokio::{NamedTask, ShutdownChannel};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

mod config;
mod routes;
mod state;

use config::Config;
use state::AppState;

/// The card processor's REST API base.
const CARD_API_BASE: &str = "https://api.stripe.com/v1";

fn main() -> anyhow::Result<()> {
    // Seed the environment from .env in dev; ignore a missing file.
    let _ = dotenvy::dotenv();
    refundry_logger::init();

    let config = Config::from_env().context("Invalid configuration")?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(run(config))
}

async fn run(config: Config) -> anyhow::Result<()> {
    // --- Stores --- //
    let db_options = MySqlConnectOptions::new()
        .host(&config.db.host)
        .port(config.db.port)
        .username(&config.db.user)
        .password(&config.db.password)
        .database(&config.db.database);
    let pool = MySqlPoolOptions::new()
        .max_connections(10)
        .connect_lazy_with(db_options);
    let business = Arc::new(MySqlBusinessStore::new(pool));

    let audit = Arc::new(RestAuditStore::new(AuditConfig {
        base_url: config.audit.url.clone(),
        service_role_key: config.audit.service_role_key.clone(),
    }));

    // --- Providers --- //
    let private_key =
        aggregator::parse_private_key(&config.aggregator.private_key)
            .context("Invalid AGGREGATOR_PRIVATE_KEY")?;
    let public_key = config
        .aggregator
        .public_key
        .as_deref()
        .map(aggregator::parse_public_key)
        .transpose()
        .context("Invalid AGGREGATOR_PUBLIC_KEY")?;
    let aggregator_client = Arc::new(AggregatorClient::new(AggregatorConfig {
        base_url: config.aggregator.base_url.clone(),
        pid: config.aggregator.pid.clone(),
        private_key,
        public_key,
        sign_type: SignType::from_config(
            config.aggregator.sign_type.as_deref(),
        ),
    }));
    let card_client = Arc::new(CardProcessorClient::new(CardConfig {
        secret_key: config.card_secret_key.clone(),
        api_base: CARD_API_BASE.to_owned(),
    }));

    let deps = EngineDeps {
        business,
        audit,
        aggregator: aggregator_client,
        card: card_client.clone(),
        charges: card_client,
    };

    let state = AppState {
        estimate: EstimateJob::new(deps.clone()),
        auth: AdminAuthenticator::new(
            config.admin_api_key.clone(),
            Some(config.audit.jwt_secret.as_str()),
            config.admin_emails.clone(),
        ),
        deps,
    };

    // --- Router --- //
    let mut cors = CorsLayer::new()
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);
    if let Some(origin) = &config.admin_cors_origin {
        let origin = origin
            .parse::<http::HeaderValue>()
            .context("Invalid ADMIN_CORS_ORIGIN")?;
        cors = cors.allow_origin(AllowOrigin::exact(origin));
    }
    let router = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // --- Serve --- //
    let shutdown = ShutdownChannel::new();
    spawn_signal_listener(shutdown.clone());

    let listener =
        tokio::net::TcpListener::bind(("0.0.0.0", config.port))
            .await
            .with_context(|| {
                format!("Couldn't bind port {port}", port = config.port)
            })?;
    info!("refundry-server listening on port {port}", port = config.port);
    serve_with_graceful_shutdown(listener, router, shutdown).await
}

/// Trigger a graceful shutdown on SIGINT or SIGTERM.
fn spawn_signal_listener(shutdown: ShutdownChannel) {
    NamedTask::spawn("signal-listener", async move {
        #[cfg(unix)]
        let sigterm = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(_) => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(unix))]
        let sigterm = std::future::pending::<()>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            () = sigterm => info!("Received SIGTERM"),
        }
        shutdown.send();
    })
    .detach();
}
