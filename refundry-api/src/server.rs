//! Axum server utilities.
//!
//! - [`ApiJson`] / [`ApiQuery`] extractors which reject with the standard
//!   [`ApiError`] envelope instead of axum's plaintext rejections.
//! - [`ApiJson`] doubles as the success-response wrapper.
//! - [`serve_with_graceful_shutdown`] to run a [`Router`] until the shutdown
//!   channel fires, draining in-flight requests.

use anyhow::Context as _;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, FromRequestParts, Request};
use axum::response::{IntoResponse, Response};
use axum::Router;
use http::request::Parts;
use refundry_tokio::ShutdownChannel;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::ApiError;

/// JSON body extractor / response wrapper conforming to the refundry API.
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, ApiError> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError::validation(
                "invalid_json_body",
                rejection.body_text(),
            )),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiJson<T> {
    fn into_response(self) -> Response {
        match serde_json::to_vec(&self.0) {
            Ok(body) => (
                [(http::header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response(),
            // Serialization failing is a programming error; surface it as
            // the standard internal envelope.
            Err(e) => {
                warn!("Couldn't serialize response: {e:#}");
                ApiError::internal(e).into_response()
            }
        }
    }
}

/// Query string extractor conforming to the refundry API.
#[derive(Debug)]
pub struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> Result<Self, ApiError> {
        match axum::extract::Query::<T>::from_request_parts(parts, state)
            .await
        {
            Ok(axum::extract::Query(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError::validation(
                "invalid_query",
                rejection.body_text(),
            )),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.kind.to_http_status();
        if status.is_server_error() {
            warn!("{status}: {self}");
        }
        let body = serde_json::to_vec(&self.to_envelope())
            .unwrap_or_else(|_| b"{\"error\":\"internal\"}".to_vec());
        (
            status,
            [(http::header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}

/// Serve `router` on `listener` until `shutdown` fires, then drain.
pub async fn serve_with_graceful_shutdown(
    listener: tokio::net::TcpListener,
    router: Router,
    shutdown: ShutdownChannel,
) -> anyhow::Result<()> {
    let local_addr =
        listener.local_addr().context("Couldn't read local addr")?;
    info!("Serving on {local_addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.recv_owned())
        .await
        .context("Server errored")
}

#[cfg(test)]
mod test {
    use axum::response::IntoResponse;

    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn api_error_renders_envelope() {
        let err = ApiError::new(
            ErrorKind::StateConflict,
            "fee_too_high",
            "net amount is not positive",
        );
        let resp = err.into_response();
        assert_eq!(resp.status(), http::StatusCode::CONFLICT);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "fee_too_high");
    }
}
