//! A thin REST client over [`reqwest`] used for all outbound HTTP: the card
//! processor, the aggregator, and the audit store.
//!
//! The `from` and `to` labels identify the calling component and the remote
//! service so requests from different clients in the same process can be told
//! apart in logs. The `from` label is also propagated as the user agent.

use std::borrow::Cow;
use std::time::{Duration, Instant};

use http::header::HeaderMap;
use http::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

// Avoid `Method::` prefix. Associated constants can't be imported.
pub const GET: Method = Method::GET;
pub const POST: Method = Method::POST;
pub const PATCH: Method = Method::PATCH;

/// External collaborators get ample time to respond; no per-leg timeout is
/// layered on top of this.
pub const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors surfaced by [`RestClient`].
#[derive(Debug, thiserror::Error)]
pub enum RestError {
    #[error("request to {to} failed: {source}")]
    Transport {
        to: &'static str,
        source: reqwest::Error,
    },
    #[error("{to} returned HTTP {status}: {body}")]
    Status {
        to: &'static str,
        status: http::StatusCode,
        body: String,
    },
    #[error("couldn't decode {to} response: {source}")]
    Decode {
        to: &'static str,
        source: serde_json::Error,
    },
}

/// A generic `RestClient` with refundry defaults.
#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    /// The component this client calls from, e.g. "engine".
    from: Cow<'static, str>,
    /// The service this client calls, e.g. "card-processor".
    to: &'static str,
}

impl RestClient {
    pub fn new(
        from: impl Into<Cow<'static, str>>,
        to: &'static str,
    ) -> Self {
        let from = from.into();
        let client = reqwest::Client::builder()
            .user_agent(format!("refundry/{from}"))
            .timeout(API_REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build reqwest Client");
        Self { client, from, to }
    }

    /// The service label this client calls.
    pub fn to(&self) -> &'static str {
        self.to
    }

    /// Send a JSON-in, JSON-out request with extra headers, returning the
    /// deserialized body of a 2xx response.
    pub async fn request_json<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<&Req>,
    ) -> Result<Resp, RestError> {
        let bytes = self.request_raw(method, url, headers, body).await?;
        serde_json::from_slice(&bytes).map_err(|source| RestError::Decode {
            to: self.to,
            source,
        })
    }

    /// Send a form-encoded request, returning the raw body of a 2xx
    /// response.
    pub async fn request_form<Req: Serialize>(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        form: &Req,
    ) -> Result<Vec<u8>, RestError> {
        let start = Instant::now();
        let result = async {
            let resp = self
                .client
                .request(method.clone(), url)
                .headers(headers)
                .form(form)
                .send()
                .await
                .map_err(|source| self.transport(source))?;
            self.read_success_body(resp).await
        }
        .await;
        self.log_request(&method, url, start, &result);
        result
    }

    async fn request_raw<Req: Serialize>(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<&Req>,
    ) -> Result<Vec<u8>, RestError> {
        let start = Instant::now();
        let result = async {
            let mut req = self
                .client
                .request(method.clone(), url)
                .headers(headers);
            if let Some(body) = body {
                req = req.json(body);
            }
            let resp =
                req.send().await.map_err(|source| self.transport(source))?;
            self.read_success_body(resp).await
        }
        .await;
        self.log_request(&method, url, start, &result);
        result
    }

    async fn read_success_body(
        &self,
        resp: reqwest::Response,
    ) -> Result<Vec<u8>, RestError> {
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|source| self.transport(source))?;
        if status.is_success() {
            Ok(bytes.to_vec())
        } else {
            Err(RestError::Status {
                to: self.to,
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            })
        }
    }

    fn transport(&self, source: reqwest::Error) -> RestError {
        RestError::Transport {
            to: self.to,
            source,
        }
    }

    fn log_request(
        &self,
        method: &Method,
        url: &str,
        start: Instant,
        result: &Result<Vec<u8>, RestError>,
    ) {
        let elapsed_ms = start.elapsed().as_millis();
        let from = &self.from;
        let to = self.to;
        match result {
            Ok(_) =>
                debug!("({from}=>{to}) {method} {url} ok in {elapsed_ms}ms"),
            Err(e) =>
                debug!("({from}=>{to}) {method} {url} errored in \
                        {elapsed_ms}ms: {e}"),
        }
    }
}
