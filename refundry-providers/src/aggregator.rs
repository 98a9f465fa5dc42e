//! The aggregator (Alipay / WeChat) refund adapter.
//!
//! The aggregator speaks form-encoded HTTP with an RSA signature over a
//! canonicalized parameter string: drop `sign` and `sign_type`, drop empty
//! values, sort the remaining keys in ASCII byte order, and join as
//! `k1=v1&k2=v2&...`. Responses are JSON and, when the aggregator's public
//! key is configured and the response carries a `sign`, are verified by the
//! same canonicalization before being trusted.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use refundry_api::rest::{RestClient, POST};
use refundry_core::ids::OutRefundNo;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{Map, Value};
use sha1::Sha1;
use sha2::Sha256;
use tracing::instrument;

use crate::contract::{
    ProviderError, RefundOutcome, RefundProvider, RefundRequest, RefundTarget,
};

/// The refund endpoint, relative to the configured base url.
const REFUND_PATH: &str = "/api/refund";

/// Which RSA signature scheme to use. The aggregator's dialect names them
/// `RSA2` (SHA-256, the default) and `RSA` (legacy SHA-1).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum SignType {
    #[default]
    Rsa2,
    Rsa,
}

impl SignType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rsa2 => "RSA2",
            Self::Rsa => "RSA",
        }
    }

    /// Parse the configured value; unknown values fall back to the default
    /// rather than failing startup.
    pub fn from_config(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("RSA") => Self::Rsa,
            _ => Self::Rsa2,
        }
    }
}

/// Configuration for [`AggregatorClient`].
pub struct AggregatorConfig {
    pub base_url: String,
    /// Our merchant id at the aggregator.
    pub pid: String,
    pub private_key: RsaPrivateKey,
    /// The aggregator's public key; response signatures are only verified
    /// when present.
    pub public_key: Option<RsaPublicKey>,
    pub sign_type: SignType,
}

/// The aggregator refund sink.
pub struct AggregatorClient {
    rest: RestClient,
    config: AggregatorConfig,
}

impl AggregatorClient {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            rest: RestClient::new("engine", "aggregator"),
            config,
        }
    }

    fn sign(&self, canonical: &str) -> Result<String, ProviderError> {
        let msg = canonical.as_bytes();
        let sig_bytes = match self.config.sign_type {
            SignType::Rsa2 => {
                let key = SigningKey::<Sha256>::new(
                    self.config.private_key.clone(),
                );
                key.try_sign(msg)
                    .map_err(|e| {
                        ProviderError::InvalidRequest(format!(
                            "rsa signing failed: {e}"
                        ))
                    })?
                    .to_vec()
            }
            SignType::Rsa => {
                let key =
                    SigningKey::<Sha1>::new(self.config.private_key.clone());
                key.try_sign(msg)
                    .map_err(|e| {
                        ProviderError::InvalidRequest(format!(
                            "rsa signing failed: {e}"
                        ))
                    })?
                    .to_vec()
            }
        };
        Ok(BASE64.encode(sig_bytes))
    }

    fn verify(
        &self,
        public_key: &RsaPublicKey,
        canonical: &str,
        sign_b64: &str,
    ) -> Result<(), ProviderError> {
        let sig_bytes = BASE64
            .decode(sign_b64.trim())
            .map_err(|_| ProviderError::BadSignature)?;
        let signature = Signature::try_from(sig_bytes.as_slice())
            .map_err(|_| ProviderError::BadSignature)?;
        let msg = canonical.as_bytes();
        let verified = match self.config.sign_type {
            SignType::Rsa2 => VerifyingKey::<Sha256>::new(public_key.clone())
                .verify(msg, &signature)
                .is_ok(),
            SignType::Rsa => VerifyingKey::<Sha1>::new(public_key.clone())
                .verify(msg, &signature)
                .is_ok(),
        };
        if verified {
            Ok(())
        } else {
            Err(ProviderError::BadSignature)
        }
    }
}

#[async_trait]
impl RefundProvider for AggregatorClient {
    #[instrument(skip_all, name = "(aggregator-refund)")]
    async fn refund(
        &self,
        req: &RefundRequest,
        idempotency_key: &OutRefundNo,
    ) -> Result<RefundOutcome, ProviderError> {
        let (order_no, use_out_trade_no) = match &req.target {
            RefundTarget::AggregatorOrder {
                order_no,
                use_out_trade_no,
            } => (order_no, *use_out_trade_no),
            other => {
                return Err(ProviderError::InvalidRequest(format!(
                    "aggregator can't refund target {other:?}"
                )))
            }
        };
        let amount = req.amount.ok_or_else(|| {
            ProviderError::InvalidRequest(
                "aggregator refunds require an amount".to_owned(),
            )
        })?;
        if !amount.is_positive() {
            return Err(ProviderError::InvalidRequest(format!(
                "aggregator refund amount must be positive, got {amount}"
            )));
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let order_no_field = if use_out_trade_no {
            "out_trade_no"
        } else {
            "trade_no"
        };
        let mut params = Map::new();
        params.insert("pid".to_owned(), self.config.pid.clone().into());
        params.insert(order_no_field.to_owned(), order_no.clone().into());
        params.insert("money".to_owned(), amount.to_yuan_string().into());
        params.insert(
            "out_refund_no".to_owned(),
            idempotency_key.as_str().to_owned().into(),
        );
        params.insert("timestamp".to_owned(), timestamp.to_string().into());
        params.insert(
            "sign_type".to_owned(),
            self.config.sign_type.as_str().to_owned().into(),
        );

        let sign = self.sign(&canonical_signing_string(&params))?;
        params.insert("sign".to_owned(), sign.into());

        // All values are strings at this point; flatten for form encoding.
        let form: Vec<(&str, &str)> = params
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.as_str(), v)))
            .collect();

        let url = format!("{}{REFUND_PATH}", self.config.base_url);
        let body = self
            .rest
            .request_form(POST, &url, http::HeaderMap::new(), &form)
            .await?;

        let response: Value =
            serde_json::from_slice(&body).map_err(|e| {
                ProviderError::InvalidResponse(format!(
                    "non-JSON aggregator response: {e}"
                ))
            })?;

        // Verify the response signature before trusting any field.
        if let Some(public_key) = &self.config.public_key {
            if let Some(sign) = response.get("sign").and_then(Value::as_str) {
                let object = response.as_object().ok_or_else(|| {
                    ProviderError::InvalidResponse(
                        "aggregator response is not an object".to_owned(),
                    )
                })?;
                let canonical = canonical_signing_string(object);
                self.verify(public_key, &canonical, sign)?;
            }
        }

        // Some aggregator deployments stringify the code.
        let code = response.get("code").and_then(|v| {
            v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        });
        if code != Some(0) {
            let msg = response
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("aggregator refund rejected");
            return Err(ProviderError::Rejected(msg.to_owned()));
        }

        let provider_refund_no = response
            .get("refund_no")
            .and_then(Value::as_str)
            .map(str::to_owned);

        Ok(RefundOutcome {
            provider_refund_no,
            raw_response: response,
        })
    }
}

/// Build the canonical signing string over a parameter map: drop `sign` and
/// `sign_type`, drop entries whose value is empty / null / array / object,
/// sort the remaining keys in ASCII byte order, join as `k1=v1&k2=v2&...`.
pub fn canonical_signing_string(params: &Map<String, Value>) -> String {
    let mut entries: Vec<(&str, String)> = params
        .iter()
        .filter_map(|(key, value)| {
            if key == "sign" || key == "sign_type" {
                return None;
            }
            let rendered = match value {
                Value::String(s) if !s.is_empty() => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((key.as_str(), rendered))
        })
        .collect();
    entries.sort_unstable_by(|(a, _), (b, _)| a.as_bytes().cmp(b.as_bytes()));
    entries
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Parse private key material: PEM, base64 of PEM, or base64 DER (PKCS#8 or
/// PKCS#1).
pub fn parse_private_key(input: &str) -> anyhow::Result<RsaPrivateKey> {
    let trimmed = input.trim();
    if trimmed.contains("-----BEGIN") {
        return RsaPrivateKey::from_pkcs8_pem(trimmed)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(trimmed))
            .map_err(|e| anyhow::anyhow!("invalid private key PEM: {e}"));
    }

    let compact: String =
        trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    let der = BASE64
        .decode(compact.as_bytes())
        .map_err(|e| anyhow::anyhow!("private key is not PEM or base64: {e}"))?;

    if let Ok(pem) = std::str::from_utf8(&der) {
        if pem.contains("-----BEGIN") {
            return RsaPrivateKey::from_pkcs8_pem(pem)
                .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
                .map_err(|e| {
                    anyhow::anyhow!("invalid base64'd private key PEM: {e}")
                });
        }
    }

    RsaPrivateKey::from_pkcs8_der(&der)
        .or_else(|_| RsaPrivateKey::from_pkcs1_der(&der))
        .map_err(|e| anyhow::anyhow!("invalid private key DER: {e}"))
}

/// Parse public key material: PEM, base64 of PEM, or base64 DER (SPKI or
/// PKCS#1).
pub fn parse_public_key(input: &str) -> anyhow::Result<RsaPublicKey> {
    let trimmed = input.trim();
    if trimmed.contains("-----BEGIN") {
        return RsaPublicKey::from_public_key_pem(trimmed)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(trimmed))
            .map_err(|e| anyhow::anyhow!("invalid public key PEM: {e}"));
    }

    let compact: String =
        trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    let der = BASE64
        .decode(compact.as_bytes())
        .map_err(|e| anyhow::anyhow!("public key is not PEM or base64: {e}"))?;

    if let Ok(pem) = std::str::from_utf8(&der) {
        if pem.contains("-----BEGIN") {
            return RsaPublicKey::from_public_key_pem(pem)
                .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
                .map_err(|e| {
                    anyhow::anyhow!("invalid base64'd public key PEM: {e}")
                });
        }
    }

    RsaPublicKey::from_public_key_der(&der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(&der))
        .map_err(|e| anyhow::anyhow!("invalid public key DER: {e}"))
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn canonical_string_sorts_and_filters() {
        let params = map(json!({
            "timestamp": "1700000000",
            "pid": "1001",
            "money": "9.50",
            "out_refund_no": "agg_x_1",
            "sign": "should-drop",
            "sign_type": "RSA2",
            "empty": "",
            "nullish": null,
            "list": [1, 2],
            "obj": {"k": "v"},
        }));
        assert_eq!(
            canonical_signing_string(&params),
            "money=9.50&out_refund_no=agg_x_1&pid=1001&timestamp=1700000000",
        );
    }

    #[test]
    fn canonical_string_renders_scalars() {
        let params = map(json!({ "code": 0, "ok": true, "msg": "fine" }));
        assert_eq!(
            canonical_signing_string(&params),
            "code=0&msg=fine&ok=true",
        );
    }

    #[test]
    fn canonical_string_sorts_ascii_byte_order() {
        // 'Z' (0x5a) < '_' (0x5f) < 'a' (0x61)
        let params = map(json!({ "a": "3", "Z": "1", "_m": "2" }));
        assert_eq!(canonical_signing_string(&params), "Z=1&_m=2&a=3");
    }

    #[test]
    fn sign_type_from_config() {
        assert_eq!(SignType::from_config(None), SignType::Rsa2);
        assert_eq!(SignType::from_config(Some("RSA2")), SignType::Rsa2);
        assert_eq!(SignType::from_config(Some("rsa")), SignType::Rsa);
        assert_eq!(SignType::from_config(Some("bogus")), SignType::Rsa2);
    }
}
