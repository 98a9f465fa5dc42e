//! Identifier newtypes and the deterministic idempotency key scheme.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::money::Cents;

/// A user's numeric id in the business database.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
    #[inline]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for UserId {
    type Err = std::num::ParseIntError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        i64::from_str(s).map(Self)
    }
}

/// The refund sink a leg is executed against.
///
/// Serializes through its [`Display`] impl so the wire strings and the
/// stored strings can't drift apart.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(SerializeDisplay, DeserializeFromStr)]
#[derive(strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Provider {
    Aggregator,
    Card,
}

/// Identifies one refund execution invocation (one admin POST).
///
/// The batch id is embedded in every leg's idempotency key, so re-triggering
/// a failed batch yields fresh keys: retries across operators are never
/// conflated.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    /// `"userrefund_<uid>_<unix_ms>"`.
    pub fn derive(user_id: UserId, unix_ms: i64) -> Self {
        Self(format!("userrefund_{user_id}_{unix_ms}"))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A per-leg idempotency key, persisted as `out_refund_no` before the
/// provider is called. Deterministic in (provider, batch, target, amount), so
/// replaying the same leg cannot double-refund.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutRefundNo(String);

impl OutRefundNo {
    /// `"<provider>_<batch>_<target_id>_<amount_cents>"`.
    pub fn derive(
        provider: Provider,
        batch: &BatchId,
        target_id: &str,
        amount: Cents,
    ) -> Self {
        Self(format!("{provider}_{batch}_{target_id}_{}", amount.as_i64()))
    }

    /// Rehydrate a key read back from the audit store.
    pub fn from_stored(key: String) -> Self {
        Self(key)
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for OutRefundNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn idempotency_key_shape() {
        let batch = BatchId::derive(UserId::new(42), 1700000000123);
        assert_eq!(batch.as_str(), "userrefund_42_1700000000123");

        let key = OutRefundNo::derive(
            Provider::Card,
            &batch,
            "ch_123",
            Cents::new(2000),
        );
        assert_eq!(key.as_str(), "card_userrefund_42_1700000000123_ch_123_2000");

        let key2 = OutRefundNo::derive(
            Provider::Aggregator,
            &batch,
            "T202401010001",
            Cents::new(500),
        );
        assert_eq!(
            key2.as_str(),
            "aggregator_userrefund_42_1700000000123_T202401010001_500",
        );
    }
}
