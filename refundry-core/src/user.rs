//! User rows, owned by the business database.

use serde::{Deserialize, Serialize};

use crate::ids::UserId;
use crate::money::Quota;

/// A user of the quota service.
///
/// The refund engine mutates only `quota`: a conditional decrement when a leg
/// reserves balance, and an increment only to compensate a failed leg.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: Option<String>,
    /// The user's customer handle at the card processor, if they ever paid
    /// by card.
    pub card_customer_id: Option<String>,
    /// Current spendable quota. Non-negative.
    pub quota: Quota,
    /// Lifetime consumed quota. Non-negative.
    pub used_quota: Quota,
}

/// The redacted user snapshot embedded in quotes and traces.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub id: UserId,
    pub email: Option<String>,
    pub card_customer_id: Option<String>,
}

impl From<&User> for UserSnapshot {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            card_customer_id: user.card_customer_id.clone(),
        }
    }
}
