//! Charge rows as reported by the card processor. Never persisted by us.

use serde::{Deserialize, Serialize};

use crate::money::Cents;

/// A charge listed from the card processor.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CardCharge {
    pub id: String,
    /// Unix seconds.
    pub created: i64,
    /// Lowercase ISO currency code, e.g. `"cny"`.
    pub currency: String,
    /// Originally charged amount in minor units.
    pub amount: Cents,
    /// Already refunded amount in minor units.
    pub amount_refunded: Cents,
    pub payment_intent: Option<String>,
    pub paid: bool,
    pub status: String,
}

impl CardCharge {
    /// The still-refundable amount: `max(0, amount - amount_refunded)`.
    pub fn remaining(&self) -> Cents {
        self.amount.saturating_refundable_sub(self.amount_refunded)
    }

    /// Whether this charge ever moved money: paid and succeeded.
    pub fn is_settled(&self) -> bool {
        self.paid && self.status == "succeeded"
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn remaining_clamps_at_zero() {
        let mut charge = CardCharge {
            id: "ch_1".to_owned(),
            created: 0,
            currency: "cny".to_owned(),
            amount: Cents::new(2000),
            amount_refunded: Cents::new(500),
            payment_intent: None,
            paid: true,
            status: "succeeded".to_owned(),
        };
        assert_eq!(charge.remaining(), Cents::new(1500));
        charge.amount_refunded = Cents::new(9000);
        assert_eq!(charge.remaining(), Cents::ZERO);
    }
}
