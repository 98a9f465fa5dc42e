//! Top-up rows, owned by the business database.

use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::ids::UserId;
use crate::money::{Cents, Quota};

/// How a top-up was paid.
///
/// `Card` renders as `"stripe"`, the value the business database stores for
/// card-processor payments. Serializes through its [`Display`] impl so the
/// wire strings and the stored strings can't drift apart.
///
/// [`Display`]: std::fmt::Display
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(SerializeDisplay, DeserializeFromStr)]
#[derive(strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum PaymentMethod {
    Alipay,
    Wxpay,
    #[strum(serialize = "stripe")]
    Card,
}

impl PaymentMethod {
    /// Whether this method settles through the aggregator.
    #[inline]
    pub fn is_aggregator(self) -> bool {
        matches!(self, Self::Alipay | Self::Wxpay)
    }
}

/// Lifecycle of a top-up. `Success -> Refund` once fully refunded; never the
/// reverse.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(SerializeDisplay, DeserializeFromStr)]
#[derive(strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum TopUpStatus {
    Success,
    Refund,
}

/// A completed payment which granted quota.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TopUp {
    pub id: i64,
    pub user_id: UserId,
    /// Paid amount. Meaningful only for aggregator payments; for card rows
    /// the authoritative paid amount comes from the card processor itself.
    pub money: Cents,
    /// Granted quota expressed in yuan-equivalent (x 5000 to quota units).
    /// Promotions can make this exceed `money`. Absent on old rows.
    pub amount: Option<Cents>,
    /// External order id: the aggregator order no, or for card rows a charge
    /// id or payment-intent id.
    pub trade_no: String,
    /// Unix seconds.
    pub create_time: i64,
    pub payment_method: PaymentMethod,
    pub status: TopUpStatus,
}

impl TopUp {
    /// The quota originally granted by this top-up: `amount * 5000` when the
    /// grant column is present, else `money * 5000`.
    pub fn original_grant_quota(&self) -> Quota {
        self.amount.unwrap_or(self.money).to_quota()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn payment_method_wire_values() {
        let json = |m: PaymentMethod| serde_json::to_string(&m).unwrap();
        assert_eq!(json(PaymentMethod::Alipay), "\"alipay\"");
        assert_eq!(json(PaymentMethod::Wxpay), "\"wxpay\"");
        assert_eq!(json(PaymentMethod::Card), "\"stripe\"");
        assert_eq!(PaymentMethod::Card.to_string(), "stripe");
        assert_eq!(
            "stripe".parse::<PaymentMethod>().unwrap(),
            PaymentMethod::Card,
        );
    }

    #[test]
    fn grant_falls_back_to_money() {
        let mut topup = TopUp {
            id: 1,
            user_id: UserId::new(7),
            money: Cents::new(1000),
            amount: Some(Cents::new(2000)),
            trade_no: "T1".to_owned(),
            create_time: 0,
            payment_method: PaymentMethod::Alipay,
            status: TopUpStatus::Success,
        };
        assert_eq!(topup.original_grant_quota(), Quota::new(10_000_000));
        topup.amount = None;
        assert_eq!(topup.original_grant_quota(), Quota::new(5_000_000));
    }
}
