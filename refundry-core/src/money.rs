//! Money newtypes which maintain the unit invariant `1 yuan = 100 cents =
//! 500_000 quota` and provide exact integer conversions between the three
//! units.
//!
//! Note that we don't impl `From<i64>`, [`FromStr`], etc because we want
//! calling code to be explicit about what the input unit is.
//!
//! All value-carrying arithmetic in this crate goes through [`Cents`] and
//! [`Quota`]; floating point is never used. The only lossy operation is
//! [`Quota::to_cents_floor`], which truncates toward zero.
//!
//! [`FromStr`]: std::str::FromStr

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Quota granted per cent of payment.
pub const QUOTA_PER_CENT: i128 = 5000;
/// Quota granted per yuan of payment.
pub const QUOTA_PER_YUAN: i128 = 500_000;
/// Cents per yuan.
pub const CENTS_PER_YUAN: i64 = 100;

/// Errors that can occur when parsing or converting money values.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum MoneyError {
    #[error("invalid amount: {0:?}")]
    InvalidAmount(String),
    #[error("amount out of range: {0:?}")]
    OutOfRange(String),
}

/// A signed amount of money in 1/100 yuan ("minor units").
///
/// This is the common wire unit for the card processor and the unit all
/// refund plans are computed in.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cents(i64);

impl Cents {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn new(cents: i64) -> Self {
        Self(cents)
    }

    #[inline]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Parse a yuan string (e.g. `"10"`, `"10.5"`, `"-3.14"`) into [`Cents`].
    ///
    /// Accepts an optional leading minus, a decimal integer part, and 0-2
    /// fractional digits. Any fractional digits past the second are
    /// truncated, not rounded. Empty input fails.
    pub fn from_yuan_str(s: &str) -> Result<Self, MoneyError> {
        let invalid = || MoneyError::InvalidAmount(s.to_owned());

        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let (int_part, frac_part) = match digits.split_once('.') {
            Some((int_part, frac_part)) => (int_part, frac_part),
            None => (digits, ""),
        };

        if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
        if !frac_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let yuan = int_part
            .parse::<i64>()
            .map_err(|_| MoneyError::OutOfRange(s.to_owned()))?;

        // Truncate (not round) anything past two fractional digits.
        let frac_part = &frac_part[..frac_part.len().min(2)];
        let mut sub_yuan_cents = frac_part.parse::<i64>().unwrap_or(0);
        if frac_part.len() == 1 {
            sub_yuan_cents *= 10;
        }

        let magnitude = yuan
            .checked_mul(CENTS_PER_YUAN)
            .and_then(|c| c.checked_add(sub_yuan_cents))
            .ok_or_else(|| MoneyError::OutOfRange(s.to_owned()))?;

        let cents = if negative {
            magnitude
                .checked_neg()
                .ok_or_else(|| MoneyError::OutOfRange(s.to_owned()))?
        } else {
            magnitude
        };

        Ok(Self(cents))
    }

    /// Format as a yuan string with exactly two fractional digits,
    /// sign-preserving, e.g. `-250` -> `"-2.50"`.
    pub fn to_yuan_string(self) -> String {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        format!("{sign}{}.{:02}", abs / 100, abs % 100)
    }

    /// Exact conversion to quota units: `1 cent = 5000 quota`.
    #[inline]
    pub fn to_quota(self) -> Quota {
        Quota(i128::from(self.0) * QUOTA_PER_CENT)
    }

    #[inline]
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    #[inline]
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }

    /// `max(0, self - rhs)`, the "remaining refundable" shape used all over
    /// the quote algorithm.
    #[inline]
    pub fn saturating_refundable_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0).max(0))
    }

    #[inline]
    pub fn is_positive(self) -> bool {
        self.0 > 0
    }
}

/// [`Display`]s the yuan string, e.g. `"10.00"`.
impl Display for Cents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_yuan_string())
    }
}

/// An amount of internal quota credit.
///
/// Stored as [`i128`] because a user's lifetime quota can exceed 2^53 and
/// intermediate cross-products in the quote sort exceed 2^64.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quota(i128);

impl Quota {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn new(quota: i128) -> Self {
        Self(quota)
    }

    #[inline]
    pub const fn as_i128(self) -> i128 {
        self.0
    }

    /// Convert to cents, truncating toward zero: `q / 5000`.
    ///
    /// This is the only rounding operation in the money layer.
    #[inline]
    pub fn to_cents_floor(self) -> Result<Cents, MoneyError> {
        i64::try_from(self.0 / QUOTA_PER_CENT)
            .map(Cents)
            .map_err(|_| MoneyError::OutOfRange(self.0.to_string()))
    }

    #[inline]
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    #[inline]
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }

    /// `max(0, self - rhs)`.
    #[inline]
    pub fn saturating_refundable_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0).max(0))
    }

    #[inline]
    pub fn min(self, rhs: Self) -> Self {
        Self(self.0.min(rhs.0))
    }

    #[inline]
    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }
}

impl Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod test {
    use proptest::{
        arbitrary::any, prop_assert, prop_assert_eq, proptest,
        strategy::Strategy,
    };

    use super::*;

    #[test]
    fn parses_yuan_strings() {
        let ok = [
            ("0", 0),
            ("10", 1000),
            ("10.", 1000),
            ("10.5", 1050),
            ("10.50", 1050),
            ("10.509", 1050), // third digit truncated
            ("10.999", 1099),
            ("0.01", 1),
            ("-3.14", -314),
            ("-0.5", -50),
            ("007", 700),
        ];
        for (s, cents) in ok {
            assert_eq!(Cents::from_yuan_str(s), Ok(Cents::new(cents)), "{s}");
        }

        let bad = ["", "-", ".", "-.5", ".5", "1.2.3", "1e3", " 1", "1 ", "a"];
        for s in bad {
            assert!(Cents::from_yuan_str(s).is_err(), "{s:?} should fail");
        }
    }

    #[test]
    fn formats_yuan_strings() {
        assert_eq!(Cents::new(0).to_yuan_string(), "0.00");
        assert_eq!(Cents::new(1).to_yuan_string(), "0.01");
        assert_eq!(Cents::new(950).to_yuan_string(), "9.50");
        assert_eq!(Cents::new(1000).to_yuan_string(), "10.00");
        assert_eq!(Cents::new(-250).to_yuan_string(), "-2.50");
        assert_eq!(Cents::new(i64::MAX).to_yuan_string().len(), 20);
    }

    /// `format(parse(s)) == canonical(s)` for any `s` with <= 2 fractional
    /// digits.
    #[test]
    fn yuan_string_roundtrips() {
        let yuan_and_frac = (any::<i32>(), 0u8..100).prop_map(|(y, f)| {
            let sign = if y < 0 { "-" } else { "" };
            format!("{sign}{}.{f:02}", y.unsigned_abs())
        });
        proptest!(|(s in yuan_and_frac)| {
            let cents = Cents::from_yuan_str(&s).unwrap();
            prop_assert_eq!(cents.to_yuan_string(), s);
        });
    }

    /// `cents -> quota -> cents` is lossless.
    #[test]
    fn cents_quota_roundtrips() {
        proptest!(|(c in any::<i64>())| {
            let cents = Cents::new(c);
            let roundtrip = cents.to_quota().to_cents_floor().unwrap();
            prop_assert_eq!(cents, roundtrip);
        });
    }

    /// `to_cents_floor` truncates toward zero by at most 4999 quota.
    #[test]
    fn cents_floor_truncates() {
        proptest!(|(q in 0i128..=(i128::from(i64::MAX) * QUOTA_PER_CENT))| {
            let cents = Quota::new(q).to_cents_floor().unwrap();
            let back = cents.to_quota();
            prop_assert!(back.as_i128() <= q);
            prop_assert!(q - back.as_i128() < QUOTA_PER_CENT);
        });
    }
}
