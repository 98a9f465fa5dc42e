//! Operator fee parsing.
//!
//! Operators may retain a percentage of a refund as a handling fee. The fee
//! arrives as a human-entered percent string (`"5"`, `"2.5"`, `"0.25"`) and
//! is converted to integer basis points so all downstream math stays exact.

use crate::money::Cents;

/// The default fee when the operator does not supply one: 5% = 500 bps.
pub const DEFAULT_FEE_BPS: u32 = 500;
/// 100% in basis points.
pub const MAX_FEE_BPS: u32 = 10_000;

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("invalid fee percent: {0:?}")]
pub struct InvalidFeePercent(pub String);

/// Parse an optional fee percent string into basis points.
///
/// Accepts `0..=100` with at most two decimal places. `None` yields
/// [`DEFAULT_FEE_BPS`].
pub fn parse_fee_percent(
    fee_percent: Option<&str>,
) -> Result<u32, InvalidFeePercent> {
    let s = match fee_percent {
        Some(s) => s,
        None => return Ok(DEFAULT_FEE_BPS),
    };
    let invalid = || InvalidFeePercent(s.to_owned());

    let (int_part, frac_part) = match s.split_once('.') {
        Some((int_part, frac_part)) => (int_part, frac_part),
        None => (s, ""),
    };

    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    // More than two decimals is rejected, not truncated: a fee like "2.505"
    // is more likely a typo than an intent.
    if frac_part.len() > 2 || !frac_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let whole = int_part.parse::<u32>().map_err(|_| invalid())?;
    let mut frac = frac_part.parse::<u32>().unwrap_or(0);
    if frac_part.len() == 1 {
        frac *= 10;
    }

    let bps = whole
        .checked_mul(100)
        .and_then(|b| b.checked_add(frac))
        .ok_or_else(invalid)?;
    if bps > MAX_FEE_BPS {
        return Err(invalid());
    }
    Ok(bps)
}

/// `gross * fee_bps / 10000`, truncating. Exact in `i128`.
pub fn fee_cents(gross: Cents, fee_bps: u32) -> Cents {
    let fee = i128::from(gross.as_i64()) * i128::from(fee_bps)
        / i128::from(MAX_FEE_BPS);
    // `fee` is bounded by `gross`, which already fit in an i64.
    Cents::new(fee as i64)
}

#[cfg(test)]
mod test {
    use proptest::{prop_assert, prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn parses_fee_percents() {
        assert_eq!(parse_fee_percent(None), Ok(500));
        assert_eq!(parse_fee_percent(Some("0")), Ok(0));
        assert_eq!(parse_fee_percent(Some("5")), Ok(500));
        assert_eq!(parse_fee_percent(Some("2.5")), Ok(250));
        assert_eq!(parse_fee_percent(Some("0.25")), Ok(25));
        assert_eq!(parse_fee_percent(Some("100")), Ok(10_000));
        assert_eq!(parse_fee_percent(Some("100.00")), Ok(10_000));

        for bad in ["", ".", "-1", "100.01", "101", "2.505", "5%", "a", "1e1"]
        {
            assert!(parse_fee_percent(Some(bad)).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn fee_never_exceeds_gross() {
        proptest!(|(gross in 0i64..=i64::MAX, bps in 0u32..=MAX_FEE_BPS)| {
            let fee = fee_cents(Cents::new(gross), bps);
            prop_assert!(fee.as_i64() >= 0);
            prop_assert!(fee.as_i64() <= gross);
            if bps == MAX_FEE_BPS {
                prop_assert_eq!(fee.as_i64(), gross);
            }
        });
    }
}
