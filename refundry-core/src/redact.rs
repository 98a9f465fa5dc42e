//! Redaction for the public activity view.
//!
//! The public projection of the refund log must never leak trade numbers,
//! customer handles, charge / payment-intent ids, or idempotency keys. The
//! walker applies three rules to an arbitrary JSON tree:
//!
//! 1. any value under a key in the sensitive set becomes `"[redacted]"`;
//! 2. string values anywhere are scrubbed of `ch_…` / `pi_…` / `cus_…`
//!    tokens, which become `<prefix>_[redacted]`;
//! 3. arrays longer than [`MAX_ARRAY_LEN`] collapse to
//!    `{"count": n, "truncated": true}`.

use serde_json::{json, Map, Value};

pub const REDACTED: &str = "[redacted]";
/// Arrays longer than this are collapsed to a count.
pub const MAX_ARRAY_LEN: usize = 50;

/// Keys whose values are always replaced wholesale.
const SENSITIVE_KEYS: &[&str] = &[
    "card_charge_id",
    "card_customer_id",
    "card_payment_intent",
    "charge",
    "charge_id",
    "customer",
    "customer_id",
    "out_refund_no",
    "out_trade_no",
    "payment_intent",
    "payment_intent_id",
    "provider_refund_no",
    "topup_trade_no",
    "trade_no",
];

/// Card-processor id prefixes scrubbed out of free-form strings.
const SCRUBBED_PREFIXES: &[&str] = &["cus_", "ch_", "pi_"];

/// Redact a JSON tree for public consumption.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, child) in map {
                if SENSITIVE_KEYS.contains(&key.as_str()) {
                    // Preserve nulls so "field absent" stays observable.
                    let redacted = match child {
                        Value::Null => Value::Null,
                        _ => Value::String(REDACTED.to_owned()),
                    };
                    out.insert(key.clone(), redacted);
                } else {
                    out.insert(key.clone(), redact_value(child));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) =>
            if items.len() > MAX_ARRAY_LEN {
                json!({ "count": items.len(), "truncated": true })
            } else {
                Value::Array(items.iter().map(redact_value).collect())
            },
        Value::String(s) => Value::String(scrub_string(s)),
        other => other.clone(),
    }
}

/// Replace every `<prefix><ident chars>` token with `<prefix>[redacted]`.
/// A prefix match only counts at the start of a token (start of string or
/// after a non-identifier byte), so e.g. "touch_me" is untouched.
fn scrub_string(s: &str) -> String {
    let is_ident = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    'outer: while i < bytes.len() {
        let at_token_start = i == 0 || !is_ident(bytes[i - 1]);
        if at_token_start {
            for prefix in SCRUBBED_PREFIXES {
                let p = prefix.as_bytes();
                let has_id_char = s.len() >= i + p.len() + 1
                    && bytes[i..].starts_with(p)
                    && is_ident(bytes[i + p.len()]);
                if has_id_char {
                    out.push_str(prefix);
                    out.push_str(REDACTED);
                    i += p.len();
                    while i < bytes.len() && is_ident(bytes[i]) {
                        i += 1;
                    }
                    continue 'outer;
                }
            }
        }
        // `s` is valid UTF-8; copy whole code points.
        let ch_len = utf8_len(bytes[i]);
        out.push_str(&s[i..i + ch_len]);
        i += ch_len;
    }
    out
}

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        b if b < 0x80 => 1,
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        _ => 2,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sensitive_keys_are_replaced() {
        let input = json!({
            "trade_no": "T20240101",
            "nested": { "out_refund_no": "card_userrefund_1_2_ch_3_400" },
            "card_charge_id": null,
            "refund_money": "9.50",
        });
        let out = redact_value(&input);
        assert_eq!(out["trade_no"], REDACTED);
        assert_eq!(out["nested"]["out_refund_no"], REDACTED);
        assert_eq!(out["card_charge_id"], Value::Null);
        assert_eq!(out["refund_money"], "9.50");
    }

    #[test]
    fn strings_are_scrubbed() {
        let scrub = |s: &str| scrub_string(s);
        assert_eq!(scrub("ch_1AbC9z"), "ch_[redacted]");
        assert_eq!(scrub("refund for pi_3XyZ done"), "refund for pi_[redacted] done");
        assert_eq!(
            scrub("cus_A1 paid via ch_B2"),
            "cus_[redacted] paid via ch_[redacted]",
        );
        // Only token starts count.
        assert_eq!(scrub("touch_me"), "touch_me");
        assert_eq!(scrub("epoch_1"), "epoch_1");
        // Bare prefixes with no id chars are left alone.
        assert_eq!(scrub("ch_"), "ch_");
        assert_eq!(scrub("the word chapter"), "the word chapter");
    }

    #[test]
    fn long_arrays_collapse() {
        let short = Value::Array(vec![json!(1); MAX_ARRAY_LEN]);
        let long = Value::Array(vec![json!(1); MAX_ARRAY_LEN + 1]);
        assert_eq!(redact_value(&short), short);
        assert_eq!(
            redact_value(&long),
            json!({ "count": 51, "truncated": true }),
        );
    }

    #[test]
    fn scrubbing_reaches_into_arrays_and_objects() {
        let input = json!({
            "raw_response": {
                "refund": { "charge": "ch_123", "memo": "see ch_123" },
                "items": ["pi_9", "ok"],
            }
        });
        let out = redact_value(&input);
        assert_eq!(out["raw_response"]["refund"]["charge"], REDACTED);
        assert_eq!(out["raw_response"]["refund"]["memo"], "see ch_[redacted]");
        assert_eq!(out["raw_response"]["items"][0], "pi_[redacted]");
        assert_eq!(out["raw_response"]["items"][1], "ok");
    }
}
