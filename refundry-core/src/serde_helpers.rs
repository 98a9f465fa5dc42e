//! Serde helpers shared across wire types.

/// Deserialize an optional field that clients send either as a JSON string
/// or as a JSON number, e.g. `"fee_percent": 5` vs `"fee_percent": "5"`.
///
/// Numbers are passed through via their canonical display form so a single
/// string parser downstream sees both spellings.
pub mod opt_string_or_number {
    use std::fmt;

    use serde::de::{self, Deserializer, Visitor};

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct OptStringOrNumber;

        impl<'de> Visitor<'de> for OptStringOrNumber {
            type Value = Option<String>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string, a number, or null")
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }

            fn visit_some<D: Deserializer<'de>>(
                self,
                deserializer: D,
            ) -> Result<Self::Value, D::Error> {
                deserializer.deserialize_any(StringOrNumber).map(Some)
            }
        }

        struct StringOrNumber;

        impl Visitor<'_> for StringOrNumber {
            type Value = String;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string or a number")
            }

            fn visit_str<E: de::Error>(
                self,
                v: &str,
            ) -> Result<Self::Value, E> {
                Ok(v.to_owned())
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(v.to_string())
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(v.to_string())
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                // Human-entered decimals like 2.5; value math never touches
                // the float, it is re-parsed by the exact string parsers.
                Ok(v.to_string())
            }
        }

        deserializer.deserialize_option(OptStringOrNumber)
    }
}

#[cfg(test)]
mod test {
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Body {
        #[serde(default, with = "super::opt_string_or_number")]
        fee_percent: Option<String>,
    }

    #[test]
    fn accepts_strings_numbers_and_null() {
        let de = |s: &str| serde_json::from_str::<Body>(s).unwrap().fee_percent;
        assert_eq!(de(r#"{"fee_percent": "5"}"#), Some("5".to_owned()));
        assert_eq!(de(r#"{"fee_percent": 5}"#), Some("5".to_owned()));
        assert_eq!(de(r#"{"fee_percent": 2.5}"#), Some("2.5".to_owned()));
        assert_eq!(de(r#"{"fee_percent": null}"#), None);
        assert_eq!(de(r#"{}"#), None);
    }
}
