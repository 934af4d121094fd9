//! Decoding helpers for proposer-submitted data.
//!
//! The lenient helpers never fail: a value of the wrong shape decodes to its empty form so
//! that validation can reject the one entry carrying it instead of the whole request.
pub(crate) use ethereum_consensus::serde::as_str;
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::Value;

/// Byte strings as `0x`-prefixed hex; anything that is not valid hex reads as no bytes.
pub(crate) mod as_hex {
    use super::*;
    use serde::Serializer;

    pub fn serialize<S, T>(bytes: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        let encoding = format!("0x{}", hex::encode(bytes.as_ref()));
        serializer.serialize_str(&encoding)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = match Value::deserialize(deserializer)? {
            Value::String(input) => {
                let input = input.strip_prefix("0x").unwrap_or(&input);
                hex::decode(input).unwrap_or_default()
            }
            _ => Vec::new(),
        };
        Ok(bytes)
    }
}

/// Integers quoted as strings; bare JSON numbers are accepted too.
pub(crate) mod as_lenient_str {
    use super::*;
    use serde::Serializer;
    use std::{fmt::Display, str::FromStr};

    pub fn serialize<S, T>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Display,
    {
        match value {
            Some(value) => serializer.collect_str(value),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: FromStr,
    {
        let value = match Value::deserialize(deserializer)? {
            Value::String(input) => input.parse().ok(),
            Value::Number(number) => number.to_string().parse().ok(),
            _ => None,
        };
        Ok(value)
    }
}

/// Any value that does not decode as `T` reads as `None`.
pub(crate) fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}
