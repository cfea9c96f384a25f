// Base64 helpers for use in `#[serde(with)]`
use serde::{de, Deserialize, Deserializer, Serializer};

/// Decode a base64 string, mapping failures into a parse error
pub fn decode_b64(s: &str) -> Result<Vec<u8>, crate::Error> {
    base64::decode(s.trim()).map_err(|e| crate::Error::Parse(format!("invalid base64: {}", e)))
}

/// Arbitrary bytes as a base64 string
pub mod b64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        decode_b64(&s).map_err(de::Error::custom)
    }
}

/// Optional bytes as a base64 string or null
pub mod b64_bytes_opt {
    use super::*;

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&base64::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            Some(s) => decode_b64(&s).map(Some).map_err(de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Deserialize an `Option` that must be present (possibly `null`).
///
/// Plain `Option` fields silently default to `None` when missing.
pub fn required_option<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer)
}
