//! Key and value codecs
//!
//! Keys become canonical strings, values become bytes for the remote tier.
//! Remote payloads are wrapped in a one-byte envelope so a cached absence
//! survives the trip through the remote store.

use std::fmt::Display;
use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};

use crate::cache::CacheValue;
use crate::error::{CacheError, Result};

const TAG_NULL: u8 = 0x00;
const TAG_VALUE: u8 = 0x01;

/// Converts a caller key into the canonical string used by both tiers.
pub trait KeyCodec<K: ?Sized>: Send + Sync {
    fn convert(&self, key: &K) -> String;
}

impl<K: ?Sized, F> KeyCodec<K> for F
where
    F: Fn(&K) -> String + Send + Sync,
{
    fn convert(&self, key: &K) -> String {
        self(key)
    }
}

/// Uses the key's `Display` output.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisplayKeyCodec;

impl<K: Display + ?Sized> KeyCodec<K> for DisplayKeyCodec {
    fn convert(&self, key: &K) -> String {
        key.to_string()
    }
}

/// Converts values to and from bytes.
pub trait ValueCodec<V>: Send + Sync {
    fn encode(&self, value: &V) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<V>;
}

/// JSON via serde_json.
pub struct JsonCodec<V>(PhantomData<fn() -> V>);

impl<V> JsonCodec<V> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<V> Default for JsonCodec<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> ValueCodec<V> for JsonCodec<V>
where
    V: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &V) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<V> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Passes raw bytes through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl ValueCodec<Vec<u8>> for BytesCodec {
    fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Encodes a cached value into its remote envelope.
pub fn encode_entry<V>(codec: &dyn ValueCodec<V>, value: &CacheValue<V>) -> Result<Vec<u8>> {
    match value {
        CacheValue::Null => Ok(vec![TAG_NULL]),
        CacheValue::Present(v) => {
            let payload = codec.encode(v)?;
            let mut bytes = Vec::with_capacity(payload.len() + 1);
            bytes.push(TAG_VALUE);
            bytes.extend_from_slice(&payload);
            Ok(bytes)
        }
    }
}

/// Decodes a remote envelope.
pub fn decode_entry<V>(codec: &dyn ValueCodec<V>, bytes: &[u8]) -> Result<CacheValue<V>> {
    match bytes.split_first() {
        Some((&TAG_NULL, [])) => Ok(CacheValue::Null),
        Some((&TAG_VALUE, payload)) => Ok(CacheValue::Present(codec.decode(payload)?)),
        Some((tag, _)) => Err(CacheError::Codec(format!("unknown envelope tag {tag:#04x}"))),
        None => Err(CacheError::Codec("empty remote payload".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
        total: f64,
    }

    #[test]
    fn test_display_key_codec() {
        assert_eq!(KeyCodec::<u64>::convert(&DisplayKeyCodec, &42), "42");
        assert_eq!(KeyCodec::<str>::convert(&DisplayKeyCodec, "abc"), "abc");
    }

    #[test]
    fn test_closure_key_codec() {
        let codec = |key: &(u32, u32)| format!("{}-{}", key.0, key.1);
        assert_eq!(codec.convert(&(1, 2)), "1-2");
    }

    #[test]
    fn test_json_envelope() {
        let codec = JsonCodec::<Order>::new();
        let order = Order { id: 7, total: 12.5 };

        let bytes = encode_entry(&codec, &CacheValue::Present(order.clone())).unwrap();
        assert_eq!(bytes[0], TAG_VALUE);
        assert_eq!(decode_entry(&codec, &bytes).unwrap(), CacheValue::Present(order));
    }

    #[test]
    fn test_null_envelope() {
        let codec = BytesCodec;
        let bytes = encode_entry(&codec, &CacheValue::Null).unwrap();
        assert_eq!(bytes, vec![TAG_NULL]);
        assert_eq!(decode_entry(&codec, &bytes).unwrap(), CacheValue::Null);
    }

    #[test]
    fn test_malformed_envelopes() {
        let codec = JsonCodec::<Order>::new();
        assert!(matches!(decode_entry(&codec, &[]), Err(CacheError::Codec(_))));
        assert!(matches!(decode_entry(&codec, &[0x7f, 1]), Err(CacheError::Codec(_))));
        assert!(matches!(decode_entry(&codec, &[TAG_VALUE, b'{']), Err(CacheError::Codec(_))));
        assert!(matches!(decode_entry(&codec, &[TAG_NULL, 1]), Err(CacheError::Codec(_))));
    }
}
