//! Item codecs.
//!
//! A [`Codec`] turns an opaque queue item into bytes and back. The queue
//! stores every encoded item as a base64 string in a Redis list, so codecs
//! never need to worry about text safety themselves.

use std::fmt;
use std::marker::PhantomData;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SerializationError;

/// Encode/decode capability for queue items.
pub trait Codec: Send + Sync + 'static {
    /// The item type carried by blocks.
    type Item: Send + Sync + 'static;

    fn encode(&self, item: &Self::Item) -> Result<Vec<u8>, SerializationError>;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Item, SerializationError>;
}

/// Encodes an item and wraps the bytes as base64 text.
pub fn encode_to_string<C: Codec>(codec: &C, item: &C::Item) -> Result<String, SerializationError> {
    Ok(STANDARD.encode(codec.encode(item)?))
}

/// Reverses [`encode_to_string`].
pub fn decode_from_string<C: Codec>(codec: &C, text: &str) -> Result<C::Item, SerializationError> {
    let bytes = STANDARD.decode(text)?;
    codec.decode(&bytes)
}

/// Self-describing JSON codec for any serde type.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<T> Codec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Item = T;

    fn encode(&self, item: &T) -> Result<Vec<u8>, SerializationError> {
        Ok(serde_json::to_vec(item)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Task {
        id: u64,
        name: String,
        tags: Vec<String>,
        payload: Option<serde_json::Value>,
    }

    #[test]
    fn test_struct_survives_string_encoding() {
        let codec = JsonCodec::<Task>::new();
        let task = Task {
            id: 42,
            name: "résumé \"quoted\"\nline".to_string(),
            tags: vec!["a".to_string(), String::new()],
            payload: Some(serde_json::json!({"nested": [1, 2, 3]})),
        };

        let encoded = encode_to_string(&codec, &task).expect("encode");
        assert!(encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=')));

        let decoded = decode_from_string(&codec, &encoded).expect("decode");
        assert_eq!(decoded, task);
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let codec = JsonCodec::<String>::new();
        let err = decode_from_string(&codec, "not base64!!").unwrap_err();
        assert!(matches!(err, SerializationError::Base64(_)));
    }

    #[test]
    fn test_type_mismatch_is_rejected() {
        let encoded = encode_to_string(&JsonCodec::<String>::new(), &"text".to_string())
            .expect("encode");
        let err = decode_from_string(&JsonCodec::<u64>::new(), &encoded).unwrap_err();
        assert!(matches!(err, SerializationError::Json(_)));
    }

    struct FailingCodec;

    impl Codec for FailingCodec {
        type Item = u8;

        fn encode(&self, _item: &u8) -> Result<Vec<u8>, SerializationError> {
            Err(SerializationError::Codec("cannot encode".to_string()))
        }

        fn decode(&self, bytes: &[u8]) -> Result<u8, SerializationError> {
            bytes
                .first()
                .copied()
                .ok_or_else(|| SerializationError::Codec("empty".to_string()))
        }
    }

    #[test]
    fn test_custom_codec_errors_propagate() {
        let err = encode_to_string(&FailingCodec, &1).unwrap_err();
        assert!(err.to_string().contains("cannot encode"));

        let decoded = decode_from_string(&FailingCodec, &STANDARD.encode([7u8])).expect("decode");
        assert_eq!(decoded, 7);
    }
}
