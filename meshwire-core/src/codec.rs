//! Pluggable payload serialization.
//!
//! The transport treats payloads as opaque bytes. The [`MessageCodec`] trait is
//! the seam where a payload format is plugged in; [`JsonCodec`] is the default
//! and is used for the error payloads of failed response streams.
//!
//! # Example
//!
//! ```rust
//! use meshwire_core::{JsonCodec, MessageCodec};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Quote {
//!     ticker: String,
//!     price: u32,
//! }
//!
//! let codec = JsonCodec;
//! let quote = Quote { ticker: "ACME".to_string(), price: 42 };
//!
//! let bytes = codec.encode(&quote).expect("encode");
//! let decoded: Quote = codec.decode(&bytes).expect("decode");
//! assert_eq!(quote, decoded);
//! ```

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Failed to encode a value to bytes.
    #[error("encode error: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// Failed to decode bytes to a value.
    #[error("decode error: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The message has no payload to decode.
    #[error("message has no payload")]
    MissingPayload,
}

/// Pluggable payload serialization format.
///
/// `Clone + Send + Sync + 'static` so a codec can be shared by the stream
/// processors across tasks.
pub trait MessageCodec: Clone + Send + Sync + 'static {
    /// Encode a serializable value to bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json.
#[derive(Clone, Default, Debug, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Greeting {
        name: String,
        times: u32,
    }

    #[test]
    fn test_json_codec_struct() {
        let codec = JsonCodec;
        let value = Greeting {
            name: "joe".to_string(),
            times: 2,
        };
        let bytes = codec.encode(&value).expect("encode should succeed");
        assert_eq!(&bytes, br#"{"name":"joe","times":2}"#);
        let decoded: Greeting = codec.decode(&bytes).expect("decode should succeed");
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_json_codec_decode_error() {
        let codec = JsonCodec;
        let result: Result<Greeting, _> = codec.decode(b"not json");
        let err = result.expect_err("garbage should not decode");
        assert!(matches!(err, CodecError::Decode(_)));
        assert!(err.to_string().starts_with("decode error:"));
    }
}
