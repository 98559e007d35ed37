//! Codec trait and implementations for serializing/deserializing payloads.
//!
//! A "codec" (coder/decoder) converts between Rust types and the raw bytes
//! that travel as a message body through the broker. The pub/sub engine
//! doesn't care how payloads are serialized; it only needs something that
//! implements the [`Codec`] trait. This is the "strategy pattern": one
//! interface, swappable implementations, chosen per subscription.
//!
//! Two implementations ship with the crate:
//!
//! - [`JsonCodec`]: human-readable, interoperable, easy to inspect in the
//!   broker's management UI.
//! - [`BincodeCodec`]: compact binary, for high-volume traffic between
//!   Rust processes that share the payload types.

use serde::{Serialize, de::DeserializeOwned};

use crate::CodecError;

/// Content type tag attached to JSON-encoded messages.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Content type tag attached to bincode-encoded messages.
pub const BINCODE_CONTENT_TYPE: &str = "application/x-bincode";

/// A codec that can encode Rust types to bytes and decode bytes back.
///
/// ## Trait bounds explained
///
/// - `Send + Sync` → the codec is shared by the delivery-loop task and
///   whoever publishes, possibly on different runtime threads.
/// - `'static` → the codec owns everything it needs, so it can be moved
///   into a long-lived subscription task.
///
/// ## Generic methods
///
/// `encode` and `decode` are generic over the payload type, so one codec
/// value serves every message type in the system. `DeserializeOwned`
/// means the decoded value doesn't borrow from the delivery body, which
/// lets the engine settle (ack/nack) the delivery after decoding.
pub trait Codec: Send + Sync + 'static {
    /// The MIME-style tag published in the message's `content-type`
    /// property.
    fn content_type(&self) -> &'static str;

    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns [`CodecError::Encode`] if the value can't be represented
    /// in this format.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns [`CodecError::Decode`] if the bytes are malformed,
    /// truncated, or don't match the expected type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// ## Example
///
/// ```rust
/// use peril_codec::{Codec, JsonCodec};
///
/// let codec = JsonCodec;
/// let bytes = codec.encode(&vec![1u32, 2, 3]).unwrap();
/// assert_eq!(bytes, b"[1,2,3]");
///
/// let decoded: Vec<u32> = codec.decode(&bytes).unwrap();
/// assert_eq!(decoded, vec![1, 2, 3]);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::encode("JSON", e))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::decode("JSON", e))
    }
}

// ---------------------------------------------------------------------------
// BincodeCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses bincode's compact binary encoding.
///
/// Bincode is not self-describing: both sides must agree on the exact
/// payload type. Types relying on `#[serde(untagged)]`, `#[serde(flatten)]`
/// or other `deserialize_any` features can't be decoded with it.
#[cfg(feature = "bincode")]
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

#[cfg(feature = "bincode")]
impl Codec for BincodeCodec {
    fn content_type(&self) -> &'static str {
        BINCODE_CONTENT_TYPE
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(value).map_err(|e| CodecError::encode("bincode", e))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        bincode::deserialize(data).map_err(|e| CodecError::decode("bincode", e))
    }
}
