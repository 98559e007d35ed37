//! Message codecs for Peril.
//!
//! This crate defines how typed payloads become message bodies:
//!
//! - **Codec** ([`Codec`] trait, [`JsonCodec`], [`BincodeCodec`]): how
//!   values are converted to/from bytes, plus the content-type tag that
//!   is published alongside them.
//! - **Errors** ([`CodecError`]): what can go wrong while encoding or
//!   decoding.
//!
//! # Architecture
//!
//! The codec layer sits between the broker port (raw bodies) and the
//! pub/sub engine (typed handlers). It knows nothing about exchanges,
//! queues or acknowledgments.
//!
//! ```text
//! Broker (bytes) → Codec (T) → Handler (AckType)
//! ```
//!
//! # Feature Flags
//!
//! - `json` (default): [`JsonCodec`] via `serde_json`
//! - `bincode` (default): [`BincodeCodec`] via `bincode`

mod codec;
mod error;

pub use codec::{BINCODE_CONTENT_TYPE, Codec, JSON_CONTENT_TYPE};
#[cfg(feature = "bincode")]
pub use codec::BincodeCodec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::{BoxError, CodecError};
