//! Error types for the codec layer.
//!
//! Each crate in Peril defines its own error enum. A `CodecError` always
//! means the payload couldn't be turned into bytes (or back), never that
//! the broker or the network misbehaved.

/// Boxed source error, so one enum covers every codec backend.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while encoding or decoding a payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization failed (turning a Rust value into bytes).
    ///
    /// `format` names the codec that failed (e.g. `"JSON"`), so a log
    /// line reads "couldn't encode message into JSON: key must be a string".
    #[error("couldn't encode message into {format}: {source}")]
    Encode {
        format: &'static str,
        #[source]
        source: BoxError,
    },

    /// Deserialization failed (turning bytes into a Rust value).
    ///
    /// Common causes: malformed or truncated bodies, missing fields,
    /// or a producer that published a different type.
    #[error("couldn't decode {format} message: {source}")]
    Decode {
        format: &'static str,
        #[source]
        source: BoxError,
    },
}

impl CodecError {
    /// Wraps a backend serialization error.
    pub fn encode(format: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Encode {
            format,
            source: source.into(),
        }
    }

    /// Wraps a backend deserialization error.
    pub fn decode(format: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Decode {
            format,
            source: source.into(),
        }
    }

    /// Returns the name of the codec that produced this error.
    pub fn format(&self) -> &'static str {
        match self {
            Self::Encode { format, .. } | Self::Decode { format, .. } => format,
        }
    }
}
