//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during encoding, decoding or transforming values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Failed to encode value to CBOR.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode CBOR bytes.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// A byte transform could not process its input.
    #[error("{algorithm} transform failed: {message}")]
    TransformFailed {
        /// Identifier of the transform algorithm.
        algorithm: String,
        /// Description of the failure.
        message: String,
    },

    /// Unknown compression algorithm identifier.
    #[error("unknown compression algorithm: {0}")]
    UnknownAlgorithm(String),
}

impl CodecError {
    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Create a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Create a transform failed error.
    pub fn transform_failed(algorithm: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransformFailed {
            algorithm: algorithm.into(),
            message: message.into(),
        }
    }
}
