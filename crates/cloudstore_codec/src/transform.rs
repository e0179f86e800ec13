//! Pluggable byte transforms for binary attributes.

use crate::error::{CodecError, CodecResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable identifier of a byte transform algorithm.
///
/// The identifier is part of the configuration surface, so replicas that
/// share a zone must agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    /// Bytes are stored as-is.
    #[default]
    None,
    /// zlib stream.
    Zlib,
    /// LZ4 block.
    Lz4,
    /// LZMA stream.
    Lzma,
    /// LZFSE stream.
    Lzfse,
}

impl CompressionAlgorithm {
    /// Returns the stable textual identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Lzma => "lzma",
            CompressionAlgorithm::Lzfse => "lzfse",
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CompressionAlgorithm::None),
            "zlib" => Ok(CompressionAlgorithm::Zlib),
            "lz4" => Ok(CompressionAlgorithm::Lz4),
            "lzma" => Ok(CompressionAlgorithm::Lzma),
            "lzfse" => Ok(CompressionAlgorithm::Lzfse),
            other => Err(CodecError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// A reversible transform applied to binary attribute values before they
/// are written into a remote record.
pub trait ByteTransform: Send + Sync + fmt::Debug {
    /// Identifier of this transform.
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Transforms local bytes into their remote form.
    fn encode(&self, data: &[u8]) -> CodecResult<Vec<u8>>;

    /// Reverses [`encode`](Self::encode).
    fn decode(&self, data: &[u8]) -> CodecResult<Vec<u8>>;

    /// Decodes `data`, returning it unchanged when it is not in the
    /// transform's format (for example written by an older replica).
    fn decode_or_raw(&self, data: &[u8]) -> Vec<u8> {
        self.decode(data).unwrap_or_else(|_| data.to_vec())
    }
}

/// Transform that leaves bytes untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

impl ByteTransform for IdentityTransform {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn encode(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decode(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Prefixes a marker byte; rejects input without it.
    #[derive(Debug)]
    struct Marked;

    impl ByteTransform for Marked {
        fn algorithm(&self) -> CompressionAlgorithm {
            CompressionAlgorithm::Lz4
        }

        fn encode(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
            let mut out = vec![0xAB];
            out.extend_from_slice(data);
            Ok(out)
        }

        fn decode(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
            match data.split_first() {
                Some((&0xAB, rest)) => Ok(rest.to_vec()),
                _ => Err(CodecError::transform_failed("lz4", "missing marker")),
            }
        }
    }

    #[test]
    fn algorithm_identifiers_are_stable() {
        for algo in [
            CompressionAlgorithm::None,
            CompressionAlgorithm::Zlib,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Lzma,
            CompressionAlgorithm::Lzfse,
        ] {
            assert_eq!(algo.as_str().parse::<CompressionAlgorithm>().unwrap(), algo);
        }
        assert!("brotli".parse::<CompressionAlgorithm>().is_err());
        assert_eq!("ZLIB".parse::<CompressionAlgorithm>().unwrap(), CompressionAlgorithm::Zlib);
    }

    #[test]
    fn identity_is_noop() {
        let t = IdentityTransform;
        assert_eq!(t.encode(b"abc").unwrap(), b"abc");
        assert_eq!(t.decode(b"abc").unwrap(), b"abc");
        assert_eq!(t.algorithm(), CompressionAlgorithm::None);
    }

    #[test]
    fn decode_falls_back_to_raw() {
        let t = Marked;
        let encoded = t.encode(b"xyz").unwrap();
        assert_eq!(t.decode_or_raw(&encoded), b"xyz");
        // Bytes written without the transform come back unchanged.
        assert_eq!(t.decode_or_raw(b"plain"), b"plain");
    }
}
