//! # Cloudstore Codec
//!
//! Transportable scalar values for cloudstore.
//!
//! This crate provides:
//! - [`Value`], the scalar carried in record fields and entity attributes
//! - [`ScalarKind`], the declared type of an attribute with coercion rules
//! - [`ByteTransform`], a pluggable transform applied to binary attributes
//! - CBOR helpers used by the cache journal and snapshots
//!
//! ## Coercion
//!
//! Values arriving from the remote store are coerced into the declared
//! kind of the attribute. Numeric kinds keep their kind (an integer field
//! never turns into a double), dates, binary and strings pass through
//! unchanged, and anything unrecognized yields `None` so the caller can
//! substitute the attribute's declared default.
//!
//! ```
//! use cloudstore_codec::{ScalarKind, Value};
//!
//! let coerced = ScalarKind::Integer32.coerce(&Value::Double(12.9));
//! assert_eq!(coerced, Some(Value::Integer(12)));
//!
//! assert_eq!(ScalarKind::Date.coerce(&Value::Text("x".into())), None);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod error;
mod kind;
mod transform;
mod value;

pub use cbor::{from_cbor, to_cbor};
pub use error::{CodecError, CodecResult};
pub use kind::ScalarKind;
pub use transform::{ByteTransform, CompressionAlgorithm, IdentityTransform};
pub use value::Value;

/// Trait for types that can be encoded to CBOR.
pub trait Encode {
    /// Encode this value to CBOR bytes.
    fn encode(&self) -> CodecResult<Vec<u8>>;
}

/// Trait for types that can be decoded from CBOR.
pub trait Decode: Sized {
    /// Decode this value from CBOR bytes.
    fn decode(bytes: &[u8]) -> CodecResult<Self>;
}

impl<T: serde::Serialize> Encode for T {
    fn encode(&self) -> CodecResult<Vec<u8>> {
        to_cbor(self)
    }
}

impl<T: serde::de::DeserializeOwned> Decode for T {
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}
