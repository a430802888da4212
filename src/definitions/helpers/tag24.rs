//! Support for embedded
//! [CBOR Data Items](https://www.ietf.org/rfc/rfc8949.html#name-encoded-cbor-data-item),
//! also known as a tagged data item with tag number 24.

use ciborium::Value;
use coset::{AsCborValue, CborSerializable, CoseError};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// A wrapper for a struct that is to be encoded as a CBOR tagged item, with tag number 24.
///
/// If this struct is created through deserializing CBOR, then the original byte representation is
/// preserved for future serializing. Transcripts hash these bytes, so they are never re-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag24<T> {
    inner: T,
    pub inner_bytes: Vec<u8>,
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Expected a CBOR byte string, received: '{0:?}'")]
    InvalidTag24(Box<Value>),
    #[error("Expected a CBOR tagged data item with tag number 24, received: '{0:?}'")]
    NotATag24(Value),
    #[error("Unable to encode value as CBOR: {0}")]
    UnableToEncode(CoseError),
    #[error("Unable to decode bytes to inner type: {0}")]
    UnableToDecode(CoseError),
}

impl<T> Tag24<T> {
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: CborSerializable + Clone> Tag24<T> {
    pub fn new(inner: T) -> Result<Tag24<T>> {
        let inner_bytes = inner.clone().to_vec().map_err(Error::UnableToEncode)?;
        Ok(Self { inner, inner_bytes })
    }
}

impl<T: CborSerializable> Tag24<T> {
    pub fn from_bytes(inner_bytes: Vec<u8>) -> coset::Result<Tag24<T>> {
        let inner = T::from_slice(&inner_bytes)?;
        Ok(Self { inner, inner_bytes })
    }
}

/// Wraps already-encoded bytes as `#6.24(bstr)`.
pub fn tagged_bytes(inner_bytes: Vec<u8>) -> Value {
    Value::Tag(24, Box::new(Value::Bytes(inner_bytes)))
}

/// Unwraps `#6.24(bstr)` without decoding the embedded item.
pub fn untag_bytes(value: Value) -> Result<Vec<u8>> {
    match value {
        Value::Tag(24, inner_value) => match *inner_value {
            Value::Bytes(inner_bytes) => Ok(inner_bytes),
            other => Err(Error::InvalidTag24(Box::new(other))),
        },
        _ => Err(Error::NotATag24(value)),
    }
}

impl<T: CborSerializable> TryFrom<Value> for Tag24<T> {
    type Error = Error;

    fn try_from(v: Value) -> Result<Tag24<T>> {
        let inner_bytes = untag_bytes(v)?;
        let inner = T::from_slice(&inner_bytes).map_err(Error::UnableToDecode)?;
        Ok(Tag24 { inner, inner_bytes })
    }
}

impl<T> From<Tag24<T>> for Value {
    fn from(Tag24 { inner_bytes, .. }: Tag24<T>) -> Value {
        tagged_bytes(inner_bytes)
    }
}

impl<T> AsRef<T> for Tag24<T> {
    fn as_ref(&self) -> &T {
        &self.inner
    }
}

impl<T: CborSerializable> CborSerializable for Tag24<T> {}
impl<T: CborSerializable> AsCborValue for Tag24<T> {
    fn from_cbor_value(value: Value) -> coset::Result<Self> {
        Tag24::try_from(value).map_err(|e| match e {
            Error::UnableToDecode(e) | Error::UnableToEncode(e) => e,
            Error::NotATag24(_) => CoseError::UnexpectedItem("untagged item", "tag 24"),
            Error::InvalidTag24(_) => CoseError::UnexpectedItem("non-bstr", "tag 24 bstr"),
        })
    }

    fn to_cbor_value(self) -> coset::Result<Value> {
        Ok(self.into())
    }
}

impl<T> Serialize for Tag24<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        tagged_bytes(self.inner_bytes.clone()).serialize(serializer)
    }
}

impl<'de, T: CborSerializable> Deserialize<'de> for Tag24<T> {
    fn deserialize<D>(d: D) -> std::result::Result<Tag24<T>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(d)?;
        Tag24::try_from(value).map_err(de::Error::custom)
    }
}
