use ciborium::Value;
use coset::{cbor, CoseError, EndOfFile};
use serde::{de, Serialize};
use std::io::Cursor;
use thiserror::Error;

/// Nesting limit used when measuring a data item still arriving on a stream.
const MAX_NESTING: usize = 64;

#[derive(Debug, Error)]
pub enum CborError {
    /// CBOR decoding failure.
    #[error("CBOR decoding failure: {0}")]
    DecodeFailed(cbor::de::Error<EndOfFile>),
    /// Duplicate map key detected.
    #[error("duplicate map key")]
    DuplicateMapKey,
    /// CBOR encoding failure.
    #[error("CBOR encoding failure")]
    EncodeFailed,
    /// CBOR input had extra data.
    #[error("extraneous data")]
    ExtraneousData,
    /// Integer value on the wire is outside the range of integers representable in this crate.
    #[error("integer value out of range")]
    OutOfRangeIntegerValue,
    /// Unexpected CBOR item encountered (got, want).
    #[error("unexpected item: {0}, want {1}")]
    UnexpectedItem(&'static str, &'static str),
    /// Unrecognized value in IANA-controlled range (with no private range).
    #[error("unregistered IANA value")]
    UnregisteredIanaValue,
    /// Unrecognized value in neither IANA-controlled range nor private range.
    #[error("unregistered non-private IANA value")]
    UnregisteredIanaNonPrivateValue,
    /// Indefinite-length items can't be delimited on a byte stream.
    #[error("indefinite-length items are not supported")]
    IndefiniteLength,
    #[error("data item nested too deeply")]
    NestingTooDeep,
}

impl From<CoseError> for CborError {
    fn from(e: CoseError) -> Self {
        match e {
            CoseError::DecodeFailed(e) => CborError::DecodeFailed(e),
            CoseError::DuplicateMapKey => CborError::DuplicateMapKey,
            CoseError::EncodeFailed => CborError::EncodeFailed,
            CoseError::ExtraneousData => CborError::ExtraneousData,
            CoseError::OutOfRangeIntegerValue => CborError::OutOfRangeIntegerValue,
            CoseError::UnexpectedItem(s, s2) => CborError::UnexpectedItem(s, s2),
            CoseError::UnregisteredIanaValue => CborError::UnregisteredIanaValue,
            CoseError::UnregisteredIanaNonPrivateValue => {
                CborError::UnregisteredIanaNonPrivateValue
            }
        }
    }
}

pub fn to_vec<T>(value: &T) -> Result<Vec<u8>, CborError>
where
    T: Serialize,
{
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(coset::CoseError::from)
        .map_err(CborError::from)?;
    Ok(buf)
}

pub fn from_slice<T>(slice: &[u8]) -> Result<T, CborError>
where
    T: de::DeserializeOwned,
{
    ciborium::from_reader(Cursor::new(&slice))
        .map_err(|e| semantic(e.to_string()))
        .map_err(CborError::from)
}

/// Convert a `ciborium::Value` into a type `T`
#[allow(clippy::needless_pass_by_value)]
pub fn from_value<T>(value: Value) -> Result<T, CborError>
where
    T: de::DeserializeOwned,
{
    let buf = to_vec(&value)?;
    from_slice(buf.as_slice())
}

pub fn into_value<S>(v: S) -> Result<Value, CborError>
where
    S: Serialize,
{
    let bytes = to_vec(&v)?;
    from_slice(&bytes)
}

/// Implements the coset CBOR traits for a type that already has serde support, so it can be
/// embedded in a [`Tag24`](crate::definitions::helpers::tag24::Tag24).
macro_rules! cbor_serializable_via_serde {
    ($t:ty) => {
        impl coset::CborSerializable for $t {}
        impl coset::AsCborValue for $t {
            fn from_cbor_value(value: ciborium::Value) -> coset::Result<Self> {
                $crate::cbor::from_value(value).map_err(|e| $crate::cbor::semantic(e.to_string()))
            }

            fn to_cbor_value(self) -> coset::Result<ciborium::Value> {
                $crate::cbor::into_value(self).map_err(|e| $crate::cbor::semantic(e.to_string()))
            }
        }
    };
}
pub(crate) use cbor_serializable_via_serde;

/// Builds a decoding error carrying a free-form description.
pub(crate) fn semantic(message: impl Into<String>) -> CoseError {
    CoseError::DecodeFailed(ciborium::de::Error::Semantic(None, message.into()))
}

/// Looks up a text key in a decoded CBOR map.
pub(crate) fn map_get<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| matches!(k, Value::Text(text) if text == key))
        .map(|(_, v)| v)
}

/// Looks up an integer key in a decoded CBOR map.
pub(crate) fn map_get_int(map: &[(Value, Value)], key: i64) -> Option<&Value> {
    map.iter()
        .find(|(k, _)| matches!(k, Value::Integer(i) if i128::from(*i) == i128::from(key)))
        .map(|(_, v)| v)
}

/// Removes a text key from a decoded CBOR map, returning its value.
pub(crate) fn map_take(map: &mut Vec<(Value, Value)>, key: &str) -> Option<Value> {
    let index = map
        .iter()
        .position(|(k, _)| matches!(k, Value::Text(text) if text == key))?;
    Some(map.remove(index).1)
}

pub(crate) fn into_map(value: Value, want: &'static str) -> coset::Result<Vec<(Value, Value)>> {
    match value {
        Value::Map(map) => Ok(map),
        _ => Err(CoseError::UnexpectedItem("non-map", want)),
    }
}

pub(crate) fn into_bytes(value: Value, want: &'static str) -> coset::Result<Vec<u8>> {
    match value {
        Value::Bytes(bytes) => Ok(bytes),
        _ => Err(CoseError::UnexpectedItem("non-bstr", want)),
    }
}

/// Returns the encoded length of the first complete data item in `buf`, or `None` while more
/// bytes are needed to finish it.
///
/// Used to split a byte stream that carries bare CBOR data items back to back.
pub fn data_item_length(buf: &[u8]) -> Result<Option<usize>, CborError> {
    item_end(buf, 0, 0)
}

fn item_end(buf: &[u8], start: usize, depth: usize) -> Result<Option<usize>, CborError> {
    if depth > MAX_NESTING {
        return Err(CborError::NestingTooDeep);
    }
    let Some(&initial) = buf.get(start) else {
        return Ok(None);
    };
    let major = initial >> 5;
    let info = initial & 0x1f;
    let (argument, mut offset) = match info {
        0..=23 => (u64::from(info), start + 1),
        24..=27 => {
            let end = start + 1 + (1usize << (info - 24));
            let Some(bytes) = buf.get(start + 1..end) else {
                return Ok(None);
            };
            let argument = bytes
                .iter()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
            (argument, end)
        }
        31 => return Err(CborError::IndefiniteLength),
        _ => return Err(semantic(format!("reserved additional information {info}")).into()),
    };
    match major {
        // unsigned, negative, simple values and floats carry everything in the head
        0 | 1 | 7 => Ok(Some(offset)),
        2 | 3 => {
            let length =
                usize::try_from(argument).map_err(|_| CborError::OutOfRangeIntegerValue)?;
            let end = offset
                .checked_add(length)
                .ok_or(CborError::OutOfRangeIntegerValue)?;
            Ok((buf.len() >= end).then_some(end))
        }
        4 | 5 => {
            let count = if major == 4 {
                argument
            } else {
                argument
                    .checked_mul(2)
                    .ok_or(CborError::OutOfRangeIntegerValue)?
            };
            for _ in 0..count {
                match item_end(buf, offset, depth + 1)? {
                    Some(end) => offset = end,
                    None => return Ok(None),
                }
            }
            Ok(Some(offset))
        }
        _ => item_end(buf, offset, depth + 1),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn measures_complete_items() {
        let encoded = to_vec(&Value::Map(vec![(
            Value::Text("data".into()),
            Value::Bytes(vec![7; 300]),
        )]))
        .unwrap();
        assert_eq!(data_item_length(&encoded).unwrap(), Some(encoded.len()));

        let tagged = to_vec(&Value::Tag(24, Box::new(Value::Bytes(vec![1, 2, 3])))).unwrap();
        assert_eq!(data_item_length(&tagged).unwrap(), Some(tagged.len()));
    }

    #[test]
    fn incomplete_item_needs_more_bytes() {
        let encoded = to_vec(&Value::Array(vec![
            Value::Integer(1.into()),
            Value::Text("hello".into()),
        ]))
        .unwrap();
        for cut in 0..encoded.len() {
            assert_eq!(data_item_length(&encoded[..cut]).unwrap(), None);
        }
    }

    #[test]
    fn only_first_item_is_measured() {
        let mut stream = to_vec(&Value::Integer(1_000_000.into())).unwrap();
        let first = stream.len();
        stream.extend(to_vec(&Value::Text("next".into())).unwrap());
        assert_eq!(data_item_length(&stream).unwrap(), Some(first));
    }

    #[test]
    fn indefinite_length_is_rejected() {
        assert!(matches!(
            data_item_length(&[0x9f, 0x01, 0xff]),
            Err(CborError::IndefiniteLength)
        ));
    }
}
