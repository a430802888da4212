use ciborium::Value;
use coset::{AsCborValue, CborSerializable, CoseError};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;

use crate::cbor::map_get_int;

const KTY: i64 = 1;
const CRV: i64 = -1;
const X: i64 = -2;
const Y: i64 = -3;
const KTY_EC2: i64 = 2;
const CRV_P256: i64 = 1;

/// An RFC-8152 [COSE_Key](https://datatracker.ietf.org/doc/html/rfc8152#section-13)
/// restricted to the EC2 P-256 keys used for session establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoseKey(pub PublicKey);

/// Errors that can occur when deserialising a COSE_Key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("COSE_Key of kty 'EC2' missing x coordinate")]
    EC2MissingX,
    #[error("COSE_Key of kty 'EC2' missing y coordinate")]
    EC2MissingY,
    #[error("Expected to parse a CBOR map, received: '{0:?}'")]
    NotAMap(Value),
    #[error("This implementation of COSE_Key only supports P-256 EC2 keys")]
    UnsupportedKey,
    #[error("Could not reconstruct coordinates from the provided COSE_Key")]
    InvalidCoseKey,
}

impl CoseKey {
    pub fn public_key(&self) -> &PublicKey {
        &self.0
    }
}

impl From<PublicKey> for CoseKey {
    fn from(key: PublicKey) -> Self {
        CoseKey(key)
    }
}

impl From<CoseKey> for Value {
    fn from(key: CoseKey) -> Value {
        let point = key.0.to_encoded_point(false);
        let coordinate = |c: Option<&p256::FieldBytes>| c.map(|c| c.to_vec()).unwrap_or_default();
        Value::Map(vec![
            (Value::Integer(KTY.into()), Value::Integer(KTY_EC2.into())),
            (Value::Integer(CRV.into()), Value::Integer(CRV_P256.into())),
            (Value::Integer(X.into()), Value::Bytes(coordinate(point.x()))),
            (Value::Integer(Y.into()), Value::Bytes(coordinate(point.y()))),
        ])
    }
}

impl TryFrom<Value> for CoseKey {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let Value::Map(map) = v else {
            return Err(Error::NotAMap(v));
        };
        let int = |label| match map_get_int(&map, label) {
            Some(Value::Integer(i)) => i64::try_from(*i).ok(),
            _ => None,
        };
        if int(KTY) != Some(KTY_EC2) || int(CRV) != Some(CRV_P256) {
            return Err(Error::UnsupportedKey);
        }
        let x = match map_get_int(&map, X) {
            Some(Value::Bytes(x)) if x.len() == 32 => x,
            Some(_) => return Err(Error::InvalidCoseKey),
            None => return Err(Error::EC2MissingX),
        };
        let mut sec1 = Vec::with_capacity(65);
        match map_get_int(&map, Y) {
            Some(Value::Bytes(y)) if y.len() == 32 => {
                sec1.push(0x04);
                sec1.extend_from_slice(x);
                sec1.extend_from_slice(y);
            }
            Some(Value::Bool(sign)) => {
                sec1.push(if *sign { 0x03 } else { 0x02 });
                sec1.extend_from_slice(x);
            }
            Some(_) => return Err(Error::InvalidCoseKey),
            None => return Err(Error::EC2MissingY),
        }
        PublicKey::from_sec1_bytes(&sec1)
            .map(CoseKey)
            .map_err(|_| Error::InvalidCoseKey)
    }
}

impl CborSerializable for CoseKey {}
impl AsCborValue for CoseKey {
    fn from_cbor_value(value: Value) -> coset::Result<Self> {
        CoseKey::try_from(value).map_err(|e| crate::cbor::semantic(e.to_string()))
    }

    fn to_cbor_value(self) -> coset::Result<Value> {
        Ok(self.into())
    }
}

impl From<Error> for CoseError {
    fn from(e: Error) -> CoseError {
        crate::cbor::semantic(e.to_string())
    }
}
