use std::collections::BTreeMap;

use ciborium::Value;
use coset::{AsCborValue, CoseSign1, Label};
use serde::{Deserialize, Serialize};

use crate::cbor::{self, CborError};
use crate::definitions::helpers::tag24::Tag24;

pub type ItemsRequestBytes = Tag24<ItemsRequest>;
pub type DocType = String;
pub type NameSpace = String;
pub type IntentToRetain = bool;
pub type DataElementIdentifier = String;
pub type DataElements = BTreeMap<DataElementIdentifier, IntentToRetain>;
pub type Namespaces = BTreeMap<NameSpace, DataElements>;

/// COSE header label carrying an X.509 certificate chain.
const X5CHAIN: i64 = 33;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    pub version: String,
    pub doc_requests: Vec<DocRequest>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocRequest {
    pub items_request: ItemsRequestBytes,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reader_auth: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemsRequest {
    pub doc_type: DocType,
    #[serde(rename = "nameSpaces")]
    pub namespaces: Namespaces,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request_info: Option<BTreeMap<String, Value>>,
}

cbor::cbor_serializable_via_serde!(ItemsRequest);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to decode DeviceRequest: {0}")]
    Cbor(#[from] CborError),
    #[error("unsupported DeviceRequest version {0}")]
    UnsupportedVersion(String),
    #[error("DeviceRequest has no document requests")]
    Empty,
}

impl DeviceRequest {
    pub const VERSION: &'static str = "1.0";

    pub fn new(doc_requests: Vec<DocRequest>) -> Self {
        DeviceRequest {
            version: Self::VERSION.to_string(),
            doc_requests,
        }
    }

    /// Decodes a `DeviceRequest`, accepting any 1.x version.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let request: DeviceRequest = cbor::from_slice(bytes)?;
        if request.version.split('.').next() != Some("1") {
            return Err(Error::UnsupportedVersion(request.version));
        }
        if request.doc_requests.is_empty() {
            return Err(Error::Empty);
        }
        Ok(request)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CborError> {
        cbor::to_vec(self)
    }
}

impl DocRequest {
    /// The reader's certificate chain, leaf first, taken from the `x5chain` header of
    /// `readerAuth`. The signature is not checked here.
    pub fn reader_certificate_chain(&self) -> Option<Vec<Vec<u8>>> {
        let reader_auth = CoseSign1::from_cbor_value(self.reader_auth.clone()?).ok()?;
        let header = reader_auth
            .unprotected
            .rest
            .iter()
            .chain(reader_auth.protected.header.rest.iter())
            .find(|(label, _)| *label == Label::Int(X5CHAIN))
            .map(|(_, value)| value)?;
        match header {
            Value::Bytes(certificate) => Some(vec![certificate.clone()]),
            Value::Array(chain) => chain
                .iter()
                .map(|certificate| match certificate {
                    Value::Bytes(certificate) => Some(certificate.clone()),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }
}
