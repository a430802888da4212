//! `DeviceResponse` and the issuer-signed and device-signed structures it carries.
use std::collections::BTreeMap;

use ciborium::Value;
use coset::{AsCborValue, CoseMac0, CoseSign1};
use serde::{Deserialize, Serialize};

use crate::cbor::{self, CborError};
use crate::definitions::helpers::tag24::{tagged_bytes, Tag24};
use crate::definitions::session::SessionTranscript;

pub type IssuerNamespaces = BTreeMap<String, Vec<IssuerSignedItemBytes>>;
pub type IssuerSignedItemBytes = Tag24<IssuerSignedItem>;
pub type DeviceNamespacesBytes = Tag24<DeviceNamespaces>;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceResponse {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub documents: Option<Vec<Document>>,
    pub status: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub doc_type: String,
    pub issuer_signed: IssuerSigned,
    pub device_signed: DeviceSigned,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSigned {
    #[serde(rename = "nameSpaces", skip_serializing_if = "Option::is_none", default)]
    pub namespaces: Option<IssuerNamespaces>,
    /// The issuer's `COSE_Sign1` over the mobile security object.
    pub issuer_auth: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSignedItem {
    #[serde(rename = "digestID")]
    pub digest_id: u64,
    #[serde(with = "serde_bytes")]
    pub random: Vec<u8>,
    pub element_identifier: String,
    pub element_value: Value,
}

cbor::cbor_serializable_via_serde!(IssuerSignedItem);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSigned {
    #[serde(rename = "nameSpaces")]
    pub namespaces: DeviceNamespacesBytes,
    pub device_auth: DeviceAuth,
}

/// Device-signed data elements, keyed by namespace then element identifier.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct DeviceNamespaces(pub BTreeMap<String, BTreeMap<String, Value>>);

cbor::cbor_serializable_via_serde!(DeviceNamespaces);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceAuth {
    /// A detached `COSE_Sign1`.
    DeviceSignature(Value),
    /// A detached `COSE_Mac0`.
    DeviceMac(Value),
}

impl DeviceAuth {
    pub fn signature(&self) -> Option<CoseSign1> {
        match self {
            DeviceAuth::DeviceSignature(value) => CoseSign1::from_cbor_value(value.clone()).ok(),
            DeviceAuth::DeviceMac(_) => None,
        }
    }

    pub fn mac(&self) -> Option<CoseMac0> {
        match self {
            DeviceAuth::DeviceMac(value) => CoseMac0::from_cbor_value(value.clone()).ok(),
            DeviceAuth::DeviceSignature(_) => None,
        }
    }
}

impl DeviceResponse {
    pub const VERSION: &'static str = "1.0";
    pub const STATUS_OK: u64 = 0;

    pub fn new(documents: Vec<Document>) -> Self {
        DeviceResponse {
            version: Self::VERSION.to_string(),
            documents: (!documents.is_empty()).then_some(documents),
            status: Self::STATUS_OK,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, CborError> {
        cbor::from_slice(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CborError> {
        cbor::to_vec(self)
    }

    pub fn documents(&self) -> &[Document] {
        self.documents.as_deref().unwrap_or_default()
    }
}

impl Document {
    /// Disclosed issuer-signed elements as `(namespace, element identifier, value)`.
    pub fn issuer_elements(&self) -> Vec<(&str, &str, &Value)> {
        self.issuer_signed
            .namespaces
            .iter()
            .flatten()
            .flat_map(|(namespace, items)| {
                items.iter().map(move |item| {
                    let item = item.as_ref();
                    (
                        namespace.as_str(),
                        item.element_identifier.as_str(),
                        &item.element_value,
                    )
                })
            })
            .collect()
    }
}

/// Encodes `DeviceAuthenticationBytes`, the detached payload of the device signature or MAC:
/// `#6.24(bstr .cbor ["DeviceAuthentication", SessionTranscript, DocType, DeviceNameSpacesBytes])`
pub fn device_authentication_bytes(
    session_transcript: &SessionTranscript,
    doc_type: &str,
    namespaces: &DeviceNamespacesBytes,
) -> Result<Vec<u8>, CborError> {
    let device_authentication = Value::Array(vec![
        Value::Text("DeviceAuthentication".into()),
        session_transcript.to_value(),
        Value::Text(doc_type.into()),
        tagged_bytes(namespaces.inner_bytes.clone()),
    ]);
    cbor::to_vec(&tagged_bytes(cbor::to_vec(&device_authentication)?))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::definitions::session::Handover;

    fn item(identifier: &str, value: Value) -> IssuerSignedItemBytes {
        Tag24::new(IssuerSignedItem {
            digest_id: 7,
            random: vec![0xaa; 16],
            element_identifier: identifier.into(),
            element_value: value,
        })
        .unwrap()
    }

    #[test]
    fn issuer_signed_item_keeps_bytes() {
        let item = item("family_name", Value::Text("Mustermann".into()));
        let encoded = cbor::to_vec(&item).unwrap();
        let decoded: IssuerSignedItemBytes = cbor::from_slice(&encoded).unwrap();
        assert_eq!(decoded.inner_bytes, item.inner_bytes);
        assert_eq!(decoded.as_ref().digest_id, 7);
        // random is a byte string, not an array
        let Value::Map(map) = cbor::from_slice::<Value>(&item.inner_bytes).unwrap() else {
            panic!("expected map");
        };
        assert!(matches!(cbor::map_get(&map, "random"), Some(Value::Bytes(_))));
    }

    #[test]
    fn empty_response_omits_documents() {
        let response = DeviceResponse::new(vec![]);
        let Value::Map(map) = cbor::into_value(&response).unwrap() else {
            panic!("expected map");
        };
        assert!(cbor::map_get(&map, "documents").is_none());
        assert_eq!(
            cbor::map_get(&map, "status"),
            Some(&Value::Integer(0.into()))
        );
    }

    #[test]
    fn document_elements() {
        let document = Document {
            doc_type: "org.iso.18013.5.1.mDL".into(),
            issuer_signed: IssuerSigned {
                namespaces: Some(BTreeMap::from([(
                    "org.iso.18013.5.1".to_string(),
                    vec![item("age_over_21", Value::Bool(true))],
                )])),
                issuer_auth: Value::Null,
            },
            device_signed: DeviceSigned {
                namespaces: Tag24::new(DeviceNamespaces::default()).unwrap(),
                device_auth: DeviceAuth::DeviceSignature(Value::Null),
            },
        };
        let bytes = DeviceResponse::new(vec![document]).to_bytes().unwrap();
        let response = DeviceResponse::parse(&bytes).unwrap();
        assert_eq!(
            response.documents()[0].issuer_elements(),
            vec![("org.iso.18013.5.1", "age_over_21", &Value::Bool(true))]
        );
    }

    #[test]
    fn device_authentication_layout() {
        let transcript = SessionTranscript::handover_only(Handover::Qr);
        let namespaces = Tag24::new(DeviceNamespaces::default()).unwrap();
        let bytes = device_authentication_bytes(&transcript, "doc", &namespaces).unwrap();
        let Value::Tag(24, inner) = cbor::from_slice::<Value>(&bytes).unwrap() else {
            panic!("expected tag 24");
        };
        let Value::Bytes(inner) = *inner else {
            panic!("expected bstr");
        };
        let Value::Array(items) = cbor::from_slice::<Value>(&inner).unwrap() else {
            panic!("expected array");
        };
        assert_eq!(items[0], Value::Text("DeviceAuthentication".into()));
        assert_eq!(items[2], Value::Text("doc".into()));
        assert_eq!(namespaces.inner_bytes, vec![0xa0]);
    }
}
