//! The `austroads-request-forwarding-v2` protocol: an ISO 18013-5 `DeviceRequest` forwarded
//! unchanged, with the key to encrypt the response to carried alongside it.
use ciborium::Value;
use coset::AsCborValue;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{decode_base64, encode_base64, present_single, requester};
use crate::cbor;
use crate::definitions::cose_key::CoseKey;
use crate::definitions::device_request::DeviceRequest;
use crate::definitions::device_response::DeviceResponse;
use crate::definitions::session::{Handover, SessionTranscript};
use crate::hpke;
use crate::presentment::error::Error;
use crate::presentment::mechanism::DigitalCredentialsPresentmentMechanism;
use crate::presentment::model::PresentmentModel;
use crate::presentment::source::{MdocRequest, PresentmentSource};

pub const PROTOCOL: &str = "austroads-request-forwarding-v2";

/// Leading element of the encryption info, the handover and the response.
const DCAPI: &str = "dcapi";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForwardedRequest {
    device_request: String,
    encryption_info: String,
}

/// `EncryptionInfo = ["dcapi", {"nonce": bstr, "recipientPublicKey": COSE_Key}]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionInfo {
    pub nonce: Vec<u8>,
    pub recipient_public_key: p256::PublicKey,
}

impl EncryptionInfo {
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let malformed = |reason: &str| Error::MalformedRequest(format!("encryption info {reason}"));
        let value: Value = cbor::from_slice(bytes)?;
        let Value::Array(mut items) = value else {
            return Err(malformed("is not an array"));
        };
        if items.len() != 2 || items[0] != Value::Text(DCAPI.into()) {
            return Err(malformed("must start with \"dcapi\""));
        }
        let Some(Value::Map(mut parameters)) = items.pop() else {
            return Err(malformed("has no parameters"));
        };
        let nonce = match cbor::map_take(&mut parameters, "nonce") {
            Some(Value::Bytes(nonce)) => nonce,
            _ => return Err(malformed("has no nonce")),
        };
        let recipient_public_key = cbor::map_take(&mut parameters, "recipientPublicKey")
            .ok_or_else(|| malformed("has no recipient key"))
            .and_then(|key| {
                CoseKey::from_cbor_value(key).map_err(|e| malformed(&format!("key: {e}")))
            })?;
        Ok(EncryptionInfo {
            nonce,
            recipient_public_key: recipient_public_key.0,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let value = Value::Array(vec![
            Value::Text(DCAPI.into()),
            Value::Map(vec![
                (Value::Text("nonce".into()), Value::Bytes(self.nonce.clone())),
                (
                    Value::Text("recipientPublicKey".into()),
                    CoseKey(self.recipient_public_key).to_cbor_value()?,
                ),
            ]),
        ]);
        Ok(cbor::to_vec(&value)?)
    }
}

/// `["dcapi", SHA-256([encryptionInfo, origin])]`, hashing the base64url encryption info exactly
/// as received.
pub fn session_transcript(
    encryption_info: &str,
    web_origin: &str,
) -> Result<SessionTranscript, Error> {
    let dcapi_info = cbor::to_vec(&Value::Array(vec![
        Value::Text(encryption_info.to_string()),
        Value::Text(web_origin.to_string()),
    ]))?;
    Ok(SessionTranscript::handover_only(Handover::Other(
        Value::Array(vec![
            Value::Text(DCAPI.into()),
            Value::Bytes(Sha256::digest(dcapi_info).to_vec()),
        ]),
    )))
}

pub(crate) async fn respond(
    model: &PresentmentModel,
    mechanism: &DigitalCredentialsPresentmentMechanism,
    source: &dyn PresentmentSource,
) -> Result<serde_json::Value, Error> {
    let request: ForwardedRequest = serde_json::from_value(mechanism.data.clone())
        .map_err(|e| Error::MalformedRequest(e.to_string()))?;
    let web_origin = mechanism
        .web_origin
        .as_deref()
        .ok_or_else(|| Error::MalformedRequest("request forwarding needs a web origin".into()))?;
    let encryption_info =
        EncryptionInfo::decode(&decode_base64("encryptionInfo", &request.encryption_info)?)?;
    let device_request =
        DeviceRequest::parse(&decode_base64("deviceRequest", &request.device_request)?)
            .map_err(|e| Error::MalformedRequest(e.to_string()))?;
    let transcript = session_transcript(&request.encryption_info, web_origin)?;

    if device_request.doc_requests.len() > 1 {
        tracing::warn!(
            "{} document requests forwarded, answering each with its first match",
            device_request.doc_requests.len()
        );
    }
    let mut documents = Vec::new();
    for doc_request in &device_request.doc_requests {
        let mdoc_request = MdocRequest::from_doc_request(doc_request, requester(mechanism));
        documents.push(present_single(model, source, mechanism, &mdoc_request, &transcript).await?);
    }

    let device_response = DeviceResponse::new(documents).to_bytes()?;
    let sealed = hpke::seal(
        &encryption_info.recipient_public_key,
        &transcript.to_bytes()?,
        &[],
        &device_response,
    )?;
    let response = Value::Array(vec![
        Value::Text(DCAPI.into()),
        Value::Map(vec![
            (Value::Text("enc".into()), Value::Bytes(sealed.enc)),
            (
                Value::Text("cipherText".into()),
                Value::Bytes(sealed.ciphertext),
            ),
        ]),
    ]);
    Ok(serde_json::json!({ "response": encode_base64(&cbor::to_vec(&response)?) }))
}
