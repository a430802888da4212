//! The `preview` protocol: a JSON selector naming a document type and its fields, answered with
//! an HPKE-encrypted `DeviceResponse` in a versioned token.
use ciborium::Value;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{decode_base64, encode_base64, present_single, requester};
use crate::cbor;
use crate::definitions::device_response::DeviceResponse;
use crate::definitions::session::{Handover, SessionTranscript};
use crate::hpke;
use crate::presentment::error::Error;
use crate::presentment::mechanism::DigitalCredentialsPresentmentMechanism;
use crate::presentment::model::PresentmentModel;
use crate::presentment::source::{MdocRequest, PresentmentSource, RequestedClaim};

pub const PROTOCOL: &str = "preview";

const RESPONSE_VERSION: &str = "ANDROID-HPKE-v1";
const ANDROID_HANDOVER: &str = "AndroidHandoverv1";
const BROWSER_HANDOVER: &str = "BrowserHandoverv1";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreviewRequest {
    selector: Selector,
    nonce: String,
    reader_public_key: String,
}

#[derive(Debug, Deserialize)]
struct Selector {
    #[serde(default)]
    format: Vec<String>,
    doctype: String,
    fields: Vec<Field>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Field {
    namespace: String,
    name: String,
    #[serde(default)]
    intent_to_retain: bool,
}

/// Binds the request to its nonce, the reader's key and either the web origin or the calling
/// app.
pub fn session_transcript(
    nonce: &[u8],
    reader_public_key: &[u8],
    app_id: Option<&str>,
    web_origin: Option<&str>,
) -> Result<SessionTranscript, Error> {
    let reader_key_hash = Value::Bytes(Sha256::digest(reader_public_key).to_vec());
    let handover = match (web_origin, app_id) {
        (Some(origin), _) => {
            let origin_info = Value::Map(vec![
                (Value::Text("cat".into()), Value::Integer(1.into())),
                (Value::Text("type".into()), Value::Integer(1.into())),
                (
                    Value::Text("details".into()),
                    Value::Map(vec![(
                        Value::Text("baseUrl".into()),
                        Value::Text(origin.to_string()),
                    )]),
                ),
            ]);
            Value::Array(vec![
                Value::Text(BROWSER_HANDOVER.into()),
                Value::Bytes(nonce.to_vec()),
                Value::Bytes(cbor::to_vec(&origin_info)?),
                reader_key_hash,
            ])
        }
        (None, Some(app_id)) => Value::Array(vec![
            Value::Text(ANDROID_HANDOVER.into()),
            Value::Bytes(nonce.to_vec()),
            Value::Bytes(Sha256::digest(app_id.as_bytes()).to_vec()),
            reader_key_hash,
        ]),
        (None, None) => {
            return Err(Error::MalformedRequest(
                "either a web origin or an app id is required".into(),
            ))
        }
    };
    Ok(SessionTranscript::handover_only(Handover::Other(handover)))
}

pub(crate) async fn respond(
    model: &PresentmentModel,
    mechanism: &DigitalCredentialsPresentmentMechanism,
    source: &dyn PresentmentSource,
) -> Result<serde_json::Value, Error> {
    let request: PreviewRequest = serde_json::from_value(mechanism.data.clone())
        .map_err(|e| Error::MalformedRequest(e.to_string()))?;
    if !request.selector.format.is_empty()
        && !request.selector.format.iter().any(|format| format == "mdoc")
    {
        return Err(Error::MalformedRequest(format!(
            "unsupported formats {:?}",
            request.selector.format
        )));
    }
    let nonce = decode_base64("nonce", &request.nonce)?;
    let reader_public_key_bytes = decode_base64("readerPublicKey", &request.reader_public_key)?;
    let reader_public_key = p256::PublicKey::from_sec1_bytes(&reader_public_key_bytes)
        .map_err(|_| Error::MalformedRequest("readerPublicKey is not a P-256 point".into()))?;

    let mdoc_request = MdocRequest {
        doc_type: request.selector.doctype,
        claims: request
            .selector
            .fields
            .into_iter()
            .map(|field| RequestedClaim {
                namespace: field.namespace,
                element_identifier: field.name,
                intent_to_retain: field.intent_to_retain,
            })
            .collect(),
        requester: requester(mechanism),
    };
    let transcript = session_transcript(
        &nonce,
        &reader_public_key_bytes,
        mechanism.app_id.as_deref(),
        mechanism.web_origin.as_deref(),
    )?;

    let document = present_single(model, source, mechanism, &mdoc_request, &transcript).await?;
    let device_response = DeviceResponse::new(vec![document]).to_bytes()?;
    let sealed = hpke::seal(
        &reader_public_key,
        &transcript.to_bytes()?,
        &[],
        &device_response,
    )?;
    let token = Value::Map(vec![
        (
            Value::Text("version".into()),
            Value::Text(RESPONSE_VERSION.into()),
        ),
        (
            Value::Text("encryptionParameters".into()),
            Value::Map(vec![(Value::Text("pkEm".into()), Value::Bytes(sealed.enc))]),
        ),
        (
            Value::Text("cipherText".into()),
            Value::Bytes(sealed.ciphertext),
        ),
    ]);
    Ok(serde_json::json!({ "token": encode_base64(&cbor::to_vec(&token)?) }))
}
