//! Same-device presentment through a platform credential API.
//!
//! The request arrives as JSON in one of the supported protocols and the response goes back the
//! same way, HPKE-encrypted to a key the requester supplied.
use crate::definitions::device_response::Document;
use crate::definitions::session::SessionTranscript;
use crate::presentment::error::Error;
use crate::presentment::mechanism::{
    DigitalCredentialsPresentmentMechanism, DigitalCredentialsResponse,
};
use crate::presentment::model::PresentmentModel;
use crate::presentment::response::{present_document, Presented, Selection};
use crate::presentment::source::{MdocRequest, PresentmentSource, Requester};

pub mod forwarding;
pub mod preview;

const BASE64_CONFIG: base64::Config = base64::URL_SAFE_NO_PAD;

pub(crate) fn decode_base64(field: &str, encoded: &str) -> Result<Vec<u8>, Error> {
    base64::decode_config(encoded, BASE64_CONFIG)
        .map_err(|e| Error::MalformedRequest(format!("{field} is not base64url: {e}")))
}

pub(crate) fn encode_base64(bytes: &[u8]) -> String {
    base64::encode_config(bytes, BASE64_CONFIG)
}

fn requester(mechanism: &DigitalCredentialsPresentmentMechanism) -> Requester {
    Requester {
        certificate_chain: None,
        app_id: mechanism.app_id.clone(),
        web_origin: mechanism.web_origin.clone(),
    }
}

/// Answers one document request. There is no picker here: the platform already let the user
/// choose, so the first matching credential is used.
async fn present_single(
    model: &PresentmentModel,
    source: &dyn PresentmentSource,
    mechanism: &DigitalCredentialsPresentmentMechanism,
    request: &MdocRequest,
    session_transcript: &SessionTranscript,
) -> Result<Document, Error> {
    match present_document(
        model,
        source,
        request,
        Selection::FirstMatch,
        mechanism.pre_selected_document.as_deref(),
        session_transcript,
        None,
    )
    .await?
    {
        Presented::Document(document) => Ok(document),
        Presented::NoCredential => Err(Error::NoMatchingCredential),
        Presented::Declined => Err(Error::Cancelled),
    }
}

pub(crate) async fn digital_credentials_presentment(
    model: &PresentmentModel,
    mechanism: &DigitalCredentialsPresentmentMechanism,
    source: &dyn PresentmentSource,
) -> Result<(), Error> {
    tracing::info!(
        "{} request from {:?}",
        mechanism.protocol,
        mechanism.web_origin.as_deref().or(mechanism.app_id.as_deref())
    );
    let data = match mechanism.protocol.as_str() {
        preview::PROTOCOL => preview::respond(model, mechanism, source).await?,
        forwarding::PROTOCOL => forwarding::respond(model, mechanism, source).await?,
        other => return Err(Error::UnsupportedProtocol(other.to_string())),
    };
    let delivered = mechanism.send_response(DigitalCredentialsResponse {
        protocol: mechanism.protocol.clone(),
        data,
    });
    if !delivered {
        tracing::warn!("nobody is waiting for the {} response", mechanism.protocol);
    }
    model.request_served();
    Ok(())
}
