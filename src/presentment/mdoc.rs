//! Proximity presentment: answering `DeviceRequest`s from a reader over an [`MdocTransport`].
//!
//! [`MdocTransport`]: crate::transport::MdocTransport
use std::time::Duration;

use coset::CborSerializable;

use crate::definitions::device_request::DeviceRequest;
use crate::definitions::device_response::DeviceResponse;
use crate::definitions::session::{
    self, Role, SessionData, SessionEncryption, SessionEstablishment, SessionTranscript,
    STATUS_ERROR_CBOR_DECODING, STATUS_ERROR_SESSION_ENCRYPTION, STATUS_SESSION_TERMINATION,
};
use crate::presentment::error::Error;
use crate::presentment::mechanism::MdocPresentmentMechanism;
use crate::presentment::model::PresentmentModel;
use crate::presentment::response::{present_document, Presented, Selection};
use crate::presentment::source::{MdocRequest, PresentmentSource, Requester};
use crate::transport::{SharedTransport, State, TransportError};

/// Everything fixed once the reader's first message has arrived.
struct Session {
    encryption: SessionEncryption,
    transcript: SessionTranscript,
    e_reader_key: p256::PublicKey,
}

impl Session {
    fn establish(mechanism: &MdocPresentmentMechanism, message: &[u8]) -> Result<Self, Error> {
        let establishment = SessionEstablishment::from_slice(message)
            .map_err(|e| Error::MalformedRequest(format!("expected SessionEstablishment: {e}")))?;
        let e_reader_key = *establishment.e_reader_key.as_ref().public_key();
        let transcript = SessionTranscript::proximity(
            mechanism.encoded_device_engagement.clone(),
            &establishment.e_reader_key,
            mechanism.handover.clone(),
        );
        let encryption = SessionEncryption::new(
            Role::Mdoc,
            &mechanism.e_device_key,
            &e_reader_key,
            &transcript.to_tagged_bytes()?,
        )?;
        tracing::debug!("session established");
        Ok(Session {
            encryption,
            transcript,
            e_reader_key,
        })
    }
}

/// Waits until the transport is connected.
async fn wait_connected(transport: &SharedTransport) -> Result<(), Error> {
    let mut state = transport.watch_state();
    loop {
        let current = *state.borrow_and_update();
        match current {
            State::Connected => return Ok(()),
            State::Closed => return Err(TransportError::Closed.into()),
            State::Failed => return Err(TransportError::Failed("transport failed".into()).into()),
            _ => {}
        }
        if state.changed().await.is_err() {
            return Err(TransportError::Closed.into());
        }
    }
}

async fn receive(transport: &SharedTransport, timeout: Option<Duration>) -> Result<Vec<u8>, Error> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, transport.wait_for_message())
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(Error::from),
        None => Ok(transport.wait_for_message().await?),
    }
}

/// Sends an unencrypted status to the reader, logging failures.
async fn send_status(transport: &SharedTransport, status: u64) {
    match SessionData::status(status).to_vec() {
        Ok(message) => {
            if let Err(e) = transport.send_message(&message).await {
                tracing::warn!("unable to send status {status}: {e}");
            }
        }
        Err(e) => tracing::warn!("unable to encode status {status}: {e}"),
    }
}

/// Answers requests until the reader ends the session, or after the first response unless
/// multiple requests are allowed.
pub(crate) async fn mdoc_presentment(
    model: &PresentmentModel,
    mechanism: &MdocPresentmentMechanism,
    source: &dyn PresentmentSource,
) -> Result<(), Error> {
    let transport = &mechanism.transport;
    let timeout = model.config().request_timeout();
    let allow_multiple_requests =
        model.config().allow_multiple_requests || mechanism.allow_multiple_requests;
    match wait_connected(transport).await {
        Ok(()) => {}
        Err(Error::Transport(TransportError::Closed)) => {
            tracing::info!("transport closed before connecting");
            return Ok(());
        }
        Err(e) => return Err(e),
    }
    if let Some(duration) = mechanism.engagement_duration {
        tracing::debug!("engagement took {duration:?}");
    }

    let mut session: Option<Session> = None;
    loop {
        let message = match receive(transport, timeout).await {
            Ok(message) => message,
            Err(Error::Transport(TransportError::Closed)) => {
                tracing::info!("transport closed, ending presentment");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if message.is_empty() {
            tracing::info!("reader used transport-specific session termination");
            return Ok(());
        }

        let session = match &mut session {
            Some(session) => session,
            slot @ None => match Session::establish(mechanism, &message) {
                Ok(established) => slot.insert(established),
                Err(e) => {
                    if let Error::MalformedRequest(_) = e {
                        send_status(transport, STATUS_ERROR_CBOR_DECODING).await;
                    }
                    return Err(e);
                }
            },
        };
        let (data, status) = match session.encryption.decrypt_message(&message) {
            Ok(decrypted) => decrypted,
            Err(e) => {
                let status = match e {
                    session::Error::Decode(_) => STATUS_ERROR_CBOR_DECODING,
                    _ => STATUS_ERROR_SESSION_ENCRYPTION,
                };
                send_status(transport, status).await;
                return Err(e.into());
            }
        };
        if status == Some(STATUS_SESSION_TERMINATION) {
            tracing::info!("reader ended the session");
            return Ok(());
        }
        let Some(data) = data else {
            return Err(Error::MalformedRequest(format!(
                "message carries no data, status {status:?}"
            )));
        };
        let request = match DeviceRequest::parse(&data) {
            Ok(request) => request,
            Err(e) => {
                send_status(transport, STATUS_ERROR_CBOR_DECODING).await;
                return Err(Error::MalformedRequest(e.to_string()));
            }
        };
        tracing::info!("received request for {} documents", request.doc_requests.len());

        let mut documents = Vec::new();
        for doc_request in &request.doc_requests {
            let request = MdocRequest::from_doc_request(doc_request, Requester::default());
            match present_document(
                model,
                source,
                &request,
                Selection::Prompt,
                None,
                &session.transcript,
                Some(&session.e_reader_key),
            )
            .await?
            {
                Presented::Document(document) => documents.push(document),
                Presented::NoCredential | Presented::Declined => {
                    tracing::info!("not returning {}", request.doc_type)
                }
            }
        }

        let response = DeviceResponse::new(documents).to_bytes()?;
        let status = (!allow_multiple_requests).then_some(STATUS_SESSION_TERMINATION);
        let message = session.encryption.encrypt_message(Some(&response), status)?;
        transport.send_message(&message).await?;
        model.request_served();
        tracing::info!("response sent");
        if !allow_multiple_requests {
            return Ok(());
        }
    }
}
