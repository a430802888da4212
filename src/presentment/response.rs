//! Building the document returned for a single request.
use std::collections::BTreeMap;
use std::sync::Arc;

use coset::iana;
use coset::{
    mac_structure_data, sig_structure_data, AsCborValue, CoseMac0, CoseSign1, Header,
    HeaderBuilder, MacContext, ProtectedHeader, SignatureContext,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::cbor;
use crate::definitions::device_response::{
    device_authentication_bytes, DeviceAuth, DeviceNamespaces, DeviceSigned, Document,
    IssuerSigned,
};
use crate::definitions::helpers::tag24::Tag24;
use crate::definitions::session::SessionTranscript;
use crate::presentment::error::Error;
use crate::presentment::model::PresentmentModel;
use crate::presentment::source::{
    KeyError, MdocCredential, MdocRequest, PresentmentSource, SecureAreaKey,
};

/// How to pick among several matching credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Selection {
    /// Ask the user.
    Prompt,
    /// Take the first one.
    FirstMatch,
}

/// Result of trying to answer one document request.
pub(crate) enum Presented {
    Document(Document),
    NoCredential,
    Declined,
}

/// Resolves a credential for `request`, asks for consent if the policy says so, and builds the
/// document.
pub(crate) async fn present_document(
    model: &PresentmentModel,
    source: &dyn PresentmentSource,
    request: &MdocRequest,
    selection: Selection,
    pre_selected_document: Option<&str>,
    session_transcript: &SessionTranscript,
    e_reader_key: Option<&p256::PublicKey>,
) -> Result<Presented, Error> {
    let mut credentials = source
        .select_credential_for_presentment(request, pre_selected_document)
        .await?;
    let credential: Arc<dyn MdocCredential> = match (credentials.len(), selection) {
        (0, _) => {
            tracing::warn!("no credential for {}", request.doc_type);
            return Ok(Presented::NoCredential);
        }
        (1, _) | (_, Selection::FirstMatch) => credentials.swap_remove(0),
        (_, Selection::Prompt) => match model.show_credential_picker(credentials).await? {
            Some(credential) => credential,
            None => {
                tracing::info!("user chose no document for {}", request.doc_type);
                return Ok(Presented::Declined);
            }
        },
    };

    if source.should_show_consent_prompt(credential.as_ref(), request) {
        let trust_point = source.find_trust_point(request).await;
        let consented = model
            .show_consent_prompt(credential.clone(), request.clone(), trust_point)
            .await?;
        if !consented {
            tracing::info!("user declined to share {}", credential.document_id());
            return Ok(Presented::Declined);
        }
    }

    let e_reader_key = e_reader_key.filter(|_| {
        !source.should_prefer_signature_to_key_agreement(credential.as_ref(), request)
    });
    let document =
        generate_document(credential.as_ref(), request, session_transcript, e_reader_key).await?;
    Ok(Presented::Document(document))
}

/// Builds the `Document` answering `request` from `credential`.
///
/// Only issuer-signed items that were asked for are included. The device namespaces are empty.
/// Device authentication is a MAC when `e_reader_key` is given, a signature otherwise.
pub async fn generate_document(
    credential: &dyn MdocCredential,
    request: &MdocRequest,
    session_transcript: &SessionTranscript,
    e_reader_key: Option<&p256::PublicKey>,
) -> Result<Document, Error> {
    let issuer_signed: IssuerSigned = cbor::from_slice(credential.issuer_provided_data())?;
    let available = issuer_signed.namespaces.unwrap_or_default();

    let mut namespaces = BTreeMap::new();
    for claim in &request.claims {
        let item = available.get(&claim.namespace).and_then(|items| {
            items
                .iter()
                .find(|item| item.as_ref().element_identifier == claim.element_identifier)
        });
        match item {
            Some(item) => namespaces
                .entry(claim.namespace.clone())
                .or_insert_with(Vec::new)
                .push(item.clone()),
            None => tracing::debug!(
                "{} has no {}/{}",
                credential.document_id(),
                claim.namespace,
                claim.element_identifier
            ),
        }
    }

    let device_namespaces = Tag24::new(DeviceNamespaces::default())
        .map_err(|e| Error::Cbor(cbor::semantic(e.to_string()).into()))?;
    let payload =
        device_authentication_bytes(session_transcript, &request.doc_type, &device_namespaces)?;
    let key = credential.device_key();
    let device_auth = match e_reader_key {
        Some(e_reader_key) => {
            device_mac(key.as_ref(), e_reader_key, session_transcript, &payload).await?
        }
        None => device_signature(key.as_ref(), &payload).await?,
    };

    Ok(Document {
        doc_type: request.doc_type.clone(),
        issuer_signed: IssuerSigned {
            namespaces: (!namespaces.is_empty()).then_some(namespaces),
            issuer_auth: issuer_signed.issuer_auth,
        },
        device_signed: DeviceSigned {
            namespaces: device_namespaces,
            device_auth,
        },
    })
}

async fn device_signature(key: &dyn SecureAreaKey, payload: &[u8]) -> Result<DeviceAuth, Error> {
    let protected = ProtectedHeader {
        original_data: None,
        header: HeaderBuilder::new()
            .algorithm(iana::Algorithm::ES256)
            .build(),
    };
    let to_be_signed =
        sig_structure_data(SignatureContext::CoseSign1, protected.clone(), None, &[], payload);
    let signature = key.sign(&to_be_signed).await?;
    let cose_sign1 = CoseSign1 {
        protected,
        unprotected: Header::default(),
        payload: None,
        signature,
    };
    Ok(DeviceAuth::DeviceSignature(cose_sign1.to_cbor_value()?))
}

async fn device_mac(
    key: &dyn SecureAreaKey,
    e_reader_key: &p256::PublicKey,
    session_transcript: &SessionTranscript,
    payload: &[u8],
) -> Result<DeviceAuth, Error> {
    let shared_secret = key.key_agreement(e_reader_key).await?;
    let salt = Sha256::digest(session_transcript.to_tagged_bytes()?);
    let mut e_mac_key = zeroize::Zeroizing::new([0u8; 32]);
    Hkdf::<Sha256>::new(Some(salt.as_slice()), &shared_secret)
        .expand(b"EMacKey", &mut e_mac_key[..])
        .map_err(|_| KeyError::Failed("unable to derive EMacKey".into()))?;

    let protected = ProtectedHeader {
        original_data: None,
        header: HeaderBuilder::new()
            .algorithm(iana::Algorithm::HMAC_256_256)
            .build(),
    };
    let to_be_maced = mac_structure_data(MacContext::CoseMac0, protected.clone(), &[], payload);
    let mut mac = Hmac::<Sha256>::new_from_slice(&e_mac_key[..])
        .map_err(|_| KeyError::Failed("invalid EMacKey".into()))?;
    mac.update(&to_be_maced);
    let cose_mac0 = CoseMac0 {
        protected,
        unprotected: Header::default(),
        payload: None,
        tag: mac.finalize().into_bytes().to_vec(),
    };
    Ok(DeviceAuth::DeviceMac(cose_mac0.to_cbor_value()?))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::definitions::device_response::{IssuerSignedItem, IssuerSignedItemBytes};
    use crate::definitions::session::Handover;
    use crate::presentment::source::{RequestedClaim, Requester};
    use async_trait::async_trait;
    use ciborium::Value;
    use p256::ecdsa::signature::{Signer, Verifier};
    use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
    use p256::SecretKey;
    use rand::rngs::OsRng;
    use zeroize::Zeroizing;

    const NAMESPACE: &str = "org.iso.18013.5.1";

    struct Key(SecretKey);

    #[async_trait]
    impl SecureAreaKey for Key {
        fn public_key(&self) -> p256::PublicKey {
            self.0.public_key()
        }

        async fn sign(&self, data: &[u8]) -> Result<Vec<u8>, KeyError> {
            let signature: Signature = SigningKey::from(&self.0).sign(data);
            Ok(signature.to_bytes().to_vec())
        }

        async fn key_agreement(
            &self,
            other: &p256::PublicKey,
        ) -> Result<Zeroizing<Vec<u8>>, KeyError> {
            Ok(crate::definitions::session::get_shared_secret(other, &self.0))
        }
    }

    struct Credential {
        data: Vec<u8>,
        key: Arc<Key>,
    }

    impl MdocCredential for Credential {
        fn document_id(&self) -> &str {
            "doc-1"
        }

        fn document_name(&self) -> &str {
            "Driving licence"
        }

        fn doc_type(&self) -> &str {
            "org.iso.18013.5.1.mDL"
        }

        fn issuer_provided_data(&self) -> &[u8] {
            &self.data
        }

        fn device_key(&self) -> Arc<dyn SecureAreaKey> {
            self.key.clone()
        }
    }

    fn item(identifier: &str, value: Value) -> IssuerSignedItemBytes {
        Tag24::new(IssuerSignedItem {
            digest_id: 0,
            random: vec![1; 16],
            element_identifier: identifier.into(),
            element_value: value,
        })
        .unwrap()
    }

    fn credential() -> Credential {
        let issuer_signed = IssuerSigned {
            namespaces: Some(BTreeMap::from([(
                NAMESPACE.to_string(),
                vec![
                    item("family_name", Value::Text("Mustermann".into())),
                    item("given_name", Value::Text("Erika".into())),
                    item("age_over_18", Value::Bool(true)),
                ],
            )])),
            issuer_auth: Value::Null,
        };
        Credential {
            data: cbor::to_vec(&issuer_signed).unwrap(),
            key: Arc::new(Key(SecretKey::random(&mut OsRng))),
        }
    }

    fn request(elements: &[&str]) -> MdocRequest {
        MdocRequest {
            doc_type: "org.iso.18013.5.1.mDL".into(),
            claims: elements
                .iter()
                .map(|element| RequestedClaim {
                    namespace: NAMESPACE.into(),
                    element_identifier: element.to_string(),
                    intent_to_retain: false,
                })
                .collect(),
            requester: Requester::default(),
        }
    }

    #[tokio::test]
    async fn only_requested_elements_are_returned() {
        let credential = credential();
        let transcript = SessionTranscript::handover_only(Handover::Qr);
        let document = generate_document(
            &credential,
            &request(&["age_over_18", "portrait"]),
            &transcript,
            None,
        )
        .await
        .unwrap();
        assert_eq!(
            document.issuer_elements(),
            vec![(NAMESPACE, "age_over_18", &Value::Bool(true))]
        );
    }

    #[tokio::test]
    async fn signature_covers_device_authentication() {
        let credential = credential();
        let transcript = SessionTranscript::handover_only(Handover::Qr);
        let request = request(&["family_name"]);
        let document = generate_document(&credential, &request, &transcript, None)
            .await
            .unwrap();

        let sign1 = document.device_signed.device_auth.signature().unwrap();
        assert!(sign1.payload.is_none());
        let payload = device_authentication_bytes(
            &transcript,
            &request.doc_type,
            &document.device_signed.namespaces,
        )
        .unwrap();
        let to_be_signed = sig_structure_data(
            SignatureContext::CoseSign1,
            sign1.protected.clone(),
            None,
            &[],
            &payload,
        );
        let verifying_key = VerifyingKey::from(credential.key.0.public_key());
        let signature = Signature::from_slice(&sign1.signature).unwrap();
        assert!(verifying_key.verify(&to_be_signed, &signature).is_ok());
    }

    #[tokio::test]
    async fn mac_when_reader_key_given() {
        let credential = credential();
        let reader_key = SecretKey::random(&mut OsRng);
        let transcript = SessionTranscript::handover_only(Handover::Qr);
        let request = request(&["given_name"]);
        let document = generate_document(
            &credential,
            &request,
            &transcript,
            Some(&reader_key.public_key()),
        )
        .await
        .unwrap();
        let mac0 = document.device_signed.device_auth.mac().unwrap();

        // the reader derives the same key from its side of the agreement
        let shared = crate::definitions::session::get_shared_secret(
            &credential.key.0.public_key(),
            &reader_key,
        );
        let salt = Sha256::digest(transcript.to_tagged_bytes().unwrap());
        let mut e_mac_key = [0u8; 32];
        Hkdf::<Sha256>::new(Some(salt.as_slice()), &shared)
            .expand(b"EMacKey", &mut e_mac_key)
            .unwrap();
        let payload = device_authentication_bytes(
            &transcript,
            &request.doc_type,
            &document.device_signed.namespaces,
        )
        .unwrap();
        let mut mac = Hmac::<Sha256>::new_from_slice(&e_mac_key).unwrap();
        mac.update(&mac_structure_data(
            MacContext::CoseMac0,
            mac0.protected.clone(),
            &[],
            &payload,
        ));
        assert!(mac.verify_slice(&mac0.tag).is_ok());
    }
}
