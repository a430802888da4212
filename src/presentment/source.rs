//! What a presentment needs from the wallet: credentials, their keys, and the policy deciding
//! what to show the user.
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use zeroize::Zeroizing;

use crate::definitions::device_request::DocRequest;

#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyError {
    #[error("key is locked")]
    Locked,
    #[error("key operation is not supported: {0}")]
    Unsupported(&'static str),
    #[error("key operation failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("document source failed: {0}")]
pub struct SourceError(pub String);

/// A device key held in a secure area. Only P-256 keys are supported.
#[async_trait]
pub trait SecureAreaKey: Send + Sync {
    fn public_key(&self) -> p256::PublicKey;

    /// ECDSA with SHA-256 over `data`, returning `r || s`.
    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>, KeyError>;

    /// ECDH with `other`, returning the shared secret.
    async fn key_agreement(&self, other: &p256::PublicKey)
        -> Result<Zeroizing<Vec<u8>>, KeyError>;
}

/// One issued instance of an mdoc: issuer-signed data bound to a device key.
pub trait MdocCredential: Send + Sync {
    /// Identifier of the document this credential belongs to.
    fn document_id(&self) -> &str;

    /// Name of the document as shown to the user.
    fn document_name(&self) -> &str;

    fn doc_type(&self) -> &str;

    /// The encoded `IssuerSigned` structure: every issuer-signed item plus the issuer's
    /// signature over the mobile security object.
    fn issuer_provided_data(&self) -> &[u8];

    fn device_key(&self) -> Arc<dyn SecureAreaKey>;
}

impl std::fmt::Debug for dyn MdocCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MdocCredential")
            .field("document_id", &self.document_id())
            .field("doc_type", &self.doc_type())
            .finish()
    }
}

/// A document as offered to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentInfo {
    pub document_id: String,
    pub name: String,
    pub doc_type: String,
}

impl DocumentInfo {
    pub fn of(credential: &dyn MdocCredential) -> Self {
        DocumentInfo {
            document_id: credential.document_id().to_string(),
            name: credential.document_name().to_string(),
            doc_type: credential.doc_type().to_string(),
        }
    }
}

/// A trusted issuer of reader certificates, shown alongside a consent prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustPoint {
    pub certificate: Vec<u8>,
    pub display_name: Option<String>,
    pub display_icon: Option<Vec<u8>>,
}

/// Who is asking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requester {
    /// DER certificates from the reader authentication, leaf first.
    pub certificate_chain: Option<Vec<Vec<u8>>>,
    pub app_id: Option<String>,
    pub web_origin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedClaim {
    pub namespace: String,
    pub element_identifier: String,
    pub intent_to_retain: bool,
}

/// A request for a single document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdocRequest {
    pub doc_type: String,
    pub claims: Vec<RequestedClaim>,
    pub requester: Requester,
}

impl MdocRequest {
    pub fn from_doc_request(doc_request: &DocRequest, mut requester: Requester) -> Self {
        let items_request = doc_request.items_request.as_ref();
        requester.certificate_chain = requester
            .certificate_chain
            .or_else(|| doc_request.reader_certificate_chain());
        let claims = items_request
            .namespaces
            .iter()
            .flat_map(|(namespace, elements)| {
                elements
                    .iter()
                    .map(move |(element_identifier, intent_to_retain)| RequestedClaim {
                        namespace: namespace.clone(),
                        element_identifier: element_identifier.clone(),
                        intent_to_retain: *intent_to_retain,
                    })
            })
            .collect();
        MdocRequest {
            doc_type: items_request.doc_type.clone(),
            claims,
            requester,
        }
    }
}

/// Resolves requests to credentials and decides how to present them.
#[async_trait]
pub trait PresentmentSource: Send + Sync {
    /// The trust point that issued the requester's certificate, if it is trusted.
    async fn find_trust_point(&self, request: &MdocRequest) -> Option<TrustPoint>;

    /// Credentials able to satisfy `request`, each from a different document. When
    /// `pre_selected_document` is set only that document may be used.
    async fn select_credential_for_presentment(
        &self,
        request: &MdocRequest,
        pre_selected_document: Option<&str>,
    ) -> Result<Vec<Arc<dyn MdocCredential>>, SourceError>;

    fn should_show_consent_prompt(
        &self,
        credential: &dyn MdocCredential,
        request: &MdocRequest,
    ) -> bool;

    /// Sign the response even when a MAC could be used.
    fn should_prefer_signature_to_key_agreement(
        &self,
        credential: &dyn MdocCredential,
        request: &MdocRequest,
    ) -> bool;
}
