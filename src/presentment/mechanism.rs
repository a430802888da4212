//! The channel a presentment answers over.
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use p256::SecretKey;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::definitions::session::Handover;
use crate::transport::SharedTransport;

#[derive(Clone)]
pub enum PresentmentMechanism {
    /// Proximity presentment to a reader over an [`MdocTransport`](crate::transport::MdocTransport).
    Mdoc(MdocPresentmentMechanism),
    /// Same-device presentment through a platform credential API.
    DigitalCredentials(DigitalCredentialsPresentmentMechanism),
}

impl PresentmentMechanism {
    pub async fn close(&self) {
        match self {
            PresentmentMechanism::Mdoc(mechanism) => mechanism.transport.close().await,
            PresentmentMechanism::DigitalCredentials(mechanism) => mechanism.close(),
        }
    }
}

impl std::fmt::Debug for PresentmentMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresentmentMechanism::Mdoc(mechanism) => f
                .debug_struct("Mdoc")
                .field("transport", &mechanism.transport)
                .finish(),
            PresentmentMechanism::DigitalCredentials(mechanism) => f
                .debug_struct("DigitalCredentials")
                .field("protocol", &mechanism.protocol)
                .finish(),
        }
    }
}

/// A connected transport plus what the mdoc sent during engagement.
#[derive(Clone)]
pub struct MdocPresentmentMechanism {
    pub transport: SharedTransport,
    /// The mdoc's ephemeral session key, the private half of `EDeviceKey`.
    pub e_device_key: SecretKey,
    /// `DeviceEngagement` exactly as encoded in the QR code or NFC handover.
    pub encoded_device_engagement: Vec<u8>,
    pub handover: Handover,
    /// How long engagement took, for diagnostics.
    pub engagement_duration: Option<Duration>,
    /// Keep the session open after a response. Also enabled by
    /// [`PresentmentConfig::allow_multiple_requests`](crate::PresentmentConfig).
    pub allow_multiple_requests: bool,
}

/// The answer handed back to the platform API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigitalCredentialsResponse {
    pub protocol: String,
    pub data: serde_json::Value,
}

/// A single request received through a platform credential API such as the W3C Digital
/// Credentials API.
#[derive(Clone)]
pub struct DigitalCredentialsPresentmentMechanism {
    /// The calling app, when known.
    pub app_id: Option<String>,
    /// Origin of the requesting web page, when the request comes from a browser.
    pub web_origin: Option<String>,
    pub protocol: String,
    pub data: serde_json::Value,
    /// Document already chosen in the platform's own picker.
    pub pre_selected_document: Option<String>,
    response: Arc<Mutex<Option<oneshot::Sender<DigitalCredentialsResponse>>>>,
}

impl DigitalCredentialsPresentmentMechanism {
    /// Returns the mechanism and the receiver the platform caller awaits the response on. The
    /// receiver fails if the presentment ends without a response.
    pub fn new(
        app_id: Option<String>,
        web_origin: Option<String>,
        protocol: impl Into<String>,
        data: serde_json::Value,
        pre_selected_document: Option<String>,
    ) -> (Self, oneshot::Receiver<DigitalCredentialsResponse>) {
        let (tx, rx) = oneshot::channel();
        let mechanism = DigitalCredentialsPresentmentMechanism {
            app_id,
            web_origin,
            protocol: protocol.into(),
            data,
            pre_selected_document,
            response: Arc::new(Mutex::new(Some(tx))),
        };
        (mechanism, rx)
    }

    /// Delivers the response. Returns `false` if a response was already sent, the mechanism was
    /// closed, or nobody is waiting any more.
    pub fn send_response(&self, response: DigitalCredentialsResponse) -> bool {
        match self.response.lock().take() {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    fn close(&self) {
        if self.response.lock().take().is_some() {
            tracing::debug!("closed {} request without a response", self.protocol);
        }
    }
}
