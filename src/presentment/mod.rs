//! Presenting mdocs: the session state machine, and the protocol flows it runs.
pub mod digital_credentials;
mod error;
mod mdoc;
mod mechanism;
mod model;
mod response;
mod source;

pub use error::{Error, Outcome};
pub use mechanism::{
    DigitalCredentialsPresentmentMechanism, DigitalCredentialsResponse, MdocPresentmentMechanism,
    PresentmentMechanism,
};
pub use model::{ConsentData, DismissType, PresentmentModel, State, StateKind};
pub use response::generate_document;
pub use source::{
    DocumentInfo, KeyError, MdocCredential, MdocRequest, PresentmentSource, RequestedClaim,
    Requester, SecureAreaKey, SourceError, TrustPoint,
};
