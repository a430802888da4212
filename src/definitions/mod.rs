pub mod cose_key;
pub mod device_engagement;
pub mod device_request;
pub mod device_response;
pub mod helpers;
pub mod session;

pub use cose_key::CoseKey;
pub use device_engagement::{BleOptions, ConnectionMethod, DeviceEngagement, NfcOptions, Security};
pub use device_request::{DeviceRequest, DocRequest, ItemsRequest};
pub use device_response::{
    DeviceAuth, DeviceResponse, DeviceSigned, Document, IssuerSigned, IssuerSignedItem,
};
pub use session::{
    Handover, Role, SessionData, SessionEncryption, SessionEstablishment, SessionTranscript,
};
