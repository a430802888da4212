//! Presenting ISO/IEC 18013-5 mdocs.
//!
//! [`presentment::PresentmentModel`] drives one presentment session, either over a proximity
//! [`transport`] such as BLE or through a same-device platform credential API. The wire types
//! live in [`definitions`].
pub mod cbor;
pub mod config;
pub mod definitions;
pub mod hpke;
pub mod presentment;
pub mod transport;

pub use config::PresentmentConfig;
pub use presentment::{PresentmentModel, PresentmentSource};
pub use transport::{MdocTransport, MdocTransportFactory};
