use std::sync::Arc;

use crate::definitions::device_engagement::ConnectionMethod;
use crate::transport::ble::{
    BleCentralManager, BlePeripheralManager, BleTransport, CentralLink, PeripheralLink,
};
use crate::transport::{Role, SharedTransport, TransportError, TransportOptions};

/// Creates transports for connection methods.
pub trait MdocTransportFactory: Send + Sync {
    /// `method` must name a single mode, see [`ConnectionMethod::disambiguate`].
    fn create_transport(
        &self,
        method: &ConnectionMethod,
        role: Role,
        options: &TransportOptions,
    ) -> Result<SharedTransport, TransportError>;
}

type Provider<T> = Arc<dyn Fn() -> Arc<T> + Send + Sync>;

/// Builds BLE transports, getting a fresh platform manager for each one.
#[derive(Clone, Default)]
pub struct BleTransportFactory {
    central: Option<Provider<dyn BleCentralManager>>,
    peripheral: Option<Provider<dyn BlePeripheralManager>>,
}

impl BleTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_central(
        mut self,
        provider: impl Fn() -> Arc<dyn BleCentralManager> + Send + Sync + 'static,
    ) -> Self {
        self.central = Some(Arc::new(provider));
        self
    }

    pub fn with_peripheral(
        mut self,
        provider: impl Fn() -> Arc<dyn BlePeripheralManager> + Send + Sync + 'static,
    ) -> Self {
        self.peripheral = Some(Arc::new(provider));
        self
    }

    fn central_manager(&self) -> Result<Arc<dyn BleCentralManager>, TransportError> {
        self.central.as_ref().map(|provider| provider()).ok_or_else(|| {
            TransportError::UnsupportedConnectionMethod("BLE central role is not available".into())
        })
    }

    fn peripheral_manager(&self) -> Result<Arc<dyn BlePeripheralManager>, TransportError> {
        self.peripheral.as_ref().map(|provider| provider()).ok_or_else(|| {
            TransportError::UnsupportedConnectionMethod(
                "BLE peripheral role is not available".into(),
            )
        })
    }
}

impl MdocTransportFactory for BleTransportFactory {
    fn create_transport(
        &self,
        method: &ConnectionMethod,
        role: Role,
        options: &TransportOptions,
    ) -> Result<SharedTransport, TransportError> {
        let ConnectionMethod::Ble(ble) = method else {
            return Err(TransportError::UnsupportedConnectionMethod(format!(
                "{method:?}"
            )));
        };
        // In central client mode the mdoc is the central, in peripheral server mode the reader is.
        let local_is_central = match (
            ble.supports_central_client_mode,
            ble.supports_peripheral_server_mode,
        ) {
            (true, false) => role == Role::Mdoc,
            (false, true) => role == Role::MdocReader,
            (true, true) => {
                return Err(TransportError::UnsupportedConnectionMethod(
                    "BLE method offers both modes, disambiguate it first".into(),
                ))
            }
            (false, false) => {
                return Err(TransportError::UnsupportedConnectionMethod(
                    "BLE method offers no mode".into(),
                ))
            }
        };
        let transport: SharedTransport = if local_is_central {
            Arc::new(BleTransport::new(CentralLink::new(
                role,
                ble.clone(),
                options.clone(),
                self.central_manager()?,
            )?))
        } else {
            Arc::new(BleTransport::new(PeripheralLink::new(
                role,
                ble.clone(),
                options.clone(),
                self.peripheral_manager()?,
            )?))
        };
        tracing::debug!("created {role:?} transport for {method:?}");
        Ok(transport)
    }
}
