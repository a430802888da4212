use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use super::framing::MessageReceiver;
use super::transport::{BleLink, Channel, HandshakeProgress};
use super::{
    calculate_ble_ident, BleCentralManager, BleError, BleMode, GattCharacteristics,
    GattEventSender, STATE_START,
};
use crate::definitions::device_engagement::{BleOptions, ConnectionMethod};
use crate::transport::{Role, State, TransportError, TransportOptions};

/// The GATT client side of a BLE connection.
///
/// An mdoc acting as central uses central client mode, finds the reader by the advertised
/// service UUID and checks the reader's ident. A reader acting as central uses peripheral
/// server mode, and skips GATT entirely when the engagement carries an L2CAP PSM.
pub struct CentralLink {
    role: Role,
    options: BleOptions,
    mode: BleMode,
    service: Uuid,
    transport_options: TransportOptions,
    manager: Arc<dyn BleCentralManager>,
}

impl CentralLink {
    pub fn new(
        role: Role,
        options: BleOptions,
        transport_options: TransportOptions,
        manager: Arc<dyn BleCentralManager>,
    ) -> Result<Self, TransportError> {
        let (mode, service) = match role {
            Role::Mdoc => (BleMode::CentralClient, options.central_client_mode_uuid),
            Role::MdocReader => (BleMode::PeripheralServer, options.peripheral_server_mode_uuid),
        };
        let service = service.ok_or_else(|| {
            TransportError::UnsupportedConnectionMethod(format!(
                "no service UUID for {mode:?} mode"
            ))
        })?;
        Ok(CentralLink {
            role,
            options,
            mode,
            service,
            transport_options,
            manager,
        })
    }

    /// PSM known before connecting, only in peripheral server mode.
    fn known_psm(&self) -> Option<u16> {
        match self.mode {
            BleMode::PeripheralServer => self.options.peripheral_server_mode_psm,
            BleMode::CentralClient => None,
        }
    }

    fn mac_address(&self) -> Option<&[u8]> {
        match self.mode {
            BleMode::PeripheralServer => self.options.peripheral_server_mode_mac_address.as_deref(),
            BleMode::CentralClient => None,
        }
    }

    async fn verify_ident(
        &self,
        ident_characteristic: Uuid,
        e_device_key: &p256::PublicKey,
    ) -> Result<(), TransportError> {
        let expected = calculate_ble_ident(e_device_key)?;
        let ident = self.manager.read_characteristic(ident_characteristic).await?;
        if ident != expected {
            tracing::error!(
                "ident mismatch, expected {} got {}",
                hex::encode(expected),
                hex::encode(&ident)
            );
            return Err(BleError::IdentMismatch.into());
        }
        tracing::debug!("reader ident verified");
        Ok(())
    }

    /// Reads the PSM the peripheral serves, if any.
    async fn read_psm(&self, characteristic: Uuid) -> Option<u16> {
        let value = match self.manager.read_characteristic(characteristic).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("unable to read L2CAP PSM: {e}");
                return None;
            }
        };
        match value.as_slice() {
            [hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
            [0, 0, hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
            _ => {
                tracing::warn!("unexpected L2CAP PSM value {}", hex::encode(&value));
                None
            }
        }
    }
}

#[async_trait]
impl BleLink for CentralLink {
    fn role(&self) -> Role {
        self.role
    }

    fn connection_method(&self) -> ConnectionMethod {
        ConnectionMethod::Ble(self.options.clone())
    }

    fn characteristics(&self) -> GattCharacteristics {
        self.mode.characteristics()
    }

    fn inbound(&self) -> Uuid {
        self.characteristics().server2client
    }

    async fn advertise(&self, _events: GattEventSender) -> Result<bool, TransportError> {
        Ok(false)
    }

    async fn connect(
        &self,
        e_sender_key: &p256::PublicKey,
        events: GattEventSender,
        _receiver: &MessageReceiver,
        progress: &dyn HandshakeProgress,
    ) -> Result<Channel, TransportError> {
        progress.set_state(State::Scanning);
        self.manager.wait_for_powered_on().await?;
        let started = Instant::now();
        self.manager
            .scan_for_peripheral(self.service, self.mac_address())
            .await?;
        let scanning_time = started.elapsed();
        tracing::info!("found peripheral {} after {scanning_time:?}", self.service);
        progress.set_scanning_time(scanning_time);
        progress.set_state(State::Connecting);
        self.manager.connect_to_peripheral(events).await?;

        if let (Some(psm), true) = (self.known_psm(), self.transport_options.ble_use_l2cap) {
            tracing::info!("connecting to L2CAP PSM {psm} from engagement");
            let socket = self.manager.connect_l2cap(psm).await?;
            return Ok(Channel::L2cap(Arc::from(socket)));
        }

        let mtu = self
            .manager
            .request_mtu(self.transport_options.ble_desired_mtu)
            .await?;
        tracing::debug!("negotiated MTU {mtu}");
        let discovered = self.manager.discover_characteristics(self.service).await?;
        let characteristics = self.characteristics();
        for required in [
            characteristics.state,
            characteristics.client2server,
            characteristics.server2client,
        ] {
            if !discovered.contains(&required) {
                return Err(BleError::CharacteristicNotFound(required).into());
            }
        }
        if let Some(ident) = characteristics.ident.filter(|ident| discovered.contains(ident)) {
            if self.role == Role::Mdoc {
                self.verify_ident(ident, e_sender_key).await?;
            }
        }

        if self.transport_options.ble_use_l2cap && discovered.contains(&characteristics.l2cap) {
            if let Some(psm) = self.read_psm(characteristics.l2cap).await {
                match self.manager.connect_l2cap(psm).await {
                    Ok(socket) => {
                        tracing::info!("using L2CAP PSM {psm}");
                        return Ok(Channel::L2cap(Arc::from(socket)));
                    }
                    Err(e) => tracing::warn!("L2CAP connection failed, using GATT: {e}"),
                }
            }
        }

        self.manager.subscribe(characteristics.state).await?;
        self.manager.subscribe(characteristics.server2client).await?;
        self.manager
            .write_characteristic(characteristics.state, &[STATE_START])
            .await?;
        Ok(Channel::Gatt { mtu })
    }

    async fn write_characteristic(
        &self,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        Ok(self
            .manager
            .write_characteristic(characteristic, value)
            .await?)
    }

    async fn close(&self) {
        self.manager.close().await;
    }
}
