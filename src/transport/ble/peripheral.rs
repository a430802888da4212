use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::framing::{Handshake, MessageReceiver};
use super::transport::{BleLink, Channel, HandshakeProgress};
use super::{
    calculate_ble_ident, BleMode, BlePeripheralManager, GattCharacteristics, GattEventSender,
    GattService, STATE_START,
};
use crate::definitions::device_engagement::{BleOptions, ConnectionMethod};
use crate::transport::{Role, TransportError, TransportOptions};

/// The GATT server side of a BLE connection.
///
/// An mdoc acting as peripheral uses peripheral server mode and advertises as soon as asked, so
/// the PSM of its L2CAP server can go into the engagement. A reader acting as peripheral uses
/// central client mode and has to serve an ident derived from the mdoc's key, so it only starts
/// advertising once [`BleLink::connect`] hands it that key.
pub struct PeripheralLink {
    role: Role,
    options: BleOptions,
    mode: BleMode,
    service: Uuid,
    transport_options: TransportOptions,
    manager: Arc<dyn BlePeripheralManager>,
    /// `Some` once advertising, holding the PSM of the L2CAP server if there is one.
    advertised: Mutex<Option<Option<u16>>>,
}

impl PeripheralLink {
    pub fn new(
        role: Role,
        options: BleOptions,
        transport_options: TransportOptions,
        manager: Arc<dyn BlePeripheralManager>,
    ) -> Result<Self, TransportError> {
        let (mode, service) = match role {
            Role::Mdoc => (BleMode::PeripheralServer, options.peripheral_server_mode_uuid),
            Role::MdocReader => (BleMode::CentralClient, options.central_client_mode_uuid),
        };
        let service = service.ok_or_else(|| {
            TransportError::UnsupportedConnectionMethod(format!(
                "no service UUID for {mode:?} mode"
            ))
        })?;
        Ok(PeripheralLink {
            role,
            options,
            mode,
            service,
            transport_options,
            manager,
            advertised: Mutex::new(None),
        })
    }

    async fn start_advertising(
        &self,
        ident: Option<[u8; 16]>,
        events: GattEventSender,
    ) -> Result<(), TransportError> {
        if self.advertised.lock().is_some() {
            return Ok(());
        }
        self.manager.wait_for_powered_on().await?;
        let service = GattService {
            uuid: self.service,
            characteristics: self.characteristics(),
            ident,
            listen_l2cap: self.transport_options.ble_use_l2cap,
        };
        let psm = self.manager.advertise_service(&service, events).await?;
        tracing::info!("advertising {} (L2CAP PSM {psm:?})", self.service);
        *self.advertised.lock() = Some(psm);
        Ok(())
    }
}

#[async_trait]
impl BleLink for PeripheralLink {
    fn role(&self) -> Role {
        self.role
    }

    fn connection_method(&self) -> ConnectionMethod {
        let mut options = self.options.clone();
        if self.mode == BleMode::PeripheralServer {
            if let Some(Some(psm)) = *self.advertised.lock() {
                options.peripheral_server_mode_psm = Some(psm);
            }
        }
        ConnectionMethod::Ble(options)
    }

    fn characteristics(&self) -> GattCharacteristics {
        self.mode.characteristics()
    }

    fn inbound(&self) -> Uuid {
        self.characteristics().client2server
    }

    async fn advertise(&self, events: GattEventSender) -> Result<bool, TransportError> {
        match self.role {
            Role::Mdoc => {
                self.start_advertising(None, events).await?;
                Ok(true)
            }
            Role::MdocReader => Ok(false),
        }
    }

    async fn connect(
        &self,
        e_sender_key: &p256::PublicKey,
        events: GattEventSender,
        receiver: &MessageReceiver,
        _progress: &dyn HandshakeProgress,
    ) -> Result<Channel, TransportError> {
        let ident = match self.role {
            Role::MdocReader => Some(calculate_ble_ident(e_sender_key)?),
            Role::Mdoc => None,
        };
        self.start_advertising(ident, events).await?;

        let characteristics = self.characteristics();
        loop {
            match receiver
                .next_handshake(characteristics.state, characteristics.client2server)
                .await?
            {
                Handshake::State(value) if value == [STATE_START] => {
                    let mtu = self.manager.mtu();
                    tracing::info!("central started a GATT session, MTU {mtu}");
                    return Ok(Channel::Gatt { mtu });
                }
                Handshake::State(value) => {
                    tracing::debug!("ignoring state value {} before start", hex::encode(&value));
                }
                Handshake::L2capConnected(socket) => {
                    tracing::info!("central connected over L2CAP");
                    return Ok(Channel::L2cap(Arc::from(socket)));
                }
            }
        }
    }

    async fn write_characteristic(
        &self,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        Ok(self.manager.notify(characteristic, value).await?)
    }

    async fn close(&self) {
        self.manager.close().await;
    }
}
