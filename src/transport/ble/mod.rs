//! BLE transport for mdoc retrieval (ISO/IEC 18013-5 clause 8.3.3.1.1).
//!
//! Platform Bluetooth stacks plug in through [`BleCentralManager`] and [`BlePeripheralManager`].
//! Everything above those traits (GATT framing, L2CAP message splitting, the connection state
//! machine) lives in this module.
use async_trait::async_trait;
use hkdf::Hkdf;
use sha2::Sha256;
use tokio::sync::mpsc;
use uuid::{uuid, Uuid};

use crate::definitions::cose_key::CoseKey;
use crate::definitions::helpers::tag24::Tag24;
use crate::transport::TransportError;

mod central;
mod framing;
mod peripheral;
mod transport;

pub use central::CentralLink;
pub use framing::{gatt_chunks, GattReassembler, Handshake, L2capReassembler, MessageReceiver};
pub use peripheral::PeripheralLink;
pub use transport::{BleLink, BleTransport, Channel, HandshakeProgress};

/// Written to the state characteristic to start a session.
pub const STATE_START: u8 = 0x01;
/// Written to the state characteristic to end a session.
pub const STATE_END: u8 = 0x02;

/// First byte of a GATT chunk when more chunks follow.
pub const CHUNK_MORE: u8 = 0x01;
/// First byte of the last GATT chunk of a message.
pub const CHUNK_LAST: u8 = 0x00;

/// Which side runs the GATT server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BleMode {
    /// The mdoc is the GATT server.
    PeripheralServer,
    /// The reader is the GATT server.
    CentralClient,
}

/// Characteristic UUIDs of the mdoc service in one mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattCharacteristics {
    pub state: Uuid,
    pub client2server: Uuid,
    pub server2client: Uuid,
    /// Only served by a reader acting as GATT server.
    pub ident: Option<Uuid>,
    pub l2cap: Uuid,
}

impl BleMode {
    pub fn characteristics(self) -> GattCharacteristics {
        match self {
            BleMode::PeripheralServer => GattCharacteristics {
                state: uuid!("00000001-a123-48ce-896b-4c76973373e6"),
                client2server: uuid!("00000002-a123-48ce-896b-4c76973373e6"),
                server2client: uuid!("00000003-a123-48ce-896b-4c76973373e6"),
                ident: None,
                l2cap: uuid!("0000000a-a123-48ce-896b-4c76973373e6"),
            },
            BleMode::CentralClient => GattCharacteristics {
                state: uuid!("00000005-a123-48ce-896b-4c76973373e6"),
                client2server: uuid!("00000006-a123-48ce-896b-4c76973373e6"),
                server2client: uuid!("00000007-a123-48ce-896b-4c76973373e6"),
                ident: Some(uuid!("00000008-a123-48ce-896b-4c76973373e6")),
                l2cap: uuid!("0000000b-a123-48ce-896b-4c76973373e6"),
            },
        }
    }
}

/// The GATT service a peripheral publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: GattCharacteristics,
    /// Value served from the ident characteristic, if there is one.
    pub ident: Option<[u8; 16]>,
    /// Open an L2CAP server and serve its PSM from the L2CAP characteristic.
    pub listen_l2cap: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BleError {
    #[error("bluetooth is not available: {0}")]
    Unavailable(String),
    #[error("no peripheral advertising {0} was found")]
    PeripheralNotFound(Uuid),
    #[error("characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),
    #[error("L2CAP is not available")]
    L2capUnavailable,
    #[error("ident mismatch")]
    IdentMismatch,
    #[error("IO error: {0}")]
    Io(String),
}

impl From<BleError> for TransportError {
    fn from(e: BleError) -> Self {
        TransportError::Failed(e.to_string())
    }
}

/// Something that happened on a BLE connection.
pub enum GattEvent {
    /// A central wrote a characteristic, or a peripheral notified one.
    CharacteristicValue { characteristic: Uuid, value: Vec<u8> },
    /// A central opened our L2CAP server.
    L2capConnected(Box<dyn L2capSocket>),
    /// Bytes arrived on the L2CAP channel.
    L2capData(Vec<u8>),
    Disconnected,
    Error(String),
}

impl std::fmt::Debug for GattEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GattEvent::CharacteristicValue {
                characteristic,
                value,
            } => f
                .debug_struct("CharacteristicValue")
                .field("characteristic", characteristic)
                .field("len", &value.len())
                .finish(),
            GattEvent::L2capConnected(_) => f.write_str("L2capConnected"),
            GattEvent::L2capData(data) => f.debug_tuple("L2capData").field(&data.len()).finish(),
            GattEvent::Disconnected => f.write_str("Disconnected"),
            GattEvent::Error(e) => f.debug_tuple("Error").field(e).finish(),
        }
    }
}

pub type GattEventSender = mpsc::UnboundedSender<GattEvent>;
pub type GattEventReceiver = mpsc::UnboundedReceiver<GattEvent>;

/// An open L2CAP connection-oriented channel. Incoming data arrives as [`GattEvent::L2capData`].
#[async_trait]
pub trait L2capSocket: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<(), BleError>;
    async fn close(&self);
}

/// Platform BLE central role, connecting to a single peripheral.
#[async_trait]
pub trait BleCentralManager: Send + Sync {
    async fn wait_for_powered_on(&self) -> Result<(), BleError>;

    /// Scans until a peripheral advertising `service` is found, matching `mac_address` if given.
    async fn scan_for_peripheral(
        &self,
        service: Uuid,
        mac_address: Option<&[u8]>,
    ) -> Result<(), BleError>;

    /// Connects to the peripheral found by the last scan. Connection events, notifications and
    /// L2CAP data are delivered to `events`.
    async fn connect_to_peripheral(&self, events: GattEventSender) -> Result<(), BleError>;

    /// Negotiates the ATT MTU and returns the value in effect.
    async fn request_mtu(&self, desired: usize) -> Result<usize, BleError>;

    /// Discovers `service` and returns the UUIDs of its characteristics.
    async fn discover_characteristics(&self, service: Uuid) -> Result<Vec<Uuid>, BleError>;

    async fn read_characteristic(&self, characteristic: Uuid) -> Result<Vec<u8>, BleError>;

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), BleError>;

    async fn write_characteristic(
        &self,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), BleError>;

    async fn connect_l2cap(&self, psm: u16) -> Result<Box<dyn L2capSocket>, BleError>;

    /// Disconnects and releases everything. Must be safe to call at any point.
    async fn close(&self);
}

/// Platform BLE peripheral role, serving a single central.
#[async_trait]
pub trait BlePeripheralManager: Send + Sync {
    async fn wait_for_powered_on(&self) -> Result<(), BleError>;

    /// Publishes `service` and starts advertising it. Writes from the central and L2CAP
    /// connections are delivered to `events`. Returns the PSM when listening on L2CAP.
    async fn advertise_service(
        &self,
        service: &GattService,
        events: GattEventSender,
    ) -> Result<Option<u16>, BleError>;

    /// ATT MTU negotiated with the connected central.
    fn mtu(&self) -> usize;

    async fn notify(&self, characteristic: Uuid, value: &[u8]) -> Result<(), BleError>;

    /// Stops advertising, disconnects and releases everything. Must be safe to call at any
    /// point.
    async fn close(&self);
}

/// Derives the 16-byte ident a reader serves so the mdoc can tell it found the right peer:
/// `HKDF-SHA256(EDeviceKeyBytes, info = "BLEIdent")`.
pub fn calculate_ble_ident(e_device_key: &p256::PublicKey) -> Result<[u8; 16], TransportError> {
    let e_device_key_bytes = Tag24::new(CoseKey(*e_device_key))
        .map_err(|e| TransportError::Failed(e.to_string()))?
        .inner_bytes;
    let mut ble_ident = [0u8; 16];
    Hkdf::<Sha256>::new(None, &e_device_key_bytes)
        .expand(b"BLEIdent", &mut ble_ident)
        .map_err(|e| TransportError::Failed(e.to_string()))?;
    Ok(ble_ident)
}
