//! This module contains the definitions for the [DeviceEngagement] struct and the connection
//! methods an mdoc advertises in it.
//!
//! Only device retrieval is modelled. Retrieval methods other than BLE and NFC are skipped when
//! decoding.
use ciborium::Value;
use coset::{AsCborValue, CborSerializable};
use serde::Serialize;
use uuid::Uuid;

use crate::cbor::{self, CborError};
use crate::definitions::cose_key::CoseKey;
use crate::definitions::helpers::tag24::Tag24;

pub type EDeviceKeyBytes = Tag24<CoseKey>;

const TYPE_NFC: u64 = 1;
const TYPE_BLE: u64 = 2;

const BLE_PERIPHERAL_SERVER_MODE: i64 = 0;
const BLE_CENTRAL_CLIENT_MODE: i64 = 1;
const BLE_PERIPHERAL_SERVER_UUID: i64 = 10;
const BLE_CENTRAL_CLIENT_UUID: i64 = 11;
const BLE_MAC_ADDRESS: i64 = 20;
const BLE_L2CAP_PSM: i64 = 2023;

/// Errors that can occur when deserialising a DeviceEngagement.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("Expected device engagement version 1.0")]
    UnsupportedVersion,
    #[error("Invalid DeviceEngagement found")]
    InvalidDeviceEngagement,
    #[error("Invalid NfcOptions found")]
    InvalidNfcOptions,
    #[error("Malformed object not recognised")]
    Malformed,
    #[error("Something went wrong parsing a cose key")]
    CoseKeyError,
    #[error("Could not deserialize from cbor")]
    SerdeCborError,
    #[error("BLE connection methods disagree on {0}")]
    ConflictingBleOptions(&'static str),
}

impl From<coset::CoseError> for Error {
    fn from(_: coset::CoseError) -> Self {
        Error::SerdeCborError
    }
}

impl From<Error> for coset::CoseError {
    fn from(e: Error) -> Self {
        cbor::semantic(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEngagement {
    pub version: String,
    pub security: Security,
    pub connection_methods: Vec<ConnectionMethod>,
}

/// Cipher suite identifier and the mdoc's ephemeral key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Security(pub u64, pub EDeviceKeyBytes);

/// A way to reach the mdoc for data retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionMethod {
    Ble(BleOptions),
    Nfc(NfcOptions),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BleOptions {
    pub supports_peripheral_server_mode: bool,
    pub supports_central_client_mode: bool,
    pub peripheral_server_mode_uuid: Option<Uuid>,
    pub central_client_mode_uuid: Option<Uuid>,
    pub peripheral_server_mode_psm: Option<u16>,
    pub peripheral_server_mode_mac_address: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NfcOptions {
    pub command_data_field_max_length: u64,
    pub response_data_field_max_length: u64,
}

impl DeviceEngagement {
    pub const VERSION: &'static str = "1.0";
    /// ECDH with P-256.
    pub const CIPHER_SUITE: u64 = 1;

    pub fn new(
        e_device_key: p256::PublicKey,
        connection_methods: Vec<ConnectionMethod>,
    ) -> Result<Self, Error> {
        let key = Tag24::new(CoseKey(e_device_key)).map_err(|_| Error::CoseKeyError)?;
        Ok(DeviceEngagement {
            version: Self::VERSION.to_string(),
            security: Security(Self::CIPHER_SUITE, key),
            connection_methods,
        })
    }

    pub fn e_device_key(&self) -> &p256::PublicKey {
        self.security.1.as_ref().public_key()
    }
}

impl Tag24<DeviceEngagement> {
    const BASE64_CONFIG: base64::Config = base64::Config::new(base64::CharacterSet::UrlSafe, false);

    pub fn to_qr_code_uri(&self) -> String {
        let mut qr_code_uri = String::from("mdoc:");
        base64::encode_config_buf(&self.inner_bytes, Self::BASE64_CONFIG, &mut qr_code_uri);
        qr_code_uri
    }

    pub fn from_qr_code_uri(qr_code_uri: &str) -> anyhow::Result<Self> {
        let encoded_de = qr_code_uri
            .strip_prefix("mdoc:")
            .ok_or_else(|| anyhow::anyhow!("qr code has invalid prefix"))?;
        let decoded_de = base64::decode_config(encoded_de, Self::BASE64_CONFIG)?;
        Tag24::<DeviceEngagement>::from_bytes(decoded_de)
            .map_err(|e| anyhow::anyhow!("invalid device engagement: {e}"))
    }
}

impl CborSerializable for DeviceEngagement {}
impl AsCborValue for DeviceEngagement {
    fn from_cbor_value(value: Value) -> coset::Result<Self> {
        Ok(DeviceEngagement::try_from(value)?)
    }

    fn to_cbor_value(self) -> coset::Result<Value> {
        Ok(self.into())
    }
}

impl From<DeviceEngagement> for Value {
    fn from(device_engagement: DeviceEngagement) -> Value {
        let mut map = vec![
            (
                Value::Integer(0.into()),
                Value::Text(device_engagement.version),
            ),
            (
                Value::Integer(1.into()),
                Value::Array(vec![
                    Value::Integer(device_engagement.security.0.into()),
                    device_engagement.security.1.into(),
                ]),
            ),
        ];
        if !device_engagement.connection_methods.is_empty() {
            map.push((
                Value::Integer(2.into()),
                Value::Array(
                    device_engagement
                        .connection_methods
                        .into_iter()
                        .map(Value::from)
                        .collect(),
                ),
            ));
        }
        Value::Map(map)
    }
}

impl TryFrom<Value> for DeviceEngagement {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let Value::Map(map) = v else {
            return Err(Error::InvalidDeviceEngagement);
        };
        let version = match cbor::map_get_int(&map, 0) {
            Some(Value::Text(version)) => version.clone(),
            _ => return Err(Error::InvalidDeviceEngagement),
        };
        if version.split('.').next() != Some("1") {
            return Err(Error::UnsupportedVersion);
        }
        let security = match cbor::map_get_int(&map, 1) {
            Some(Value::Array(security)) => match security.as_slice() {
                [Value::Integer(suite), key] => Security(
                    u64::try_from(*suite).map_err(|_| Error::InvalidDeviceEngagement)?,
                    Tag24::try_from(key.clone()).map_err(|_| Error::CoseKeyError)?,
                ),
                _ => return Err(Error::InvalidDeviceEngagement),
            },
            _ => return Err(Error::InvalidDeviceEngagement),
        };
        let mut connection_methods = Vec::new();
        match cbor::map_get_int(&map, 2) {
            Some(Value::Array(methods)) => {
                for method in methods {
                    if let Some(method) = ConnectionMethod::from_retrieval_method(method.clone())? {
                        connection_methods.push(method);
                    }
                }
            }
            Some(_) => return Err(Error::InvalidDeviceEngagement),
            None => {}
        }
        Ok(DeviceEngagement {
            version,
            security,
            connection_methods,
        })
    }
}

impl ConnectionMethod {
    /// Parses a `DeviceRetrievalMethod`, returning `None` for transports this crate doesn't model.
    pub fn from_retrieval_method(value: Value) -> Result<Option<Self>, Error> {
        let Value::Array(items) = value else {
            return Err(Error::Malformed);
        };
        let mut items = items.into_iter();
        let (Some(Value::Integer(kind)), Some(Value::Integer(_version)), Some(options)) =
            (items.next(), items.next(), items.next())
        else {
            return Err(Error::Malformed);
        };
        match u64::try_from(kind) {
            Ok(TYPE_BLE) => Ok(Some(ConnectionMethod::Ble(options.try_into()?))),
            Ok(TYPE_NFC) => Ok(Some(ConnectionMethod::Nfc(options.try_into()?))),
            Ok(other) => {
                tracing::debug!("skipping device retrieval method of type {other}");
                Ok(None)
            }
            Err(_) => Err(Error::Malformed),
        }
    }

    /// Splits BLE methods supporting both modes into one method per mode.
    pub fn disambiguate(methods: &[ConnectionMethod]) -> Vec<ConnectionMethod> {
        let mut result = Vec::new();
        for method in methods {
            match method {
                ConnectionMethod::Ble(ble)
                    if ble.supports_central_client_mode && ble.supports_peripheral_server_mode =>
                {
                    result.push(ConnectionMethod::Ble(BleOptions {
                        supports_peripheral_server_mode: false,
                        supports_central_client_mode: true,
                        peripheral_server_mode_uuid: None,
                        central_client_mode_uuid: ble.central_client_mode_uuid,
                        peripheral_server_mode_psm: None,
                        peripheral_server_mode_mac_address: None,
                    }));
                    result.push(ConnectionMethod::Ble(BleOptions {
                        supports_peripheral_server_mode: true,
                        supports_central_client_mode: false,
                        peripheral_server_mode_uuid: ble.peripheral_server_mode_uuid,
                        central_client_mode_uuid: None,
                        peripheral_server_mode_psm: ble.peripheral_server_mode_psm,
                        peripheral_server_mode_mac_address: ble
                            .peripheral_server_mode_mac_address
                            .clone(),
                    }));
                }
                other => result.push(other.clone()),
            }
        }
        result
    }

    /// Merges all BLE methods into one, leaving other methods as they are.
    ///
    /// The merged method takes the position of the first BLE method.
    pub fn combine(methods: &[ConnectionMethod]) -> Result<Vec<ConnectionMethod>, Error> {
        fn merge<T: Clone + PartialEq>(
            into: &mut Option<T>,
            from: &Option<T>,
            what: &'static str,
        ) -> Result<(), Error> {
            match (into.as_ref(), from) {
                (Some(a), Some(b)) if a != b => Err(Error::ConflictingBleOptions(what)),
                (None, Some(b)) => {
                    *into = Some(b.clone());
                    Ok(())
                }
                _ => Ok(()),
            }
        }

        let mut result = Vec::new();
        let mut ble_index = None;
        let mut combined = BleOptions::default();
        for method in methods {
            match method {
                ConnectionMethod::Ble(ble) => {
                    if ble_index.is_none() {
                        ble_index = Some(result.len());
                        result.push(method.clone());
                    }
                    combined.supports_central_client_mode |= ble.supports_central_client_mode;
                    combined.supports_peripheral_server_mode |=
                        ble.supports_peripheral_server_mode;
                    merge(
                        &mut combined.central_client_mode_uuid,
                        &ble.central_client_mode_uuid,
                        "central client mode UUID",
                    )?;
                    merge(
                        &mut combined.peripheral_server_mode_uuid,
                        &ble.peripheral_server_mode_uuid,
                        "peripheral server mode UUID",
                    )?;
                    merge(
                        &mut combined.peripheral_server_mode_psm,
                        &ble.peripheral_server_mode_psm,
                        "L2CAP PSM",
                    )?;
                    merge(
                        &mut combined.peripheral_server_mode_mac_address,
                        &ble.peripheral_server_mode_mac_address,
                        "MAC address",
                    )?;
                }
                other => result.push(other.clone()),
            }
        }
        if let Some(index) = ble_index {
            result[index] = ConnectionMethod::Ble(combined);
        }
        Ok(result)
    }
}

impl From<ConnectionMethod> for Value {
    fn from(method: ConnectionMethod) -> Value {
        let (kind, options) = match method {
            ConnectionMethod::Ble(options) => (TYPE_BLE, options.into()),
            ConnectionMethod::Nfc(options) => (TYPE_NFC, options.into()),
        };
        Value::Array(vec![
            Value::Integer(kind.into()),
            Value::Integer(1.into()),
            options,
        ])
    }
}

impl TryFrom<Value> for BleOptions {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let Value::Map(map) = v else {
            return Err(Error::Malformed);
        };
        let flag = |key| match cbor::map_get_int(&map, key) {
            Some(Value::Bool(flag)) => Ok(*flag),
            None => Ok(false),
            Some(_) => Err(Error::Malformed),
        };
        let uuid = |key| match cbor::map_get_int(&map, key) {
            Some(Value::Bytes(bytes)) => {
                let uuid_bytes: [u8; 16] =
                    bytes.as_slice().try_into().map_err(|_| Error::Malformed)?;
                Ok(Some(Uuid::from_bytes(uuid_bytes)))
            }
            None => Ok(None),
            Some(_) => Err(Error::Malformed),
        };
        let psm = match cbor::map_get_int(&map, BLE_L2CAP_PSM) {
            Some(Value::Integer(psm)) => Some(u16::try_from(*psm).map_err(|_| Error::Malformed)?),
            None => None,
            Some(_) => return Err(Error::Malformed),
        };
        let mac_address = match cbor::map_get_int(&map, BLE_MAC_ADDRESS) {
            Some(Value::Bytes(mac)) if mac.len() == 6 => Some(mac.clone()),
            None => None,
            Some(_) => return Err(Error::Malformed),
        };
        let options = BleOptions {
            supports_peripheral_server_mode: flag(BLE_PERIPHERAL_SERVER_MODE)?,
            supports_central_client_mode: flag(BLE_CENTRAL_CLIENT_MODE)?,
            peripheral_server_mode_uuid: uuid(BLE_PERIPHERAL_SERVER_UUID)?,
            central_client_mode_uuid: uuid(BLE_CENTRAL_CLIENT_UUID)?,
            peripheral_server_mode_psm: psm,
            peripheral_server_mode_mac_address: mac_address,
        };
        if (options.supports_peripheral_server_mode && options.peripheral_server_mode_uuid.is_none())
            || (options.supports_central_client_mode && options.central_client_mode_uuid.is_none())
        {
            return Err(Error::Malformed);
        }
        Ok(options)
    }
}

impl From<BleOptions> for Value {
    fn from(o: BleOptions) -> Value {
        let mut map = vec![
            (
                Value::Integer(BLE_PERIPHERAL_SERVER_MODE.into()),
                Value::Bool(o.supports_peripheral_server_mode),
            ),
            (
                Value::Integer(BLE_CENTRAL_CLIENT_MODE.into()),
                Value::Bool(o.supports_central_client_mode),
            ),
        ];
        if let Some(uuid) = o.peripheral_server_mode_uuid {
            map.push((
                Value::Integer(BLE_PERIPHERAL_SERVER_UUID.into()),
                Value::Bytes(uuid.as_bytes().to_vec()),
            ));
        }
        if let Some(uuid) = o.central_client_mode_uuid {
            map.push((
                Value::Integer(BLE_CENTRAL_CLIENT_UUID.into()),
                Value::Bytes(uuid.as_bytes().to_vec()),
            ));
        }
        if let Some(address) = o.peripheral_server_mode_mac_address {
            map.push((Value::Integer(BLE_MAC_ADDRESS.into()), Value::Bytes(address)));
        }
        if let Some(psm) = o.peripheral_server_mode_psm {
            map.push((
                Value::Integer(BLE_L2CAP_PSM.into()),
                Value::Integer(psm.into()),
            ));
        }
        Value::Map(map)
    }
}

impl TryFrom<Value> for NfcOptions {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let Value::Map(map) = v else {
            return Err(Error::InvalidNfcOptions);
        };
        let length = |key| match cbor::map_get_int(&map, key) {
            Some(Value::Integer(length)) => {
                u64::try_from(*length).map_err(|_| Error::InvalidNfcOptions)
            }
            _ => Err(Error::InvalidNfcOptions),
        };
        Ok(NfcOptions {
            command_data_field_max_length: length(0)?,
            response_data_field_max_length: length(1)?,
        })
    }
}

impl From<NfcOptions> for Value {
    fn from(o: NfcOptions) -> Value {
        Value::Map(vec![
            (
                Value::Integer(0.into()),
                Value::Integer(o.command_data_field_max_length.into()),
            ),
            (
                Value::Integer(1.into()),
                Value::Integer(o.response_data_field_max_length.into()),
            ),
        ])
    }
}

/// Decodes `DeviceEngagement` bytes, as found in a QR code or NFC handover.
pub fn decode(bytes: &[u8]) -> Result<DeviceEngagement, CborError> {
    Ok(DeviceEngagement::from_slice(bytes)?)
}
