use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use anyhow::Result;
use async_trait::async_trait;
use ciborium::Value;
use p256::SecretKey;
use rand::rngs::OsRng;
use uuid::Uuid;

use mdoc_presentment::cbor;
use mdoc_presentment::definitions::device_engagement::{
    BleOptions, ConnectionMethod, NfcOptions,
};
use mdoc_presentment::transport::ble::{
    BleError, BleLink, BleMode, BleTransport, Channel, GattCharacteristics, GattEventSender,
    HandshakeProgress, L2capSocket, MessageReceiver,
};
use mdoc_presentment::transport::{
    BleTransportFactory, MdocTransport, MdocTransportFactory, Role, SharedTransport, State,
    TransportError, TransportOptions,
};

mod common;

use common::{central_client_method, peripheral_server_method, Air};

fn gatt_only() -> TransportOptions {
    TransportOptions {
        ble_use_l2cap: false,
        ..Default::default()
    }
}

async fn open_both(
    mdoc: &SharedTransport,
    reader: &SharedTransport,
    e_device_key: &p256::PublicKey,
) {
    let (mdoc_opened, reader_opened) =
        tokio::join!(mdoc.open(e_device_key), reader.open(e_device_key));
    mdoc_opened.unwrap();
    reader_opened.unwrap();
    assert_eq!(mdoc.state(), State::Connected);
    assert_eq!(reader.state(), State::Connected);
}

/// A message the L2CAP framing can split: one CBOR data item.
fn cbor_message(len: usize) -> Vec<u8> {
    cbor::to_vec(&Value::Bytes(vec![0x5a; len])).unwrap()
}

#[tokio::test]
async fn gatt_peripheral_server_mode() -> Result<()> {
    let air = Air::new(23, false);
    let factory = air.factory();
    let e_device_key = SecretKey::random(&mut OsRng).public_key();

    let mdoc = factory.create_transport(
        &peripheral_server_method(Uuid::new_v4()),
        Role::Mdoc,
        &gatt_only(),
    )?;
    mdoc.advertise().await?;
    assert_eq!(mdoc.state(), State::Advertising);
    let reader =
        factory.create_transport(&mdoc.connection_method(), Role::MdocReader, &gatt_only())?;
    open_both(&mdoc, &reader, &e_device_key).await;
    assert!(reader.scanning_time().is_some());

    // spans several chunks at this MTU
    let request = vec![0x5a; 100];
    reader.send_message(&request).await?;
    assert_eq!(mdoc.wait_for_message().await?, request);
    mdoc.send_message(b"response").await?;
    assert_eq!(reader.wait_for_message().await?, b"response");

    reader.send_message(&[]).await?;
    assert!(mdoc.wait_for_message().await?.is_empty());

    mdoc.close().await;
    mdoc.close().await;
    assert_eq!(mdoc.state(), State::Closed);
    assert_eq!(air.peripheral_closes.load(Ordering::SeqCst), 1);
    assert!(matches!(
        reader.wait_for_message().await,
        Err(TransportError::Closed)
    ));
    assert_eq!(reader.state(), State::Closed);
    Ok(())
}

#[tokio::test]
async fn l2cap_psm_from_engagement() -> Result<()> {
    let air = Air::new(185, true);
    let factory = air.factory();
    let options = TransportOptions::default();
    let e_device_key = SecretKey::random(&mut OsRng).public_key();

    let mdoc = factory.create_transport(
        &peripheral_server_method(Uuid::new_v4()),
        Role::Mdoc,
        &options,
    )?;
    mdoc.advertise().await?;
    let ConnectionMethod::Ble(advertised) = mdoc.connection_method() else {
        unreachable!()
    };
    assert_eq!(advertised.peripheral_server_mode_psm, Some(air.psm));

    let reader = factory.create_transport(
        &ConnectionMethod::Ble(advertised),
        Role::MdocReader,
        &options,
    )?;
    open_both(&mdoc, &reader, &e_device_key).await;

    let request = cbor_message(1000);
    reader.send_message(&request).await?;
    assert_eq!(mdoc.wait_for_message().await?, request);
    let response = cbor_message(20);
    mdoc.send_message(&response).await?;
    assert_eq!(reader.wait_for_message().await?, response);

    assert!(matches!(
        mdoc.send_message(&[]).await,
        Err(TransportError::TerminationUnsupported)
    ));

    reader.close().await;
    assert!(matches!(
        mdoc.wait_for_message().await,
        Err(TransportError::Closed)
    ));
    assert_eq!(mdoc.state(), State::Closed);
    Ok(())
}

#[tokio::test]
async fn l2cap_psm_from_characteristic() -> Result<()> {
    let air = Air::new(185, true);
    let factory = air.factory();
    let options = TransportOptions::default();
    let e_device_key = SecretKey::random(&mut OsRng).public_key();
    let method = peripheral_server_method(Uuid::new_v4());

    let mdoc = factory.create_transport(&method, Role::Mdoc, &options)?;
    mdoc.advertise().await?;
    // the reader only knows the service, so it has to read the PSM
    let reader = factory.create_transport(&method, Role::MdocReader, &options)?;
    open_both(&mdoc, &reader, &e_device_key).await;

    let request = cbor_message(64);
    reader.send_message(&request).await?;
    assert_eq!(mdoc.wait_for_message().await?, request);
    assert!(matches!(
        reader.send_message(&[]).await,
        Err(TransportError::TerminationUnsupported)
    ));
    Ok(())
}

#[tokio::test]
async fn gatt_when_l2cap_unavailable() -> Result<()> {
    let air = Air::new(64, false);
    let factory = air.factory();
    let options = TransportOptions::default();
    let e_device_key = SecretKey::random(&mut OsRng).public_key();

    let mdoc = factory.create_transport(
        &peripheral_server_method(Uuid::new_v4()),
        Role::Mdoc,
        &options,
    )?;
    mdoc.advertise().await?;
    let ConnectionMethod::Ble(advertised) = mdoc.connection_method() else {
        unreachable!()
    };
    assert_eq!(advertised.peripheral_server_mode_psm, None);

    let reader =
        factory.create_transport(&mdoc.connection_method(), Role::MdocReader, &options)?;
    open_both(&mdoc, &reader, &e_device_key).await;
    mdoc.send_message(&[1, 2, 3]).await?;
    assert_eq!(reader.wait_for_message().await?, vec![1, 2, 3]);
    mdoc.send_message(&[]).await?;
    assert!(reader.wait_for_message().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn central_client_mode_checks_ident() -> Result<()> {
    let air = Air::new(100, false);
    let factory = air.factory();
    let e_device_key = SecretKey::random(&mut OsRng).public_key();
    let method = central_client_method(Uuid::new_v4());

    let mdoc = factory.create_transport(&method, Role::Mdoc, &gatt_only())?;
    let reader = factory.create_transport(&method, Role::MdocReader, &gatt_only())?;
    // nothing to advertise for either: the reader advertises once it knows the mdoc's key
    mdoc.advertise().await?;
    reader.advertise().await?;
    assert_eq!(mdoc.state(), State::Idle);
    assert_eq!(reader.state(), State::Idle);

    open_both(&mdoc, &reader, &e_device_key).await;
    mdoc.send_message(b"request").await?;
    assert_eq!(reader.wait_for_message().await?, b"request");
    reader.send_message(b"response").await?;
    assert_eq!(mdoc.wait_for_message().await?, b"response");
    Ok(())
}

#[tokio::test]
async fn ident_mismatch_fails_mdoc() -> Result<()> {
    let air = Air::new(100, false);
    let factory = air.factory();
    let method = central_client_method(Uuid::new_v4());
    let e_device_key = SecretKey::random(&mut OsRng).public_key();
    let other_key = SecretKey::random(&mut OsRng).public_key();

    let mdoc = factory.create_transport(&method, Role::Mdoc, &gatt_only())?;
    let reader = factory.create_transport(&method, Role::MdocReader, &gatt_only())?;
    let reader_open = {
        let reader = reader.clone();
        tokio::spawn(async move { reader.open(&other_key).await })
    };

    assert!(matches!(
        mdoc.open(&e_device_key).await,
        Err(TransportError::Failed(_))
    ));
    assert_eq!(mdoc.state(), State::Failed);
    assert_eq!(air.central_closes.load(Ordering::SeqCst), 1);

    // the mdoc hung up, so the reader ends closed rather than failed
    assert!(matches!(reader_open.await?, Err(TransportError::Closed)));
    assert_eq!(reader.state(), State::Closed);
    Ok(())
}

#[tokio::test]
async fn close_during_open() -> Result<()> {
    let air = Air::new(100, true);
    let factory = air.factory();
    let e_device_key = SecretKey::random(&mut OsRng).public_key();

    let mdoc = factory.create_transport(
        &peripheral_server_method(Uuid::new_v4()),
        Role::Mdoc,
        &TransportOptions::default(),
    )?;
    mdoc.advertise().await?;
    let opening = {
        let mdoc = mdoc.clone();
        tokio::spawn(async move { mdoc.open(&e_device_key).await })
    };
    tokio::task::yield_now().await;

    mdoc.close().await;
    assert!(matches!(opening.await?, Err(TransportError::Closed)));
    assert_eq!(mdoc.state(), State::Closed);
    assert_eq!(air.peripheral_closes.load(Ordering::SeqCst), 1);
    assert!(matches!(
        mdoc.wait_for_message().await,
        Err(TransportError::Closed)
    ));
    assert!(matches!(mdoc.advertise().await, Err(TransportError::Closed)));
    Ok(())
}

#[derive(Default)]
struct CountingSocket {
    closes: AtomicUsize,
}

#[async_trait]
impl L2capSocket for CountingSocket {
    async fn write(&self, _data: &[u8]) -> Result<(), BleError> {
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// A link whose handshake hands over an L2CAP socket only after the transport was closed.
struct ClosedWhileConnectingLink {
    transport: OnceLock<Weak<BleTransport<ClosedWhileConnectingLink>>>,
    socket: Arc<CountingSocket>,
    link_closes: AtomicUsize,
}

#[async_trait]
impl BleLink for ClosedWhileConnectingLink {
    fn role(&self) -> Role {
        Role::Mdoc
    }

    fn connection_method(&self) -> ConnectionMethod {
        peripheral_server_method(Uuid::nil())
    }

    fn characteristics(&self) -> GattCharacteristics {
        BleMode::PeripheralServer.characteristics()
    }

    fn inbound(&self) -> Uuid {
        self.characteristics().client2server
    }

    async fn advertise(&self, _events: GattEventSender) -> Result<bool, TransportError> {
        Ok(true)
    }

    async fn connect(
        &self,
        _e_sender_key: &p256::PublicKey,
        _events: GattEventSender,
        _receiver: &MessageReceiver,
        _progress: &dyn HandshakeProgress,
    ) -> Result<Channel, TransportError> {
        if let Some(transport) = self.transport.get().and_then(Weak::upgrade) {
            transport.close().await;
        }
        Ok(Channel::L2cap(self.socket.clone()))
    }

    async fn write_characteristic(
        &self,
        _characteristic: Uuid,
        _value: &[u8],
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) {
        self.link_closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn socket_from_handshake_closed_after_close() {
    let socket = Arc::new(CountingSocket::default());
    let transport = Arc::new(BleTransport::new(ClosedWhileConnectingLink {
        transport: OnceLock::new(),
        socket: socket.clone(),
        link_closes: AtomicUsize::new(0),
    }));
    let _ = transport.link().transport.set(Arc::downgrade(&transport));
    let e_device_key = SecretKey::random(&mut OsRng).public_key();

    assert!(matches!(
        transport.open(&e_device_key).await,
        Err(TransportError::Closed)
    ));
    assert_eq!(transport.state(), State::Closed);
    assert_eq!(socket.closes.load(Ordering::SeqCst), 1);

    transport.close().await;
    assert_eq!(socket.closes.load(Ordering::SeqCst), 1);
    assert_eq!(transport.link().link_closes.load(Ordering::SeqCst), 1);
}

#[test]
fn factory_rejects_unusable_methods() {
    let air = Air::new(100, true);
    let factory = air.factory();
    let options = TransportOptions::default();

    let both_modes = ConnectionMethod::Ble(BleOptions {
        supports_peripheral_server_mode: true,
        supports_central_client_mode: true,
        peripheral_server_mode_uuid: Some(Uuid::new_v4()),
        central_client_mode_uuid: Some(Uuid::new_v4()),
        ..Default::default()
    });
    let nfc = ConnectionMethod::Nfc(NfcOptions {
        command_data_field_max_length: 255,
        response_data_field_max_length: 256,
    });
    let no_uuid = ConnectionMethod::Ble(BleOptions {
        supports_peripheral_server_mode: true,
        ..Default::default()
    });
    for method in [both_modes, nfc, no_uuid] {
        assert!(matches!(
            factory.create_transport(&method, Role::Mdoc, &options),
            Err(TransportError::UnsupportedConnectionMethod(_))
        ));
    }

    let without_central = BleTransportFactory::new();
    assert!(matches!(
        without_central.create_transport(
            &peripheral_server_method(Uuid::new_v4()),
            Role::MdocReader,
            &options
        ),
        Err(TransportError::UnsupportedConnectionMethod(_))
    ));
}
