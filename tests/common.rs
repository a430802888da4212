#![allow(dead_code)]
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ciborium::Value;
use coset::CborSerializable;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::{PublicKey, SecretKey};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;
use zeroize::Zeroizing;

use mdoc_presentment::cbor;
use mdoc_presentment::definitions::device_engagement::{
    BleOptions, ConnectionMethod, DeviceEngagement,
};
use mdoc_presentment::definitions::device_request::{DeviceRequest, DocRequest, ItemsRequest};
use mdoc_presentment::definitions::device_response::{
    DeviceResponse, IssuerSigned, IssuerSignedItem,
};
use mdoc_presentment::definitions::helpers::Tag24;
use mdoc_presentment::definitions::CoseKey;
use mdoc_presentment::definitions::session::{
    get_shared_secret, Handover, Role, SessionEncryption, SessionTranscript,
};
use mdoc_presentment::presentment::{
    KeyError, MdocCredential, MdocPresentmentMechanism, MdocRequest, PresentmentMechanism,
    PresentmentModel, PresentmentSource, SecureAreaKey, SourceError, State, StateKind, TrustPoint,
};
use mdoc_presentment::transport::ble::{
    BleCentralManager, BleError, BlePeripheralManager, GattEvent, GattEventSender, GattService,
    L2capSocket,
};
use mdoc_presentment::transport::{
    BleTransportFactory, MdocTransport, SharedTransport, State as TransportState, TransportError,
};

pub const DOC_TYPE: &str = "org.iso.18013.5.1.mDL";
pub const NAMESPACE: &str = "org.iso.18013.5.1";

fn main() {}

/// A P-256 device key held in memory.
pub struct TestKey(pub SecretKey);

impl TestKey {
    pub fn random() -> Self {
        TestKey(SecretKey::random(&mut OsRng))
    }
}

#[async_trait]
impl SecureAreaKey for TestKey {
    fn public_key(&self) -> PublicKey {
        self.0.public_key()
    }

    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        let signature: Signature = SigningKey::from(&self.0).sign(data);
        Ok(signature.to_bytes().to_vec())
    }

    async fn key_agreement(&self, other: &PublicKey) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        Ok(get_shared_secret(other, &self.0))
    }
}

pub struct TestCredential {
    pub document_id: String,
    pub doc_type: String,
    pub issuer_signed: Vec<u8>,
    pub key: Arc<TestKey>,
}

impl TestCredential {
    /// An mDL with a family name, a given name and an age attestation.
    pub fn mdl(document_id: &str) -> Arc<Self> {
        let item = |digest_id: u64, identifier: &str, value: Value| {
            Tag24::new(IssuerSignedItem {
                digest_id,
                random: vec![digest_id as u8; 16],
                element_identifier: identifier.to_string(),
                element_value: value,
            })
            .unwrap()
        };
        let issuer_signed = IssuerSigned {
            namespaces: Some(BTreeMap::from([(
                NAMESPACE.to_string(),
                vec![
                    item(0, "family_name", Value::Text("Mustermann".into())),
                    item(1, "given_name", Value::Text("Erika".into())),
                    item(2, "age_over_21", Value::Bool(true)),
                ],
            )])),
            issuer_auth: Value::Null,
        };
        Arc::new(TestCredential {
            document_id: document_id.to_string(),
            doc_type: DOC_TYPE.to_string(),
            issuer_signed: cbor::to_vec(&issuer_signed).unwrap(),
            key: Arc::new(TestKey::random()),
        })
    }
}

impl MdocCredential for TestCredential {
    fn document_id(&self) -> &str {
        &self.document_id
    }

    fn document_name(&self) -> &str {
        "Driving licence"
    }

    fn doc_type(&self) -> &str {
        &self.doc_type
    }

    fn issuer_provided_data(&self) -> &[u8] {
        &self.issuer_signed
    }

    fn device_key(&self) -> Arc<dyn SecureAreaKey> {
        self.key.clone()
    }
}

/// Serves a fixed set of credentials.
pub struct TestSource {
    pub credentials: Vec<Arc<TestCredential>>,
    pub consent_prompt: bool,
    pub prefer_signature: bool,
    pub trust_point: Option<TrustPoint>,
    pub requests_seen: Mutex<Vec<MdocRequest>>,
}

impl TestSource {
    pub fn new(credentials: Vec<Arc<TestCredential>>) -> Self {
        TestSource {
            credentials,
            consent_prompt: false,
            prefer_signature: true,
            trust_point: None,
            requests_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_consent_prompt(mut self) -> Self {
        self.consent_prompt = true;
        self
    }

    pub fn with_key_agreement(mut self) -> Self {
        self.prefer_signature = false;
        self
    }
}

#[async_trait]
impl PresentmentSource for TestSource {
    async fn find_trust_point(&self, _request: &MdocRequest) -> Option<TrustPoint> {
        self.trust_point.clone()
    }

    async fn select_credential_for_presentment(
        &self,
        request: &MdocRequest,
        pre_selected_document: Option<&str>,
    ) -> Result<Vec<Arc<dyn MdocCredential>>, SourceError> {
        self.requests_seen.lock().push(request.clone());
        Ok(self
            .credentials
            .iter()
            .filter(|credential| credential.doc_type == request.doc_type)
            .filter(|credential| {
                pre_selected_document.map_or(true, |id| credential.document_id == id)
            })
            .map(|credential| credential.clone() as Arc<dyn MdocCredential>)
            .collect())
    }

    fn should_show_consent_prompt(
        &self,
        _credential: &dyn MdocCredential,
        _request: &MdocRequest,
    ) -> bool {
        self.consent_prompt
    }

    fn should_prefer_signature_to_key_agreement(
        &self,
        _credential: &dyn MdocCredential,
        _request: &MdocRequest,
    ) -> bool {
        self.prefer_signature
    }
}

/// Waits until the model reaches `kind`, returning that state.
pub async fn wait_for_state(model: &PresentmentModel, kind: StateKind) -> State {
    let mut states = model.watch_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let state = states.borrow_and_update().clone();
            if state.kind() == kind {
                return state;
            }
            states.changed().await.expect("model dropped");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("model never reached {kind}, is {}", model.state_kind()))
}

pub async fn wait_for_transport_state(transport: &dyn MdocTransport, target: TransportState) {
    let mut states = transport.watch_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *states.borrow_and_update() == target {
                return;
            }
            states.changed().await.expect("transport dropped");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("transport never reached {target}, is {}", transport.state()))
}

/// The mdoc's ephemeral key and the engagement carrying it.
pub struct Engagement {
    pub e_device_key: SecretKey,
    pub bytes: Vec<u8>,
}

impl Engagement {
    pub fn new(methods: Vec<ConnectionMethod>) -> Self {
        let e_device_key = SecretKey::random(&mut OsRng);
        let bytes = DeviceEngagement::new(e_device_key.public_key(), methods)
            .unwrap()
            .to_vec()
            .unwrap();
        Engagement {
            e_device_key,
            bytes,
        }
    }

    pub fn mechanism(
        &self,
        transport: SharedTransport,
        allow_multiple_requests: bool,
    ) -> PresentmentMechanism {
        PresentmentMechanism::Mdoc(MdocPresentmentMechanism {
            transport,
            e_device_key: self.e_device_key.clone(),
            encoded_device_engagement: self.bytes.clone(),
            handover: Handover::Qr,
            engagement_duration: None,
            allow_multiple_requests,
        })
    }
}

/// The reader end of a session, encrypting requests and opening responses.
pub struct Reader {
    pub key: SecretKey,
    pub transcript: SessionTranscript,
    encryption: SessionEncryption,
}

impl Reader {
    pub fn new(engagement: &Engagement) -> Self {
        let key = SecretKey::random(&mut OsRng);
        let e_reader_key = Tag24::new(CoseKey(key.public_key())).unwrap();
        let transcript =
            SessionTranscript::proximity(engagement.bytes.clone(), &e_reader_key, Handover::Qr);
        let encryption = SessionEncryption::new(
            Role::MdocReader,
            &key,
            &engagement.e_device_key.public_key(),
            &transcript.to_tagged_bytes().unwrap(),
        )
        .unwrap();
        Reader {
            key,
            transcript,
            encryption,
        }
    }

    pub fn establishment(&mut self, request: &[u8]) -> Vec<u8> {
        self.encryption.encrypt_establishment(request).unwrap()
    }

    pub fn request(&mut self, request: &[u8]) -> Vec<u8> {
        self.encryption.encrypt_message(Some(request), None).unwrap()
    }

    pub fn termination(&mut self) -> Vec<u8> {
        self.encryption.encrypt_message(None, Some(20)).unwrap()
    }

    /// Decrypts a response, returning it with the status code the mdoc attached.
    pub fn response(&mut self, message: &[u8]) -> Result<(Option<DeviceResponse>, Option<u64>)> {
        let (data, status) = self
            .encryption
            .decrypt_message(message)
            .context("could not decrypt response")?;
        let response = data
            .map(|data| DeviceResponse::parse(&data))
            .transpose()
            .context("could not parse response")?;
        Ok((response, status))
    }
}

/// Encodes a `DeviceRequest` asking for `elements` of each doc type.
pub fn device_request(doc_types: &[(&str, &[&str])]) -> Vec<u8> {
    let doc_requests = doc_types
        .iter()
        .map(|(doc_type, elements)| DocRequest {
            items_request: Tag24::new(ItemsRequest {
                doc_type: doc_type.to_string(),
                namespaces: BTreeMap::from([(
                    NAMESPACE.to_string(),
                    elements
                        .iter()
                        .map(|element| (element.to_string(), false))
                        .collect(),
                )]),
                request_info: None,
            })
            .unwrap(),
            reader_auth: None,
        })
        .collect();
    DeviceRequest::new(doc_requests).to_bytes().unwrap()
}

/// One end of an in-memory transport pair. Both ends start connected.
pub struct LoopbackTransport {
    role: Role,
    state: watch::Sender<TransportState>,
    outbox: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    transport_termination: bool,
    pub closes: AtomicUsize,
    pub sent: Mutex<Vec<Vec<u8>>>,
}

impl LoopbackTransport {
    /// Returns the mdoc end and the reader end. `transport_termination` says whether empty
    /// messages are supported, as over GATT.
    pub fn pair(transport_termination: bool) -> (Arc<Self>, Arc<Self>) {
        let (to_reader, from_mdoc) = mpsc::unbounded_channel();
        let (to_mdoc, from_reader) = mpsc::unbounded_channel();
        let end = |role, outbox, inbox| {
            Arc::new(LoopbackTransport {
                role,
                state: watch::channel(TransportState::Connected).0,
                outbox: Mutex::new(Some(outbox)),
                inbox: tokio::sync::Mutex::new(inbox),
                transport_termination,
                closes: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
            })
        };
        (
            end(Role::Mdoc, to_reader, from_reader),
            end(Role::MdocReader, to_mdoc, from_mdoc),
        )
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    pub fn set_state(&self, state: TransportState) {
        self.state.send_replace(state);
    }
}

async fn until_terminal(mut states: watch::Receiver<TransportState>) {
    loop {
        if states.borrow_and_update().is_terminal() {
            return;
        }
        if states.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl MdocTransport for LoopbackTransport {
    fn role(&self) -> Role {
        self.role
    }

    fn connection_method(&self) -> ConnectionMethod {
        ConnectionMethod::Ble(BleOptions::default())
    }

    fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    fn scanning_time(&self) -> Option<Duration> {
        None
    }

    async fn advertise(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn open(&self, _e_sender_key: &PublicKey) -> Result<(), TransportError> {
        if self.state().is_terminal() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn send_message(&self, message: &[u8]) -> Result<(), TransportError> {
        if self.state().is_terminal() {
            return Err(TransportError::Closed);
        }
        if message.is_empty() && !self.transport_termination {
            return Err(TransportError::TerminationUnsupported);
        }
        self.sent.lock().push(message.to_vec());
        match &*self.outbox.lock() {
            Some(outbox) => outbox
                .send(message.to_vec())
                .map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn wait_for_message(&self) -> Result<Vec<u8>, TransportError> {
        let mut inbox = self.inbox.lock().await;
        tokio::select! {
            message = inbox.recv() => message.ok_or(TransportError::Closed),
            _ = until_terminal(self.state.subscribe()) => Err(TransportError::Closed),
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = TransportState::Closed;
            true
        });
        self.outbox.lock().take();
    }
}

/// The radio between one fake central and one fake peripheral.
pub struct Air {
    service: watch::Sender<Option<GattService>>,
    peripheral_events: Mutex<Option<GattEventSender>>,
    central_events: Mutex<Option<GattEventSender>>,
    pub mtu: usize,
    pub psm: u16,
    pub l2cap: bool,
    pub central_closes: AtomicUsize,
    pub peripheral_closes: AtomicUsize,
}

impl Air {
    pub fn new(mtu: usize, l2cap: bool) -> Arc<Self> {
        Arc::new(Air {
            service: watch::channel(None).0,
            peripheral_events: Mutex::new(None),
            central_events: Mutex::new(None),
            mtu,
            psm: 0x0081,
            l2cap,
            central_closes: AtomicUsize::new(0),
            peripheral_closes: AtomicUsize::new(0),
        })
    }

    /// A factory whose central and peripheral managers both use this air.
    pub fn factory(self: &Arc<Self>) -> BleTransportFactory {
        let central = self.clone();
        let peripheral = self.clone();
        BleTransportFactory::new()
            .with_central(move || {
                Arc::new(FakeCentral {
                    air: central.clone(),
                }) as Arc<dyn BleCentralManager>
            })
            .with_peripheral(move || {
                Arc::new(FakePeripheral {
                    air: peripheral.clone(),
                }) as Arc<dyn BlePeripheralManager>
            })
    }

    fn advertised(&self) -> Result<GattService, BleError> {
        self.service
            .borrow()
            .clone()
            .ok_or_else(|| BleError::Io("not connected".into()))
    }

    fn to_peripheral(&self, event: GattEvent) -> Result<(), BleError> {
        match &*self.peripheral_events.lock() {
            Some(events) => events
                .send(event)
                .map_err(|_| BleError::Io("peripheral is gone".into())),
            None => Err(BleError::Io("peripheral is gone".into())),
        }
    }

    fn to_central(&self, event: GattEvent) -> Result<(), BleError> {
        match &*self.central_events.lock() {
            Some(events) => events
                .send(event)
                .map_err(|_| BleError::Io("central is gone".into())),
            None => Err(BleError::Io("central is gone".into())),
        }
    }
}

pub fn peripheral_server_method(service: Uuid) -> ConnectionMethod {
    ConnectionMethod::Ble(BleOptions {
        supports_peripheral_server_mode: true,
        peripheral_server_mode_uuid: Some(service),
        ..Default::default()
    })
}

pub fn central_client_method(service: Uuid) -> ConnectionMethod {
    ConnectionMethod::Ble(BleOptions {
        supports_central_client_mode: true,
        central_client_mode_uuid: Some(service),
        ..Default::default()
    })
}

struct FakeSocket {
    peer: GattEventSender,
}

#[async_trait]
impl L2capSocket for FakeSocket {
    async fn write(&self, data: &[u8]) -> Result<(), BleError> {
        self.peer
            .send(GattEvent::L2capData(data.to_vec()))
            .map_err(|_| BleError::Io("L2CAP peer is gone".into()))
    }

    async fn close(&self) {}
}

pub struct FakeCentral {
    air: Arc<Air>,
}

#[async_trait]
impl BleCentralManager for FakeCentral {
    async fn wait_for_powered_on(&self) -> Result<(), BleError> {
        Ok(())
    }

    async fn scan_for_peripheral(
        &self,
        service: Uuid,
        _mac_address: Option<&[u8]>,
    ) -> Result<(), BleError> {
        let mut advertised = self.air.service.subscribe();
        let found = advertised
            .wait_for(|advertised| advertised.as_ref().map(|s| s.uuid) == Some(service))
            .await
            .is_ok();
        if found {
            Ok(())
        } else {
            Err(BleError::PeripheralNotFound(service))
        }
    }

    async fn connect_to_peripheral(&self, events: GattEventSender) -> Result<(), BleError> {
        *self.air.central_events.lock() = Some(events);
        Ok(())
    }

    async fn request_mtu(&self, desired: usize) -> Result<usize, BleError> {
        Ok(desired.min(self.air.mtu))
    }

    async fn discover_characteristics(&self, service: Uuid) -> Result<Vec<Uuid>, BleError> {
        let advertised = self.air.advertised()?;
        if advertised.uuid != service {
            return Err(BleError::PeripheralNotFound(service));
        }
        let characteristics = advertised.characteristics;
        let mut discovered = vec![
            characteristics.state,
            characteristics.client2server,
            characteristics.server2client,
        ];
        if let (Some(ident), Some(_)) = (characteristics.ident, advertised.ident) {
            discovered.push(ident);
        }
        if advertised.listen_l2cap && self.air.l2cap {
            discovered.push(characteristics.l2cap);
        }
        Ok(discovered)
    }

    async fn read_characteristic(&self, characteristic: Uuid) -> Result<Vec<u8>, BleError> {
        let advertised = self.air.advertised()?;
        if advertised.characteristics.ident == Some(characteristic) {
            if let Some(ident) = advertised.ident {
                return Ok(ident.to_vec());
            }
        }
        if advertised.characteristics.l2cap == characteristic {
            return Ok(self.air.psm.to_be_bytes().to_vec());
        }
        Err(BleError::CharacteristicNotFound(characteristic))
    }

    async fn subscribe(&self, _characteristic: Uuid) -> Result<(), BleError> {
        Ok(())
    }

    async fn write_characteristic(
        &self,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), BleError> {
        self.air.to_peripheral(GattEvent::CharacteristicValue {
            characteristic,
            value: value.to_vec(),
        })
    }

    async fn connect_l2cap(&self, psm: u16) -> Result<Box<dyn L2capSocket>, BleError> {
        if !self.air.l2cap || psm != self.air.psm {
            return Err(BleError::L2capUnavailable);
        }
        let central_events = self
            .air
            .central_events
            .lock()
            .clone()
            .ok_or(BleError::L2capUnavailable)?;
        let peripheral_events = self
            .air
            .peripheral_events
            .lock()
            .clone()
            .ok_or(BleError::L2capUnavailable)?;
        peripheral_events
            .send(GattEvent::L2capConnected(Box::new(FakeSocket {
                peer: central_events,
            })))
            .map_err(|_| BleError::L2capUnavailable)?;
        Ok(Box::new(FakeSocket {
            peer: peripheral_events,
        }))
    }

    async fn close(&self) {
        self.air.central_closes.fetch_add(1, Ordering::SeqCst);
        let _ = self.air.to_peripheral(GattEvent::Disconnected);
        self.air.central_events.lock().take();
    }
}

pub struct FakePeripheral {
    air: Arc<Air>,
}

#[async_trait]
impl BlePeripheralManager for FakePeripheral {
    async fn wait_for_powered_on(&self) -> Result<(), BleError> {
        Ok(())
    }

    async fn advertise_service(
        &self,
        service: &GattService,
        events: GattEventSender,
    ) -> Result<Option<u16>, BleError> {
        *self.air.peripheral_events.lock() = Some(events);
        self.air.service.send_replace(Some(service.clone()));
        Ok((service.listen_l2cap && self.air.l2cap).then_some(self.air.psm))
    }

    fn mtu(&self) -> usize {
        self.air.mtu
    }

    async fn notify(&self, characteristic: Uuid, value: &[u8]) -> Result<(), BleError> {
        self.air.to_central(GattEvent::CharacteristicValue {
            characteristic,
            value: value.to_vec(),
        })
    }

    async fn close(&self) {
        self.air.peripheral_closes.fetch_add(1, Ordering::SeqCst);
        self.air.service.send_replace(None);
        let _ = self.air.to_central(GattEvent::Disconnected);
        self.air.peripheral_events.lock().take();
    }
}
