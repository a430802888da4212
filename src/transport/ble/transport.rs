//! The connection state machine shared by every BLE role and mode.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use uuid::Uuid;

use super::framing::{gatt_chunks, MessageReceiver};
use super::{GattCharacteristics, GattEventSender, L2capSocket, STATE_END};
use crate::definitions::device_engagement::ConnectionMethod;
use crate::transport::{MdocTransport, Role, State, TransportError};

/// The channel messages travel over once connected.
#[derive(Clone)]
pub enum Channel {
    /// Chunked characteristic writes or notifications.
    Gatt { mtu: usize },
    L2cap(Arc<dyn L2capSocket>),
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Gatt { mtu } => f.debug_struct("Gatt").field("mtu", mtu).finish(),
            Channel::L2cap(_) => f.write_str("L2cap"),
        }
    }
}

/// Lets a handshake report the states it passes through.
pub trait HandshakeProgress: Send + Sync {
    fn set_state(&self, state: State);
    fn set_scanning_time(&self, scanning_time: Duration);
}

/// The role- and mode-specific part of a BLE transport: how to find the peer and how to put a
/// characteristic value on the air.
#[async_trait]
pub trait BleLink: Send + Sync + 'static {
    fn role(&self) -> Role;

    fn connection_method(&self) -> ConnectionMethod;

    fn characteristics(&self) -> GattCharacteristics;

    /// The characteristic carrying messages towards us.
    fn inbound(&self) -> Uuid;

    /// Makes us discoverable. Returns `false` when this side connects out instead.
    async fn advertise(&self, events: GattEventSender) -> Result<bool, TransportError>;

    /// Runs the handshake and returns the channel to use.
    async fn connect(
        &self,
        e_sender_key: &p256::PublicKey,
        events: GattEventSender,
        receiver: &MessageReceiver,
        progress: &dyn HandshakeProgress,
    ) -> Result<Channel, TransportError>;

    /// Sends a value on the outbound side of `characteristic`.
    async fn write_characteristic(
        &self,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError>;

    /// Releases the platform connection. Only ever called once per transport.
    async fn close(&self);
}

struct Inner {
    state: State,
    job: Option<AbortHandle>,
    channel: Option<Channel>,
    released: bool,
    scanning_time: Option<Duration>,
}

struct Shared<L> {
    link: L,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<State>,
    events_tx: GattEventSender,
    receiver: MessageReceiver,
}

/// A BLE [`MdocTransport`] for one role and one mode.
pub struct BleTransport<L> {
    shared: Arc<Shared<L>>,
}

impl<L: BleLink> BleTransport<L> {
    pub fn new(link: L) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(State::Idle);
        BleTransport {
            shared: Arc::new(Shared {
                link,
                inner: Mutex::new(Inner {
                    state: State::Idle,
                    job: None,
                    channel: None,
                    released: false,
                    scanning_time: None,
                }),
                state_tx,
                events_tx,
                receiver: MessageReceiver::new(events_rx),
            }),
        }
    }

    pub fn link(&self) -> &L {
        &self.shared.link
    }
}

impl<L: BleLink> Shared<L> {
    fn transition(&self, inner: &mut Inner, state: State) {
        if inner.state != state {
            tracing::debug!("{:?} BLE transport: {} -> {}", self.link.role(), inner.state, state);
            inner.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn connected_channel(&self) -> Result<Channel, TransportError> {
        let inner = self.inner.lock();
        match (inner.state, &inner.channel) {
            (State::Connected, Some(channel)) => Ok(channel.clone()),
            (State::Closed, _) => Err(TransportError::Closed),
            (state, _) => Err(TransportError::InvalidState(state)),
        }
    }

    /// Moves to `Failed` and releases the connection, unless already in a terminal state.
    async fn fail(&self, error: &TransportError) {
        let (channel, release) = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            tracing::error!("{:?} BLE transport failed: {error}", self.link.role());
            if let Some(job) = inner.job.take() {
                job.abort();
            }
            self.transition(&mut inner, State::Failed);
            (inner.channel.take(), !std::mem::replace(&mut inner.released, true))
        };
        if release {
            self.release(channel).await;
        }
    }

    /// The peer went away: moves to `Closed` and releases the connection.
    async fn peer_closed(&self) {
        let (channel, release) = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            tracing::info!("{:?} BLE transport: peer disconnected", self.link.role());
            self.transition(&mut inner, State::Closed);
            (inner.channel.take(), !std::mem::replace(&mut inner.released, true))
        };
        if release {
            self.release(channel).await;
        }
    }

    async fn release(&self, channel: Option<Channel>) {
        if let Some(Channel::L2cap(socket)) = channel {
            socket.close().await;
        }
        self.link.close().await;
    }

    /// Maps a lower-layer error from an operation on a connected transport.
    async fn on_error(&self, error: TransportError) -> TransportError {
        match error {
            TransportError::Closed => {
                self.peer_closed().await;
                TransportError::Closed
            }
            error => {
                self.fail(&error).await;
                error
            }
        }
    }
}

impl<L: BleLink> HandshakeProgress for Shared<L> {
    fn set_state(&self, state: State) {
        let mut inner = self.inner.lock();
        if !inner.state.is_terminal() {
            self.transition(&mut inner, state);
        }
    }

    fn set_scanning_time(&self, scanning_time: Duration) {
        self.inner.lock().scanning_time = Some(scanning_time);
    }
}

/// Resolves once `state` reaches `Closed` or `Failed`.
async fn wait_terminal(mut state: watch::Receiver<State>) -> TransportError {
    loop {
        let current = *state.borrow_and_update();
        match current {
            State::Closed => return TransportError::Closed,
            State::Failed => return TransportError::Failed("transport failed".into()),
            _ => {}
        }
        if state.changed().await.is_err() {
            return TransportError::Closed;
        }
    }
}

#[async_trait]
impl<L: BleLink> MdocTransport for BleTransport<L> {
    fn role(&self) -> Role {
        self.shared.link.role()
    }

    fn connection_method(&self) -> ConnectionMethod {
        self.shared.link.connection_method()
    }

    fn state(&self) -> State {
        self.shared.inner.lock().state
    }

    fn watch_state(&self) -> watch::Receiver<State> {
        self.shared.state_tx.subscribe()
    }

    fn scanning_time(&self) -> Option<Duration> {
        self.shared.inner.lock().scanning_time
    }

    async fn advertise(&self) -> Result<(), TransportError> {
        {
            let inner = self.shared.inner.lock();
            match inner.state {
                State::Idle => {}
                State::Closed => return Err(TransportError::Closed),
                state => return Err(TransportError::InvalidState(state)),
            }
        }
        match self.shared.link.advertise(self.shared.events_tx.clone()).await {
            Ok(advertised) => {
                let mut inner = self.shared.inner.lock();
                if advertised && inner.state == State::Idle {
                    self.shared.transition(&mut inner, State::Advertising);
                }
                Ok(())
            }
            Err(e) => Err(self.shared.on_error(e).await),
        }
    }

    async fn open(&self, e_sender_key: &p256::PublicKey) -> Result<(), TransportError> {
        let handle = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                State::Idle | State::Advertising if inner.job.is_none() => {}
                State::Closed => return Err(TransportError::Closed),
                state => return Err(TransportError::InvalidState(state)),
            }
            let shared = self.shared.clone();
            let e_sender_key = *e_sender_key;
            let handle = tokio::spawn(async move {
                shared
                    .link
                    .connect(
                        &e_sender_key,
                        shared.events_tx.clone(),
                        &shared.receiver,
                        shared.as_ref(),
                    )
                    .await
            });
            inner.job = Some(handle.abort_handle());
            handle
        };

        let error = match handle.await {
            Ok(Ok(channel)) => {
                {
                    let mut inner = self.shared.inner.lock();
                    inner.job = None;
                    if !inner.state.is_terminal() {
                        tracing::info!(
                            "{:?} BLE transport connected over {channel:?}",
                            self.shared.link.role()
                        );
                        inner.channel = Some(channel);
                        self.shared.transition(&mut inner, State::Connected);
                        return Ok(());
                    }
                }
                // closed while the handshake was finishing, so close() never saw this channel
                if let Channel::L2cap(socket) = channel {
                    socket.close().await;
                }
                return Err(TransportError::Closed);
            }
            Ok(Err(e)) => e,
            Err(e) if e.is_cancelled() => return Err(TransportError::Closed),
            Err(e) => TransportError::Failed(format!("handshake task failed: {e}")),
        };
        if self.state() == State::Closed {
            return Err(TransportError::Closed);
        }
        Err(self.shared.on_error(error).await)
    }

    async fn send_message(&self, message: &[u8]) -> Result<(), TransportError> {
        let channel = self.shared.connected_channel()?;
        let characteristics = self.shared.link.characteristics();
        let result = match (&channel, message.is_empty()) {
            (Channel::L2cap(_), true) => return Err(TransportError::TerminationUnsupported),
            (Channel::L2cap(socket), false) => {
                socket.write(message).await.map_err(TransportError::from)
            }
            (Channel::Gatt { .. }, true) => {
                self.shared
                    .link
                    .write_characteristic(characteristics.state, &[STATE_END])
                    .await
            }
            (Channel::Gatt { mtu }, false) => {
                let outbound = if self.shared.link.inbound() == characteristics.client2server {
                    characteristics.server2client
                } else {
                    characteristics.client2server
                };
                let mut result = Ok(());
                for chunk in gatt_chunks(message, *mtu)? {
                    result = self.shared.link.write_characteristic(outbound, &chunk).await;
                    if result.is_err() {
                        break;
                    }
                }
                result
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.shared.on_error(e).await),
        }
    }

    async fn wait_for_message(&self) -> Result<Vec<u8>, TransportError> {
        self.shared.connected_channel()?;
        let characteristics = self.shared.link.characteristics();
        let state = self.watch_state();
        let received = tokio::select! {
            received = self
                .shared
                .receiver
                .next_message(characteristics.state, self.shared.link.inbound()) => received,
            error = wait_terminal(state) => return Err(error),
        };
        match received {
            Ok(message) => Ok(message),
            Err(e) => Err(self.shared.on_error(e).await),
        }
    }

    async fn close(&self) {
        let (channel, release) = {
            let mut inner = self.shared.inner.lock();
            if let Some(job) = inner.job.take() {
                job.abort();
            }
            if !inner.state.is_terminal() {
                self.shared.transition(&mut inner, State::Closed);
            }
            (inner.channel.take(), !std::mem::replace(&mut inner.released, true))
        };
        if release {
            self.shared.release(channel).await;
        }
    }
}
