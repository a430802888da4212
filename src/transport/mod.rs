//! Transports carrying session messages between an mdoc and a reader.
//!
//! A transport moves opaque byte messages. It knows nothing about session encryption; an empty
//! message is reserved to mean transport-specific session termination.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::definitions::device_engagement::ConnectionMethod;
pub use crate::definitions::session::Role;

pub mod ble;
pub mod connect;
pub mod factory;

pub use connect::{advertise, connect_to_any, wait_for_connection};
pub use factory::{BleTransportFactory, MdocTransportFactory};

/// Lifecycle of a transport.
///
/// `Closed` and `Failed` are terminal. `Advertising` is only reachable through
/// [`MdocTransport::advertise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Idle,
    Advertising,
    Scanning,
    Connecting,
    Connected,
    Closed,
    Failed,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Closed | State::Failed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Idle => "IDLE",
            State::Advertising => "ADVERTISING",
            State::Scanning => "SCANNING",
            State::Connecting => "CONNECTING",
            State::Connected => "CONNECTED",
            State::Closed => "CLOSED",
            State::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The transport was closed locally, or before the operation could finish.
    #[error("transport is closed")]
    Closed,
    #[error("transport failed: {0}")]
    Failed(String),
    /// The active channel has no out-of-band way to signal session termination.
    #[error("transport-specific session termination is not supported on this channel")]
    TerminationUnsupported,
    #[error("operation not allowed in state {0}")]
    InvalidState(State),
    #[error("unsupported connection method: {0}")]
    UnsupportedConnectionMethod(String),
}

/// Options applied to every transport a factory creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub ble_use_l2cap: bool,
    pub ble_desired_mtu: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            ble_use_l2cap: true,
            ble_desired_mtu: 515,
        }
    }
}

#[async_trait]
pub trait MdocTransport: Send + Sync {
    fn role(&self) -> Role;

    /// The connection method this transport serves. After [`MdocTransport::advertise`] this may
    /// carry details only known once listening, such as an L2CAP PSM.
    fn connection_method(&self) -> ConnectionMethod;

    fn state(&self) -> State;

    /// Observe state changes. The receiver starts at the current state.
    fn watch_state(&self) -> watch::Receiver<State>;

    /// How long scanning took before the peer was found, for transports that scan.
    fn scanning_time(&self) -> Option<Duration>;

    /// Starts advertising so the peer can find us. A no-op for transports that connect out.
    async fn advertise(&self) -> Result<(), TransportError>;

    /// Connects to the peer. `e_sender_key` is the mdoc's ephemeral key, from which
    /// transport-level identifiers are derived.
    ///
    /// Returns once `Connected`. If [`MdocTransport::close`] is called meanwhile this returns
    /// [`TransportError::Closed`] and the transport ends `Closed`, not `Failed`.
    async fn open(&self, e_sender_key: &p256::PublicKey) -> Result<(), TransportError>;

    /// Sends one message. An empty message requests transport-specific session termination.
    async fn send_message(&self, message: &[u8]) -> Result<(), TransportError>;

    /// Waits for the next message. An empty message means the peer signalled termination.
    ///
    /// Fails with [`TransportError::Closed`] if the transport is or becomes closed.
    async fn wait_for_message(&self) -> Result<Vec<u8>, TransportError>;

    /// Closes the transport. Idempotent, and may be called concurrently with any other
    /// operation. Moves to `Closed` unless already `Failed`.
    async fn close(&self);
}

impl fmt::Debug for dyn MdocTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MdocTransport")
            .field("role", &self.role())
            .field("state", &self.state())
            .finish()
    }
}

/// Shared handle to a transport.
pub type SharedTransport = Arc<dyn MdocTransport>;
