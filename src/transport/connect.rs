//! Offering several connection methods at once and keeping whichever the peer uses.
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::definitions::device_engagement::ConnectionMethod;
use crate::transport::{
    MdocTransportFactory, Role, SharedTransport, State, TransportError, TransportOptions,
};

/// Creates a transport for each method and starts advertising on all of them.
///
/// Methods offering both BLE modes are split first, so a transport exists per mode.
pub async fn advertise(
    factory: &dyn MdocTransportFactory,
    methods: &[ConnectionMethod],
    role: Role,
    options: &TransportOptions,
) -> Result<Vec<SharedTransport>, TransportError> {
    let mut transports = Vec::new();
    for method in ConnectionMethod::disambiguate(methods) {
        let transport = match factory.create_transport(&method, role, options) {
            Ok(transport) => transport,
            Err(e) => {
                close_all(&transports).await;
                return Err(e);
            }
        };
        transports.push(transport.clone());
        if let Err(e) = transport.advertise().await {
            tracing::error!("advertising {method:?} failed: {e}");
            close_all(&transports).await;
            return Err(e);
        }
    }
    Ok(transports)
}

/// Opens every transport and returns the first one to reach `Connecting` or `Connected`.
///
/// The others are closed before this returns. The winner's handshake keeps running, so it may
/// still be `Connecting`. Fails only if every transport fails.
pub async fn wait_for_connection(
    transports: Vec<SharedTransport>,
    e_device_key: &p256::PublicKey,
) -> Result<SharedTransport, TransportError> {
    if transports.is_empty() {
        return Err(TransportError::Failed("no connection methods to wait on".into()));
    }
    let guard = CloseOnDrop(Some(transports.clone()));

    for transport in &transports {
        let transport = transport.clone();
        let e_device_key = *e_device_key;
        tokio::spawn(async move {
            if let Err(e) = transport.open(&e_device_key).await {
                tracing::debug!("{:?} did not connect: {e}", transport.connection_method());
            }
        });
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watchers = JoinSet::new();
    for (index, transport) in transports.iter().enumerate() {
        let mut state = transport.watch_state();
        let tx = tx.clone();
        watchers.spawn(async move {
            loop {
                let current = *state.borrow_and_update();
                if matches!(current, State::Connecting | State::Connected) || current.is_terminal()
                {
                    let _ = tx.send((index, current));
                    return;
                }
                if state.changed().await.is_err() {
                    let _ = tx.send((index, State::Closed));
                    return;
                }
            }
        });
    }
    drop(tx);

    let mut finished = 0;
    let winner = loop {
        let Some((index, state)) = rx.recv().await else {
            break None;
        };
        if state.is_terminal() {
            finished += 1;
            if finished == transports.len() {
                break None;
            }
        } else {
            break Some(index);
        }
    };
    watchers.abort_all();

    let Some(winner) = winner else {
        guard.disarm();
        close_all(&transports).await;
        return Err(TransportError::Failed("no connection method succeeded".into()));
    };
    guard.disarm();
    let mut transports = transports;
    let winner = transports.swap_remove(winner);
    tracing::info!("peer connected using {:?}", winner.connection_method());
    close_all(&transports).await;
    Ok(winner)
}

/// [`advertise`] followed by [`wait_for_connection`].
pub async fn connect_to_any(
    factory: &dyn MdocTransportFactory,
    methods: &[ConnectionMethod],
    role: Role,
    options: &TransportOptions,
    e_device_key: &p256::PublicKey,
) -> Result<SharedTransport, TransportError> {
    let transports = advertise(factory, methods, role, options).await?;
    wait_for_connection(transports, e_device_key).await
}

async fn close_all(transports: &[SharedTransport]) {
    for transport in transports {
        transport.close().await;
    }
}

/// Closes the transports in the background if the race is abandoned.
struct CloseOnDrop(Option<Vec<SharedTransport>>);

impl CloseOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        let Some(transports) = self.0.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { close_all(&transports).await });
            }
            Err(_) => tracing::warn!("no runtime to close abandoned transports on"),
        }
    }
}
