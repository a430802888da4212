//! Splitting messages into GATT chunks and putting them back together.
use std::collections::VecDeque;

use tokio::sync::Mutex;
use uuid::Uuid;

use super::{GattEvent, GattEventReceiver, L2capSocket, CHUNK_LAST, CHUNK_MORE, STATE_END};
use crate::cbor;
use crate::transport::TransportError;

/// ATT header bytes not available to a characteristic value.
const ATT_OVERHEAD: usize = 3;

/// Splits `message` into characteristic values for the given ATT MTU. Each value is at most
/// `mtu - 3` bytes, the first of which says whether more values follow.
pub fn gatt_chunks(message: &[u8], mtu: usize) -> Result<Vec<Vec<u8>>, TransportError> {
    let payload_size = mtu
        .checked_sub(ATT_OVERHEAD + 1)
        .filter(|size| *size > 0)
        .ok_or_else(|| TransportError::Failed(format!("MTU {mtu} is too small")))?;
    let count = message.len().div_ceil(payload_size).max(1);
    let chunks = (0..count)
        .map(|index| {
            let start = index * payload_size;
            let end = (start + payload_size).min(message.len());
            let flag = if index + 1 < count { CHUNK_MORE } else { CHUNK_LAST };
            let mut chunk = Vec::with_capacity(end - start + 1);
            chunk.push(flag);
            chunk.extend_from_slice(&message[start..end]);
            chunk
        })
        .collect();
    Ok(chunks)
}

/// Collects GATT chunks until the last one of a message arrives.
#[derive(Debug, Default)]
pub struct GattReassembler {
    buffer: Vec<u8>,
}

impl GattReassembler {
    /// Adds one characteristic value, returning the message once it is complete.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        match chunk.split_first() {
            Some((&CHUNK_MORE, data)) => {
                self.buffer.extend_from_slice(data);
                Ok(None)
            }
            Some((&CHUNK_LAST, data)) => {
                self.buffer.extend_from_slice(data);
                Ok(Some(std::mem::take(&mut self.buffer)))
            }
            Some((flag, _)) => Err(TransportError::Failed(format!(
                "invalid chunk flag {flag:#04x}"
            ))),
            None => Err(TransportError::Failed("empty characteristic value".into())),
        }
    }
}

/// Splits an L2CAP byte stream into the CBOR data items it carries.
#[derive(Debug, Default)]
pub struct L2capReassembler {
    buffer: Vec<u8>,
}

impl L2capReassembler {
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>, TransportError> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();
        while let Some(length) = cbor::data_item_length(&self.buffer)
            .map_err(|e| TransportError::Failed(format!("malformed L2CAP data: {e}")))?
        {
            messages.push(self.buffer.drain(..length).collect());
        }
        Ok(messages)
    }
}

/// What arrived on a connection that is being opened.
pub enum Handshake {
    /// The central wrote this value to the state characteristic.
    State(Vec<u8>),
    L2capConnected(Box<dyn L2capSocket>),
}

/// Turns [`GattEvent`]s into whole messages.
pub struct MessageReceiver {
    inner: Mutex<ReceiverInner>,
}

struct ReceiverInner {
    events: GattEventReceiver,
    gatt: GattReassembler,
    l2cap: L2capReassembler,
    pending: VecDeque<Vec<u8>>,
}

impl MessageReceiver {
    pub fn new(events: GattEventReceiver) -> Self {
        MessageReceiver {
            inner: Mutex::new(ReceiverInner {
                events,
                gatt: GattReassembler::default(),
                l2cap: L2capReassembler::default(),
                pending: VecDeque::new(),
            }),
        }
    }

    /// Waits for a state characteristic write or an L2CAP connection. Values of other
    /// characteristics are left for [`MessageReceiver::next_message`].
    pub async fn next_handshake(
        &self,
        state_characteristic: Uuid,
        inbound: Uuid,
    ) -> Result<Handshake, TransportError> {
        let mut inner = self.inner.lock().await;
        loop {
            match inner.recv().await? {
                GattEvent::CharacteristicValue {
                    characteristic,
                    value,
                } if characteristic == state_characteristic => {
                    return Ok(Handshake::State(value));
                }
                GattEvent::CharacteristicValue {
                    characteristic,
                    value,
                } if characteristic == inbound => inner.gatt_value(&value)?,
                GattEvent::CharacteristicValue { characteristic, .. } => {
                    tracing::debug!("ignoring write to {characteristic} while connecting");
                }
                GattEvent::L2capConnected(socket) => return Ok(Handshake::L2capConnected(socket)),
                GattEvent::L2capData(data) => inner.l2cap_data(&data)?,
                GattEvent::Disconnected => return Err(TransportError::Closed),
                GattEvent::Error(e) => return Err(TransportError::Failed(e)),
            }
        }
    }

    /// Waits for the next complete message. A write of the end value to the state
    /// characteristic is returned as an empty message.
    pub async fn next_message(
        &self,
        state_characteristic: Uuid,
        inbound: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        let mut inner = self.inner.lock().await;
        loop {
            if let Some(message) = inner.pending.pop_front() {
                return Ok(message);
            }
            match inner.recv().await? {
                GattEvent::CharacteristicValue {
                    characteristic,
                    value,
                } if characteristic == state_characteristic => {
                    if value == [STATE_END] {
                        tracing::info!("peer signalled end of session");
                        return Ok(Vec::new());
                    }
                    tracing::debug!("ignoring state value {}", hex::encode(&value));
                }
                GattEvent::CharacteristicValue {
                    characteristic,
                    value,
                } if characteristic == inbound => inner.gatt_value(&value)?,
                GattEvent::CharacteristicValue { characteristic, .. } => {
                    tracing::debug!("ignoring value of {characteristic}");
                }
                GattEvent::L2capData(data) => inner.l2cap_data(&data)?,
                GattEvent::L2capConnected(socket) => {
                    tracing::warn!("unexpected second L2CAP connection");
                    socket.close().await;
                }
                GattEvent::Disconnected => return Err(TransportError::Closed),
                GattEvent::Error(e) => return Err(TransportError::Failed(e)),
            }
        }
    }
}

impl ReceiverInner {
    async fn recv(&mut self) -> Result<GattEvent, TransportError> {
        self.events.recv().await.ok_or(TransportError::Closed)
    }

    fn gatt_value(&mut self, value: &[u8]) -> Result<(), TransportError> {
        if let Some(message) = self.gatt.push(value)? {
            self.pending.push_back(message);
        }
        Ok(())
    }

    fn l2cap_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.pending.extend(self.l2cap.push(data)?);
        Ok(())
    }
}
