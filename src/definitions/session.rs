//! Session establishment and encryption for mdoc retrieval (ISO/IEC 18013-5 clause 9.1.1).
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use ciborium::Value;
use coset::{AsCborValue, CborSerializable, CoseError};
use hkdf::Hkdf;
use p256::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::cbor::{self, map_get};
use crate::definitions::cose_key::CoseKey;
use crate::definitions::helpers::tag24::{tagged_bytes, Tag24};

/// Session encryption error, the reader should answer with status 10.
pub const STATUS_ERROR_SESSION_ENCRYPTION: u64 = 10;
/// CBOR decoding error, the reader should answer with status 11.
pub const STATUS_ERROR_CBOR_DECODING: u64 = 11;
/// Session termination.
pub const STATUS_SESSION_TERMINATION: u64 = 20;

pub type EReaderKey = CoseKey;
pub type EReaderKeyBytes = Tag24<EReaderKey>;

/// Which end of an mdoc session this party is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The credential holder.
    Mdoc,
    /// The verifier.
    MdocReader,
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to decode session message: {0}")]
    Decode(CoseError),
    #[error("unable to encode session message: {0}")]
    Encode(CoseError),
    #[error("message counter exhausted")]
    CounterExhausted,
    #[error("unable to derive session key")]
    KeyDerivation,
    #[error("message could not be encrypted")]
    Encryption,
    #[error("message could not be decrypted")]
    Decryption,
}

/// The first message sent by a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEstablishment {
    pub e_reader_key: EReaderKeyBytes,
    pub data: Vec<u8>,
}

/// Every message after the session establishment, in either direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionData {
    pub data: Option<Vec<u8>>,
    pub status: Option<u64>,
}

impl SessionData {
    pub fn status(status: u64) -> Self {
        SessionData {
            data: None,
            status: Some(status),
        }
    }

    /// The unencrypted message used to end a session.
    pub fn termination() -> Self {
        Self::status(STATUS_SESSION_TERMINATION)
    }
}

impl CborSerializable for SessionEstablishment {}
impl AsCborValue for SessionEstablishment {
    fn from_cbor_value(value: Value) -> coset::Result<Self> {
        let mut map = cbor::into_map(value, "SessionEstablishment")?;
        let e_reader_key = cbor::map_take(&mut map, "eReaderKey")
            .ok_or_else(|| cbor::semantic("SessionEstablishment is missing eReaderKey"))?;
        let data = cbor::map_take(&mut map, "data")
            .ok_or_else(|| cbor::semantic("SessionEstablishment is missing data"))?;
        Ok(SessionEstablishment {
            e_reader_key: Tag24::from_cbor_value(e_reader_key)?,
            data: cbor::into_bytes(data, "data bstr")?,
        })
    }

    fn to_cbor_value(self) -> coset::Result<Value> {
        Ok(Value::Map(vec![
            (
                Value::Text("eReaderKey".into()),
                self.e_reader_key.to_cbor_value()?,
            ),
            (Value::Text("data".into()), Value::Bytes(self.data)),
        ]))
    }
}

impl CborSerializable for SessionData {}
impl AsCborValue for SessionData {
    fn from_cbor_value(value: Value) -> coset::Result<Self> {
        let mut map = cbor::into_map(value, "SessionData")?;
        let data = cbor::map_take(&mut map, "data")
            .map(|data| cbor::into_bytes(data, "data bstr"))
            .transpose()?;
        let status = match cbor::map_take(&mut map, "status") {
            Some(Value::Integer(status)) => Some(
                u64::try_from(status).map_err(|_| CoseError::OutOfRangeIntegerValue)?,
            ),
            Some(_) => return Err(CoseError::UnexpectedItem("non-uint", "status")),
            None => None,
        };
        Ok(SessionData { data, status })
    }

    fn to_cbor_value(self) -> coset::Result<Value> {
        let mut map = Vec::new();
        if let Some(data) = self.data {
            map.push((Value::Text("data".into()), Value::Bytes(data)));
        }
        if let Some(status) = self.status {
            map.push((Value::Text("status".into()), Value::Integer(status.into())));
        }
        Ok(Value::Map(map))
    }
}

/// How the two parties found each other, bound into the session transcript.
#[derive(Debug, Clone, PartialEq)]
pub enum Handover {
    /// QR engagement has no handover data.
    Qr,
    Nfc {
        handover_select: Vec<u8>,
        handover_request: Option<Vec<u8>>,
    },
    /// A handover structure built by some other engagement, e.g. a browser or app API.
    Other(Value),
}

impl From<Handover> for Value {
    fn from(handover: Handover) -> Value {
        match handover {
            Handover::Qr => Value::Null,
            Handover::Nfc {
                handover_select,
                handover_request,
            } => Value::Array(vec![
                Value::Bytes(handover_select),
                handover_request.map_or(Value::Null, Value::Bytes),
            ]),
            Handover::Other(value) => value,
        }
    }
}

/// `SessionTranscript = [DeviceEngagementBytes / null, EReaderKeyBytes / null, Handover]`
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTranscript {
    pub device_engagement_bytes: Option<Vec<u8>>,
    pub e_reader_key_bytes: Option<Vec<u8>>,
    pub handover: Handover,
}

impl SessionTranscript {
    /// Transcript for proximity presentment, embedding the exact bytes each side sent.
    pub fn proximity(
        device_engagement_bytes: Vec<u8>,
        e_reader_key: &EReaderKeyBytes,
        handover: Handover,
    ) -> Self {
        SessionTranscript {
            device_engagement_bytes: Some(device_engagement_bytes),
            e_reader_key_bytes: Some(e_reader_key.inner_bytes.clone()),
            handover,
        }
    }

    /// Transcript with no engagement or reader key, only handover data.
    pub fn handover_only(handover: Handover) -> Self {
        SessionTranscript {
            device_engagement_bytes: None,
            e_reader_key_bytes: None,
            handover,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            self.device_engagement_bytes
                .clone()
                .map_or(Value::Null, tagged_bytes),
            self.e_reader_key_bytes
                .clone()
                .map_or(Value::Null, tagged_bytes),
            self.handover.clone().into(),
        ])
    }

    /// The encoded `SessionTranscript` array.
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, cbor::CborError> {
        cbor::to_vec(&self.to_value())
    }

    /// `SessionTranscriptBytes = #6.24(bstr .cbor SessionTranscript)`
    pub fn to_tagged_bytes(&self) -> std::result::Result<Vec<u8>, cbor::CborError> {
        cbor::to_vec(&tagged_bytes(self.to_bytes()?))
    }
}

pub fn get_shared_secret(
    remote_public_key: &PublicKey,
    e_self_key_priv: &SecretKey,
) -> Zeroizing<Vec<u8>> {
    let shared_secret = p256::ecdh::diffie_hellman(
        e_self_key_priv.to_nonzero_scalar(),
        remote_public_key.as_affine(),
    );
    Zeroizing::new(shared_secret.raw_secret_bytes().to_vec())
}

/// Derives `SKReader` when `reader` is set, `SKDevice` otherwise.
pub fn derive_session_key(
    shared_secret: &[u8],
    session_transcript_bytes: &[u8],
    reader: bool,
) -> Result<Zeroizing<[u8; 32]>> {
    let salt = Sha256::digest(session_transcript_bytes);
    let hkdf = Hkdf::<Sha256>::new(Some(salt.as_slice()), shared_secret);
    let mut okm = Zeroizing::new([0u8; 32]);
    let info: &[u8] = if reader { b"SKReader" } else { b"SKDevice" };
    hkdf.expand(info, &mut okm[..])
        .map_err(|_| Error::KeyDerivation)?;
    Ok(okm)
}

fn nonce(identifier: u8, counter: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[7] = identifier;
    nonce[8..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// The reader's IV identifier is all zeroes, the mdoc's ends in 1.
fn identifier(role: Role) -> u8 {
    match role {
        Role::MdocReader => 0,
        Role::Mdoc => 1,
    }
}

/// Encrypts and decrypts session messages for one side of a session.
///
/// Counters start at 1 and advance once per message in each direction.
pub struct SessionEncryption {
    role: Role,
    sk_self: Zeroizing<[u8; 32]>,
    sk_remote: Zeroizing<[u8; 32]>,
    encrypted_counter: u32,
    decrypted_counter: u32,
    e_self_key: PublicKey,
}

impl SessionEncryption {
    pub fn new(
        role: Role,
        e_self_key: &SecretKey,
        remote_public_key: &PublicKey,
        session_transcript_bytes: &[u8],
    ) -> Result<Self> {
        let shared_secret = get_shared_secret(remote_public_key, e_self_key);
        let sk_reader = derive_session_key(&shared_secret, session_transcript_bytes, true)?;
        let sk_device = derive_session_key(&shared_secret, session_transcript_bytes, false)?;
        let (sk_self, sk_remote) = match role {
            Role::Mdoc => (sk_device, sk_reader),
            Role::MdocReader => (sk_reader, sk_device),
        };
        Ok(SessionEncryption {
            role,
            sk_self,
            sk_remote,
            encrypted_counter: 1,
            decrypted_counter: 1,
            e_self_key: e_self_key.public_key(),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&self.sk_self[..])
            .map_err(|_| Error::Encryption)?;
        let iv = nonce(identifier(self.role), self.encrypted_counter);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| Error::Encryption)?;
        self.encrypted_counter = self
            .encrypted_counter
            .checked_add(1)
            .ok_or(Error::CounterExhausted)?;
        Ok(ciphertext)
    }

    fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let remote = match self.role {
            Role::Mdoc => Role::MdocReader,
            Role::MdocReader => Role::Mdoc,
        };
        let cipher = Aes256Gcm::new_from_slice(&self.sk_remote[..])
            .map_err(|_| Error::Decryption)?;
        let iv = nonce(identifier(remote), self.decrypted_counter);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext)
            .map_err(|_| Error::Decryption)?;
        self.decrypted_counter = self
            .decrypted_counter
            .checked_add(1)
            .ok_or(Error::CounterExhausted)?;
        Ok(plaintext)
    }

    /// Builds an encoded `SessionData` carrying `data` encrypted and an optional status code.
    ///
    /// A reader's first message should use [`SessionEncryption::encrypt_establishment`] instead.
    pub fn encrypt_message(&mut self, data: Option<&[u8]>, status: Option<u64>) -> Result<Vec<u8>> {
        let data = data.map(|data| self.seal(data)).transpose()?;
        SessionData { data, status }.to_vec().map_err(Error::Encode)
    }

    /// Builds the reader's encoded `SessionEstablishment` message.
    pub fn encrypt_establishment(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let e_reader_key = Tag24::new(CoseKey(self.e_self_key))
            .map_err(|e| Error::Encode(cbor::semantic(e.to_string())))?;
        let data = self.seal(data)?;
        SessionEstablishment { e_reader_key, data }
            .to_vec()
            .map_err(Error::Encode)
    }

    /// Decrypts a `SessionEstablishment` or `SessionData` message, returning the plaintext (if
    /// any) and the status code (if any).
    pub fn decrypt_message(&mut self, message: &[u8]) -> Result<(Option<Vec<u8>>, Option<u64>)> {
        let value: Value = cbor::from_slice(message)
            .map_err(|e| Error::Decode(cbor::semantic(e.to_string())))?;
        let is_establishment =
            matches!(&value, Value::Map(map) if map_get(map, "eReaderKey").is_some());
        let session_data = if is_establishment {
            let establishment =
                SessionEstablishment::from_cbor_value(value).map_err(Error::Decode)?;
            SessionData {
                data: Some(establishment.data),
                status: None,
            }
        } else {
            SessionData::from_cbor_value(value).map_err(Error::Decode)?
        };
        let data = session_data
            .data
            .map(|data| self.open(&data))
            .transpose()?;
        Ok((data, session_data.status))
    }
}
