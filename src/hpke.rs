//! Single-shot HPKE (RFC 9180) in base mode with the suite
//! DHKEM(P-256, HKDF-SHA256), HKDF-SHA256, AES-128-GCM.
//!
//! Used to encrypt responses for same-device presentment. Only the first message of a context is
//! ever produced, so the sequence number is always zero.
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use hkdf::Hkdf;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroizing;

const KEM_P256_HKDF_SHA256: u16 = 0x0010;
const KDF_HKDF_SHA256: u16 = 0x0001;
const AEAD_AES_128_GCM: u16 = 0x0001;
const MODE_BASE: u8 = 0x00;

const N_SECRET: usize = 32;
const N_K: usize = 16;
const N_N: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid encapsulated key")]
    InvalidEncapsulatedKey,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("encryption failed")]
    Encryption,
    #[error("decryption failed")]
    Decryption,
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Output of [`seal`]: the encapsulated ephemeral key and the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub enc: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

fn kem_suite_id() -> Vec<u8> {
    [&b"KEM"[..], &KEM_P256_HKDF_SHA256.to_be_bytes()[..]].concat()
}

fn hpke_suite_id() -> Vec<u8> {
    [
        &b"HPKE"[..],
        &KEM_P256_HKDF_SHA256.to_be_bytes()[..],
        &KDF_HKDF_SHA256.to_be_bytes()[..],
        &AEAD_AES_128_GCM.to_be_bytes()[..],
    ]
    .concat()
}

fn labeled_extract(suite_id: &[u8], salt: &[u8], label: &[u8], ikm: &[u8]) -> Zeroizing<Vec<u8>> {
    let labeled_ikm = Zeroizing::new([&b"HPKE-v1"[..], suite_id, label, ikm].concat());
    let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), &labeled_ikm);
    Zeroizing::new(prk.to_vec())
}

fn labeled_expand(
    suite_id: &[u8],
    prk: &[u8],
    label: &[u8],
    info: &[u8],
    length: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let length_prefix = u16::try_from(length)
        .map_err(|_| Error::KeyDerivation)?
        .to_be_bytes();
    let labeled_info = [&length_prefix[..], &b"HPKE-v1"[..], suite_id, label, info].concat();
    let hkdf = Hkdf::<Sha256>::from_prk(prk).map_err(|_| Error::KeyDerivation)?;
    let mut okm = Zeroizing::new(vec![0u8; length]);
    hkdf.expand(&labeled_info, &mut okm[..])
        .map_err(|_| Error::KeyDerivation)?;
    Ok(okm)
}

fn serialize_public_key(key: &PublicKey) -> Vec<u8> {
    key.to_encoded_point(false).as_bytes().to_vec()
}

fn dh(secret: &SecretKey, public: &PublicKey) -> Zeroizing<Vec<u8>> {
    let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
    Zeroizing::new(shared.raw_secret_bytes().to_vec())
}

fn extract_and_expand(dh: &[u8], kem_context: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let suite_id = kem_suite_id();
    let eae_prk = labeled_extract(&suite_id, b"", b"eae_prk", dh);
    labeled_expand(&suite_id, &eae_prk, b"shared_secret", kem_context, N_SECRET)
}

struct Context {
    key: Zeroizing<Vec<u8>>,
    base_nonce: Zeroizing<Vec<u8>>,
}

fn key_schedule(shared_secret: &[u8], info: &[u8]) -> Result<Context> {
    let suite_id = hpke_suite_id();
    let psk_id_hash = labeled_extract(&suite_id, b"", b"psk_id_hash", b"");
    let info_hash = labeled_extract(&suite_id, b"", b"info_hash", info);
    let key_schedule_context = [
        &[MODE_BASE][..],
        psk_id_hash.as_slice(),
        info_hash.as_slice(),
    ]
    .concat();
    let secret = labeled_extract(&suite_id, shared_secret, b"secret", b"");
    Ok(Context {
        key: labeled_expand(&suite_id, &secret, b"key", &key_schedule_context, N_K)?,
        base_nonce: labeled_expand(
            &suite_id,
            &secret,
            b"base_nonce",
            &key_schedule_context,
            N_N,
        )?,
    })
}

/// Encrypts `plaintext` to `recipient`, binding `info` into the key schedule and `aad` into the
/// AEAD.
pub fn seal(recipient: &PublicKey, info: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Sealed> {
    let ephemeral = SecretKey::random(&mut OsRng);
    seal_with_ephemeral(&ephemeral, recipient, info, aad, plaintext)
}

fn seal_with_ephemeral(
    ephemeral: &SecretKey,
    recipient: &PublicKey,
    info: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Sealed> {
    let enc = serialize_public_key(&ephemeral.public_key());
    let kem_context = [enc.as_slice(), serialize_public_key(recipient).as_slice()].concat();
    let shared_secret = extract_and_expand(&dh(ephemeral, recipient), &kem_context)?;
    let context = key_schedule(&shared_secret, info)?;
    let cipher = Aes128Gcm::new_from_slice(&context.key).map_err(|_| Error::Encryption)?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&context.base_nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::Encryption)?;
    Ok(Sealed { enc, ciphertext })
}

/// Decrypts a message produced by [`seal`] for the holder of `recipient`.
pub fn open(
    recipient: &SecretKey,
    enc: &[u8],
    info: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let ephemeral = PublicKey::from_sec1_bytes(enc).map_err(|_| Error::InvalidEncapsulatedKey)?;
    let kem_context = [enc, serialize_public_key(&recipient.public_key()).as_slice()].concat();
    let shared_secret = extract_and_expand(&dh(recipient, &ephemeral), &kem_context)?;
    let context = key_schedule(&shared_secret, info)?;
    let cipher = Aes128Gcm::new_from_slice(&context.key).map_err(|_| Error::Decryption)?;
    cipher
        .decrypt(
            Nonce::from_slice(&context.base_nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| Error::Decryption)
}
