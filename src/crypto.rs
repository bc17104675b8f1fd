//! # Signature Capability
//!
//! The overlay treats signing as an external capability: storage protection
//! and signed data entries need *a* public-key signature scheme, not a
//! specific one. [`SignatureFactory`] is that seam; the default
//! implementation is Ed25519 via `ed25519-dalek`.
//!
//! A wire signature is the scheme's `(r, s)` pair, each half
//! [`SIGNATURE_HALF_BYTES`] bytes. Public keys travel as a 2-byte length
//! prefix followed by the scheme's encoding (32 raw bytes for Ed25519).
//!
//! The protection model in the storage layer identifies keys by
//! `key_hash()`, the 160-bit content hash of the encoded public key. A
//! writer proving `key_hash(pk) == domain_key` holds the master key for
//! that domain.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::id::Number160;

/// Byte width of each signature half on the wire.
pub const SIGNATURE_HALF_BYTES: usize = 32;

/// Total wire size of a signature.
pub const SIGNATURE_BYTES: usize = 2 * SIGNATURE_HALF_BYTES;

/// Errors surfaced by signature operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// No signature or public key present where one is required.
    Missing,
    /// The public key bytes do not decode under the active scheme.
    MalformedKey,
    /// Verification ran and the signature does not match.
    Invalid,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature or public key missing"),
            SignatureError::MalformedKey => write!(f, "malformed public key"),
            SignatureError::Invalid => write!(f, "signature verification failed"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// An encoded public key, scheme-opaque to the rest of the crate.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    pub fn from_encoded(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn encoded(&self) -> &[u8] {
        &self.0
    }

    /// 160-bit identity of this key, used by the master-key override in the
    /// protection model.
    pub fn key_hash(&self) -> Number160 {
        Number160::hash_of(&self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(&self.0);
        write!(f, "PublicKey({})", &hex[..hex.len().min(8)])
    }
}

/// A detached signature as an `(r, s)` pair.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub r: [u8; SIGNATURE_HALF_BYTES],
    pub s: [u8; SIGNATURE_HALF_BYTES],
}

impl Signature {
    pub fn from_parts(r: [u8; SIGNATURE_HALF_BYTES], s: [u8; SIGNATURE_HALF_BYTES]) -> Self {
        Self { r, s }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.r);
        buf.put_slice(&self.s);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < SIGNATURE_BYTES {
            return None;
        }
        let mut r = [0u8; SIGNATURE_HALF_BYTES];
        let mut s = [0u8; SIGNATURE_HALF_BYTES];
        buf.copy_to_slice(&mut r);
        buf.copy_to_slice(&mut s);
        Some(Self { r, s })
    }

    fn to_bytes(self) -> [u8; SIGNATURE_BYTES] {
        let mut out = [0u8; SIGNATURE_BYTES];
        out[..SIGNATURE_HALF_BYTES].copy_from_slice(&self.r);
        out[SIGNATURE_HALF_BYTES..].copy_from_slice(&self.s);
        out
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sig({}..)", &hex::encode(self.r)[..8])
    }
}

/// The signature capability: sign and verify payload bytes.
pub trait SignatureFactory: Send + Sync {
    fn sign(&self, secret: &KeyPair, payload: &[u8]) -> Signature;

    fn verify(
        &self,
        public_key: &PublicKey,
        payload: &[u8],
        signature: &Signature,
    ) -> Result<(), SignatureError>;
}

/// Encode a public key with a 2-byte length prefix. An absent key encodes
/// as length zero.
pub fn encode_public_key(key: Option<&PublicKey>, buf: &mut BytesMut) {
    match key {
        Some(key) => {
            buf.put_u16(key.encoded().len() as u16);
            buf.put_slice(key.encoded());
        }
        None => buf.put_u16(0),
    }
}

/// Decode a length-prefixed public key; zero length means absent.
pub fn decode_public_key(buf: &mut impl Buf) -> Option<Option<PublicKey>> {
    if buf.remaining() < 2 {
        return None;
    }
    let len = buf.get_u16() as usize;
    if len == 0 {
        return Some(None);
    }
    if buf.remaining() < len {
        return None;
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Some(Some(PublicKey::from_encoded(bytes)))
}

/// An Ed25519 keypair owning its signing key.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_encoded(self.signing_key.verifying_key().to_bytes().to_vec())
    }

    /// The peer identity derived from this keypair.
    pub fn peer_id(&self) -> Number160 {
        self.public_key().key_hash()
    }

    fn sign_payload(&self, payload: &[u8]) -> ed25519_dalek::Signature {
        self.signing_key.sign(payload)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Default signature provider over Ed25519. The 64-byte Ed25519 signature
/// maps onto the `(r, s)` wire pair as its `R` and `S` halves.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519SignatureFactory;

impl SignatureFactory for Ed25519SignatureFactory {
    fn sign(&self, secret: &KeyPair, payload: &[u8]) -> Signature {
        let sig = secret.sign_payload(payload);
        let bytes = sig.to_bytes();
        let mut r = [0u8; SIGNATURE_HALF_BYTES];
        let mut s = [0u8; SIGNATURE_HALF_BYTES];
        r.copy_from_slice(&bytes[..SIGNATURE_HALF_BYTES]);
        s.copy_from_slice(&bytes[SIGNATURE_HALF_BYTES..]);
        Signature { r, s }
    }

    fn verify(
        &self,
        public_key: &PublicKey,
        payload: &[u8],
        signature: &Signature,
    ) -> Result<(), SignatureError> {
        let key_bytes: &[u8; 32] = public_key
            .encoded()
            .try_into()
            .map_err(|_| SignatureError::MalformedKey)?;
        let verifying_key =
            VerifyingKey::from_bytes(key_bytes).map_err(|_| SignatureError::MalformedKey)?;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.to_bytes());
        verifying_key
            .verify(payload, &sig)
            .map_err(|_| SignatureError::Invalid)
    }
}
