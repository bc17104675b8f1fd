//! # Stored Data & Wire Codec
//!
//! A [`Data`] is the unit of storage: an opaque payload plus optional
//! time-to-live, version ancestry, signature and protection metadata. The
//! wire form is a compact header-flagged, self-delimiting binary format
//! usable in streaming mode, so a large entry can be decoded across
//! arbitrary buffer fragmentation.
//!
//! ## Wire Layout
//!
//! ```text
//! header(1) | length(1|2|4) | [ttlSeconds(4)] | [basedOn(20)] |
//! [pubKeyLen(2) + pubKey] | payload(length) | [signature r‖s]
//! ```
//!
//! Header bits, MSB first: `basedOn | signed | ttl | protectedEntry |
//! flag2 | flag1 | type(2)`. The length field width follows the type:
//! `Small` ≤ 255 takes one byte, `Medium` ≤ 65535 two, `Large` four.
//!
//! ## Streaming Decode
//!
//! [`Data::decode_header`] peeks and returns `None` without consuming
//! anything until the complete header (including an embedded public key) is
//! available. The returned entry then accepts payload bytes through
//! [`Data::decode_payload`] and is finalized by [`Data::decode_done`],
//! which reads the trailing signature.
//!
//! The signature covers the payload bytes only. Signing with a bare secret
//! key leaves the public key off the wire; verification must then be handed
//! the key externally.

use std::fmt;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::{
    decode_public_key, encode_public_key, KeyPair, PublicKey, Signature, SignatureError,
    SignatureFactory, SIGNATURE_BYTES,
};
use crate::id::{Number160, ID_BYTES};

const HEADER_FLAG1: u8 = 0x04;
const HEADER_FLAG2: u8 = 0x08;
const HEADER_PROTECTED: u8 = 0x10;
const HEADER_TTL: u8 = 0x20;
const HEADER_SIGNED: u8 = 0x40;
const HEADER_BASED_ON: u8 = 0x80;

/// Payload size class, inferred from the payload length.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DataType {
    Small = 0,
    Medium = 1,
    Large = 2,
}

impl DataType {
    pub fn infer(length: usize) -> Self {
        if length <= 0xFF {
            DataType::Small
        } else if length <= 0xFFFF {
            DataType::Medium
        } else {
            DataType::Large
        }
    }

    fn from_header(header: u8) -> Option<Self> {
        match header & 0x03 {
            0 => Some(DataType::Small),
            1 => Some(DataType::Medium),
            2 => Some(DataType::Large),
            _ => None,
        }
    }

    fn length_field_bytes(self) -> usize {
        match self {
            DataType::Small => 1,
            DataType::Medium => 2,
            DataType::Large => 4,
        }
    }

    fn accepts_length(self, length: usize) -> bool {
        match self {
            DataType::Small => length <= 0xFF,
            DataType::Medium => (0x100..=0xFFFF).contains(&length),
            DataType::Large => length > 0xFFFF && length <= i32::MAX as usize,
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A stored data entry.
pub struct Data {
    data_type: DataType,
    length: usize,
    payload: Bytes,
    /// Partially received payload during streaming decode.
    partial: Option<BytesMut>,
    ttl_seconds: Option<i32>,
    based_on: Option<Number160>,
    signature: Option<Signature>,
    public_key: Option<PublicKey>,
    protected_entry: bool,
    flag1: bool,
    flag2: bool,
    /// Header announced a signature (streaming decode reads it last).
    wire_signed: bool,
    /// Local arrival wall clock in milliseconds. Never serialized.
    valid_from_millis: u64,
    /// Lazily computed payload hash. Never serialized.
    hash: OnceLock<Number160>,
}

impl Data {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            data_type: DataType::infer(payload.len()),
            length: payload.len(),
            payload,
            partial: None,
            ttl_seconds: None,
            based_on: None,
            signature: None,
            public_key: None,
            protected_entry: false,
            flag1: false,
            flag2: false,
            wire_signed: false,
            valid_from_millis: now_millis(),
            hash: OnceLock::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Bytes::new())
    }

    /// Shell for streaming decode: flags from the header, payload pending.
    fn from_header(header: u8, length: usize) -> Option<Self> {
        let data_type = DataType::from_header(header)?;
        if !data_type.accepts_length(length) {
            return None;
        }
        Some(Self {
            data_type,
            length,
            payload: Bytes::new(),
            partial: Some(BytesMut::with_capacity(length.min(64 * 1024))),
            ttl_seconds: None,
            based_on: None,
            signature: None,
            public_key: None,
            protected_entry: header & HEADER_PROTECTED != 0,
            flag1: header & HEADER_FLAG1 != 0,
            flag2: header & HEADER_FLAG2 != 0,
            wire_signed: header & HEADER_SIGNED != 0,
            valid_from_millis: now_millis(),
            hash: OnceLock::new(),
        })
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn ttl_seconds(&self) -> Option<i32> {
        self.ttl_seconds
    }

    pub fn based_on(&self) -> Option<Number160> {
        self.based_on
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    pub fn public_key(&self) -> Option<&PublicKey> {
        self.public_key.as_ref()
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    pub fn is_protected_entry(&self) -> bool {
        self.protected_entry
    }

    pub fn flag1(&self) -> bool {
        self.flag1
    }

    pub fn flag2(&self) -> bool {
        self.flag2
    }

    pub fn valid_from_millis(&self) -> u64 {
        self.valid_from_millis
    }

    pub fn with_ttl_seconds(mut self, ttl_seconds: i32) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn with_based_on(mut self, version: Number160) -> Self {
        self.based_on = Some(version);
        self
    }

    pub fn with_protected_entry(mut self) -> Self {
        self.protected_entry = true;
        self
    }

    pub fn with_flag1(mut self, flag1: bool) -> Self {
        self.flag1 = flag1;
        self
    }

    pub fn with_flag2(mut self, flag2: bool) -> Self {
        self.flag2 = flag2;
        self
    }

    pub fn with_public_key(mut self, public_key: PublicKey) -> Self {
        self.public_key = Some(public_key);
        self
    }

    /// Sign the payload and attach the signer's public key.
    pub fn sign(mut self, keypair: &KeyPair, factory: &dyn SignatureFactory) -> Self {
        if self.signature.is_none() {
            self.signature = Some(factory.sign(keypair, &self.payload));
            self.public_key = Some(keypair.public_key());
        }
        self
    }

    /// Sign without attaching the public key; the verifier must be handed
    /// the key externally.
    pub fn sign_detached(mut self, keypair: &KeyPair, factory: &dyn SignatureFactory) -> Self {
        if self.signature.is_none() {
            self.signature = Some(factory.sign(keypair, &self.payload));
        }
        self
    }

    /// Verify the signature against the attached public key, or against
    /// `external` when no key travelled on the wire.
    pub fn verify(
        &self,
        factory: &dyn SignatureFactory,
        external: Option<&PublicKey>,
    ) -> Result<(), SignatureError> {
        let signature = self.signature.as_ref().ok_or(SignatureError::Missing)?;
        let key = self
            .public_key
            .as_ref()
            .or(external)
            .ok_or(SignatureError::Missing)?;
        factory.verify(key, &self.payload, signature)
    }

    /// Expiration instant in wall-clock milliseconds. Entries without a
    /// positive TTL never expire.
    pub fn expiration_millis(&self) -> u64 {
        match self.ttl_seconds {
            Some(ttl) if ttl > 0 => self
                .valid_from_millis
                .saturating_add(ttl as u64 * 1000),
            _ => u64::MAX,
        }
    }

    /// Content hash of the payload, computed on first use.
    pub fn hash(&self) -> Number160 {
        *self.hash.get_or_init(|| Number160::hash_of(&self.payload))
    }

    fn header_byte(&self) -> u8 {
        let mut header = self.data_type as u8;
        if self.flag1 {
            header |= HEADER_FLAG1;
        }
        if self.flag2 {
            header |= HEADER_FLAG2;
        }
        if self.protected_entry {
            header |= HEADER_PROTECTED;
        }
        if self.ttl_seconds.is_some() {
            header |= HEADER_TTL;
        }
        if self.signature.is_some() {
            header |= HEADER_SIGNED;
        }
        if self.based_on.is_some() {
            header |= HEADER_BASED_ON;
        }
        header
    }

    /// Write header, length and the optional pre-payload fields.
    pub fn encode_header(&self, buf: &mut BytesMut) {
        buf.put_u8(self.header_byte());
        match self.data_type {
            DataType::Small => buf.put_u8(self.length as u8),
            DataType::Medium => buf.put_u16(self.length as u16),
            DataType::Large => buf.put_u32(self.length as u32),
        }
        if let Some(ttl) = self.ttl_seconds {
            buf.put_i32(ttl);
        }
        if let Some(based_on) = &self.based_on {
            buf.put_slice(based_on.as_bytes());
        }
        if self.signature.is_some() {
            encode_public_key(self.public_key.as_ref(), buf);
        }
    }

    /// Write the payload bytes.
    pub fn encode_payload(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.payload);
    }

    /// Write the trailing signature, if any.
    pub fn encode_done(&self, buf: &mut BytesMut) {
        if let Some(signature) = &self.signature {
            signature.encode(buf);
        }
    }

    /// Encode the complete entry into a fresh buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_header(&mut buf);
        self.encode_payload(&mut buf);
        self.encode_done(&mut buf);
        buf
    }

    pub fn encoded_len(&self) -> usize {
        let mut len = 1 + self.data_type.length_field_bytes() + self.length;
        if self.ttl_seconds.is_some() {
            len += 4;
        }
        if self.based_on.is_some() {
            len += ID_BYTES;
        }
        if self.signature.is_some() {
            len += 2 + self.public_key.as_ref().map_or(0, |k| k.encoded().len());
            len += SIGNATURE_BYTES;
        }
        len
    }

    /// Peek at `buf` and decode the header if it is fully available.
    ///
    /// Consumes nothing and returns `None` while bytes are missing; on
    /// success the header (through the embedded public key) is consumed and
    /// the returned entry awaits `length` payload bytes.
    pub fn decode_header(buf: &mut BytesMut) -> Option<Data> {
        let bytes: &[u8] = buf.as_ref();
        // Header plus at least one length byte.
        if bytes.len() < 2 {
            return None;
        }
        let header = bytes[0];
        let data_type = DataType::from_header(header)?;
        let length_field = data_type.length_field_bytes();
        let has_ttl = header & HEADER_TTL != 0;
        let has_based_on = header & HEADER_BASED_ON != 0;
        let signed = header & HEADER_SIGNED != 0;

        let meta = if has_ttl { 4 } else { 0 } + if has_based_on { ID_BYTES } else { 0 };
        let pk_len_offset = 1 + length_field + meta;
        let mut need = pk_len_offset + if signed { 2 } else { 0 };
        if bytes.len() < need {
            return None;
        }
        if signed {
            let pk_len =
                u16::from_be_bytes([bytes[pk_len_offset], bytes[pk_len_offset + 1]]) as usize;
            need += pk_len;
            if bytes.len() < need {
                return None;
            }
        }

        // Everything up to the payload is available; consume it.
        buf.advance(1);
        let length = match data_type {
            DataType::Small => buf.get_u8() as usize,
            DataType::Medium => buf.get_u16() as usize,
            DataType::Large => buf.get_u32() as usize,
        };
        let mut data = Data::from_header(header, length)?;
        if has_ttl {
            data.ttl_seconds = Some(buf.get_i32());
        }
        if has_based_on {
            let mut id = [0u8; ID_BYTES];
            buf.copy_to_slice(&mut id);
            data.based_on = Some(Number160::from_bytes(id));
        }
        if signed {
            data.public_key = decode_public_key(buf)?;
        }
        Some(data)
    }

    /// Append payload bytes from `buf`, up to the remaining expected
    /// length. Returns `true` once the payload is complete.
    pub fn decode_payload(&mut self, buf: &mut BytesMut) -> bool {
        let Some(partial) = self.partial.as_mut() else {
            // Payload already complete.
            return true;
        };
        let remaining = self.length - partial.len();
        let take = remaining.min(buf.len());
        partial.put_slice(&buf.split_to(take));
        if partial.len() == self.length {
            self.payload = self
                .partial
                .take()
                .map(BytesMut::freeze)
                .unwrap_or_default();
            true
        } else {
            false
        }
    }

    /// Finalize the decode by reading the trailing signature. For entries
    /// signed without an embedded public key, `provided` supplies the
    /// verification key. Returns `false` while signature bytes are missing.
    pub fn decode_done(&mut self, buf: &mut BytesMut, provided: Option<&PublicKey>) -> bool {
        if self.wire_signed && self.signature.is_none() {
            let Some(signature) = Signature::decode(buf) else {
                return false;
            };
            self.signature = Some(signature);
        }
        if self.public_key.is_none() {
            self.public_key = provided.cloned();
        }
        true
    }

    /// Decode a complete entry from a single buffer.
    pub fn decode(buf: &mut BytesMut) -> Option<Data> {
        let mut data = Data::decode_header(buf)?;
        if !data.decode_payload(buf) {
            return None;
        }
        if !data.decode_done(buf, None) {
            return None;
        }
        Some(data)
    }
}

impl Clone for Data {
    fn clone(&self) -> Self {
        Self {
            data_type: self.data_type,
            length: self.length,
            payload: self.payload.clone(),
            partial: self.partial.clone(),
            ttl_seconds: self.ttl_seconds,
            based_on: self.based_on,
            signature: self.signature,
            public_key: self.public_key.clone(),
            protected_entry: self.protected_entry,
            flag1: self.flag1,
            flag2: self.flag2,
            wire_signed: self.wire_signed,
            valid_from_millis: self.valid_from_millis,
            hash: match self.hash.get() {
                Some(hash) => {
                    let cell = OnceLock::new();
                    let _ = cell.set(*hash);
                    cell
                }
                None => OnceLock::new(),
            },
        }
    }
}

impl PartialEq for Data {
    fn eq(&self, other: &Self) -> bool {
        self.data_type == other.data_type
            && self.length == other.length
            && self.ttl_seconds == other.ttl_seconds
            && self.based_on == other.based_on
            && self.signature == other.signature
            && self.protected_entry == other.protected_entry
            && self.flag1 == other.flag1
            && self.flag2 == other.flag2
            && self.payload == other.payload
    }
}

impl Eq for Data {}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Data[l:{},t:{:?},pk:{},sig:{}]",
            self.length,
            self.ttl_seconds,
            self.public_key.is_some(),
            self.signature.is_some()
        )
    }
}

impl Serialize for Data {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Data {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = <Vec<u8>>::deserialize(deserializer)?;
        let mut buf = BytesMut::from(&bytes[..]);
        Data::decode(&mut buf).ok_or_else(|| D::Error::custom("malformed data entry"))
    }
}
