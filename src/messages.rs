//! # Wire Protocol Messages
//!
//! Every RPC message is an [`Envelope`]: a fixed binary prologue followed
//! by a size-bounded bincode body. The prologue is hand-encoded so that any
//! implementation can frame and route messages without knowing the body
//! schema:
//!
//! ```text
//! magic(2) | command(1) | kind(1) | messageId(4) | sender PeerAddress |
//! recipient peerId(20) | bodyLen(4) | body
//! ```
//!
//! TCP multiplexes envelopes length-framed (the prologue is
//! self-delimiting); UDP carries one envelope per datagram.
//!
//! ## Bodies
//!
//! Command-specific payloads are serde enums serialized with bincode under
//! a hard size limit, following the bounded-deserialization rule: never
//! decode untrusted bytes without a cap.
//!
//! [`Data`] values embedded in bodies serialize through their own binary
//! codec, so stored entries keep one canonical wire form everywhere.

use std::fmt;

use bincode::Options;
use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::address::PeerAddress;
use crate::crypto::PublicKey;
use crate::data::Data;
use crate::id::{Number160, Number320, Number640, ID_BYTES};
use crate::storage::{DigestInfo, PutStatus, SimpleBloomFilter};

/// Protocol magic, first two bytes of every envelope.
pub const PROTOCOL_MAGIC: u16 = 0xC417;

/// Maximum accepted body size (4 MiB). Larger bodies are a protocol
/// violation.
pub const MAX_BODY_SIZE: usize = 4 * 1024 * 1024;

/// Bincode options with the size limit enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_BODY_SIZE as u64)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced. Use this for every body decode.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_body(body: &Body) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(body)
}

/// Request families carried in the command byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Command {
    Ping = 0,
    Store = 1,
    Neighbors = 2,
    Direct = 3,
    Quit = 4,
    PeerExchange = 5,
    Broadcast = 6,
    Relay = 7,
}

impl Command {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Command::Ping),
            1 => Some(Command::Store),
            2 => Some(Command::Neighbors),
            3 => Some(Command::Direct),
            4 => Some(Command::Quit),
            5 => Some(Command::PeerExchange),
            6 => Some(Command::Broadcast),
            7 => Some(Command::Relay),
            _ => None,
        }
    }
}

/// Message kind: one request type, four response types.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Kind {
    Request = 0,
    Ack = 1,
    Ok = 2,
    Partial = 3,
    Fail = 4,
}

impl Kind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Kind::Request),
            1 => Some(Kind::Ack),
            2 => Some(Kind::Ok),
            3 => Some(Kind::Partial),
            4 => Some(Kind::Fail),
            _ => None,
        }
    }
}

/// Why an operation failed. Attached to completion results and `Fail`
/// envelopes.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum FailureReason {
    /// No response within the RPC budget.
    Timeout,
    /// No channel permit available.
    ChannelReservationFailed,
    /// The channel to the peer could not be opened.
    PeerUnreachable,
    /// Malformed message, bad magic or length mismatch.
    ProtocolViolation,
    /// Data signature verification failed.
    SignatureInvalid,
    /// The local peer is shutting down.
    Shutdown,
    /// Broadcast requested without any usable neighbor.
    NoBroadcastAddress,
    /// Local misuse of the API.
    IllegalArgument(String),
    /// The remote answered with a failure.
    Remote(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::ChannelReservationFailed => write!(f, "channel reservation failed"),
            FailureReason::PeerUnreachable => write!(f, "peer unreachable"),
            FailureReason::ProtocolViolation => write!(f, "protocol violation"),
            FailureReason::SignatureInvalid => write!(f, "signature invalid"),
            FailureReason::Shutdown => write!(f, "peer is shutting down"),
            FailureReason::NoBroadcastAddress => write!(f, "no broadcast address"),
            FailureReason::IllegalArgument(msg) => write!(f, "illegal argument: {msg}"),
            FailureReason::Remote(msg) => write!(f, "remote failure: {msg}"),
        }
    }
}

impl std::error::Error for FailureReason {}

/// Storage sub-commands, distinguishing the STORE request variants.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum StoreRequest {
    Put {
        entries: Vec<(Number640, Data)>,
        public_key: Option<PublicKey>,
        put_if_absent: bool,
        claim_domain: bool,
    },
    Get {
        keys: Vec<Number640>,
    },
    GetRange {
        from: Number640,
        to: Number640,
        key_bloom: Option<SimpleBloomFilter>,
        content_bloom: Option<SimpleBloomFilter>,
    },
    Remove {
        keys: Vec<Number640>,
        public_key: Option<PublicKey>,
    },
    RemoveRange {
        from: Number640,
        to: Number640,
        public_key: Option<PublicKey>,
    },
    Digest {
        location_and_domain: Number320,
        key_bloom: Option<SimpleBloomFilter>,
        content_bloom: Option<SimpleBloomFilter>,
    },
    DigestRange {
        from: Number640,
        to: Number640,
    },
    DigestKeys {
        keys: Vec<Number640>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum StoreResponse {
    Status(Vec<(Number640, PutStatus)>),
    Entries(Vec<(Number640, Data)>),
    Digest(DigestInfo),
}

/// Typed message bodies, one enum across all commands.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Body {
    Empty,
    Store(StoreRequest),
    StoreReply(StoreResponse),
    Neighbors {
        target: Number160,
    },
    NeighborsReply {
        peers: Vec<PeerAddress>,
        /// Digest of the responder's `(target, domain 0)` branch, letting
        /// routing compare replica contents en passant.
        digest: DigestInfo,
    },
    Direct {
        payload: Vec<u8>,
        /// Raw buffers skip any application decoding on the remote side.
        raw: bool,
    },
    /// One chunk of a streamed direct payload. Chunks of a stream share
    /// the id and arrive in sequence order; the final chunk produces the
    /// application reply.
    DirectStream {
        stream_id: u64,
        seq: u32,
        last: bool,
        raw: bool,
        chunk: Vec<u8>,
    },
    DirectReply {
        payload: Vec<u8>,
    },
    Broadcast {
        message_key: Number160,
        hop_count: u32,
        entries: Vec<(Number640, Data)>,
    },
    PeerExchange {
        peers: Vec<PeerAddress>,
    },
    RelaySetup,
    Fail {
        reason: FailureReason,
    },
}

/// One wire message.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub command: Command,
    pub kind: Kind,
    pub message_id: u32,
    pub sender: PeerAddress,
    pub recipient: Number160,
    pub body: Body,
}

impl Envelope {
    pub fn request(
        command: Command,
        message_id: u32,
        sender: PeerAddress,
        recipient: Number160,
        body: Body,
    ) -> Self {
        Self {
            command,
            kind: Kind::Request,
            message_id,
            sender,
            recipient,
            body,
        }
    }

    /// A response to this envelope, echoing command and message id.
    pub fn reply(&self, kind: Kind, sender: PeerAddress, body: Body) -> Self {
        Self {
            command: self.command,
            kind,
            message_id: self.message_id,
            sender,
            recipient: self.sender.peer_id,
            body,
        }
    }

    pub fn fail(&self, sender: PeerAddress, reason: FailureReason) -> Self {
        self.reply(Kind::Fail, sender, Body::Fail { reason })
    }

    pub fn is_request(&self) -> bool {
        self.kind == Kind::Request
    }

    /// The failure carried by a `Fail` reply, if any.
    pub fn failure(&self) -> Option<FailureReason> {
        match (&self.kind, &self.body) {
            (Kind::Fail, Body::Fail { reason }) => Some(reason.clone()),
            (Kind::Fail, _) => Some(FailureReason::Remote("unspecified".into())),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<BytesMut, bincode::Error> {
        let body = serialize_body(&self.body)?;
        let mut buf = BytesMut::with_capacity(32 + self.sender.encoded_len() + body.len());
        buf.put_u16(PROTOCOL_MAGIC);
        buf.put_u8(self.command as u8);
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.message_id);
        self.sender.encode(&mut buf);
        buf.put_slice(self.recipient.as_bytes());
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        Ok(buf)
    }

    /// Decode one envelope, consuming exactly its bytes. `None` means a
    /// malformed or truncated message (a protocol violation at the
    /// transport).
    pub fn decode(buf: &mut BytesMut) -> Option<Envelope> {
        if buf.remaining() < 8 {
            return None;
        }
        if buf.get_u16() != PROTOCOL_MAGIC {
            return None;
        }
        let command = Command::from_byte(buf.get_u8())?;
        let kind = Kind::from_byte(buf.get_u8())?;
        let message_id = buf.get_u32();
        let sender = PeerAddress::decode(buf)?;
        if buf.remaining() < ID_BYTES + 4 {
            return None;
        }
        let mut id = [0u8; ID_BYTES];
        buf.copy_to_slice(&mut id);
        let recipient = Number160::from_bytes(id);
        let body_len = buf.get_u32() as usize;
        if body_len > MAX_BODY_SIZE || buf.remaining() < body_len {
            return None;
        }
        let body_bytes = buf.split_to(body_len);
        let body = deserialize_bounded(&body_bytes).ok()?;
        Some(Envelope {
            command,
            kind,
            message_id,
            sender,
            recipient,
            body,
        })
    }
}
