//! # Peer Addresses
//!
//! A [`PeerAddress`] binds a peer identifier to its reachable endpoints and
//! reachability flags. Relayed peers additionally carry the socket
//! addresses of their relay peers, which is how the rest of the overlay
//! reaches them.
//!
//! ## Wire Form
//!
//! ```text
//! options(1) | peerId(20) | addrType(1) | addr(4 or 16) | tcpPort(2) |
//! udpPort(2) | [relayCount(1) | {relay socket address}]
//! ```
//!
//! The options byte packs the reachability flags; the relay list is only
//! present when the `relayed` flag is set.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::id::{Number160, ID_BYTES};

/// Upper bound on relay endpoints a single peer may advertise.
pub const MAX_RELAYS: usize = 5;

const OPT_FIREWALLED_TCP: u8 = 0x01;
const OPT_FIREWALLED_UDP: u8 = 0x02;
const OPT_RELAYED: u8 = 0x04;

const ADDR_TYPE_V4: u8 = 0;
const ADDR_TYPE_V6: u8 = 1;

/// A bare socket endpoint of a peer, without identity. Used for relay
/// endpoint lists.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerSocketAddress {
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl PeerSocketAddress {
    pub fn new(ip: IpAddr, tcp_port: u16, udp_port: u16) -> Self {
        Self {
            ip,
            tcp_port,
            udp_port,
        }
    }

    pub fn tcp_socket(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    pub fn udp_socket(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    fn encoded_len(&self) -> usize {
        let addr = match self.ip {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 16,
        };
        1 + addr + 2 + 2
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self.ip {
            IpAddr::V4(v4) => {
                buf.put_u8(ADDR_TYPE_V4);
                buf.put_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                buf.put_u8(ADDR_TYPE_V6);
                buf.put_slice(&v6.octets());
            }
        }
        buf.put_u16(self.tcp_port);
        buf.put_u16(self.udp_port);
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 1 {
            return None;
        }
        let ip = match buf.get_u8() {
            ADDR_TYPE_V4 => {
                if buf.remaining() < 4 {
                    return None;
                }
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            ADDR_TYPE_V6 => {
                if buf.remaining() < 16 {
                    return None;
                }
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return None,
        };
        if buf.remaining() < 4 {
            return None;
        }
        let tcp_port = buf.get_u16();
        let udp_port = buf.get_u16();
        Some(Self {
            ip,
            tcp_port,
            udp_port,
        })
    }
}

impl fmt::Debug for PeerSocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/tcp:{},udp:{}", self.ip, self.tcp_port, self.udp_port)
    }
}

/// Reachability flags carried in the options byte.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
pub struct AddressFlags {
    pub firewalled_tcp: bool,
    pub firewalled_udp: bool,
    pub relayed: bool,
}

impl AddressFlags {
    fn to_options(self) -> u8 {
        let mut options = 0u8;
        if self.firewalled_tcp {
            options |= OPT_FIREWALLED_TCP;
        }
        if self.firewalled_udp {
            options |= OPT_FIREWALLED_UDP;
        }
        if self.relayed {
            options |= OPT_RELAYED;
        }
        options
    }

    fn from_options(options: u8) -> Self {
        Self {
            firewalled_tcp: options & OPT_FIREWALLED_TCP != 0,
            firewalled_udp: options & OPT_FIREWALLED_UDP != 0,
            relayed: options & OPT_RELAYED != 0,
        }
    }
}

/// The full advertised address of a peer.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub peer_id: Number160,
    pub socket: PeerSocketAddress,
    pub flags: AddressFlags,
    /// Relay endpoints, populated only when `flags.relayed` is set. At most
    /// [`MAX_RELAYS`] entries survive encoding.
    pub relays: Vec<PeerSocketAddress>,
}

impl PeerAddress {
    pub fn new(peer_id: Number160, socket: PeerSocketAddress) -> Self {
        Self {
            peer_id,
            socket,
            flags: AddressFlags::default(),
            relays: Vec::new(),
        }
    }

    /// A loopback address, handy in tests where the transport routes by
    /// peer id rather than by socket.
    pub fn local(peer_id: Number160, port: u16) -> Self {
        Self::new(
            peer_id,
            PeerSocketAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port, port),
        )
    }

    pub fn with_flags(mut self, flags: AddressFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Rewrite this address as relayed through the given endpoints.
    pub fn as_relayed(&self, relays: Vec<PeerSocketAddress>) -> Self {
        let mut out = self.clone();
        out.flags.relayed = true;
        out.relays = relays;
        out.relays.truncate(MAX_RELAYS);
        out
    }

    pub fn is_reachable(&self) -> bool {
        !self.flags.firewalled_tcp && !self.flags.firewalled_udp && !self.flags.relayed
    }

    pub fn encoded_len(&self) -> usize {
        let mut len = 1 + ID_BYTES + self.socket.encoded_len();
        if self.flags.relayed {
            len += 1;
            for relay in self.relays.iter().take(MAX_RELAYS) {
                len += relay.encoded_len();
            }
        }
        len
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.flags.to_options());
        buf.put_slice(self.peer_id.as_bytes());
        self.socket.encode(buf);
        if self.flags.relayed {
            let count = self.relays.len().min(MAX_RELAYS);
            buf.put_u8(count as u8);
            for relay in self.relays.iter().take(count) {
                relay.encode(buf);
            }
        }
    }

    /// Decode an address, consuming exactly its wire length. Returns `None`
    /// on truncated or malformed input.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 1 + ID_BYTES {
            return None;
        }
        let flags = AddressFlags::from_options(buf.get_u8());
        let mut id_bytes = [0u8; ID_BYTES];
        buf.copy_to_slice(&mut id_bytes);
        let peer_id = Number160::from_bytes(id_bytes);
        let socket = PeerSocketAddress::decode(buf)?;

        let mut relays = Vec::new();
        if flags.relayed {
            if buf.remaining() < 1 {
                return None;
            }
            let count = buf.get_u8() as usize;
            if count > MAX_RELAYS {
                return None;
            }
            for _ in 0..count {
                relays.push(PeerSocketAddress::decode(buf)?);
            }
        }

        Some(Self {
            peer_id,
            socket,
            flags,
            relays,
        })
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({:?}@{:?}", self.peer_id, self.socket)?;
        if self.flags.relayed {
            write!(f, ",relayed×{}", self.relays.len())?;
        }
        if self.flags.firewalled_tcp || self.flags.firewalled_udp {
            write!(f, ",fw")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: u32) -> PeerAddress {
        PeerAddress::local(Number160::from_u32(id), 4000 + id as u16)
    }

    #[test]
    fn encode_decode_round_trip() {
        let addr = sample(7);
        let mut buf = BytesMut::new();
        addr.encode(&mut buf);
        assert_eq!(buf.len(), addr.encoded_len());

        let decoded = PeerAddress::decode(&mut buf).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn relayed_address_round_trip() {
        let relays = vec![
            PeerSocketAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 4001, 4001),
            PeerSocketAddress::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 4002, 4003),
        ];
        let addr = sample(9).as_relayed(relays.clone());
        assert!(addr.flags.relayed);

        let mut buf = BytesMut::new();
        addr.encode(&mut buf);
        let decoded = PeerAddress::decode(&mut buf).unwrap();
        assert_eq!(decoded.relays, relays);
        assert!(decoded.flags.relayed);
    }

    #[test]
    fn relay_list_truncated_to_max() {
        let relays: Vec<_> = (0..8)
            .map(|i| PeerSocketAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, i)), 4000, 4000))
            .collect();
        let addr = sample(1).as_relayed(relays);
        assert_eq!(addr.relays.len(), MAX_RELAYS);

        let mut buf = BytesMut::new();
        addr.encode(&mut buf);
        let decoded = PeerAddress::decode(&mut buf).unwrap();
        assert_eq!(decoded.relays.len(), MAX_RELAYS);
    }

    #[test]
    fn truncated_input_rejected() {
        let addr = sample(3);
        let mut buf = BytesMut::new();
        addr.encode(&mut buf);
        buf.truncate(buf.len() - 3);
        assert!(PeerAddress::decode(&mut buf).is_none());
    }

    #[test]
    fn firewalled_flags_survive() {
        let mut addr = sample(5);
        addr.flags.firewalled_tcp = true;
        addr.flags.firewalled_udp = true;
        assert!(!addr.is_reachable());

        let mut buf = BytesMut::new();
        addr.encode(&mut buf);
        let decoded = PeerAddress::decode(&mut buf).unwrap();
        assert!(decoded.flags.firewalled_tcp);
        assert!(decoded.flags.firewalled_udp);
        assert!(!decoded.flags.relayed);
    }
}
