//! Addresses and the base protocol data unit
//!
//! A BACnet [`Address`] names a station or a broadcast scope, locally or on a
//! remote network. Addresses may carry an explicit next-hop `route`; equality
//! and hashing ignore it.

use core::fmt;
use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    str::FromStr,
};

use crate::error::Error;

/// default BACnet/IP UDP port (0xBAC0)
pub const BACNET_PORT: u16 = 47808;

/// A link-layer station address: 1-6 octets for MS/TP and Ethernet-class
/// links, 6 for IPv4+port, 18 for IPv6+port.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mac(Vec<u8>);

impl Mac {
    /// raw octets
    pub fn new(octets: Vec<u8>) -> Self {
        Mac(octets)
    }

    /// a one-octet MS/TP style station address
    pub fn station(addr: u8) -> Self {
        Mac(vec![addr])
    }

    /// six octets: IPv4 address and port
    pub fn from_ipv4(addr: SocketAddrV4) -> Self {
        let mut octets = addr.ip().octets().to_vec();
        octets.extend_from_slice(&addr.port().to_be_bytes());
        Mac(octets)
    }

    /// eighteen octets: IPv6 address and port
    pub fn from_ipv6(addr: SocketAddrV6) -> Self {
        let mut octets = addr.ip().octets().to_vec();
        octets.extend_from_slice(&addr.port().to_be_bytes());
        Mac(octets)
    }

    /// the octets
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// octet count
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// true when empty (a broadcast MAC placeholder)
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// interpret as an IPv4 or IPv6 socket address, by length
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self.0.len() {
            6 => {
                let ip: [u8; 4] = self.0[..4].try_into().ok()?;
                let port = u16::from_be_bytes(self.0[4..6].try_into().ok()?);
                Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port)))
            }
            18 => {
                let ip: [u8; 16] = self.0[..16].try_into().ok()?;
                let port = u16::from_be_bytes(self.0[16..18].try_into().ok()?);
                Some(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(ip),
                    port,
                    0,
                    0,
                )))
            }
            _ => None,
        }
    }
}

impl fmt::Debug for Mac {
    // IP+port MACs print as a socket address, everything else as hex
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_socket_addr() {
            Some(sa) => write!(f, "{sa}"),
            None => write!(f, "0x{}", hex::encode(&self.0)),
        }
    }
}

/// The address forms of Clause 6
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AddressKind {
    /// no address at all
    Null,
    /// broadcast on the local network
    LocalBroadcast,
    /// a station on the local network
    LocalStation(Mac),
    /// broadcast on a remote network
    RemoteBroadcast(u16),
    /// a station on a remote network
    RemoteStation(u16, Mac),
    /// broadcast everywhere
    GlobalBroadcast,
}

/// A BACnet address: one of the [`AddressKind`] forms, optionally with an
/// explicit next hop attached for route-aware addressing.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone)]
pub struct Address {
    /// the address itself
    pub kind: AddressKind,
    /// explicit next hop; compared by neither `Eq` nor `Hash`
    pub route: Option<Box<Address>>,
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Eq for Address {}

impl std::hash::Hash for Address {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            AddressKind::Null => write!(f, "Null")?,
            AddressKind::LocalBroadcast => write!(f, "*")?,
            AddressKind::LocalStation(mac) => write!(f, "{mac:?}")?,
            AddressKind::RemoteBroadcast(net) => write!(f, "{net}:*")?,
            AddressKind::RemoteStation(net, mac) => write!(f, "{net}:{mac:?}")?,
            AddressKind::GlobalBroadcast => write!(f, "*:*")?,
        }
        if let Some(route) = &self.route {
            write!(f, "@{route:?}")?;
        }
        Ok(())
    }
}

impl Address {
    /// a null address
    pub fn null() -> Self {
        AddressKind::Null.into()
    }

    /// broadcast on the local network
    pub fn local_broadcast() -> Self {
        AddressKind::LocalBroadcast.into()
    }

    /// broadcast everywhere
    pub fn global_broadcast() -> Self {
        AddressKind::GlobalBroadcast.into()
    }

    /// a station on the local network
    pub fn local_station(mac: Mac) -> Self {
        AddressKind::LocalStation(mac).into()
    }

    /// a station on a remote network
    pub fn remote_station(net: u16, mac: Mac) -> Self {
        AddressKind::RemoteStation(net, mac).into()
    }

    /// broadcast on a remote network
    pub fn remote_broadcast(net: u16) -> Self {
        AddressKind::RemoteBroadcast(net).into()
    }

    /// a local station for an IPv4 socket address
    pub fn from_ipv4(addr: SocketAddrV4) -> Self {
        Address::local_station(Mac::from_ipv4(addr))
    }

    /// attach an explicit next hop
    pub fn via(mut self, route: Address) -> Self {
        self.route = Some(Box::new(route));
        self
    }

    /// the remote network number, if this address names one
    pub fn network(&self) -> Option<u16> {
        match self.kind {
            AddressKind::RemoteBroadcast(net) | AddressKind::RemoteStation(net, _) => Some(net),
            _ => None,
        }
    }

    /// the station MAC, if this address names one
    pub fn mac(&self) -> Option<&Mac> {
        match &self.kind {
            AddressKind::LocalStation(mac) | AddressKind::RemoteStation(_, mac) => Some(mac),
            _ => None,
        }
    }

    /// true for any of the broadcast forms
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self.kind,
            AddressKind::LocalBroadcast
                | AddressKind::RemoteBroadcast(_)
                | AddressKind::GlobalBroadcast
        )
    }
}

impl From<AddressKind> for Address {
    fn from(kind: AddressKind) -> Self {
        Address { kind, route: None }
    }
}

impl FromStr for Address {
    type Err = Error;

    /// Parse the address surface:
    ///
    /// - `*` local broadcast, `*:*` global broadcast
    /// - `w.x.y.z` and `w.x.y.z:port` IPv4 stations
    /// - `[2001:db8::1]:port` IPv6 stations
    /// - `net:*` remote broadcast
    /// - `net:station` remote station (decimal MS/TP station or hex MAC)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "" | "null" => return Ok(Address::null()),
            "*" => return Ok(Address::local_broadcast()),
            "*:*" => return Ok(Address::global_broadcast()),
            _ => {}
        }

        // IPv6 in brackets
        if s.starts_with('[') {
            let sa: SocketAddrV6 = s.parse()?;
            return Ok(Address::local_station(Mac::from_ipv6(sa)));
        }

        // bare IPv4 or IPv4:port
        if s.split('.').count() == 4 {
            let sa: SocketAddrV4 = if s.contains(':') {
                s.parse()?
            } else {
                SocketAddrV4::new(s.parse::<Ipv4Addr>()?, BACNET_PORT)
            };
            return Ok(Address::from_ipv4(sa));
        }

        // net:local forms
        if let Some((net_part, local_part)) = s.split_once(':') {
            let net: u16 = net_part
                .parse()
                .map_err(|_| Error::AddrParse(format!("network number {net_part:?}")))?;
            if local_part == "*" {
                return Ok(Address::remote_broadcast(net));
            }
            if let Some(hex_part) = local_part.strip_prefix("0x") {
                let mac = hex::decode(hex_part)
                    .map_err(|_| Error::AddrParse(format!("mac {local_part:?}")))?;
                return Ok(Address::remote_station(net, Mac::new(mac)));
            }
            if local_part.split('.').count() == 4 {
                let sa: SocketAddrV4 =
                    SocketAddrV4::new(local_part.parse::<Ipv4Addr>()?, BACNET_PORT);
                return Ok(Address::remote_station(net, Mac::from_ipv4(sa)));
            }
            let station: u8 = local_part
                .parse()
                .map_err(|_| Error::AddrParse(format!("station {local_part:?}")))?;
            return Ok(Address::remote_station(net, Mac::station(station)));
        }

        Err(Error::AddrParse(format!("address {s:?}")))
    }
}

/// Protocol control information and payload shared by every layer's PDU
#[derive(Debug, Clone, Default)]
pub struct Pdu {
    /// where the PDU came from
    pub source: Address,
    /// where the PDU is going
    pub destination: Address,
    /// sender expects a reply on the same path
    pub expecting_reply: bool,
    /// network priority, 0..=3
    pub network_priority: u8,
    /// the payload octets
    pub data: Vec<u8>,
}

impl Default for Address {
    fn default() -> Self {
        Address::null()
    }
}

impl Pdu {
    /// a new PDU carrying `data` to `destination`
    pub fn new(destination: Address, data: Vec<u8>) -> Self {
        Pdu {
            source: Address::null(),
            destination,
            expecting_reply: false,
            network_priority: 0,
            data,
        }
    }

    /// builder: set the source
    pub fn with_source(mut self, source: Address) -> Self {
        self.source = source;
        self
    }

    /// builder: mark as expecting a reply
    pub fn expecting_reply(mut self, expecting: bool) -> Self {
        self.expecting_reply = expecting;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_surface() {
        assert_eq!("*".parse::<Address>().unwrap(), Address::local_broadcast());
        assert_eq!(
            "*:*".parse::<Address>().unwrap(),
            Address::global_broadcast()
        );

        let a: Address = "192.168.0.10".parse().unwrap();
        assert_eq!(
            a.mac().unwrap().to_socket_addr().unwrap(),
            "192.168.0.10:47808".parse::<SocketAddr>().unwrap()
        );

        let a: Address = "192.168.0.10:47809".parse().unwrap();
        assert_eq!(
            a.mac().unwrap().to_socket_addr().unwrap(),
            "192.168.0.10:47809".parse::<SocketAddr>().unwrap()
        );

        let a: Address = "3:*".parse().unwrap();
        assert_eq!(a, Address::remote_broadcast(3));

        let a: Address = "3:17".parse().unwrap();
        assert_eq!(a, Address::remote_station(3, Mac::station(17)));

        let a: Address = "3:0x1122334455".parse().unwrap();
        assert_eq!(
            a.mac().unwrap().as_slice(),
            &[0x11, 0x22, 0x33, 0x44, 0x55]
        );

        let a: Address = "[2001:db8::1]:47808".parse().unwrap();
        assert_eq!(a.mac().unwrap().len(), 18);

        assert!("foo".parse::<Address>().is_err());
    }

    #[test]
    fn equality_ignores_route() {
        let plain = Address::remote_station(3, Mac::station(0x11));
        let routed = Address::remote_station(3, Mac::station(0x11))
            .via("10.0.0.1".parse().unwrap());
        assert_eq!(plain, routed);

        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(plain);
        assert!(set.contains(&routed));
    }

    #[test]
    fn mac_socket_addr_roundtrip() {
        let sa: SocketAddrV4 = "10.0.0.1:47808".parse().unwrap();
        let mac = Mac::from_ipv4(sa);
        assert_eq!(mac.len(), 6);
        assert_eq!(mac.to_socket_addr().unwrap(), SocketAddr::V4(sa));
        assert_eq!(Mac::station(5).to_socket_addr(), None);
    }
}
