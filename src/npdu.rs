//! NPDU header codec and the network-layer message set (Clause 6)
//!
//! ```text
//! +---------+---------+-------------------+-------------------+-----+
//! | version | control | DNET DLEN DADR... | SNET SLEN SADR... | hop |
//! +---------+---------+-------------------+-------------------+-----+
//! | [msg type] [vendor id] | NSDU...                                |
//! +------------------------+----------------------------------------+
//! ```
//!
//! Control octet: bit 7 network-layer message, bit 5 destination present,
//! bit 3 source present, bit 2 expecting reply, bits 1-0 priority.

use crate::{
    decoder::{Decodable, Decoder},
    encoder::{Encodable, Encoder},
    error::{DecodeError, DecodeResult, EncodeError, EncodeResult},
    pdu::{Address, AddressKind, Mac},
};

/// NPDU protocol version
pub const NPDU_VERSION: u8 = 0x01;

/// DNET value meaning "every network"
pub const GLOBAL_DNET: u16 = 0xFFFF;

/// default hop count for freshly routed frames
pub const DEFAULT_HOP_COUNT: u8 = 255;

/// One row of a routing table, as carried by Initialize-Routing-Table
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTableEntry {
    /// the destination network
    pub dnet: u16,
    /// the router port leading there
    pub port_id: u8,
    /// port-specific info octets
    pub port_info: Vec<u8>,
}

/// Network-layer messages (Clause 6.4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    /// 0x00; None asks about every network
    WhoIsRouterToNetwork(Option<u16>),
    /// 0x01
    IAmRouterToNetwork(Vec<u16>),
    /// 0x02
    ICouldBeRouterToNetwork {
        net: u16,
        performance_index: u8,
    },
    /// 0x03
    RejectMessageToNetwork {
        reason: u8,
        net: u16,
    },
    /// 0x04
    RouterBusyToNetwork(Vec<u16>),
    /// 0x05
    RouterAvailableToNetwork(Vec<u16>),
    /// 0x06; empty asks for the table
    InitializeRoutingTable(Vec<RoutingTableEntry>),
    /// 0x07
    InitializeRoutingTableAck(Vec<RoutingTableEntry>),
    /// 0x08
    EstablishConnectionToNetwork {
        net: u16,
        termination_time: u8,
    },
    /// 0x09
    DisconnectConnectionToNetwork(u16),
    /// 0x12
    WhatIsNetworkNumber,
    /// 0x13; configured distinguishes configured from learned
    NetworkNumberIs {
        net: u16,
        configured: bool,
    },
    /// 0x80.. vendor-proprietary
    Proprietary {
        message_type: u8,
        vendor_id: u16,
        data: Vec<u8>,
    },
}

impl NetworkMessage {
    /// the message-type octet
    pub fn message_type(&self) -> u8 {
        use NetworkMessage::*;
        match self {
            WhoIsRouterToNetwork(_) => 0x00,
            IAmRouterToNetwork(_) => 0x01,
            ICouldBeRouterToNetwork { .. } => 0x02,
            RejectMessageToNetwork { .. } => 0x03,
            RouterBusyToNetwork(_) => 0x04,
            RouterAvailableToNetwork(_) => 0x05,
            InitializeRoutingTable(_) => 0x06,
            InitializeRoutingTableAck(_) => 0x07,
            EstablishConnectionToNetwork { .. } => 0x08,
            DisconnectConnectionToNetwork(_) => 0x09,
            WhatIsNetworkNumber => 0x12,
            NetworkNumberIs { .. } => 0x13,
            Proprietary { message_type, .. } => *message_type,
        }
    }

    fn encode_body(&self, e: &mut Encoder<'_>) -> EncodeResult<()> {
        use NetworkMessage::*;
        match self {
            WhoIsRouterToNetwork(net) => {
                if let Some(net) = net {
                    e.write_u16(*net)?;
                }
            }
            IAmRouterToNetwork(nets) | RouterBusyToNetwork(nets)
            | RouterAvailableToNetwork(nets) => {
                for net in nets {
                    e.write_u16(*net)?;
                }
            }
            ICouldBeRouterToNetwork {
                net,
                performance_index,
            } => {
                e.write_u16(*net)?;
                e.write_u8(*performance_index)?;
            }
            RejectMessageToNetwork { reason, net } => {
                e.write_u8(*reason)?;
                e.write_u16(*net)?;
            }
            InitializeRoutingTable(entries) | InitializeRoutingTableAck(entries) => {
                if entries.len() > u8::MAX as usize {
                    return Err(EncodeError::TooLong {
                        len: entries.len(),
                        max: u8::MAX as usize,
                    });
                }
                e.write_u8(entries.len() as u8)?;
                for entry in entries {
                    e.write_u16(entry.dnet)?;
                    e.write_u8(entry.port_id)?;
                    e.write_u8(entry.port_info.len() as u8)?;
                    e.write_slice(&entry.port_info)?;
                }
            }
            EstablishConnectionToNetwork {
                net,
                termination_time,
            } => {
                e.write_u16(*net)?;
                e.write_u8(*termination_time)?;
            }
            DisconnectConnectionToNetwork(net) => e.write_u16(*net)?,
            WhatIsNetworkNumber => {}
            NetworkNumberIs { net, configured } => {
                e.write_u16(*net)?;
                e.write_u8(u8::from(*configured))?;
            }
            Proprietary { data, .. } => e.write_slice(data)?,
        }
        Ok(())
    }

    fn decode_body(message_type: u8, decoder: &mut Decoder<'_>) -> DecodeResult<Self> {
        use NetworkMessage::*;
        let read_nets = |d: &mut Decoder<'_>| -> DecodeResult<Vec<u16>> {
            let mut nets = Vec::with_capacity(d.remaining() / 2);
            while d.remaining() >= 2 {
                nets.push(d.read_u16()?);
            }
            Ok(nets)
        };
        let read_table = |d: &mut Decoder<'_>| -> DecodeResult<Vec<RoutingTableEntry>> {
            let count = d.read_u8()?;
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let dnet = d.read_u16()?;
                let port_id = d.read_u8()?;
                let info_len = d.read_u8()? as usize;
                entries.push(RoutingTableEntry {
                    dnet,
                    port_id,
                    port_info: d.read_slice(info_len)?.to_vec(),
                });
            }
            Ok(entries)
        };

        Ok(match message_type {
            0x00 => WhoIsRouterToNetwork(if decoder.remaining() >= 2 {
                Some(decoder.read_u16()?)
            } else {
                None
            }),
            0x01 => IAmRouterToNetwork(read_nets(decoder)?),
            0x02 => ICouldBeRouterToNetwork {
                net: decoder.read_u16()?,
                performance_index: decoder.read_u8()?,
            },
            0x03 => RejectMessageToNetwork {
                reason: decoder.read_u8()?,
                net: decoder.read_u16()?,
            },
            0x04 => RouterBusyToNetwork(read_nets(decoder)?),
            0x05 => RouterAvailableToNetwork(read_nets(decoder)?),
            0x06 => InitializeRoutingTable(if decoder.remaining() > 0 {
                read_table(decoder)?
            } else {
                vec![]
            }),
            0x07 => InitializeRoutingTableAck(if decoder.remaining() > 0 {
                read_table(decoder)?
            } else {
                vec![]
            }),
            0x08 => EstablishConnectionToNetwork {
                net: decoder.read_u16()?,
                termination_time: decoder.read_u8()?,
            },
            0x09 => DisconnectConnectionToNetwork(decoder.read_u16()?),
            0x12 => WhatIsNetworkNumber,
            0x13 => NetworkNumberIs {
                net: decoder.read_u16()?,
                configured: decoder.read_u8()? == 1,
            },
            other => {
                return Err(DecodeError::InvalidData(
                    other as u32,
                    "unrecognized network message type",
                ));
            }
        })
    }
}

/// What an NPDU carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NpduContent {
    /// an APDU, opaque at this layer
    Apdu(Vec<u8>),
    /// a network-layer message
    Network(NetworkMessage),
}

/// A decoded NPDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Npdu {
    /// reply expected on the same path
    pub expecting_reply: bool,
    /// network priority, 0..=3
    pub priority: u8,
    /// DNET/DLEN/DADR, when routing beyond the local network
    pub destination: Option<Address>,
    /// SNET/SLEN/SADR, set by the first router on the path
    pub source: Option<Address>,
    /// present whenever `destination` is
    pub hop_count: Option<u8>,
    /// the payload
    pub content: NpduContent,
}

impl Npdu {
    /// an NPDU carrying an APDU with no routing header
    pub fn apdu(data: Vec<u8>) -> Self {
        Npdu {
            expecting_reply: false,
            priority: 0,
            destination: None,
            source: None,
            hop_count: None,
            content: NpduContent::Apdu(data),
        }
    }

    /// an NPDU carrying a network message with no routing header
    pub fn network(message: NetworkMessage) -> Self {
        Npdu {
            expecting_reply: false,
            priority: 0,
            destination: None,
            source: None,
            hop_count: None,
            content: NpduContent::Network(message),
        }
    }

    /// builder: set DNET/DADR and the default hop count
    pub fn with_destination(mut self, destination: Address) -> Self {
        self.destination = Some(destination);
        self.hop_count = Some(DEFAULT_HOP_COUNT);
        self
    }

    /// builder: set SNET/SADR
    pub fn with_source(mut self, source: Address) -> Self {
        self.source = Some(source);
        self
    }
}

fn encode_routed_address(e: &mut Encoder<'_>, addr: &Address) -> EncodeResult<()> {
    match &addr.kind {
        AddressKind::RemoteStation(net, mac) => {
            e.write_u16(*net)?;
            e.write_u8(mac.len() as u8)?;
            e.write_slice(mac.as_slice())
        }
        AddressKind::RemoteBroadcast(net) => {
            e.write_u16(*net)?;
            e.write_u8(0)
        }
        AddressKind::GlobalBroadcast => {
            e.write_u16(GLOBAL_DNET)?;
            e.write_u8(0)
        }
        _ => Err(EncodeError::OutOfRange("routed address")),
    }
}

fn decode_routed_address(decoder: &mut Decoder<'_>) -> DecodeResult<Address> {
    let net = decoder.read_u16()?;
    let len = decoder.read_u8()? as usize;
    Ok(if net == GLOBAL_DNET {
        Address::global_broadcast()
    } else if len == 0 {
        Address::remote_broadcast(net)
    } else {
        Address::remote_station(net, Mac::new(decoder.read_slice(len)?.to_vec()))
    })
}

impl Encodable for Npdu {
    fn encode(&self, e: &mut Encoder<'_>) -> EncodeResult<()> {
        e.write_u8(NPDU_VERSION)?;
        let mut control = self.priority & 0x03;
        if matches!(self.content, NpduContent::Network(_)) {
            control |= 0x80;
        }
        if self.destination.is_some() {
            control |= 0x20;
        }
        if self.source.is_some() {
            control |= 0x08;
        }
        if self.expecting_reply {
            control |= 0x04;
        }
        e.write_u8(control)?;

        if let Some(dest) = &self.destination {
            encode_routed_address(e, dest)?;
        }
        if let Some(source) = &self.source {
            encode_routed_address(e, source)?;
        }
        if self.destination.is_some() {
            e.write_u8(self.hop_count.unwrap_or(DEFAULT_HOP_COUNT))?;
        }

        match &self.content {
            NpduContent::Network(message) => {
                let message_type = message.message_type();
                e.write_u8(message_type)?;
                if message_type >= 0x80 {
                    let vendor_id = match message {
                        NetworkMessage::Proprietary { vendor_id, .. } => *vendor_id,
                        _ => 0,
                    };
                    e.write_u16(vendor_id)?;
                }
                message.encode_body(e)
            }
            NpduContent::Apdu(data) => e.write_slice(data),
        }
    }
}

impl Decodable for Npdu {
    fn decode(decoder: &mut Decoder<'_>) -> DecodeResult<Self> {
        let version = decoder.read_u8()?;
        if version != NPDU_VERSION {
            return Err(DecodeError::InvalidData(
                version as u32,
                "unsupported NPDU version",
            ));
        }
        let control = decoder.read_u8()?;
        let is_network = control & 0x80 != 0;
        let has_destination = control & 0x20 != 0;
        let has_source = control & 0x08 != 0;
        let expecting_reply = control & 0x04 != 0;
        let priority = control & 0x03;

        let destination = if has_destination {
            Some(decode_routed_address(decoder)?)
        } else {
            None
        };
        let source = if has_source {
            let addr = decode_routed_address(decoder)?;
            // a source must name a station
            if addr.mac().is_none() {
                return Err(DecodeError::OutOfRange("NPDU source address"));
            }
            Some(addr)
        } else {
            None
        };
        let hop_count = if has_destination {
            Some(decoder.read_u8()?)
        } else {
            None
        };

        let content = if is_network {
            let message_type = decoder.read_u8()?;
            if message_type >= 0x80 {
                let vendor_id = decoder.read_u16()?;
                NpduContent::Network(NetworkMessage::Proprietary {
                    message_type,
                    vendor_id,
                    data: decoder.read_slice(decoder.remaining())?.to_vec(),
                })
            } else {
                NpduContent::Network(NetworkMessage::decode_body(message_type, decoder)?)
            }
        } else {
            NpduContent::Apdu(decoder.read_slice(decoder.remaining())?.to_vec())
        };

        Ok(Npdu {
            expecting_reply,
            priority,
            destination,
            source,
            hop_count,
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(npdu: Npdu) {
        let bytes = npdu.to_vec().unwrap();
        assert_eq!(Npdu::from_bytes(&bytes).unwrap(), npdu);
    }

    #[test]
    fn plain_apdu_header() {
        let npdu = Npdu::apdu(vec![0x10, 0x08]);
        let bytes = npdu.to_vec().unwrap();
        assert_eq!(&bytes, &[0x01, 0x00, 0x10, 0x08]);
        roundtrip(npdu);
    }

    #[test]
    fn routed_header_with_hop_count() {
        let npdu = Npdu::apdu(vec![0xAA])
            .with_destination(Address::remote_station(3, Mac::station(0x11)))
            .with_source(Address::remote_station(1, Mac::station(0x22)));
        let bytes = npdu.to_vec().unwrap();
        // control: dest + source
        assert_eq!(bytes[1], 0x28);
        // DNET 3, DLEN 1, DADR 0x11
        assert_eq!(&bytes[2..6], &[0x00, 0x03, 0x01, 0x11]);
        // SNET 1, SLEN 1, SADR 0x22
        assert_eq!(&bytes[6..10], &[0x00, 0x01, 0x01, 0x22]);
        // hop count trails the addresses
        assert_eq!(bytes[10], DEFAULT_HOP_COUNT);
        roundtrip(npdu);
    }

    #[test]
    fn global_broadcast_dnet() {
        let npdu = Npdu::apdu(vec![]).with_destination(Address::global_broadcast());
        let bytes = npdu.to_vec().unwrap();
        assert_eq!(&bytes[2..5], &[0xFF, 0xFF, 0x00]);
        roundtrip(npdu);
    }

    #[test]
    fn network_messages_roundtrip() {
        for message in [
            NetworkMessage::WhoIsRouterToNetwork(None),
            NetworkMessage::WhoIsRouterToNetwork(Some(3)),
            NetworkMessage::IAmRouterToNetwork(vec![3, 4, 5]),
            NetworkMessage::RejectMessageToNetwork { reason: 1, net: 9 },
            NetworkMessage::RouterBusyToNetwork(vec![7]),
            NetworkMessage::RouterAvailableToNetwork(vec![7]),
            NetworkMessage::InitializeRoutingTable(vec![]),
            NetworkMessage::InitializeRoutingTableAck(vec![RoutingTableEntry {
                dnet: 2,
                port_id: 1,
                port_info: vec![],
            }]),
            NetworkMessage::WhatIsNetworkNumber,
            NetworkMessage::NetworkNumberIs {
                net: 100,
                configured: true,
            },
        ] {
            roundtrip(Npdu::network(message));
        }
    }

    #[test]
    fn network_control_bit() {
        let npdu = Npdu::network(NetworkMessage::WhatIsNetworkNumber);
        let bytes = npdu.to_vec().unwrap();
        assert_eq!(bytes[1] & 0x80, 0x80);
        assert_eq!(bytes[2], 0x12);
    }

    #[test]
    fn version_checked() {
        assert!(Npdu::from_bytes(&[0x02, 0x00]).is_err());
    }
}
