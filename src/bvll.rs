//! BACnet Virtual Link Layer framing (Annex J for IPv4, Annex U for IPv6)
//!
//! Every BACnet/IP datagram starts with a 4-octet header: the BVLL type
//! octet (0x81 for IPv4, 0x82 for IPv6), a function code, and the total
//! frame length including the header.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::{
    decoder::{Decodable, Decoder},
    encoder::{Encodable, Encoder},
    error::{DecodeError, DecodeResult, EncodeError, EncodeResult},
};

/// BVLL type octet for BACnet/IPv4
pub const BVLL_TYPE_IPV4: u8 = 0x81;
/// BVLL type octet for BACnet/IPv6
pub const BVLL_TYPE_IPV6: u8 = 0x82;

/// Result code: success
pub const RESULT_SUCCESS: u16 = 0x0000;
/// Result code: foreign-device registration refused
pub const RESULT_REGISTER_FD_NAK: u16 = 0x0030;
/// Result code: distribute-broadcast refused
pub const RESULT_DISTRIBUTE_NAK: u16 = 0x0060;

/// One broadcast distribution table row: peer address and distribution mask.
///
/// An all-ones mask means unicast forwarding to the peer; anything else
/// produces a directed broadcast on the peer's subnet.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BdtEntry {
    /// the BBMD peer
    pub address: SocketAddrV4,
    /// broadcast distribution mask
    pub mask: Ipv4Addr,
}

impl BdtEntry {
    /// a peer reached by plain unicast
    pub fn unicast(address: SocketAddrV4) -> Self {
        BdtEntry {
            address,
            mask: Ipv4Addr::BROADCAST,
        }
    }

    /// the address this entry's forwards are sent to
    pub fn forward_to(&self) -> SocketAddrV4 {
        let ip = u32::from(*self.address.ip()) | !u32::from(self.mask);
        SocketAddrV4::new(Ipv4Addr::from(ip), self.address.port())
    }
}

/// One foreign device table row
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdtEntry {
    /// the registered foreign device
    pub address: SocketAddrV4,
    /// registered time-to-live, seconds
    pub ttl: u16,
    /// seconds until the registration lapses
    pub remaining: u16,
}

fn encode_socket_v4(e: &mut Encoder<'_>, addr: &SocketAddrV4) -> EncodeResult<()> {
    e.write(addr.ip().octets())?;
    e.write_u16(addr.port())
}

fn decode_socket_v4(decoder: &mut Decoder<'_>) -> DecodeResult<SocketAddrV4> {
    let ip: [u8; 4] = decoder.read()?;
    let port = decoder.read_u16()?;
    Ok(SocketAddrV4::new(Ipv4Addr::from(ip), port))
}

/// BVLL-IPv4 messages (Annex J)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bvll {
    /// 0x00
    Result(u16),
    /// 0x01
    WriteBdt(Vec<BdtEntry>),
    /// 0x02
    ReadBdt,
    /// 0x03
    ReadBdtAck(Vec<BdtEntry>),
    /// 0x04: an NPDU relayed by a BBMD, carrying the original sender
    ForwardedNpdu {
        origin: SocketAddrV4,
        npdu: Vec<u8>,
    },
    /// 0x05
    RegisterForeignDevice {
        ttl: u16,
    },
    /// 0x06
    ReadFdt,
    /// 0x07
    ReadFdtAck(Vec<FdtEntry>),
    /// 0x08
    DeleteFdtEntry(SocketAddrV4),
    /// 0x09: a foreign device asking its BBMD to broadcast
    DistributeBroadcast(Vec<u8>),
    /// 0x0A
    OriginalUnicast(Vec<u8>),
    /// 0x0B
    OriginalBroadcast(Vec<u8>),
    /// 0x0C: opaque at this layer
    SecureBvll(Vec<u8>),
}

impl Bvll {
    /// the function code octet
    pub fn function(&self) -> u8 {
        use Bvll::*;
        match self {
            Result(_) => 0x00,
            WriteBdt(_) => 0x01,
            ReadBdt => 0x02,
            ReadBdtAck(_) => 0x03,
            ForwardedNpdu { .. } => 0x04,
            RegisterForeignDevice { .. } => 0x05,
            ReadFdt => 0x06,
            ReadFdtAck(_) => 0x07,
            DeleteFdtEntry(_) => 0x08,
            DistributeBroadcast(_) => 0x09,
            OriginalUnicast(_) => 0x0A,
            OriginalBroadcast(_) => 0x0B,
            SecureBvll(_) => 0x0C,
        }
    }
}

impl Encodable for Bvll {
    fn encode(&self, e: &mut Encoder<'_>) -> EncodeResult<()> {
        // body first, to learn the length
        let mut body = Vec::new();
        {
            let mut be = Encoder::new(&mut body);
            use Bvll::*;
            match self {
                Result(code) => be.write_u16(*code)?,
                WriteBdt(entries) | ReadBdtAck(entries) => {
                    for entry in entries {
                        encode_socket_v4(&mut be, &entry.address)?;
                        be.write(entry.mask.octets())?;
                    }
                }
                ReadBdt | ReadFdt => {}
                ForwardedNpdu { origin, npdu } => {
                    encode_socket_v4(&mut be, origin)?;
                    be.write_slice(npdu)?;
                }
                RegisterForeignDevice { ttl } => be.write_u16(*ttl)?,
                ReadFdtAck(entries) => {
                    for entry in entries {
                        encode_socket_v4(&mut be, &entry.address)?;
                        be.write_u16(entry.ttl)?;
                        be.write_u16(entry.remaining)?;
                    }
                }
                DeleteFdtEntry(addr) => encode_socket_v4(&mut be, addr)?,
                DistributeBroadcast(npdu) | OriginalUnicast(npdu) | OriginalBroadcast(npdu)
                | SecureBvll(npdu) => be.write_slice(npdu)?,
            }
        }

        let total = body.len() + 4;
        if total > u16::MAX as usize {
            return Err(EncodeError::TooLong {
                len: total,
                max: u16::MAX as usize,
            });
        }
        e.write_u8(BVLL_TYPE_IPV4)?;
        e.write_u8(self.function())?;
        e.write_u16(total as u16)?;
        e.write_slice(&body)
    }
}

impl Decodable for Bvll {
    fn decode(decoder: &mut Decoder<'_>) -> DecodeResult<Self> {
        let bvll_type = decoder.read_u8()?;
        if bvll_type != BVLL_TYPE_IPV4 {
            return Err(DecodeError::InvalidData(
                bvll_type as u32,
                "not a BACnet/IPv4 frame",
            ));
        }
        let function = decoder.read_u8()?;
        let length = decoder.read_u16()? as usize;
        if length < 4 || length - 4 > decoder.remaining() {
            return Err(DecodeError::NotEnoughBytes);
        }
        let mut body = Decoder::new(decoder.read_slice(length - 4)?);

        use Bvll::*;
        Ok(match function {
            0x00 => Result(body.read_u16()?),
            0x01 | 0x03 => {
                let mut entries = Vec::with_capacity(body.remaining() / 10);
                while body.remaining() >= 10 {
                    let address = decode_socket_v4(&mut body)?;
                    let mask: [u8; 4] = body.read()?;
                    entries.push(BdtEntry {
                        address,
                        mask: Ipv4Addr::from(mask),
                    });
                }
                if function == 0x01 {
                    WriteBdt(entries)
                } else {
                    ReadBdtAck(entries)
                }
            }
            0x02 => ReadBdt,
            0x04 => ForwardedNpdu {
                origin: decode_socket_v4(&mut body)?,
                npdu: body.read_slice(body.remaining())?.to_vec(),
            },
            0x05 => RegisterForeignDevice {
                ttl: body.read_u16()?,
            },
            0x06 => ReadFdt,
            0x07 => {
                let mut entries = Vec::with_capacity(body.remaining() / 10);
                while body.remaining() >= 10 {
                    entries.push(FdtEntry {
                        address: decode_socket_v4(&mut body)?,
                        ttl: body.read_u16()?,
                        remaining: body.read_u16()?,
                    });
                }
                ReadFdtAck(entries)
            }
            0x08 => DeleteFdtEntry(decode_socket_v4(&mut body)?),
            0x09 => DistributeBroadcast(body.read_slice(body.remaining())?.to_vec()),
            0x0A => OriginalUnicast(body.read_slice(body.remaining())?.to_vec()),
            0x0B => OriginalBroadcast(body.read_slice(body.remaining())?.to_vec()),
            0x0C => SecureBvll(body.read_slice(body.remaining())?.to_vec()),
            other => {
                return Err(DecodeError::InvalidData(
                    other as u32,
                    "unrecognized BVLL function",
                ));
            }
        })
    }
}

/// 3-octet virtual MAC used on BACnet/IPv6 links
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vmac(pub [u8; 3]);

impl Vmac {
    /// derive a VMAC from a device instance (low 3 octets)
    pub fn from_device_instance(instance: u32) -> Self {
        let b = instance.to_be_bytes();
        Vmac([b[1], b[2], b[3]])
    }
}

/// BVLL-IPv6 messages (Annex U); the operational subset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BvllV6 {
    /// 0x00
    Result {
        source: Vmac,
        function: u8,
        code: u16,
    },
    /// 0x01
    OriginalUnicast {
        source: Vmac,
        destination: Vmac,
        npdu: Vec<u8>,
    },
    /// 0x02
    OriginalBroadcast {
        source: Vmac,
        npdu: Vec<u8>,
    },
    /// 0x03
    AddressResolution {
        source: Vmac,
        target: Vmac,
    },
    /// 0x05
    AddressResolutionAck {
        source: Vmac,
        destination: Vmac,
    },
}

impl BvllV6 {
    fn function(&self) -> u8 {
        use BvllV6::*;
        match self {
            Result { .. } => 0x00,
            OriginalUnicast { .. } => 0x01,
            OriginalBroadcast { .. } => 0x02,
            AddressResolution { .. } => 0x03,
            AddressResolutionAck { .. } => 0x05,
        }
    }
}

impl Encodable for BvllV6 {
    fn encode(&self, e: &mut Encoder<'_>) -> EncodeResult<()> {
        let mut body = Vec::new();
        {
            let mut be = Encoder::new(&mut body);
            use BvllV6::*;
            match self {
                Result {
                    source,
                    function,
                    code,
                } => {
                    be.write(source.0)?;
                    be.write_u8(*function)?;
                    be.write_u16(*code)?;
                }
                OriginalUnicast {
                    source,
                    destination,
                    npdu,
                } => {
                    be.write(source.0)?;
                    be.write(destination.0)?;
                    be.write_slice(npdu)?;
                }
                OriginalBroadcast { source, npdu } => {
                    be.write(source.0)?;
                    be.write_slice(npdu)?;
                }
                AddressResolution { source, target } => {
                    be.write(source.0)?;
                    be.write(target.0)?;
                }
                AddressResolutionAck {
                    source,
                    destination,
                } => {
                    be.write(source.0)?;
                    be.write(destination.0)?;
                }
            }
        }
        e.write_u8(BVLL_TYPE_IPV6)?;
        e.write_u8(self.function())?;
        e.write_u16((body.len() + 4) as u16)?;
        e.write_slice(&body)
    }
}

impl Decodable for BvllV6 {
    fn decode(decoder: &mut Decoder<'_>) -> DecodeResult<Self> {
        let bvll_type = decoder.read_u8()?;
        if bvll_type != BVLL_TYPE_IPV6 {
            return Err(DecodeError::InvalidData(
                bvll_type as u32,
                "not a BACnet/IPv6 frame",
            ));
        }
        let function = decoder.read_u8()?;
        let length = decoder.read_u16()? as usize;
        if length < 4 || length - 4 > decoder.remaining() {
            return Err(DecodeError::NotEnoughBytes);
        }
        let mut body = Decoder::new(decoder.read_slice(length - 4)?);

        use BvllV6::*;
        Ok(match function {
            0x00 => Result {
                source: Vmac(body.read()?),
                function: body.read_u8()?,
                code: body.read_u16()?,
            },
            0x01 => OriginalUnicast {
                source: Vmac(body.read()?),
                destination: Vmac(body.read()?),
                npdu: body.read_slice(body.remaining())?.to_vec(),
            },
            0x02 => OriginalBroadcast {
                source: Vmac(body.read()?),
                npdu: body.read_slice(body.remaining())?.to_vec(),
            },
            0x03 => AddressResolution {
                source: Vmac(body.read()?),
                target: Vmac(body.read()?),
            },
            0x05 => AddressResolutionAck {
                source: Vmac(body.read()?),
                destination: Vmac(body.read()?),
            },
            other => {
                return Err(DecodeError::InvalidData(
                    other as u32,
                    "unrecognized BVLL-IPv6 function",
                ));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Bvll) {
        let bytes = message.to_vec().unwrap();
        assert_eq!(Bvll::from_bytes(&bytes).unwrap(), message);
    }

    #[test]
    fn original_unicast_header() {
        let message = Bvll::OriginalUnicast(vec![0x01, 0x00, 0xAA]);
        let bytes = message.to_vec().unwrap();
        assert_eq!(&bytes[..4], &[0x81, 0x0A, 0x00, 0x07]);
        roundtrip(message);
    }

    #[test]
    fn forwarded_npdu_carries_origin() {
        let message = Bvll::ForwardedNpdu {
            origin: "10.0.1.5:47808".parse().unwrap(),
            npdu: vec![0x01, 0x00],
        };
        let bytes = message.to_vec().unwrap();
        assert_eq!(bytes[1], 0x04);
        assert_eq!(&bytes[4..8], &[10, 0, 1, 5]);
        roundtrip(message);
    }

    #[test]
    fn register_fd_and_result() {
        roundtrip(Bvll::RegisterForeignDevice { ttl: 30 });
        roundtrip(Bvll::Result(RESULT_REGISTER_FD_NAK));
    }

    #[test]
    fn table_messages_roundtrip() {
        roundtrip(Bvll::ReadBdt);
        roundtrip(Bvll::ReadBdtAck(vec![BdtEntry {
            address: "192.168.1.255:47808".parse().unwrap(),
            mask: "255.255.255.0".parse().unwrap(),
        }]));
        roundtrip(Bvll::ReadFdt);
        roundtrip(Bvll::ReadFdtAck(vec![FdtEntry {
            address: "172.16.0.9:47808".parse().unwrap(),
            ttl: 60,
            remaining: 42,
        }]));
        roundtrip(Bvll::DeleteFdtEntry("172.16.0.9:47808".parse().unwrap()));
        roundtrip(Bvll::WriteBdt(vec![BdtEntry::unicast(
            "10.1.2.3:47808".parse().unwrap(),
        )]));
    }

    #[test]
    fn bdt_directed_broadcast_address() {
        let entry = BdtEntry {
            address: "192.168.1.1:47808".parse().unwrap(),
            mask: "255.255.255.0".parse().unwrap(),
        };
        assert_eq!(
            entry.forward_to(),
            "192.168.1.255:47808".parse().unwrap()
        );
        // all-ones mask forwards by plain unicast
        let entry = BdtEntry::unicast("10.1.2.3:47808".parse().unwrap());
        assert_eq!(entry.forward_to(), "10.1.2.3:47808".parse().unwrap());
    }

    #[test]
    fn truncated_frame_rejected() {
        // declared length exceeds what's on the wire
        assert!(Bvll::from_bytes(&[0x81, 0x0A, 0x00, 0x08, 0x01]).is_err());
        // wrong type octet
        assert!(Bvll::from_bytes(&[0x82, 0x0A, 0x00, 0x04]).is_err());
    }

    #[test]
    fn ipv6_roundtrip() {
        for message in [
            BvllV6::OriginalUnicast {
                source: Vmac([1, 2, 3]),
                destination: Vmac([4, 5, 6]),
                npdu: vec![0x01, 0x00],
            },
            BvllV6::OriginalBroadcast {
                source: Vmac([1, 2, 3]),
                npdu: vec![0x01, 0x00],
            },
            BvllV6::AddressResolution {
                source: Vmac([1, 2, 3]),
                target: Vmac([4, 5, 6]),
            },
        ] {
            let bytes = message.to_vec().unwrap();
            assert_eq!(bytes[0], BVLL_TYPE_IPV6);
            assert_eq!(BvllV6::from_bytes(&bytes).unwrap(), message);
        }
    }
}
