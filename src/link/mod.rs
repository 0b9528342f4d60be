//! Data links: the byte-PDU endpoints at the bottom of the stack
//!
//! A link delivers NPDUs between local stations. Everything above sees only
//! [`LinkFrame`]s with local-station or local-broadcast addressing; BVLL
//! framing, foreign-device registration, and broadcast distribution stay
//! inside the link.

use async_trait::async_trait;

use crate::{error::Result, pdu::Address};

pub mod bip;
pub mod ipv6;
pub mod vlan;

pub use bip::{BipConfig, BipLink, BipMode};
pub use ipv6::BipV6Link;
pub use vlan::{VirtualNetwork, VirtualNode};

/// An NPDU as it crosses the link boundary
#[derive(Debug, Clone)]
pub struct LinkFrame {
    /// sending station
    pub source: Address,
    /// us, or the local broadcast
    pub destination: Address,
    /// the NPDU octets
    pub npdu: Vec<u8>,
}

/// A data link: framed-NPDU endpoint above, bytes-on-a-wire below
#[async_trait]
pub trait DataLink: Send + Sync {
    /// this station's address on the link
    fn local_address(&self) -> Address;

    /// send an NPDU to a local station or the local broadcast
    async fn send(&self, destination: &Address, npdu: &[u8]) -> Result<()>;

    /// the next inbound frame; pends until one arrives
    async fn recv(&self) -> Result<LinkFrame>;

    /// orderly shutdown; foreign devices deregister here
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
