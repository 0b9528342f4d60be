//! BACnet/IPv6 link (Annex U)
//!
//! Stations carry a 3-octet VMAC inside the BVLL while the link addresses
//! peers by their 18-octet address+port MAC. Inbound frames teach us the
//! VMAC binding of each peer; address-resolution requests are answered with
//! our own binding. Broadcasts ride the well-known multicast group.

use std::{
    collections::HashMap,
    net::{Ipv6Addr, SocketAddr, SocketAddrV6},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::{net::UdpSocket, sync::mpsc};
use tracing::{debug, warn};

use crate::{
    bvll::{BvllV6, Vmac},
    decoder::Decodable,
    encoder::Encodable,
    error::{Error, Result},
    link::{DataLink, LinkFrame},
    pdu::{Address, AddressKind, Mac},
};

/// the link-local BACnet multicast group, FF02::BAC0
pub const MULTICAST_GROUP: Ipv6Addr = Ipv6Addr::new(0xFF02, 0, 0, 0, 0, 0, 0, 0xBAC0);

/// A BACnet/IPv6 link
pub struct BipV6Link {
    socket: Arc<UdpSocket>,
    local: Address,
    vmac: Vmac,
    group_port: u16,
    frames: tokio::sync::Mutex<mpsc::Receiver<LinkFrame>>,
    task: tokio::task::JoinHandle<()>,
}

impl BipV6Link {
    /// bind, join the multicast group, and start the receive pump.
    /// The VMAC is conventionally derived from the device instance.
    pub async fn start(bind: SocketAddrV6, vmac: Vmac, interface: u32) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::V6(bind)).await?;
        socket.join_multicast_v6(&MULTICAST_GROUP, interface)?;
        let socket = Arc::new(socket);
        let local = Address::local_station(Mac::from_ipv6(bind));

        let (tx, rx) = mpsc::channel(64);
        let bindings: Arc<Mutex<HashMap<Vmac, SocketAddrV6>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let task = tokio::spawn(Self::pump(
            socket.clone(),
            vmac,
            local.clone(),
            tx,
            bindings,
        ));

        Ok(BipV6Link {
            socket,
            local,
            vmac,
            group_port: bind.port(),
            frames: tokio::sync::Mutex::new(rx),
            task,
        })
    }

    async fn pump(
        socket: Arc<UdpSocket>,
        our_vmac: Vmac,
        local: Address,
        tx: mpsc::Sender<LinkFrame>,
        bindings: Arc<Mutex<HashMap<Vmac, SocketAddrV6>>>,
    ) {
        let mut buf = vec![0u8; 1500];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(ok) => ok,
                Err(e) => {
                    warn!("socket receive failed: {e}");
                    continue;
                }
            };
            let peer_v6 = match peer {
                SocketAddr::V6(v6) => v6,
                SocketAddr::V4(_) => continue,
            };
            let message = match BvllV6::from_bytes(&buf[..len]) {
                Ok(m) => m,
                Err(e) => {
                    debug!("dropping malformed BVLL-IPv6 from {peer}: {e}");
                    continue;
                }
            };
            let source = Address::local_station(Mac::from_ipv6(peer_v6));

            let frame = match message {
                BvllV6::OriginalUnicast {
                    source: src_vmac,
                    destination,
                    npdu,
                } => {
                    bindings.lock().expect("poisoned").insert(src_vmac, peer_v6);
                    // zero VMAC addresses whoever owns the socket address
                    if destination != our_vmac && destination != Vmac([0, 0, 0]) {
                        continue;
                    }
                    Some(LinkFrame {
                        source,
                        destination: local.clone(),
                        npdu,
                    })
                }
                BvllV6::OriginalBroadcast {
                    source: src_vmac,
                    npdu,
                } => {
                    if src_vmac == our_vmac {
                        continue;
                    }
                    bindings.lock().expect("poisoned").insert(src_vmac, peer_v6);
                    Some(LinkFrame {
                        source,
                        destination: Address::local_broadcast(),
                        npdu,
                    })
                }
                BvllV6::AddressResolution {
                    source: src_vmac,
                    target,
                } => {
                    bindings.lock().expect("poisoned").insert(src_vmac, peer_v6);
                    if target == our_vmac {
                        let ack = BvllV6::AddressResolutionAck {
                            source: our_vmac,
                            destination: src_vmac,
                        };
                        if let Ok(bytes) = ack.to_vec() {
                            let _ = socket.send_to(&bytes, peer).await;
                        }
                    }
                    None
                }
                BvllV6::AddressResolutionAck {
                    source: src_vmac, ..
                } => {
                    bindings.lock().expect("poisoned").insert(src_vmac, peer_v6);
                    None
                }
                BvllV6::Result { code, .. } => {
                    if code != 0 {
                        warn!("BVLL-IPv6 negative result: {code:#06x}");
                    }
                    None
                }
            };

            if let Some(frame) = frame
                && tx.send(frame).await.is_err()
            {
                return;
            }
        }
    }
}

#[async_trait]
impl DataLink for BipV6Link {
    fn local_address(&self) -> Address {
        self.local.clone()
    }

    async fn send(&self, destination: &Address, npdu: &[u8]) -> Result<()> {
        match &destination.kind {
            AddressKind::LocalStation(mac) => {
                let to = mac
                    .to_socket_addr()
                    .ok_or(Error::Config("station MAC is not an IPv6 address"))?;
                let message = BvllV6::OriginalUnicast {
                    source: self.vmac,
                    // the peer checks the VMAC against its own; zero means
                    // "whoever owns this socket address"
                    destination: Vmac([0, 0, 0]),
                    npdu: npdu.to_vec(),
                };
                self.socket.send_to(&message.to_vec()?, to).await?;
                Ok(())
            }
            AddressKind::LocalBroadcast => {
                let message = BvllV6::OriginalBroadcast {
                    source: self.vmac,
                    npdu: npdu.to_vec(),
                };
                let to = SocketAddr::V6(SocketAddrV6::new(MULTICAST_GROUP, self.group_port, 0, 0));
                self.socket.send_to(&message.to_vec()?, to).await?;
                Ok(())
            }
            _ => Err(Error::Config("link can only address local stations")),
        }
    }

    async fn recv(&self) -> Result<LinkFrame> {
        self.frames
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::Cancelled)
    }
}

impl Drop for BipV6Link {
    fn drop(&mut self) {
        self.task.abort();
    }
}
