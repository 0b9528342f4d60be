//! BACnet/IPv4 links: normal, foreign-device, and BBMD modes (Annex J)

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    net::UdpSocket,
    sync::mpsc,
    time::{Instant, interval},
};
use tracing::{debug, warn};

use crate::{
    bvll::{BdtEntry, Bvll, FdtEntry, RESULT_SUCCESS},
    decoder::Decodable,
    encoder::Encodable,
    error::{Error, Result},
    link::{DataLink, LinkFrame},
    pdu::{Address, AddressKind, BACNET_PORT},
};

/// slack added to a foreign registration before it is purged, seconds
const FDT_GRACE: u64 = 30;

/// How a BACnet/IPv4 link participates in broadcast distribution
#[derive(Debug, Clone)]
pub enum BipMode {
    /// plain subnet citizen: original unicast/broadcast
    Normal,
    /// registers with a BBMD and receives distributed broadcasts
    Foreign {
        /// the BBMD to register with
        bbmd: SocketAddrV4,
        /// registration time-to-live, seconds
        ttl: u16,
    },
    /// runs the broadcast distribution machinery for the subnet
    Bbmd {
        /// broadcast distribution table, this BBMD included
        bdt: Vec<BdtEntry>,
    },
}

/// BACnet/IPv4 link configuration
#[derive(Debug, Clone)]
pub struct BipConfig {
    /// local bind address
    pub address: SocketAddrV4,
    /// subnet broadcast address; the limited broadcast when unknown
    pub broadcast: Ipv4Addr,
    /// participation mode
    pub mode: BipMode,
}

impl BipConfig {
    /// a normal-mode config on the default port
    pub fn normal(address: SocketAddrV4, broadcast: Ipv4Addr) -> Self {
        BipConfig {
            address,
            broadcast,
            mode: BipMode::Normal,
        }
    }
}

struct ForeignState {
    bbmd: SocketAddrV4,
    ttl: u16,
    registered: bool,
}

struct BbmdState {
    bdt: Vec<BdtEntry>,
    fdt: HashMap<SocketAddrV4, (u16, Instant)>,
}

impl BbmdState {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.fdt.retain(|_, (_, expiry)| *expiry > now);
    }

    fn live_entries(&mut self) -> Vec<SocketAddrV4> {
        self.purge_expired();
        self.fdt.keys().copied().collect()
    }

    fn table(&mut self) -> Vec<FdtEntry> {
        self.purge_expired();
        let now = Instant::now();
        self.fdt
            .iter()
            .map(|(addr, (ttl, expiry))| FdtEntry {
                address: *addr,
                ttl: *ttl,
                remaining: expiry.saturating_duration_since(now).as_secs() as u16,
            })
            .collect()
    }
}

/// A BACnet/IPv4 link in one of the three modes
pub struct BipLink {
    socket: Arc<UdpSocket>,
    config: BipConfig,
    local: Address,
    frames: tokio::sync::Mutex<mpsc::Receiver<LinkFrame>>,
    foreign: Option<Arc<Mutex<ForeignState>>>,
    bbmd: Option<Arc<Mutex<BbmdState>>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl BipLink {
    /// bind the socket and start the receive pump (and, in foreign mode,
    /// the re-registration timer)
    pub async fn start(mut config: BipConfig) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::V4(config.address)).await?;
        socket.set_broadcast(true)?;
        // pick up the kernel-assigned port when bound to port 0
        if let Ok(SocketAddr::V4(bound)) = socket.local_addr() {
            config.address = bound;
        }
        let socket = Arc::new(socket);
        let local = Address::from_ipv4(config.address);

        let foreign = match &config.mode {
            BipMode::Foreign { bbmd, ttl } => Some(Arc::new(Mutex::new(ForeignState {
                bbmd: *bbmd,
                ttl: *ttl,
                registered: false,
            }))),
            _ => None,
        };
        let bbmd = match &config.mode {
            BipMode::Bbmd { bdt } => Some(Arc::new(Mutex::new(BbmdState {
                bdt: bdt.clone(),
                fdt: HashMap::new(),
            }))),
            _ => None,
        };

        let (tx, rx) = mpsc::channel(64);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(Self::pump(
            socket.clone(),
            config.clone(),
            tx,
            foreign.clone(),
            bbmd.clone(),
        )));

        if let Some(state) = foreign.clone() {
            let socket = socket.clone();
            tasks.push(tokio::spawn(async move {
                let (bbmd, ttl) = {
                    let state = state.lock().expect("poisoned");
                    (state.bbmd, state.ttl)
                };
                let register = Bvll::RegisterForeignDevice { ttl };
                let bytes = match register.to_vec() {
                    Ok(b) => b,
                    Err(_) => return,
                };
                // re-register at half the TTL so the entry never lapses
                let mut ticker = interval(Duration::from_secs((ttl as u64 / 2).max(1)));
                loop {
                    ticker.tick().await;
                    if let Err(e) = socket.send_to(&bytes, SocketAddr::V4(bbmd)).await {
                        warn!("foreign registration send failed: {e}");
                    }
                }
            }));
        }

        Ok(BipLink {
            socket,
            config,
            local,
            frames: tokio::sync::Mutex::new(rx),
            foreign,
            bbmd,
            tasks,
        })
    }

    /// true once the BBMD has acknowledged our registration
    pub fn is_registered(&self) -> bool {
        self.foreign
            .as_ref()
            .map(|s| s.lock().expect("poisoned").registered)
            .unwrap_or(false)
    }

    /// current foreign-device table (BBMD mode)
    pub fn foreign_device_table(&self) -> Vec<FdtEntry> {
        self.bbmd
            .as_ref()
            .map(|s| s.lock().expect("poisoned").table())
            .unwrap_or_default()
    }

    async fn send_bvll(socket: &UdpSocket, message: &Bvll, to: SocketAddr) -> Result<()> {
        let bytes = message.to_vec()?;
        socket.send_to(&bytes, to).await?;
        Ok(())
    }

    async fn pump(
        socket: Arc<UdpSocket>,
        config: BipConfig,
        tx: mpsc::Sender<LinkFrame>,
        foreign: Option<Arc<Mutex<ForeignState>>>,
        bbmd: Option<Arc<Mutex<BbmdState>>>,
    ) {
        let us = SocketAddr::V4(config.address);
        let local = Address::from_ipv4(config.address);
        let mut buf = vec![0u8; 1500];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(ok) => ok,
                Err(e) => {
                    warn!("socket receive failed: {e}");
                    continue;
                }
            };
            if peer == us {
                continue;
            }
            let peer_v4 = match peer {
                SocketAddr::V4(v4) => v4,
                SocketAddr::V6(_) => continue,
            };
            let message = match Bvll::from_bytes(&buf[..len]) {
                Ok(m) => m,
                Err(e) => {
                    debug!("dropping malformed BVLL from {peer}: {e}");
                    continue;
                }
            };

            let frame = match message {
                Bvll::OriginalUnicast(npdu) => Some(LinkFrame {
                    source: Address::from_ipv4(peer_v4),
                    destination: local.clone(),
                    npdu,
                }),
                Bvll::OriginalBroadcast(npdu) => {
                    if let Some(state) = &bbmd {
                        Self::distribute(
                            &socket,
                            &config,
                            state,
                            peer_v4,
                            &npdu,
                            /*rebroadcast_locally=*/ false,
                        )
                        .await;
                    }
                    Some(LinkFrame {
                        source: Address::from_ipv4(peer_v4),
                        destination: Address::local_broadcast(),
                        npdu,
                    })
                }
                Bvll::ForwardedNpdu { origin, npdu } => {
                    if let Some(state) = &bbmd {
                        // fan out to our foreign devices; BDT peers already
                        // got it from the originating BBMD
                        let entries = state.lock().expect("poisoned").live_entries();
                        let fwd = Bvll::ForwardedNpdu {
                            origin,
                            npdu: npdu.clone(),
                        };
                        for fd in entries {
                            if fd == peer_v4 || fd == origin {
                                continue;
                            }
                            let _ = Self::send_bvll(&socket, &fwd, SocketAddr::V4(fd)).await;
                        }
                    }
                    Some(LinkFrame {
                        source: Address::from_ipv4(origin),
                        destination: Address::local_broadcast(),
                        npdu,
                    })
                }
                Bvll::DistributeBroadcast(npdu) => {
                    if let Some(state) = &bbmd {
                        Self::distribute(&socket, &config, state, peer_v4, &npdu, true).await;
                        Some(LinkFrame {
                            source: Address::from_ipv4(peer_v4),
                            destination: Address::local_broadcast(),
                            npdu,
                        })
                    } else {
                        warn!("distribute-broadcast received but not a BBMD");
                        None
                    }
                }
                Bvll::RegisterForeignDevice { ttl } => {
                    if let Some(state) = &bbmd {
                        state.lock().expect("poisoned").fdt.insert(
                            peer_v4,
                            (ttl, Instant::now() + Duration::from_secs(ttl as u64 + FDT_GRACE)),
                        );
                        let _ =
                            Self::send_bvll(&socket, &Bvll::Result(RESULT_SUCCESS), peer).await;
                    }
                    None
                }
                Bvll::Result(code) => {
                    if let Some(state) = &foreign {
                        let mut state = state.lock().expect("poisoned");
                        if peer_v4 == state.bbmd {
                            state.registered = code == RESULT_SUCCESS;
                            if code != RESULT_SUCCESS {
                                warn!("BBMD refused registration: {code:#06x}");
                            }
                        }
                    }
                    None
                }
                Bvll::ReadBdt => {
                    if let Some(state) = &bbmd {
                        let entries = state.lock().expect("poisoned").bdt.clone();
                        let _ =
                            Self::send_bvll(&socket, &Bvll::ReadBdtAck(entries), peer).await;
                    }
                    None
                }
                Bvll::WriteBdt(entries) => {
                    if let Some(state) = &bbmd {
                        state.lock().expect("poisoned").bdt = entries;
                        let _ =
                            Self::send_bvll(&socket, &Bvll::Result(RESULT_SUCCESS), peer).await;
                    }
                    None
                }
                Bvll::ReadFdt => {
                    if let Some(state) = &bbmd {
                        let entries = state.lock().expect("poisoned").table();
                        let _ =
                            Self::send_bvll(&socket, &Bvll::ReadFdtAck(entries), peer).await;
                    }
                    None
                }
                Bvll::DeleteFdtEntry(addr) => {
                    if let Some(state) = &bbmd {
                        state.lock().expect("poisoned").fdt.remove(&addr);
                        let _ =
                            Self::send_bvll(&socket, &Bvll::Result(RESULT_SUCCESS), peer).await;
                    }
                    None
                }
                Bvll::ReadBdtAck(_) | Bvll::ReadFdtAck(_) => {
                    // management responses surface to whoever polled; the
                    // link itself has no use for them
                    None
                }
                Bvll::SecureBvll(_) => {
                    debug!("ignoring secure-BVLL from {peer}");
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

    /// BBMD fan-out of a broadcast originated by `origin_peer`
    async fn distribute(
        socket: &UdpSocket,
        config: &BipConfig,
        state: &Arc<Mutex<BbmdState>>,
        origin_peer: SocketAddrV4,
        npdu: &[u8],
        rebroadcast_locally: bool,
    ) {
        let (bdt, fds) = {
            let mut state = state.lock().expect("poisoned");
            (state.bdt.clone(), state.live_entries())
        };
        let fwd = Bvll::ForwardedNpdu {
            origin: origin_peer,
            npdu: npdu.to_vec(),
        };
        if rebroadcast_locally {
            let to = SocketAddrV4::new(config.broadcast, config.address.port());
            let _ = Self::send_bvll(socket, &fwd, SocketAddr::V4(to)).await;
        }
        for entry in bdt {
            if entry.address == config.address {
                continue;
            }
            let _ = Self::send_bvll(socket, &fwd, SocketAddr::V4(entry.forward_to())).await;
        }
        for fd in fds {
            if fd == origin_peer {
                continue;
            }
            let _ = Self::send_bvll(socket, &fwd, SocketAddr::V4(fd)).await;
        }
    }
}

#[async_trait]
impl DataLink for BipLink {
    fn local_address(&self) -> Address {
        self.local.clone()
    }

    async fn send(&self, destination: &Address, npdu: &[u8]) -> Result<()> {
        match &destination.kind {
            AddressKind::LocalStation(mac) => {
                let to = mac
                    .to_socket_addr()
                    .ok_or(Error::Config("station MAC is not an IPv4 address"))?;
                Self::send_bvll(&self.socket, &Bvll::OriginalUnicast(npdu.to_vec()), to).await
            }
            AddressKind::LocalBroadcast => match &self.config.mode {
                BipMode::Foreign { bbmd, .. } => {
                    // broadcasts leave a foreign device via its BBMD
                    Self::send_bvll(
                        &self.socket,
                        &Bvll::DistributeBroadcast(npdu.to_vec()),
                        SocketAddr::V4(*bbmd),
                    )
                    .await
                }
                BipMode::Normal => {
                    let to =
                        SocketAddrV4::new(self.config.broadcast, self.config.address.port());
                    Self::send_bvll(
                        &self.socket,
                        &Bvll::OriginalBroadcast(npdu.to_vec()),
                        SocketAddr::V4(to),
                    )
                    .await
                }
                BipMode::Bbmd { .. } => {
                    let to =
                        SocketAddrV4::new(self.config.broadcast, self.config.address.port());
                    Self::send_bvll(
                        &self.socket,
                        &Bvll::OriginalBroadcast(npdu.to_vec()),
                        SocketAddr::V4(to),
                    )
                    .await?;
                    // our own broadcasts also fan out through the tables
                    if let Some(state) = &self.bbmd {
                        Self::distribute(
                            &self.socket,
                            &self.config,
                            state,
                            self.config.address,
                            npdu,
                            false,
                        )
                        .await;
                    }
                    Ok(())
                }
            },
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

    async fn shutdown(&self) -> Result<()> {
        if let Some(state) = &self.foreign {
            let bbmd = state.lock().expect("poisoned").bbmd;
            let _ = Self::send_bvll(
                &self.socket,
                &Bvll::DeleteFdtEntry(self.config.address),
                SocketAddr::V4(bbmd),
            )
            .await;
        }
        for task in &self.tasks {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for BipLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// parse a `host:port` string into the config's socket address form
pub fn parse_bind_address(s: &str) -> Result<SocketAddrV4> {
    if s.contains(':') {
        Ok(s.parse()?)
    } else {
        Ok(SocketAddrV4::new(s.parse::<Ipv4Addr>()?, BACNET_PORT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_address_default_port() {
        assert_eq!(
            parse_bind_address("10.0.0.1").unwrap(),
            "10.0.0.1:47808".parse().unwrap()
        );
        assert_eq!(
            parse_bind_address("10.0.0.1:47809").unwrap(),
            "10.0.0.1:47809".parse().unwrap()
        );
    }

    #[tokio::test]
    async fn unicast_between_normal_links() {
        let a = BipLink::start(BipConfig::normal(
            "127.0.0.1:0".parse().unwrap(),
            Ipv4Addr::LOCALHOST,
        ))
        .await
        .unwrap();
        let a_addr = a.socket.local_addr().unwrap();
        let b = BipLink::start(BipConfig::normal(
            "127.0.0.1:0".parse().unwrap(),
            Ipv4Addr::LOCALHOST,
        ))
        .await
        .unwrap();
        let b_addr = match b.socket.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            _ => unreachable!(),
        };

        a.send(
            &Address::from_ipv4(b_addr),
            &[0x01, 0x00, 0xDE, 0xAD],
        )
        .await
        .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.npdu, vec![0x01, 0x00, 0xDE, 0xAD]);
        assert_eq!(
            frame.source.mac().unwrap().to_socket_addr().unwrap(),
            a_addr
        );
    }

    #[tokio::test]
    async fn foreign_registers_and_distributes() {
        let bbmd = BipLink::start(BipConfig {
            address: "127.0.0.1:0".parse().unwrap(),
            broadcast: Ipv4Addr::LOCALHOST,
            mode: BipMode::Bbmd { bdt: vec![] },
        })
        .await
        .unwrap();
        let bbmd_addr = match bbmd.socket.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            _ => unreachable!(),
        };

        let fd = BipLink::start(BipConfig {
            address: "127.0.0.1:0".parse().unwrap(),
            broadcast: Ipv4Addr::LOCALHOST,
            mode: BipMode::Foreign {
                bbmd: bbmd_addr,
                ttl: 30,
            },
        })
        .await
        .unwrap();

        // registration is acknowledged
        tokio::time::timeout(Duration::from_secs(2), async {
            while !fd.is_registered() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("registration never acknowledged");
        assert_eq!(bbmd.foreign_device_table().len(), 1);

        // a foreign broadcast reaches the BBMD as a local broadcast
        fd.send(&Address::local_broadcast(), &[0x01, 0x00, 0x10, 0x08])
            .await
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(1), bbmd.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.destination, Address::local_broadcast());
        assert_eq!(frame.npdu, vec![0x01, 0x00, 0x10, 0x08]);

        fd.shutdown().await.unwrap();
    }
}
