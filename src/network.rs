//! Network service: adapters, the router-info cache, routing, and the
//! network service element (Clause 6)
//!
//! The [`Nsap`] owns one adapter per attached network. Outbound PDUs are
//! wrapped in NPDUs and steered to the right adapter; inbound NPDUs are
//! processed locally, forwarded, or both. Network-layer messages are handled
//! by the service-element half: router discovery, routing-table queries, and
//! network-number learning.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    decoder::Decodable,
    encoder::Encodable,
    error::{Error, Result},
    link::DataLink,
    npdu::{NetworkMessage, Npdu, NpduContent, RoutingTableEntry},
    pdu::{Address, AddressKind, Pdu},
};

/// collection window for Who-Is-Router-To-Network
pub const WHO_IS_ROUTER_TIMEOUT: Duration = Duration::from_secs(2);
/// collection window for Initialize-Routing-Table
pub const INIT_ROUTING_TABLE_TIMEOUT: Duration = Duration::from_secs(3);
/// collection window for What-Is-Network-Number
pub const WHAT_IS_NETWORK_NUMBER_TIMEOUT: Duration = Duration::from_secs(2);

/// Reachability of a destination network through a router
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum RouterStatus {
    #[default]
    Available,
    Busy,
    Disconnected,
    Unreachable,
}

/// One router and the networks it reaches
#[derive(Debug, Clone)]
pub struct RouterInfo {
    /// the network the router was learned on; None while ours is unknown
    pub source_net: Option<u16>,
    /// the router's station address on that network
    pub address: Address,
    /// destination networks and their status
    pub dnets: HashMap<u16, RouterStatus>,
}

/// In-memory router-info database.
///
/// Two indexes are kept in step: `(snet, router-address)` to the record, and
/// `(snet, dnet)` to the router address serving that destination.
#[derive(Debug, Default)]
pub struct RouterInfoCache {
    routers: HashMap<(Option<u16>, Address), RouterInfo>,
    path_info: HashMap<(Option<u16>, u16), Address>,
}

impl RouterInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// the router serving `dnet` as seen from `snet`
    pub fn get_path(&self, snet: Option<u16>, dnet: u16) -> Option<&Address> {
        let addr = self.path_info.get(&(snet, dnet))?;
        // a busy or dead dnet is still a known path; Unreachable is not
        match self
            .routers
            .get(&(snet, addr.clone()))
            .and_then(|info| info.dnets.get(&dnet))
        {
            Some(RouterStatus::Unreachable) => None,
            Some(_) => Some(addr),
            None => None,
        }
    }

    /// the full record for a router
    pub fn get_router(&self, snet: Option<u16>, address: &Address) -> Option<&RouterInfo> {
        self.routers.get(&(snet, address.clone()))
    }

    /// learn (or refresh) that `router` on `snet` reaches `dnets`
    pub fn learn(&mut self, snet: Option<u16>, router: Address, dnets: &[u16]) {
        self.routers
            .entry((snet, router.clone()))
            .or_insert_with(|| RouterInfo {
                source_net: snet,
                address: router.clone(),
                dnets: HashMap::new(),
            });
        for dnet in dnets {
            if let Some(info) = self.routers.get_mut(&(snet, router.clone())) {
                info.dnets.insert(*dnet, RouterStatus::Available);
            }
            // a dnet moves to whichever router advertised it last
            if let Some(previous) = self.path_info.insert((snet, *dnet), router.clone())
                && previous != router
                && let Some(old) = self.routers.get_mut(&(snet, previous))
            {
                old.dnets.remove(dnet);
            }
        }
    }

    /// set the status of `dnets` through `router`; an empty list hits every
    /// dnet the router advertises
    pub fn set_status(
        &mut self,
        snet: Option<u16>,
        router: &Address,
        dnets: &[u16],
        status: RouterStatus,
    ) {
        if let Some(info) = self.routers.get_mut(&(snet, router.clone())) {
            if dnets.is_empty() {
                for value in info.dnets.values_mut() {
                    *value = status;
                }
            } else {
                for dnet in dnets {
                    if let Some(value) = info.dnets.get_mut(dnet) {
                        *value = status;
                    }
                }
            }
        }
    }

    /// drop a router and every path through it
    pub fn remove_router(&mut self, snet: Option<u16>, router: &Address) {
        if let Some(info) = self.routers.remove(&(snet, router.clone())) {
            for dnet in info.dnets.keys() {
                self.path_info.remove(&(snet, *dnet));
            }
        }
    }

    /// re-key everything learned while our own network number was unknown
    pub fn update_source_network(&mut self, old: Option<u16>, new: Option<u16>) {
        let moved: Vec<_> = self
            .routers
            .keys()
            .filter(|(snet, _)| *snet == old)
            .cloned()
            .collect();
        for (_, addr) in moved {
            if let Some(mut info) = self.routers.remove(&(old, addr.clone())) {
                info.source_net = new;
                self.routers.insert((new, addr), info);
            }
        }
        let moved: Vec<_> = self
            .path_info
            .keys()
            .filter(|(snet, _)| *snet == old)
            .cloned()
            .collect();
        for (_, dnet) in moved {
            if let Some(addr) = self.path_info.remove(&(old, dnet)) {
                self.path_info.insert((new, dnet), addr);
            }
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        for ((snet, dnet), addr) in &self.path_info {
            let info = self
                .routers
                .get(&(*snet, addr.clone()))
                .expect("path without router");
            assert!(info.dnets.contains_key(dnet), "router without dnet");
        }
    }
}

/// An NSAP-owned port onto one network
pub struct NetworkAdapter {
    net: Mutex<Option<u16>>,
    link: Arc<dyn DataLink>,
}

impl NetworkAdapter {
    /// the network number, once known
    pub fn net(&self) -> Option<u16> {
        *self.net.lock().expect("poisoned")
    }

    /// our station address on this adapter's link
    pub fn local_address(&self) -> Address {
        self.link.local_address()
    }
}

/// An APDU on its way up to the application service layer
#[derive(Debug, Clone)]
pub struct UpstreamPdu {
    /// originating station, possibly on a remote network
    pub source: Address,
    /// us, or the broadcast scope it arrived under
    pub destination: Address,
    /// sender expects a reply
    pub expecting_reply: bool,
    /// the APDU octets
    pub apdu: Vec<u8>,
}

struct RouterQuery {
    dnet: u16,
    tx: oneshot::Sender<Address>,
}

struct TableQuery {
    peer: Address,
    tx: oneshot::Sender<Vec<RoutingTableEntry>>,
}

struct NetNumberQuery {
    tx: oneshot::Sender<u16>,
}

/// Network Service Access Point: adapters, routing, and the NSE
pub struct Nsap {
    adapters: Mutex<Vec<Arc<NetworkAdapter>>>,
    router_cache: Mutex<RouterInfoCache>,
    upstream: Mutex<Option<mpsc::Sender<UpstreamPdu>>>,
    router_queries: Mutex<Vec<RouterQuery>>,
    table_queries: Mutex<Vec<TableQuery>>,
    net_number_queries: Mutex<Vec<NetNumberQuery>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Default for Nsap {
    fn default() -> Self {
        Self::new()
    }
}

impl Nsap {
    pub fn new() -> Self {
        Nsap {
            adapters: Mutex::new(Vec::new()),
            router_cache: Mutex::new(RouterInfoCache::new()),
            upstream: Mutex::new(None),
            router_queries: Mutex::new(Vec::new()),
            table_queries: Mutex::new(Vec::new()),
            net_number_queries: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Attach a link as the adapter for `net` (None while the number is
    /// unknown). The first adapter bound is the local adapter: the one
    /// carrying the application's own address.
    pub fn bind(&self, net: Option<u16>, link: Arc<dyn DataLink>) -> Result<()> {
        let mut adapters = self.adapters.lock().expect("poisoned");
        if net.is_some() && adapters.iter().any(|a| a.net() == net) {
            return Err(Error::Config("network number already bound"));
        }
        adapters.push(Arc::new(NetworkAdapter {
            net: Mutex::new(net),
            link,
        }));
        Ok(())
    }

    /// the adapter carrying the application's address
    pub fn local_adapter(&self) -> Option<Arc<NetworkAdapter>> {
        self.adapters.lock().expect("poisoned").first().cloned()
    }

    /// our station address on the local adapter
    pub fn local_address(&self) -> Option<Address> {
        self.local_adapter().map(|a| a.local_address())
    }

    /// true when this node routes between networks
    pub fn is_router(&self) -> bool {
        self.adapters.lock().expect("poisoned").len() >= 2
    }

    /// register the upstream channel and start one receive pump per adapter
    pub fn start(self: &Arc<Self>, upstream: mpsc::Sender<UpstreamPdu>) {
        *self.upstream.lock().expect("poisoned") = Some(upstream);
        let adapters = self.adapters.lock().expect("poisoned").clone();
        let mut tasks = self.tasks.lock().expect("poisoned");
        for adapter in adapters {
            let nsap = self.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match adapter.link.recv().await {
                        Ok(frame) => {
                            nsap.process_frame(&adapter, frame.source, frame.destination, &frame.npdu)
                                .await;
                        }
                        Err(_) => return,
                    }
                }
            }));
        }
    }

    /// stop the receive pumps
    pub fn stop(&self) {
        for task in self.tasks.lock().expect("poisoned").drain(..) {
            task.abort();
        }
    }

    fn adapter_for_net(&self, net: u16) -> Option<Arc<NetworkAdapter>> {
        self.adapters
            .lock()
            .expect("poisoned")
            .iter()
            .find(|a| a.net() == Some(net))
            .cloned()
    }

    fn all_adapters(&self) -> Vec<Arc<NetworkAdapter>> {
        self.adapters.lock().expect("poisoned").clone()
    }

    fn our_nets(&self) -> Vec<u16> {
        self.adapters
            .lock()
            .expect("poisoned")
            .iter()
            .filter_map(|a| a.net())
            .collect()
    }

    // ---- downstream ---------------------------------------------------

    /// Encode and send an application PDU. Resolves routes for remote
    /// destinations, issuing Who-Is-Router-To-Network when the cache misses.
    pub async fn request(&self, pdu: Pdu) -> Result<()> {
        let npdu = Npdu::apdu(pdu.data.clone());
        self.send_npdu(npdu, &pdu.destination, pdu.expecting_reply, pdu.network_priority)
            .await
    }

    /// send a network-layer message to a local station or broadcast on the
    /// given adapter
    async fn send_network_message(
        &self,
        adapter: &NetworkAdapter,
        destination: &Address,
        message: NetworkMessage,
    ) -> Result<()> {
        let npdu = Npdu::network(message);
        adapter.link.send(destination, &npdu.to_vec()?).await
    }

    async fn send_npdu(
        &self,
        mut npdu: Npdu,
        destination: &Address,
        expecting_reply: bool,
        priority: u8,
    ) -> Result<()> {
        npdu.expecting_reply = expecting_reply;
        npdu.priority = priority & 0x03;

        // route-aware addressing: the attached route is the hop, the
        // original destination rides in the NPDU header
        if let Some(route) = &destination.route {
            let adapter = self
                .local_adapter()
                .ok_or(Error::Config("no adapter bound"))?;
            let npdu = npdu.with_destination(Address {
                kind: destination.kind.clone(),
                route: None,
            });
            return adapter.link.send(route, &npdu.to_vec()?).await;
        }

        match &destination.kind {
            AddressKind::LocalStation(_) | AddressKind::LocalBroadcast => {
                let adapter = self
                    .local_adapter()
                    .ok_or(Error::Config("no adapter bound"))?;
                adapter.link.send(destination, &npdu.to_vec()?).await
            }
            AddressKind::GlobalBroadcast => {
                let npdu = npdu.with_destination(Address::global_broadcast());
                let bytes = npdu.to_vec()?;
                for adapter in self.all_adapters() {
                    if let Err(e) = adapter.link.send(&Address::local_broadcast(), &bytes).await {
                        warn!("global broadcast send failed: {e}");
                    }
                }
                Ok(())
            }
            AddressKind::RemoteStation(dnet, mac) => {
                if let Some(adapter) = self.adapter_for_net(*dnet) {
                    // directly attached: downgrade to a local send
                    let local = Address::local_station(mac.clone());
                    return adapter.link.send(&local, &npdu.to_vec()?).await;
                }
                let (adapter, router) = self.resolve_route(*dnet).await?;
                let npdu = npdu.with_destination(destination.clone());
                adapter.link.send(&router, &npdu.to_vec()?).await
            }
            AddressKind::RemoteBroadcast(dnet) => {
                if let Some(adapter) = self.adapter_for_net(*dnet) {
                    return adapter
                        .link
                        .send(&Address::local_broadcast(), &npdu.to_vec()?)
                        .await;
                }
                let (adapter, router) = self.resolve_route(*dnet).await?;
                let npdu = npdu.with_destination(destination.clone());
                adapter.link.send(&router, &npdu.to_vec()?).await
            }
            AddressKind::Null => Err(Error::Config("cannot send to the null address")),
        }
    }

    /// The adapter and next-hop station for `dnet`: from the cache, or by
    /// asking the routers and waiting out the discovery window.
    async fn resolve_route(&self, dnet: u16) -> Result<(Arc<NetworkAdapter>, Address)> {
        // cache first
        for adapter in self.all_adapters() {
            let snet = adapter.net();
            if let Some(router) = self
                .router_cache
                .lock()
                .expect("poisoned")
                .get_path(snet, dnet)
                .cloned()
            {
                return Ok((adapter, router));
            }
        }

        let (tx, rx) = oneshot::channel();
        self.router_queries
            .lock()
            .expect("poisoned")
            .push(RouterQuery { dnet, tx });

        for adapter in self.all_adapters() {
            let _ = self
                .send_network_message(
                    &adapter,
                    &Address::local_broadcast(),
                    NetworkMessage::WhoIsRouterToNetwork(Some(dnet)),
                )
                .await;
        }

        let resolved = tokio::time::timeout(WHO_IS_ROUTER_TIMEOUT, rx).await;
        // sweep queries whose waiters have gone away
        self.router_queries
            .lock()
            .expect("poisoned")
            .retain(|query| !query.tx.is_closed());
        let router = resolved
            .map_err(|_| Error::UnknownRoute(dnet))?
            .map_err(|_| Error::UnknownRoute(dnet))?;

        // the responder's adapter is the one that heard it
        for adapter in self.all_adapters() {
            let snet = adapter.net();
            if self
                .router_cache
                .lock()
                .expect("poisoned")
                .get_path(snet, dnet)
                .is_some()
            {
                return Ok((adapter, router));
            }
        }
        Err(Error::UnknownRoute(dnet))
    }

    /// ask a router (or the broadcast scope) for its routing table
    pub async fn initialize_routing_table(
        &self,
        peer: Address,
    ) -> Result<Vec<RoutingTableEntry>> {
        let adapter = self
            .local_adapter()
            .ok_or(Error::Config("no adapter bound"))?;
        let (tx, rx) = oneshot::channel();
        self.table_queries
            .lock()
            .expect("poisoned")
            .push(TableQuery {
                peer: peer.clone(),
                tx,
            });
        self.send_network_message(&adapter, &peer, NetworkMessage::InitializeRoutingTable(vec![]))
            .await?;
        let resolved = tokio::time::timeout(INIT_ROUTING_TABLE_TIMEOUT, rx).await;
        self.table_queries
            .lock()
            .expect("poisoned")
            .retain(|query| !query.tx.is_closed());
        resolved
            .map_err(|_| Error::Cancelled)?
            .map_err(|_| Error::Cancelled)
    }

    /// broadcast What-Is-Network-Number on the local adapter and wait for
    /// the first answer
    pub async fn what_is_network_number(&self) -> Result<u16> {
        let adapter = self
            .local_adapter()
            .ok_or(Error::Config("no adapter bound"))?;
        let (tx, rx) = oneshot::channel();
        self.net_number_queries
            .lock()
            .expect("poisoned")
            .push(NetNumberQuery { tx });
        self.send_network_message(
            &adapter,
            &Address::local_broadcast(),
            NetworkMessage::WhatIsNetworkNumber,
        )
        .await?;
        let resolved = tokio::time::timeout(WHAT_IS_NETWORK_NUMBER_TIMEOUT, rx).await;
        self.net_number_queries
            .lock()
            .expect("poisoned")
            .retain(|query| !query.tx.is_closed());
        resolved
            .map_err(|_| Error::Cancelled)?
            .map_err(|_| Error::Cancelled)
    }

    /// a snapshot of the router cache, for diagnostics and tests
    pub fn router_cache(&self) -> std::sync::MutexGuard<'_, RouterInfoCache> {
        self.router_cache.lock().expect("poisoned")
    }

    // ---- upstream -----------------------------------------------------

    async fn process_frame(
        self: &Arc<Self>,
        adapter: &Arc<NetworkAdapter>,
        link_source: Address,
        link_destination: Address,
        bytes: &[u8],
    ) {
        let npdu = match Npdu::from_bytes(bytes) {
            Ok(n) => n,
            Err(e) => {
                warn!("dropping malformed NPDU from {link_source:?}: {e}");
                return;
            }
        };

        // source routing: a SADR claiming one of our own networks is a
        // spoofed path and drops the frame; anything else teaches the
        // cache that the sending station routes to snet
        if let Some(source) = &npdu.source
            && let Some(snet) = source.network()
        {
            if self.our_nets().contains(&snet) {
                warn!("path error: source claims directly attached network {snet}, dropping");
                return;
            }
            self.router_cache.lock().expect("poisoned").learn(
                adapter.net(),
                link_source.clone(),
                &[snet],
            );
        }

        match &npdu.content {
            NpduContent::Network(message) => {
                self.handle_network_message(adapter, &link_source, message.clone())
                    .await;
            }
            NpduContent::Apdu(apdu) => {
                let local_adapter = self.local_adapter();
                let local_adapter_arrival = local_adapter
                    .as_ref()
                    .map(|a| Arc::ptr_eq(a, adapter))
                    .unwrap_or(false);
                let local_net = local_adapter.as_ref().and_then(|a| a.net());
                let local_mac = local_adapter
                    .as_ref()
                    .and_then(|a| a.local_address().mac().cloned());

                let (process, forward) = match &npdu.destination {
                    None => (local_adapter_arrival, false),
                    Some(dadr) => match &dadr.kind {
                        AddressKind::GlobalBroadcast => (true, true),
                        AddressKind::RemoteBroadcast(dnet) => {
                            // no sender wraps a same-network destination in
                            // a remote DADR
                            if adapter.net() == Some(*dnet) {
                                warn!("path error: remote broadcast for the arrival network {dnet}, dropping");
                                return;
                            }
                            (local_net == Some(*dnet), true)
                        }
                        AddressKind::RemoteStation(dnet, mac) => {
                            if adapter.net() == Some(*dnet) {
                                warn!("path error: remote station on the arrival network {dnet}, dropping");
                                return;
                            }
                            // ours only when the DADR names our own station
                            // on the local adapter's network
                            let ours = local_net == Some(*dnet)
                                && local_mac.as_ref() == Some(mac);
                            (ours, !ours)
                        }
                        _ => (false, false),
                    },
                };

                if forward {
                    self.forward(adapter, &link_source, npdu.clone()).await;
                }
                if !process {
                    return;
                }

                // the application sees the end-to-end source
                let source = match &npdu.source {
                    Some(sadr) => {
                        let mut addr = sadr.clone();
                        // keep the hop for route-aware replies
                        addr.route = Some(Box::new(link_source.clone()));
                        addr
                    }
                    None => link_source.clone(),
                };
                let destination = match &npdu.destination {
                    Some(dadr) if matches!(dadr.kind, AddressKind::GlobalBroadcast) => {
                        Address::global_broadcast()
                    }
                    Some(dadr) if dadr.is_broadcast() => Address::local_broadcast(),
                    _ => link_destination,
                };

                let upstream = self.upstream.lock().expect("poisoned").clone();
                if let Some(tx) = upstream {
                    let _ = tx
                        .send(UpstreamPdu {
                            source,
                            destination,
                            expecting_reply: npdu.expecting_reply,
                            apdu: apdu.clone(),
                        })
                        .await;
                }
            }
        }
    }

    /// relay a routed NPDU toward its DNET
    async fn forward(
        self: &Arc<Self>,
        arrival: &Arc<NetworkAdapter>,
        link_source: &Address,
        mut npdu: Npdu,
    ) {
        // hop count strictly decreases; zero drops
        match npdu.hop_count {
            Some(0) | None => {
                debug!("hop count exhausted, dropping");
                return;
            }
            Some(h) => npdu.hop_count = Some(h - 1),
        }
        if npdu.hop_count == Some(0) {
            debug!("hop count exhausted, dropping");
            return;
        }

        // first router on the path stamps the source
        if npdu.source.is_none()
            && let (Some(snet), Some(mac)) = (arrival.net(), link_source.mac())
        {
            npdu.source = Some(Address::remote_station(snet, mac.clone()));
        }

        let destination = npdu.destination.clone();
        match destination.as_ref().map(|d| &d.kind) {
            Some(AddressKind::GlobalBroadcast) => {
                // replicate on every adapter but the arrival one
                let bytes = match npdu.to_vec() {
                    Ok(b) => b,
                    Err(_) => return,
                };
                for adapter in self.all_adapters() {
                    if Arc::ptr_eq(&adapter, arrival) {
                        continue;
                    }
                    let _ = adapter.link.send(&Address::local_broadcast(), &bytes).await;
                }
            }
            Some(AddressKind::RemoteStation(dnet, mac)) => {
                if let Some(adapter) = self.adapter_for_net(*dnet) {
                    // final hop: deliver without the destination header
                    npdu.destination = None;
                    npdu.hop_count = None;
                    let local = Address::local_station(mac.clone());
                    if let Ok(bytes) = npdu.to_vec() {
                        let _ = adapter.link.send(&local, &bytes).await;
                    }
                } else {
                    self.forward_via_router(arrival, npdu, *dnet).await;
                }
            }
            Some(AddressKind::RemoteBroadcast(dnet)) => {
                if let Some(adapter) = self.adapter_for_net(*dnet) {
                    npdu.destination = None;
                    npdu.hop_count = None;
                    if let Ok(bytes) = npdu.to_vec() {
                        let _ = adapter.link.send(&Address::local_broadcast(), &bytes).await;
                    }
                } else {
                    self.forward_via_router(arrival, npdu, *dnet).await;
                }
            }
            _ => {}
        }
    }

    async fn forward_via_router(
        self: &Arc<Self>,
        arrival: &Arc<NetworkAdapter>,
        npdu: Npdu,
        dnet: u16,
    ) {
        for adapter in self.all_adapters() {
            if Arc::ptr_eq(&adapter, arrival) {
                continue;
            }
            let router = self
                .router_cache
                .lock()
                .expect("poisoned")
                .get_path(adapter.net(), dnet)
                .cloned();
            if let Some(router) = router {
                if let Ok(bytes) = npdu.to_vec() {
                    let _ = adapter.link.send(&router, &bytes).await;
                }
                return;
            }
        }
        debug!("no route to {dnet} for forwarded frame, dropping");
    }

    async fn handle_network_message(
        self: &Arc<Self>,
        adapter: &Arc<NetworkAdapter>,
        link_source: &Address,
        message: NetworkMessage,
    ) {
        match message {
            NetworkMessage::WhoIsRouterToNetwork(query) => {
                // answer for the networks behind our other adapters
                if !self.is_router() {
                    return;
                }
                let reachable: Vec<u16> = self
                    .all_adapters()
                    .iter()
                    .filter(|a| !Arc::ptr_eq(a, adapter))
                    .filter_map(|a| a.net())
                    .filter(|net| query.is_none_or(|q| q == *net))
                    .collect();
                if !reachable.is_empty() {
                    let _ = self
                        .send_network_message(
                            adapter,
                            &Address::local_broadcast(),
                            NetworkMessage::IAmRouterToNetwork(reachable),
                        )
                        .await;
                }
            }
            NetworkMessage::IAmRouterToNetwork(nets) => {
                self.router_cache.lock().expect("poisoned").learn(
                    adapter.net(),
                    link_source.clone(),
                    &nets,
                );
                // resolve any discovery waiting on one of these networks
                let mut queries = self.router_queries.lock().expect("poisoned");
                let mut remaining = Vec::new();
                for query in queries.drain(..) {
                    if nets.contains(&query.dnet) {
                        let _ = query.tx.send(link_source.clone());
                    } else {
                        remaining.push(query);
                    }
                }
                *queries = remaining;
            }
            NetworkMessage::ICouldBeRouterToNetwork { .. } => {
                // only interesting to connection-establishing routers
            }
            NetworkMessage::RejectMessageToNetwork { reason, net } => {
                debug!("reject-message-to-network {net} reason {reason} from {link_source:?}");
                self.router_cache.lock().expect("poisoned").set_status(
                    adapter.net(),
                    link_source,
                    &[net],
                    RouterStatus::Unreachable,
                );
            }
            NetworkMessage::RouterBusyToNetwork(nets) => {
                self.router_cache.lock().expect("poisoned").set_status(
                    adapter.net(),
                    link_source,
                    &nets,
                    RouterStatus::Busy,
                );
            }
            NetworkMessage::RouterAvailableToNetwork(nets) => {
                self.router_cache.lock().expect("poisoned").set_status(
                    adapter.net(),
                    link_source,
                    &nets,
                    RouterStatus::Available,
                );
            }
            NetworkMessage::InitializeRoutingTable(entries) => {
                if entries.is_empty() {
                    // a query: answer with our table
                    let table: Vec<RoutingTableEntry> = self
                        .all_adapters()
                        .iter()
                        .enumerate()
                        .filter_map(|(port, a)| {
                            a.net().map(|net| RoutingTableEntry {
                                dnet: net,
                                port_id: port as u8 + 1,
                                port_info: vec![],
                            })
                        })
                        .collect();
                    let _ = self
                        .send_network_message(
                            adapter,
                            link_source,
                            NetworkMessage::InitializeRoutingTableAck(table),
                        )
                        .await;
                }
                // table writes are not accepted from the wire
            }
            NetworkMessage::InitializeRoutingTableAck(entries) => {
                let mut queries = self.table_queries.lock().expect("poisoned");
                if let Some(pos) = queries
                    .iter()
                    .position(|q| q.peer == *link_source || q.peer.is_broadcast())
                {
                    let query = queries.remove(pos);
                    let _ = query.tx.send(entries);
                }
            }
            NetworkMessage::EstablishConnectionToNetwork { .. }
            | NetworkMessage::DisconnectConnectionToNetwork(_) => {
                // PTP connection management is out of scope for these links
            }
            NetworkMessage::WhatIsNetworkNumber => {
                if let Some(net) = adapter.net() {
                    let _ = self
                        .send_network_message(
                            adapter,
                            &Address::local_broadcast(),
                            NetworkMessage::NetworkNumberIs {
                                net,
                                configured: true,
                            },
                        )
                        .await;
                }
            }
            NetworkMessage::NetworkNumberIs { net, .. } => {
                if adapter.net().is_none() {
                    debug!("learned network number {net}");
                    *adapter.net.lock().expect("poisoned") = Some(net);
                    self.router_cache
                        .lock()
                        .expect("poisoned")
                        .update_source_network(None, Some(net));
                }
                let mut queries = self.net_number_queries.lock().expect("poisoned");
                for query in queries.drain(..) {
                    let _ = query.tx.send(net);
                }
            }
            NetworkMessage::Proprietary { message_type, .. } => {
                debug!("ignoring proprietary network message {message_type:#04x}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::Mac;

    fn station(n: u8) -> Address {
        Address::local_station(Mac::station(n))
    }

    #[test]
    fn cache_learn_and_path() {
        let mut cache = RouterInfoCache::new();
        cache.learn(Some(1), station(9), &[3, 4]);
        assert_eq!(cache.get_path(Some(1), 3), Some(&station(9)));
        assert_eq!(cache.get_path(Some(1), 5), None);
        assert_eq!(cache.get_path(Some(2), 3), None);
        cache.check_invariants();
    }

    #[test]
    fn cache_dnet_moves_between_routers() {
        let mut cache = RouterInfoCache::new();
        cache.learn(Some(1), station(9), &[3]);
        cache.learn(Some(1), station(8), &[3]);
        assert_eq!(cache.get_path(Some(1), 3), Some(&station(8)));
        // the old router no longer advertises 3
        assert!(
            !cache
                .get_router(Some(1), &station(9))
                .unwrap()
                .dnets
                .contains_key(&3)
        );
        cache.check_invariants();
    }

    #[test]
    fn cache_status_transitions() {
        let mut cache = RouterInfoCache::new();
        cache.learn(Some(1), station(9), &[3]);
        cache.set_status(Some(1), &station(9), &[3], RouterStatus::Busy);
        // busy paths still resolve
        assert!(cache.get_path(Some(1), 3).is_some());
        cache.set_status(Some(1), &station(9), &[], RouterStatus::Unreachable);
        assert!(cache.get_path(Some(1), 3).is_none());
        cache.set_status(Some(1), &station(9), &[3], RouterStatus::Available);
        assert!(cache.get_path(Some(1), 3).is_some());
        cache.check_invariants();
    }

    #[test]
    fn cache_remove_router_clears_paths() {
        let mut cache = RouterInfoCache::new();
        cache.learn(Some(1), station(9), &[3, 4]);
        cache.remove_router(Some(1), &station(9));
        assert!(cache.get_path(Some(1), 3).is_none());
        assert!(cache.get_path(Some(1), 4).is_none());
        cache.check_invariants();
    }

    #[test]
    fn cache_source_network_rekey() {
        let mut cache = RouterInfoCache::new();
        cache.learn(None, station(9), &[3]);
        cache.update_source_network(None, Some(7));
        assert!(cache.get_path(None, 3).is_none());
        assert_eq!(cache.get_path(Some(7), 3), Some(&station(9)));
        cache.check_invariants();
    }

    #[test]
    fn duplicate_net_binding_rejected() {
        let vlan = VirtualNetwork::new("n");
        let nsap = Nsap::new();
        nsap.bind(Some(1), Arc::new(vlan.attach(Mac::station(1))))
            .unwrap();
        assert!(
            nsap.bind(Some(1), Arc::new(vlan.attach(Mac::station(2))))
                .is_err()
        );
    }

    // multi-network scenarios: route discovery through a router node,
    // forwarding, and network-number learning

    use crate::{
        app::{Application, DeviceConfig},
        constructed::PropertyValue,
        link::VirtualNetwork,
        object::{PropertyIdentifier, VendorRegistry},
        primitives::ObjectIdentifier,
        tsm::AsapConfig,
    };

    fn app_on(
        vlan: &Arc<VirtualNetwork>,
        net: u16,
        station: u8,
        instance: u32,
    ) -> Arc<Application> {
        let app = Application::with_registry(
            DeviceConfig {
                device_instance: instance,
                device_name: format!("device-{instance}"),
                vendor_identifier: 260,
                ..DeviceConfig::default()
            },
            Arc::new(VendorRegistry::standard()),
            AsapConfig::default(),
        );
        app.bind_link(Some(net), Arc::new(vlan.attach(Mac::station(station))))
            .unwrap();
        app.start();
        app
    }

    /// a bare two-port router between two VLANs
    fn router_between(
        net1: (&Arc<VirtualNetwork>, u16, u8),
        net2: (&Arc<VirtualNetwork>, u16, u8),
    ) -> Arc<Nsap> {
        let nsap = Arc::new(Nsap::new());
        nsap.bind(Some(net1.1), Arc::new(net1.0.attach(Mac::station(net1.2))))
            .unwrap();
        nsap.bind(Some(net2.1), Arc::new(net2.0.attach(Mac::station(net2.2))))
            .unwrap();
        // a router's own application traffic is not under test; drain the
        // upstream channel
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        nsap.start(tx);
        nsap
    }

    fn drained_nsap(net: Option<u16>, vlan: &Arc<VirtualNetwork>, station: u8) -> Arc<Nsap> {
        let nsap = Arc::new(Nsap::new());
        nsap.bind(net, Arc::new(vlan.attach(Mac::station(station))))
            .unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        nsap.start(tx);
        nsap
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_read_across_a_router() {
        let vlan1 = VirtualNetwork::new("net-1");
        let vlan2 = VirtualNetwork::new("net-2");

        let a = app_on(&vlan1, 1, 1, 100);
        let b = app_on(&vlan2, 2, 2, 150);
        let _router = router_between((&vlan1, 1, 9), (&vlan2, 2, 9));
        let _ = &b;

        // the cache starts empty; the read must trigger route discovery
        let peer = Address::remote_station(2, Mac::station(2));
        let value = a
            .read_property(
                &peer,
                ObjectIdentifier::device(150),
                PropertyIdentifier::ObjectName,
                None,
            )
            .await
            .unwrap();
        assert_eq!(value, PropertyValue::CharacterString("device-150".into()));

        // discovery populated the router cache: (snet 1, dnet 2) -> router
        let cache = a.nsap().router_cache();
        let router_addr = cache.get_path(Some(1), 2).expect("learned route");
        assert_eq!(*router_addr, Address::local_station(Mac::station(9)));
        let info = cache.get_router(Some(1), router_addr).unwrap();
        assert!(info.dnets.contains_key(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn global_broadcast_crosses_the_router() {
        let vlan1 = VirtualNetwork::new("net-1");
        let vlan2 = VirtualNetwork::new("net-2");

        let a = app_on(&vlan1, 1, 1, 100);
        let b = app_on(&vlan2, 2, 2, 150);
        let _router = router_between((&vlan1, 1, 9), (&vlan2, 2, 9));
        let _ = &b;

        // who-is as global broadcast reaches the device behind the router,
        // and its i-am comes back with a routed source address
        let found = a.who_is(Some(150), Some(150), None).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].device_identifier, ObjectIdentifier::device(150));

        let cache = a.device_info().lock().unwrap();
        let info = cache.get_by_instance(150).unwrap();
        assert_eq!(info.address, Address::remote_station(2, Mac::station(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_network_read_fails_with_no_route() {
        let vlan = VirtualNetwork::new("net-1");
        let a = app_on(&vlan, 1, 1, 100);

        let peer = Address::remote_station(77, Mac::station(5));
        let err = a
            .read_property(
                &peer,
                ObjectIdentifier::device(1),
                PropertyIdentifier::ObjectName,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownRoute(77)));
    }

    #[tokio::test(start_paused = true)]
    async fn network_number_learning() {
        let vlan = VirtualNetwork::new("net-5");

        // a configured node that can answer What-Is-Network-Number
        let _configured = drained_nsap(Some(5), &vlan, 9);
        // a node that does not know its network number yet
        let learner = drained_nsap(None, &vlan, 1);

        let net = learner.what_is_network_number().await.unwrap();
        assert_eq!(net, 5);
        // the adapter learned its number
        assert_eq!(learner.local_adapter().unwrap().net(), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_routing_table_query() {
        let vlan1 = VirtualNetwork::new("net-1");
        let vlan2 = VirtualNetwork::new("net-2");
        let router = router_between((&vlan1, 1, 9), (&vlan2, 2, 9));
        let _ = &router;

        let asker = drained_nsap(Some(1), &vlan1, 1);
        let table = asker
            .initialize_routing_table(Address::local_station(Mac::station(9)))
            .await
            .unwrap();
        let mut nets: Vec<u16> = table.iter().map(|entry| entry.dnet).collect();
        nets.sort_unstable();
        assert_eq!(nets, vec![1, 2]);
    }
}
