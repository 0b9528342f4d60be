//! Virtual LAN: an in-memory network of nodes
//!
//! Stacks under test attach [`VirtualNode`]s to a shared [`VirtualNetwork`]
//! and exchange frames without sockets. Delivery is in-order per sender;
//! broadcast reaches every other attached node.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    error::{Error, Result},
    link::{DataLink, LinkFrame},
    pdu::{Address, AddressKind, Mac},
};

/// A named in-memory network
pub struct VirtualNetwork {
    name: String,
    nodes: Mutex<HashMap<Mac, mpsc::Sender<LinkFrame>>>,
}

impl VirtualNetwork {
    /// a new, empty network
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(VirtualNetwork {
            name: name.into(),
            nodes: Mutex::new(HashMap::new()),
        })
    }

    /// attach a node with the given station address
    pub fn attach(self: &Arc<Self>, mac: Mac) -> VirtualNode {
        let (tx, rx) = mpsc::channel(64);
        self.nodes.lock().expect("poisoned").insert(mac.clone(), tx);
        VirtualNode {
            network: self.clone(),
            mac,
            frames: tokio::sync::Mutex::new(rx),
        }
    }

    /// number of attached nodes
    pub fn node_count(&self) -> usize {
        self.nodes.lock().expect("poisoned").len()
    }

    fn deliver(&self, frame: LinkFrame) {
        let (to_mac, broadcast) = match &frame.destination.kind {
            AddressKind::LocalStation(mac) => (Some(mac.clone()), false),
            AddressKind::LocalBroadcast => (None, true),
            _ => {
                debug!("vlan {} dropping frame with non-local destination", self.name);
                return;
            }
        };
        let from_mac = frame.source.mac().cloned();
        let nodes = self.nodes.lock().expect("poisoned");
        if broadcast {
            for (mac, tx) in nodes.iter() {
                if Some(mac) == from_mac.as_ref() {
                    continue;
                }
                let _ = tx.try_send(frame.clone());
            }
        } else if let Some(mac) = to_mac
            && let Some(tx) = nodes.get(&mac)
        {
            let _ = tx.try_send(frame);
        }
    }
}

/// One station on a [`VirtualNetwork`]
pub struct VirtualNode {
    network: Arc<VirtualNetwork>,
    mac: Mac,
    frames: tokio::sync::Mutex<mpsc::Receiver<LinkFrame>>,
}

#[async_trait]
impl DataLink for VirtualNode {
    fn local_address(&self) -> Address {
        Address::local_station(self.mac.clone())
    }

    async fn send(&self, destination: &Address, npdu: &[u8]) -> Result<()> {
        if !matches!(
            destination.kind,
            AddressKind::LocalStation(_) | AddressKind::LocalBroadcast
        ) {
            return Err(Error::Config("link can only address local stations"));
        }
        self.network.deliver(LinkFrame {
            source: self.local_address(),
            destination: destination.clone(),
            npdu: npdu.to_vec(),
        });
        Ok(())
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

impl Drop for VirtualNode {
    fn drop(&mut self) {
        self.network
            .nodes
            .lock()
            .expect("poisoned")
            .remove(&self.mac);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unicast_reaches_one_node() {
        let net = VirtualNetwork::new("test");
        let a = net.attach(Mac::station(1));
        let b = net.attach(Mac::station(2));
        let c = net.attach(Mac::station(3));
        assert_eq!(net.node_count(), 3);

        a.send(&Address::local_station(Mac::station(2)), &[0xAA])
            .await
            .unwrap();
        let frame = b.recv().await.unwrap();
        assert_eq!(frame.npdu, vec![0xAA]);
        assert_eq!(frame.source, Address::local_station(Mac::station(1)));

        // c saw nothing
        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(50), c.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn broadcast_skips_the_sender() {
        let net = VirtualNetwork::new("test");
        let a = net.attach(Mac::station(1));
        let b = net.attach(Mac::station(2));
        let c = net.attach(Mac::station(3));

        a.send(&Address::local_broadcast(), &[0xBB]).await.unwrap();
        assert_eq!(b.recv().await.unwrap().npdu, vec![0xBB]);
        assert_eq!(c.recv().await.unwrap().npdu, vec![0xBB]);
        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(50), a.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn detach_on_drop() {
        let net = VirtualNetwork::new("test");
        let a = net.attach(Mac::station(1));
        {
            let _b = net.attach(Mac::station(2));
            assert_eq!(net.node_count(), 2);
        }
        assert_eq!(net.node_count(), 1);
        drop(a);
        assert_eq!(net.node_count(), 0);
    }
}
