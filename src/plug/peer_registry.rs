use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::plug::dump::DumpSink;
use crate::plug::peer::{DatagramCommand, Peer, PeerOutlet, Transport};

/// The ordered collection of all peers known to a session.
///
/// Order matters: Blit addresses peers by their position in the registry, so removing a peer
///  shifts all later peers down by one. There is never more than one peer for a given address.
pub struct PeerRegistry {
    transport: Transport,
    peers: Vec<Peer>,
    /// the session's shared socket, used for UDP peers that were added before any datagram
    ///  arrived from them
    datagram_outlet: Option<mpsc::UnboundedSender<DatagramCommand>>,
    dump: Arc<dyn DumpSink>,
}

impl PeerRegistry {
    pub fn new_tcp(dump: Arc<dyn DumpSink>) -> PeerRegistry {
        PeerRegistry {
            transport: Transport::Tcp,
            peers: Vec::new(),
            datagram_outlet: None,
            dump,
        }
    }

    pub fn new_udp(datagram_outlet: mpsc::UnboundedSender<DatagramCommand>, dump: Arc<dyn DumpSink>) -> PeerRegistry {
        PeerRegistry {
            transport: Transport::Udp,
            peers: Vec::new(),
            datagram_outlet: Some(datagram_outlet),
            dump,
        }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Peer> {
        self.peers.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Peer> {
        self.peers.get_mut(index)
    }

    pub fn find_index(&self, addr: SocketAddr) -> Option<usize> {
        self.peers.iter()
            .position(|p| p.addr() == addr)
    }

    pub fn find(&self, addr: SocketAddr) -> Option<&Peer> {
        self.find_index(addr)
            .map(|i| &self.peers[i])
    }

    /// Returns the index of the peer for a given address, registering a new peer at the end if
    ///  the address is not known yet.
    ///
    /// The outlet is only used when a new peer is created. It must belong to this registry's
    ///  transport.
    pub fn resolve(&mut self, addr: SocketAddr, outlet: &PeerOutlet) -> usize {
        if let Some(index) = self.find_index(addr) {
            return index;
        }

        debug_assert_eq!(outlet.transport(), self.transport, "peer outlet does not match the session's transport");

        let peer = Peer::new(addr, outlet.clone());
        debug!("new peer {}", peer.name());
        self.peers.push(peer);
        self.peers.len() - 1
    }

    /// Registers a UDP peer before any datagram was exchanged with it, so the session has a
    ///  target for its first message. Adding an address that is already known returns the
    ///  existing peer's index.
    pub fn add_manual(&mut self, addr: SocketAddr) -> anyhow::Result<usize> {
        let outlet = match &self.datagram_outlet {
            Some(outlet) => PeerOutlet::Datagram(outlet.clone()),
            None => bail!("peers can only be added manually for UDP sessions"),
        };
        Ok(self.resolve(addr, &outlet))
    }

    /// Removes the peer at a given index, closing its connection for TCP. Removing an index
    ///  that does not exist is a no-op.
    pub fn delete(&mut self, index: usize) -> Option<Peer> {
        if index >= self.peers.len() {
            trace!("no peer at index {} - nothing to delete", index);
            return None;
        }
        let peer = self.peers.remove(index);
        peer.close();
        Some(peer)
    }

    pub fn delete_addr(&mut self, addr: SocketAddr) -> Option<Peer> {
        self.find_index(addr)
            .and_then(|index| self.delete(index))
    }

    /// Removes a peer whose connection is already gone, i.e. without closing anything.
    pub(crate) fn forget(&mut self, addr: SocketAddr) -> Option<Peer> {
        self.find_index(addr)
            .map(|index| self.peers.remove(index))
    }

    pub(crate) fn forget_all(&mut self) {
        self.peers.clear();
    }

    /// Removes all peers, closing every TCP connection.
    pub fn clear(&mut self) {
        for peer in self.peers.drain(..) {
            peer.close();
        }
    }

    /// This is the single place through which outbound data is written. The message is dumped
    ///  before it is handed to the transport; a failing dump is reported but does not prevent
    ///  (or hide the outcome of) the send.
    pub fn send(&self, index: usize, sender_name: &str, data: Bytes) -> anyhow::Result<()> {
        let peer = self.peers.get(index)
            .ok_or_else(|| anyhow!("invalid peer index {}", index))?;

        if let Err(e) = self.dump.dump(sender_name, peer.name(), &data) {
            warn!("failed to dump message for {}: {}", peer.name(), e);
        }
        peer.write(data)
    }

    pub(crate) fn dump_inbound(&self, from: &str, to: &str, data: &[u8]) {
        if let Err(e) = self.dump.dump(from, to, data) {
            warn!("failed to dump message from {}: {}", from, e);
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.peers.iter()
            .map(|p| p.name().to_string())
            .collect()
    }
}
