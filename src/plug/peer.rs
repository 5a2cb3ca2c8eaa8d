use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}
impl Display for Transport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "TCP"),
            Transport::Udp => write!(f, "UDP"),
        }
    }
}
impl FromStr for Transport {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Transport::Tcp),
            "UDP" => Ok(Transport::Udp),
            _ => Err(anyhow!("invalid transport protocol: {:?}", s)),
        }
    }
}

/// Commands for the writer task of a single TCP connection. They are processed in order, so a
///  `Close` takes effect after all writes queued before it were flushed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StreamCommand {
    Write(Bytes),
    Close,
}

/// Commands for the writer task of a (shared) UDP socket.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DatagramCommand {
    SendTo(SocketAddr, Bytes),
    /// closes the socket after all previously queued datagrams are sent
    Shutdown,
}

/// The way outbound data leaves the process for a given peer: TCP peers have a dedicated
///  connection each, UDP peers share their session's socket.
#[derive(Clone)]
pub enum PeerOutlet {
    Stream(mpsc::UnboundedSender<StreamCommand>),
    Datagram(mpsc::UnboundedSender<DatagramCommand>),
}
impl Debug for PeerOutlet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerOutlet::Stream(_) => write!(f, "PeerOutlet::Stream"),
            PeerOutlet::Datagram(_) => write!(f, "PeerOutlet::Datagram"),
        }
    }
}
impl PeerOutlet {
    pub fn transport(&self) -> Transport {
        match self {
            PeerOutlet::Stream(_) => Transport::Tcp,
            PeerOutlet::Datagram(_) => Transport::Udp,
        }
    }
}

/// A remote endpoint known to a session, identified by its transport address.
#[derive(Debug)]
pub struct Peer {
    addr: SocketAddr,
    transport: Transport,
    name: String,
    /// Inbound data from a muted peer is read (and discarded) but not processed any further
    pub mute: bool,
    outlet: PeerOutlet,
}

impl Peer {
    pub fn new(addr: SocketAddr, outlet: PeerOutlet) -> Peer {
        let transport = outlet.transport();
        Peer {
            addr,
            transport,
            name: format!("PEER-{}:{}({})", addr.ip(), addr.port(), transport),
            mute: false,
            outlet,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hands data to the transport. This does not dump anything, see
    ///  [crate::plug::peer_registry::PeerRegistry::send] for the logged path.
    pub(crate) fn write(&self, data: Bytes) -> anyhow::Result<()> {
        match &self.outlet {
            PeerOutlet::Stream(sender) => sender.send(StreamCommand::Write(data))
                .map_err(|_| anyhow!("connection to {} is closed", self.name)),
            PeerOutlet::Datagram(sender) => sender.send(DatagramCommand::SendTo(self.addr, data))
                .map_err(|_| anyhow!("socket for {} is closed", self.name)),
        }
    }

    /// Closes a TCP peer's connection. UDP peers have no connection of their own, so this is a
    ///  no-op for them.
    pub fn close(&self) {
        if let PeerOutlet::Stream(sender) = &self.outlet {
            let _ = sender.send(StreamCommand::Close);
        }
    }

    /// Closes the transport after pending writes: the peer's connection for TCP, the whole
    ///  shared socket for UDP.
    pub(crate) fn close_after_writing(&self) {
        match &self.outlet {
            PeerOutlet::Stream(sender) => {
                let _ = sender.send(StreamCommand::Close);
            }
            PeerOutlet::Datagram(sender) => {
                let _ = sender.send(DatagramCommand::Shutdown);
            }
        }
    }
}
