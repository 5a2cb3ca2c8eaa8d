//! Utilities for testing code that drives plug sessions. They are used by this crate's own tests,
//!  and they are exported so applications plugging in their own `Responder` can test against
//!  sessions without real sockets.

pub mod dump;
pub mod prompt;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use tokio::sync::mpsc;

use crate::plug::peer::{DatagramCommand, PeerOutlet, StreamCommand};

pub use dump::RecordingDumpSink;
pub use prompt::{ChannelPrompt, PromptRequest};

/// convenience method for unit test code: a loopback address with the given port, the same
///  number generating the same address and different numbers different addresses
pub fn test_addr(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

/// An outlet for a TCP peer, with the receiving end standing in for the connection's writer
pub fn stream_outlet() -> (PeerOutlet, mpsc::UnboundedReceiver<StreamCommand>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (PeerOutlet::Stream(sender), receiver)
}

/// An outlet for UDP peers, with the receiving end standing in for the socket's writer
pub fn datagram_outlet() -> (PeerOutlet, mpsc::UnboundedReceiver<DatagramCommand>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (PeerOutlet::Datagram(sender), receiver)
}
