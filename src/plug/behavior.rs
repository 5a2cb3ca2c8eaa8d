use std::fmt::{Debug, Formatter};

use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::plug::feed::FeedEngine;
use crate::plug::peer_registry::PeerRegistry;

/// Application hook for protocol stubs: every inbound message is passed to `process`, and each
///  returned buffer is sent back to the message's sender, in order.
#[cfg_attr(test, automock)]
pub trait Responder: Send + 'static {
    fn process(&mut self, data: &[u8], sender: &str) -> Vec<Bytes>;
}

/// Forwards inbound messages to the other side of the conversation without interpreting them.
#[derive(Debug, Default, Clone)]
pub struct RelayBehavior;

impl RelayBehavior {
    /// The indices of all peers an inbound message from `sender` is relayed to: everybody except
    ///  the sender and muted peers
    pub fn targets(&self, registry: &PeerRegistry, sender: usize) -> Vec<usize> {
        registry.iter()
            .enumerate()
            .filter(|(i, p)| *i != sender && !p.mute)
            .map(|(i, _)| i)
            .collect()
    }
}

pub struct StubBehavior {
    responder: Box<dyn Responder>,
}
impl Debug for StubBehavior {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "StubBehavior")
    }
}

impl StubBehavior {
    pub fn new(responder: Box<dyn Responder>) -> StubBehavior {
        StubBehavior { responder }
    }

    pub fn respond(&mut self, data: &[u8], sender: &str) -> Vec<Bytes> {
        self.responder.process(data, sender)
    }
}

/// What a session does with inbound data. The variant is chosen when the session is built and
///  never changes afterwards.
#[derive(Debug)]
pub enum Behavior {
    Relay(RelayBehavior),
    Feed(FeedEngine),
    Stub(StubBehavior),
}

impl Behavior {
    pub fn feed(&self) -> Option<&FeedEngine> {
        match self {
            Behavior::Feed(feed) => Some(feed),
            _ => None,
        }
    }

    pub fn feed_mut(&mut self) -> Option<&mut FeedEngine> {
        match self {
            Behavior::Feed(feed) => Some(feed),
            _ => None,
        }
    }
}
