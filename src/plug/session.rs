use std::net::SocketAddr;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::plug::behavior::Behavior;
use crate::plug::feed::FeedStep;
use crate::plug::peer::{Peer, PeerOutlet, Transport};
use crate::plug::peer_registry::PeerRegistry;
use crate::plug::plug_config::SessionRole;

/// Work that a session handed back to its driver because it must not be done while the
///  session is locked.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Deferred {
    /// ask the operator before sending the feed message at `position` to `peer`
    Confirm { peer: SocketAddr, position: usize },
}

/// One data endpoint (a TCP listener / connection, or a UDP socket) with its peers and the
///  behavior that decides what happens to inbound data.
///
/// All methods are synchronous: outbound data is queued on the peers' outlets and written by
///  the transport's writer tasks, so a session can be driven under a lock without ever holding
///  it across I/O.
pub struct Session {
    role: SessionRole,
    transport: Transport,
    local_addr: Option<SocketAddr>,
    registry: PeerRegistry,
    behavior: Behavior,
    stop_on_close: bool,
    /// whether the transport wraps connections in TLS
    tls: bool,
}

impl Session {
    pub fn new(role: SessionRole, registry: PeerRegistry, behavior: Behavior) -> Session {
        Session {
            role,
            transport: registry.transport(),
            local_addr: None,
            registry,
            behavior,
            stop_on_close: role == SessionRole::Client,
            tls: false,
        }
    }

    pub fn set_local_addr(&mut self, local_addr: SocketAddr) {
        self.local_addr = Some(local_addr);
    }

    pub fn set_tls(&mut self, tls: bool) {
        self.tls = tls;
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    pub fn name(&self) -> String {
        match self.local_addr {
            Some(addr) => format!("{}-{}:{}({})", self.role, addr.ip(), addr.port(), self.transport),
            None => format!("{}-PENDING({})", self.role, self.transport),
        }
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn stop_on_close(&self) -> bool {
        self.stop_on_close
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn behavior(&self) -> &Behavior {
        &self.behavior
    }

    /// A TCP connection was established, either accepted by a server or connected by a client.
    ///  A client feed with `go_first` sends its first message right away.
    pub fn on_connected(&mut self, addr: SocketAddr, outlet: &PeerOutlet) -> anyhow::Result<()> {
        let index = self.registry.resolve(addr, outlet);
        if let Some(peer) = self.registry.get(index) {
            info!("** {} CONNECTED TO {}{}", self.name(), peer.name(), if self.tls { " (TLS)" } else { "" });
        }

        if self.role != SessionRole::Client {
            return Ok(());
        }
        let go_first = self.behavior.feed_mut()
            .map(|feed| feed.take_go_first())
            .unwrap_or(false);
        if go_first {
            self.feed_to(addr)?;
        }
        Ok(())
    }

    /// Seeds the target peer of a UDP client and sends the first feed message to it: a UDP
    ///  client has no other way to learn about its peer.
    pub fn initiate(&mut self, target: SocketAddr) -> anyhow::Result<()> {
        self.registry.add_manual(target)?;

        if let Some(feed) = self.behavior.feed_mut() {
            feed.clear_go_first();
            self.feed_to(target)?;
        }
        Ok(())
    }

    /// Dispatches data received from `addr`. Data from a muted peer is consumed without any
    ///  further effect.
    pub fn on_inbound(&mut self, addr: SocketAddr, outlet: &PeerOutlet, data: Bytes) -> anyhow::Result<Option<Deferred>> {
        let index = self.registry.resolve(addr, outlet);
        let peer = self.registry.get(index)
            .ok_or_else(|| anyhow!("peer {} vanished during resolution", addr))?;
        if peer.mute {
            trace!("dropping {} bytes from muted peer {}", data.len(), peer.name());
            return Ok(None);
        }

        let sender_name = peer.name().to_string();
        let name = self.name();
        self.registry.dump_inbound(&sender_name, &name, &data);

        if let Some(feed) = self.behavior.feed() {
            if feed.options().step {
                return Ok(Some(Deferred::Confirm { peer: addr, position: feed.position() }));
            }
            self.feed_to(addr)?;
            return Ok(None);
        }

        match &mut self.behavior {
            Behavior::Relay(relay) => {
                for target in relay.targets(&self.registry, index) {
                    if let Err(e) = self.registry.send(target, &sender_name, data.clone()) {
                        warn!("failed to relay message from {}: {}", sender_name, e);
                    }
                }
            }
            Behavior::Stub(stub) => {
                for reply in stub.respond(&data, &sender_name) {
                    self.registry.send(index, &name, reply)?;
                }
            }
            Behavior::Feed(_) => {}
        }
        Ok(None)
    }

    /// Sends the feed's next message to the peer at `addr`, closing the transport afterwards if
    ///  this was the last message and `close_at_end` is set.
    pub fn feed_to(&mut self, addr: SocketAddr) -> anyhow::Result<()> {
        let index = match self.registry.find_index(addr) {
            Some(index) => index,
            None => {
                warn!("peer {} is gone - not advancing the feed", addr);
                return Ok(());
            }
        };

        let name = self.name();
        let feed = match self.behavior.feed_mut() {
            Some(feed) => feed,
            None => bail!("{} does not replay a feed", name),
        };

        match feed.next_step() {
            FeedStep::Send { position, data, close_after } => {
                trace!("sending feed message #{}", position);
                self.registry.send(index, &name, data)?;
                if close_after {
                    if let Some(peer) = self.registry.get(index) {
                        debug!("feed is exhausted - closing after writing to {}", peer.name());
                        peer.close_after_writing();
                    }
                }
            }
            FeedStep::Exhausted { notice } => {
                if notice {
                    info!("** FEED EXHAUSTED");
                }
            }
        }
        Ok(())
    }

    /// A TCP connection ended. Returns true if the process should stop because of it.
    pub fn on_connection_closed(&mut self, addr: SocketAddr) -> bool {
        self.registry.forget(addr);
        self.closed()
    }

    /// The session's UDP socket is gone, and with it every peer association.
    pub fn on_socket_closed(&mut self) -> bool {
        self.registry.forget_all();
        self.closed()
    }

    /// A client's connection could not be established
    pub fn on_connect_failed(&mut self) -> bool {
        info!("** Connection refused.");
        self.stopping()
    }

    fn closed(&self) -> bool {
        info!("** Connection closed.");
        self.stopping()
    }

    fn stopping(&self) -> bool {
        if self.stop_on_close {
            info!("STOPPING!!");
        }
        self.stop_on_close
    }

    /// Writes Blit-injected data to a peer, regardless of whether it is muted
    pub fn inject(&self, index: usize, sender_name: &str, data: Bytes) -> anyhow::Result<()> {
        self.registry.send(index, sender_name, data)
    }

    pub fn set_mute(&mut self, index: usize, mute: bool) -> anyhow::Result<()> {
        let peer = self.registry.get_mut(index)
            .ok_or_else(|| anyhow!("invalid peer index {}", index))?;
        peer.mute = mute;
        debug!("{} {}", if mute { "muted" } else { "unmuted" }, peer.name());
        Ok(())
    }

    pub fn delete_peer(&mut self, index: usize) -> Option<Peer> {
        self.registry.delete(index)
    }

    pub fn clear_peers(&mut self) {
        self.registry.clear();
    }

    pub fn peer_listing(&self) -> Vec<String> {
        self.registry.names()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use rstest::rstest;

    use super::*;
    use crate::plug::behavior::{MockResponder, RelayBehavior, StubBehavior};
    use crate::plug::feed::{FeedEngine, FeedOptions, FeedState};
    use crate::plug::peer::{DatagramCommand, StreamCommand};
    use crate::test_util::{datagram_outlet, stream_outlet, test_addr, RecordingDumpSink};

    fn feed_session(role: SessionRole, msgs: &[&'static str], options: FeedOptions) -> (Session, Arc<RecordingDumpSink>) {
        let dump = Arc::new(RecordingDumpSink::default());
        let feed = FeedEngine::new(msgs.iter().map(|m| Bytes::from_static(m.as_bytes())).collect::<Vec<_>>(), options);
        let mut session = Session::new(role, PeerRegistry::new_tcp(dump.clone()), Behavior::Feed(feed));
        session.set_local_addr(test_addr(5000));
        (session, dump)
    }

    fn feed_state(session: &Session) -> (usize, FeedState) {
        let feed = session.behavior().feed().unwrap();
        (feed.position(), feed.state())
    }

    #[rstest]
    #[case::client(SessionRole::Client, "CLIENT-127.0.0.1:5000(TCP)", true)]
    #[case::server(SessionRole::Server, "SERVER-127.0.0.1:5000(TCP)", false)]
    fn test_name_and_stop_on_close(#[case] role: SessionRole, #[case] expected_name: &str, #[case] expected_stop: bool) {
        let (session, _) = feed_session(role, &[], FeedOptions::default());
        assert_eq!(session.name(), expected_name);
        assert_eq!(session.stop_on_close(), expected_stop);
    }

    #[test]
    fn test_pending_name() {
        let session = Session::new(SessionRole::Client, PeerRegistry::new_tcp(Arc::new(RecordingDumpSink::default())), Behavior::Relay(RelayBehavior));
        assert_eq!(session.name(), "CLIENT-PENDING(TCP)");
    }

    #[test]
    fn test_feed_answers_each_trigger() {
        let (mut session, dump) = feed_session(SessionRole::Server, &["one", "two"], FeedOptions::default());
        let (outlet, mut rx) = stream_outlet();

        session.on_connected(test_addr(1), &outlet).unwrap();
        assert!(rx.try_recv().is_err());

        for expected in ["one", "two"] {
            assert_eq!(session.on_inbound(test_addr(1), &outlet, Bytes::from_static(b"hi")).unwrap(), None);
            assert_eq!(rx.try_recv().unwrap(), StreamCommand::Write(Bytes::from_static(expected.as_bytes())));
        }
        assert_eq!(feed_state(&session), (2, FeedState::Exhausted));

        session.on_inbound(test_addr(1), &outlet, Bytes::from_static(b"hi")).unwrap();
        assert!(rx.try_recv().is_err());

        let records = dump.records();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0], ("PEER-127.0.0.1:1(TCP)".to_string(), "SERVER-127.0.0.1:5000(TCP)".to_string(), b"hi".to_vec()));
        assert_eq!(records[1], ("SERVER-127.0.0.1:5000(TCP)".to_string(), "PEER-127.0.0.1:1(TCP)".to_string(), b"one".to_vec()));
    }

    #[test]
    fn test_muted_peer_does_not_advance_feed() {
        let (mut session, dump) = feed_session(SessionRole::Server, &["one", "two"], FeedOptions::default());
        let (outlet, mut rx) = stream_outlet();
        session.on_connected(test_addr(1), &outlet).unwrap();

        session.set_mute(0, true).unwrap();
        session.on_inbound(test_addr(1), &outlet, Bytes::from_static(b"x")).unwrap();
        session.on_inbound(test_addr(1), &outlet, Bytes::from_static(b"y")).unwrap();
        assert!(rx.try_recv().is_err());
        assert!(dump.records().is_empty());
        assert_eq!(feed_state(&session), (0, FeedState::Idle));

        session.set_mute(0, false).unwrap();
        session.on_inbound(test_addr(1), &outlet, Bytes::from_static(b"z")).unwrap();
        assert_eq!(rx.try_recv().unwrap(), StreamCommand::Write(Bytes::from_static(b"one")));
        assert_eq!(feed_state(&session), (1, FeedState::Playing));
    }

    #[test]
    fn test_set_mute_invalid_index() {
        let (mut session, _) = feed_session(SessionRole::Server, &[], FeedOptions::default());
        assert!(session.set_mute(0, true).is_err());
    }

    #[test]
    fn test_step_defers_feed() {
        let (mut session, _) = feed_session(SessionRole::Server, &["one"], FeedOptions { step: true, ..FeedOptions::default() });
        let (outlet, mut rx) = stream_outlet();

        let deferred = session.on_inbound(test_addr(1), &outlet, Bytes::from_static(b"x")).unwrap();
        assert_eq!(deferred, Some(Deferred::Confirm { peer: test_addr(1), position: 0 }));
        assert!(rx.try_recv().is_err());

        session.feed_to(test_addr(1)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), StreamCommand::Write(Bytes::from_static(b"one")));
    }

    #[test]
    fn test_feed_to_deleted_peer_keeps_position() {
        let (mut session, _) = feed_session(SessionRole::Server, &["one"], FeedOptions::default());
        let (outlet, _rx) = stream_outlet();
        session.on_connected(test_addr(1), &outlet).unwrap();
        session.delete_peer(0);

        session.feed_to(test_addr(1)).unwrap();
        assert_eq!(feed_state(&session), (0, FeedState::Idle));
    }

    #[rstest]
    #[case::client_go_first(SessionRole::Client, true, Some("one"))]
    #[case::client_waits(SessionRole::Client, false, None)]
    #[case::server_ignores_go_first(SessionRole::Server, true, None)]
    fn test_go_first(#[case] role: SessionRole, #[case] go_first: bool, #[case] expected: Option<&'static str>) {
        let (mut session, _) = feed_session(role, &["one", "two"], FeedOptions { go_first, ..FeedOptions::default() });
        let (outlet, mut rx) = stream_outlet();

        session.on_connected(test_addr(1), &outlet).unwrap();
        assert_eq!(rx.try_recv().ok(), expected.map(|m| StreamCommand::Write(Bytes::from_static(m.as_bytes()))));
    }

    #[test]
    fn test_close_at_end_closes_after_last_write() {
        let (mut session, _) = feed_session(SessionRole::Client, &["one"], FeedOptions { close_at_end: true, go_first: true, ..FeedOptions::default() });
        let (outlet, mut rx) = stream_outlet();

        session.on_connected(test_addr(1), &outlet).unwrap();
        assert_eq!(rx.try_recv().unwrap(), StreamCommand::Write(Bytes::from_static(b"one")));
        assert_eq!(rx.try_recv().unwrap(), StreamCommand::Close);
    }

    #[test]
    fn test_udp_client_initiates() {
        let (outlet, mut rx) = datagram_outlet();
        let PeerOutlet::Datagram(sender) = outlet.clone() else { panic!() };
        let feed = FeedEngine::new(vec![Bytes::from_static(b"A"), Bytes::from_static(b"B")], FeedOptions { go_first: true, ..FeedOptions::default() });
        let mut session = Session::new(SessionRole::Client, PeerRegistry::new_udp(sender, Arc::new(RecordingDumpSink::default())), Behavior::Feed(feed));

        let target = test_addr(9000);
        session.initiate(target).unwrap();
        assert_eq!(rx.try_recv().unwrap(), DatagramCommand::SendTo(target, Bytes::from_static(b"A")));
        assert!(!session.behavior().feed().unwrap().options().go_first);

        session.on_inbound(target, &outlet, Bytes::from_static(b"reply")).unwrap();
        assert_eq!(rx.try_recv().unwrap(), DatagramCommand::SendTo(target, Bytes::from_static(b"B")));

        session.on_inbound(target, &outlet, Bytes::from_static(b"reply")).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(feed_state(&session), (2, FeedState::Exhausted));
        assert_eq!(session.registry().len(), 1);
    }

    #[test]
    fn test_relay_forwards_to_other_peers() {
        let dump = Arc::new(RecordingDumpSink::default());
        let mut session = Session::new(SessionRole::Server, PeerRegistry::new_tcp(dump.clone()), Behavior::Relay(RelayBehavior));
        let (o1, mut rx1) = stream_outlet();
        let (o2, mut rx2) = stream_outlet();
        let (o3, mut rx3) = stream_outlet();
        session.on_connected(test_addr(1), &o1).unwrap();
        session.on_connected(test_addr(2), &o2).unwrap();
        session.on_connected(test_addr(3), &o3).unwrap();
        session.set_mute(2, true).unwrap();

        session.on_inbound(test_addr(1), &o1, Bytes::from_static(b"abc")).unwrap();

        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap(), StreamCommand::Write(Bytes::from_static(b"abc")));
        assert!(rx3.try_recv().is_err());
        assert_eq!(dump.records().last().unwrap().0, "PEER-127.0.0.1:1(TCP)");
    }

    #[test]
    fn test_stub_replies_to_sender() {
        let mut responder = MockResponder::new();
        responder.expect_process()
            .times(1)
            .returning(|data, _| vec![Bytes::copy_from_slice(data), Bytes::from_static(b"!")]);

        let mut session = Session::new(SessionRole::Server, PeerRegistry::new_tcp(Arc::new(RecordingDumpSink::default())), Behavior::Stub(StubBehavior::new(Box::new(responder))));
        let (outlet, mut rx) = stream_outlet();
        session.on_inbound(test_addr(1), &outlet, Bytes::from_static(b"echo")).unwrap();

        assert_eq!(rx.try_recv().unwrap(), StreamCommand::Write(Bytes::from_static(b"echo")));
        assert_eq!(rx.try_recv().unwrap(), StreamCommand::Write(Bytes::from_static(b"!")));
    }

    #[test]
    fn test_inject_ignores_mute() {
        let (mut session, _) = feed_session(SessionRole::Server, &[], FeedOptions::default());
        let (outlet, mut rx) = stream_outlet();
        session.on_connected(test_addr(1), &outlet).unwrap();
        session.set_mute(0, true).unwrap();

        session.inject(0, "BLITSRV", Bytes::from_static(b"x")).unwrap();
        assert_eq!(rx.try_recv().unwrap(), StreamCommand::Write(Bytes::from_static(b"x")));
        assert!(session.inject(1, "BLITSRV", Bytes::from_static(b"x")).is_err());
    }

    #[rstest]
    #[case::client(SessionRole::Client, true)]
    #[case::server(SessionRole::Server, false)]
    fn test_connection_closed(#[case] role: SessionRole, #[case] expected_stop: bool) {
        let (mut session, _) = feed_session(role, &[], FeedOptions::default());
        let (outlet, _rx) = stream_outlet();
        session.on_connected(test_addr(1), &outlet).unwrap();

        assert_eq!(session.on_connection_closed(test_addr(1)), expected_stop);
        assert!(session.registry().is_empty());
    }
}
