use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace, warn};

use crate::plug::peer::{DatagramCommand, PeerOutlet};
use crate::plug::session_handle::SessionHandle;

const MAX_DATAGRAM_SIZE: usize = 65536;

/// The wildcard address with an ephemeral port, in the same address family as `target`
pub fn unspecified_for(target: SocketAddr) -> SocketAddr {
    match target {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

pub async fn bind(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).await?;
    debug!("bound UDP socket to {:?}", socket.local_addr());
    Ok(socket)
}

/// Drives a session's shared UDP socket: every datagram is inbound data from the peer with the
///  sender's address, and queued datagrams are sent until the session shuts the socket down.
#[instrument(name="udp_socket", skip_all)]
pub async fn run_socket(
    socket: UdpSocket,
    sender: mpsc::UnboundedSender<DatagramCommand>,
    commands: mpsc::UnboundedReceiver<DatagramCommand>,
    handle: SessionHandle,
) {
    let outlet = PeerOutlet::Datagram(sender);

    tokio::select! {
        r = read_loop(&socket, &outlet, &handle) => {
            if let Err(e) = r {
                warn!("error reading from UDP socket: {}", e);
            }
        }
        _ = write_loop(&socket, commands) => {
            trace!("UDP socket shut down");
        }
    }

    handle.on_socket_closed().await;
}

async fn read_loop(socket: &UdpSocket, outlet: &PeerOutlet, handle: &SessionHandle) -> anyhow::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                handle.on_inbound(from, outlet, Bytes::copy_from_slice(&buf[..len])).await;
            }
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset) => {
                // ICMP feedback for an earlier datagram, the socket itself is fine
                debug!("peer is unreachable: {}", e);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn write_loop(socket: &UdpSocket, mut commands: mpsc::UnboundedReceiver<DatagramCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            DatagramCommand::SendTo(to, data) => {
                if let Err(e) = socket.send_to(&data, to).await {
                    warn!("error sending datagram to {}: {}", to, e);
                }
            }
            DatagramCommand::Shutdown => return,
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::plug::behavior::{Behavior, MockResponder, StubBehavior};
    use crate::plug::feed::{FeedEngine, FeedOptions};
    use crate::plug::peer_registry::PeerRegistry;
    use crate::plug::plug_config::SessionRole;
    use crate::plug::session::Session;
    use crate::plug::shutdown::StopReason;
    use crate::test_util::{ChannelPrompt, RecordingDumpSink};

    async fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
        let mut buf = vec![0u8; 1024];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf)).await.unwrap().unwrap();
        buf.truncate(n);
        (buf, from)
    }

    async fn start(role: SessionRole, behavior: Behavior) -> (SessionHandle, SocketAddr, tokio::task::JoinHandle<()>) {
        let socket = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (sender, commands) = mpsc::unbounded_channel();

        let mut session = Session::new(role, PeerRegistry::new_udp(sender.clone(), Arc::new(RecordingDumpSink::default())), behavior);
        session.set_local_addr(addr);
        let (prompt, _) = ChannelPrompt::new();
        let handle = SessionHandle::new(session, Arc::new(prompt));

        let join_handle = tokio::spawn(run_socket(socket, sender, commands, handle.clone()));
        (handle, addr, join_handle)
    }

    #[tokio::test]
    async fn test_stub_server_answers_each_sender() {
        let mut responder = MockResponder::new();
        responder.expect_process()
            .returning(|data, _| vec![Bytes::from([b"re:".as_ref(), data].concat())]);
        let (handle, addr, _) = start(SessionRole::Server, Behavior::Stub(StubBehavior::new(Box::new(responder)))).await;

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.send_to(b"a", addr).await.unwrap();
        assert_eq!(recv(&a).await, (b"re:a".to_vec(), addr));
        b.send_to(b"b", addr).await.unwrap();
        assert_eq!(recv(&b).await, (b"re:b".to_vec(), addr));

        assert_eq!(handle.lock().await.peer_listing(), vec![
            format!("PEER-127.0.0.1:{}(UDP)", a.local_addr().unwrap().port()),
            format!("PEER-127.0.0.1:{}(UDP)", b.local_addr().unwrap().port()),
        ]);
    }

    #[tokio::test]
    async fn test_close_at_end_shuts_socket_down() {
        let feed = FeedEngine::new(vec![Bytes::from_static(b"last")], FeedOptions { close_at_end: true, ..FeedOptions::default() });
        let (handle, addr, join_handle) = start(SessionRole::Client, Behavior::Feed(feed)).await;

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        handle.initiate(peer.local_addr().unwrap()).await.unwrap();
        assert_eq!(recv(&peer).await, (b"last".to_vec(), addr));

        tokio::time::timeout(Duration::from_secs(5), join_handle).await.unwrap().unwrap();
        assert_eq!(handle.stop_signal().reason(), Some(StopReason::ConnectionClosed));
        assert!(handle.lock().await.peer_listing().is_empty());
    }

    #[test]
    fn test_unspecified_for() {
        assert_eq!(unspecified_for("10.1.2.3:5".parse().unwrap()), "0.0.0.0:0".parse().unwrap());
        assert_eq!(unspecified_for("[::1]:5".parse().unwrap()), "[::]:0".parse().unwrap());
    }
}
