use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::{Buf, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::blit::blit_messages::{decode, BlitCommand, DecodeResult};
use crate::plug::plug_config::SessionRole;
use crate::plug::session_handle::SessionHandle;
use crate::plug::shutdown::{Shutdown, StopReason};
use crate::transport::tcp_endpoint::accept_retrying;

/// The data session Blit commands act upon. It is `None` while there is no data session, e.g.
///  while a persistent client waits to reconnect; the control listener itself keeps running.
pub type BlitTarget = Arc<RwLock<Option<SessionHandle>>>;

pub fn new_blit_target() -> BlitTarget {
    Arc::new(RwLock::new(None))
}

/// Executes decoded Blit commands against the current data session.
pub struct BlitDispatcher {
    name: String,
    target: BlitTarget,
    shutdown: Shutdown,
}

impl BlitDispatcher {
    pub fn new(addr: SocketAddr, target: BlitTarget, shutdown: Shutdown) -> BlitDispatcher {
        BlitDispatcher {
            name: format!("{}-{}:{}(TCP)", SessionRole::Control, addr.ip(), addr.port()),
            target,
            shutdown,
        }
    }

    /// the name injected messages are attributed to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Executes all complete frames at the start of the buffer, removing them from it. An
    ///  incomplete trailing frame stays in the buffer for the next read. Returns the number of
    ///  frames that were rejected or failed.
    ///
    /// Garbage (a bad signature or an unknown opcode) discards the whole buffer: the stream is
    ///  out of sync, and the next frame is expected at the start of a fresh read. An oversized
    ///  message is skipped as it arrives, and a command that fails (e.g. because of an unknown
    ///  peer index) consumes exactly its own frame.
    pub async fn process_buffer(&self, input: &mut ControlBuffer) -> usize {
        let mut num_errors = 0;
        loop {
            if input.discard > 0 {
                let n = input.discard.min(input.buf.len());
                input.buf.advance(n);
                input.discard -= n;
                if input.discard > 0 {
                    trace!("skipping rejected frame - {} bytes to go", input.discard);
                    return num_errors;
                }
            }

            match decode(&input.buf) {
                DecodeResult::Complete { command, consumed } => {
                    input.buf.advance(consumed);
                    if let Err(e) = self.execute(command).await {
                        error!("** BLIT-ERROR({})", e);
                        num_errors += 1;
                    }
                }
                DecodeResult::Incomplete => {
                    trace!("waiting for more data - {} bytes buffered", input.buf.len());
                    return num_errors;
                }
                DecodeResult::Error(e) => {
                    error!("** BLIT-ERROR({})", e);
                    num_errors += 1;
                    match e.frame_len() {
                        Some(frame_len) => input.discard = frame_len,
                        None => {
                            input.buf.clear();
                            return num_errors;
                        }
                    }
                }
            }
        }
    }

    pub async fn execute(&self, command: BlitCommand) -> anyhow::Result<()> {
        if command == BlitCommand::Kill {
            info!("** BLIT-KILL - Received shutdown command");
            self.shutdown.trigger(StopReason::Killed);
            return Ok(());
        }

        let target = self.target.read().await;
        let handle = target.as_ref()
            .ok_or_else(|| anyhow!("No active session"))?;
        let mut session = handle.lock().await;

        match command {
            BlitCommand::Squelch { peer } => {
                session.set_mute(peer.into(), true)
                    .map_err(|_| anyhow!("Malformed or missing peer for mute"))?;
            }
            BlitCommand::Unsquelch { peer } => {
                session.set_mute(peer.into(), false)
                    .map_err(|_| anyhow!("Malformed or missing peer for unmute"))?;
            }
            BlitCommand::Delete { peer } => {
                match session.delete_peer(peer.into()) {
                    Some(deleted) => debug!("** BLIT-DELETE - removed {}", deleted.name()),
                    None => bail!("Invalid peer index {}", peer),
                }
            }
            BlitCommand::SendMsg { peer, data } => {
                if session.registry().get(peer.into()).is_none() {
                    bail!("Invalid peer index {}", peer);
                }
                if let Err(e) = session.inject(peer.into(), &self.name, data) {
                    warn!("failed to send injected message: {}", e);
                }
            }
            BlitCommand::ListPeers => {
                info!("** BLIT-LISTPEERS - Received list peers command");
                for (i, name) in session.peer_listing().iter().enumerate() {
                    info!("**   {} - {}", i, name);
                }
                info!("** BLIT-LISTPEERS-END - End of peer list");
            }
            BlitCommand::Clear => {
                session.clear_peers();
                debug!("** BLIT-CLEAR - removed all peers");
            }
            BlitCommand::Kill => {}
        }
        Ok(())
    }
}

/// Bytes received on one control connection that were not consumed by a frame yet
#[derive(Default)]
pub struct ControlBuffer {
    buf: BytesMut,
    /// bytes of a rejected frame that are still to be skipped
    discard: usize,
}

impl ControlBuffer {
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// the bytes of an incomplete frame
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl From<&[u8]> for ControlBuffer {
    fn from(data: &[u8]) -> Self {
        ControlBuffer {
            buf: BytesMut::from(data),
            discard: 0,
        }
    }
}

/// The always-on control listener: a TCP listener, plus optionally a UDP socket on the same
///  address.
pub struct BlitServer {
    tcp: TcpListener,
    udp: Option<UdpSocket>,
    dispatcher: Arc<BlitDispatcher>,
}

impl BlitServer {
    pub async fn bind(addr: SocketAddr, with_udp: bool, target: BlitTarget, shutdown: Shutdown) -> anyhow::Result<BlitServer> {
        let tcp = TcpListener::bind(addr).await
            .map_err(|e| anyhow!("cannot bind Blit listener to {}: {}", addr, e))?;
        let local_addr = tcp.local_addr()?;

        let udp = if with_udp {
            Some(UdpSocket::bind(local_addr).await
                .map_err(|e| anyhow!("cannot bind Blit UDP socket to {}: {}", local_addr, e))?)
        }
        else {
            None
        };

        let dispatcher = Arc::new(BlitDispatcher::new(local_addr, target, shutdown));
        debug!("** {} Started", dispatcher.name());

        Ok(BlitServer {
            tcp,
            udp,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.tcp.local_addr()?)
    }

    /// Serves control connections until the returned future is dropped. Connection tasks are
    ///  owned by this future and end with it.
    pub async fn run(self) -> anyhow::Result<()> {
        let udp = async {
            match &self.udp {
                Some(socket) => udp_loop(socket, &self.dispatcher).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            r = accept_loop(&self.tcp, &self.dispatcher) => r,
            r = udp => r,
        }
    }
}

async fn accept_loop(listener: &TcpListener, dispatcher: &Arc<BlitDispatcher>) -> anyhow::Result<()> {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            (stream, addr) = accept_retrying(move || listener.accept()) => {
                let dispatcher = dispatcher.clone();
                connections.spawn(async move {
                    if let Err(e) = handle_connection(stream, addr, dispatcher).await {
                        warn!("Blit connection from {} broke with an error: {}", addr, e);
                    }
                });
            }
            Some(_) = connections.join_next() => {}
        }
    }
}

#[instrument(name="blit_connection", skip_all, fields(addr = %addr))]
async fn handle_connection(mut stream: TcpStream, addr: SocketAddr, dispatcher: Arc<BlitDispatcher>) -> anyhow::Result<()> {
    trace!("accepted Blit connection");
    let mut input = ControlBuffer::default();
    loop {
        input.buf.reserve(4096);
        if stream.read_buf(&mut input.buf).await? == 0 {
            if !input.is_empty() {
                warn!("Blit connection closed with {} bytes of an incomplete command", input.buf.len());
            }
            return Ok(());
        }
        dispatcher.process_buffer(&mut input).await;
    }
}

async fn udp_loop(socket: &UdpSocket, dispatcher: &BlitDispatcher) -> anyhow::Result<()> {
    let mut recv_buf = vec![0u8; 65536];
    loop {
        let (len, from) = socket.recv_from(&mut recv_buf).await?;
        trace!("received Blit datagram from {}", from);

        // no further bytes can follow a datagram, so an incomplete frame is an error here
        let mut input = ControlBuffer::from(&recv_buf[..len]);
        dispatcher.process_buffer(&mut input).await;
        if !input.is_empty() {
            error!("** BLIT-ERROR(Truncated datagram from {})", from);
        }
    }
}
