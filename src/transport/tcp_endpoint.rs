use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, instrument, trace, warn};

use crate::plug::peer::{PeerOutlet, StreamCommand};
use crate::plug::session_handle::SessionHandle;
use crate::transport::tls::TlsClient;

const READ_BUF_SIZE: usize = 16*1024;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Accepts connections, each of them becoming a peer of the server session. Runs until the
///  returned future is dropped, which also ends all accepted connections.
pub async fn serve(listener: TcpListener, tls: Option<TlsAcceptor>, handle: SessionHandle) -> anyhow::Result<()> {
    let listener = &listener;
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            (stream, addr) = accept_retrying(move || listener.accept()) => {
                connections.spawn(accept_connection(stream, addr, tls.clone(), handle.clone()));
            }
            Some(_) = connections.join_next() => {}
        }
    }
}

/// Calls `accept` until it succeeds. A failed accept (e.g. because the process ran out of file
///  descriptors) does not affect the listener, so it is logged and retried after a pause.
pub(crate) async fn accept_retrying<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                warn!("error accepting connection: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

async fn accept_connection(stream: TcpStream, addr: SocketAddr, tls: Option<TlsAcceptor>, handle: SessionHandle) {
    match tls {
        None => run_connection(stream, addr, handle).await,
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => run_connection(stream, addr, handle).await,
            Err(e) => warn!("TLS handshake with {} failed: {}", addr, e),
        },
    }
}

/// Connects a client session to its target. A connection that cannot be established (including
///  a failed TLS handshake) is reported to the session like a closed one, which may stop the
///  process.
pub async fn run_client(target: SocketAddr, source: Option<SocketAddr>, tls: Option<TlsClient>, handle: SessionHandle) -> anyhow::Result<()> {
    let stream = match connect(target, source).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("connecting to {} failed: {}", target, e);
            handle.on_connect_failed().await;
            return Ok(());
        }
    };

    handle.lock().await.set_local_addr(stream.local_addr()?);

    match tls {
        None => run_connection(stream, target, handle).await,
        Some(TlsClient { connector, server_name }) => {
            match connector.connect(server_name, stream).await {
                Ok(stream) => run_connection(stream, target, handle).await,
                Err(e) => {
                    warn!("TLS handshake with {} failed: {}", target, e);
                    handle.on_connect_failed().await;
                }
            }
        }
    }
    Ok(())
}

/// Connects to `target`, binding to `source` first if it is given
pub async fn connect(target: SocketAddr, source: Option<SocketAddr>) -> anyhow::Result<TcpStream> {
    let source = match source {
        None => return Ok(TcpStream::connect(target).await?),
        Some(source) => source,
    };

    let socket = if source.is_ipv4() {
        TcpSocket::new_v4()?
    }
    else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(source)?;
    Ok(socket.connect(target).await?)
}

/// Drives a single connection until either side closes it. Data written to the connection is
///  queued by the session and written by this connection's writer; a queued `Close` takes
///  effect after all writes queued before it.
#[instrument(name="connection", skip_all, fields(peer = %peer_addr))]
pub async fn run_connection<S>(stream: S, peer_addr: SocketAddr, handle: SessionHandle)
where S: AsyncRead + AsyncWrite + Send + 'static
{
    let (sender, receiver) = mpsc::unbounded_channel();
    let outlet = PeerOutlet::Stream(sender);
    let (reader, writer) = tokio::io::split(stream);

    handle.on_connected(peer_addr, &outlet).await;

    tokio::select! {
        r = read_loop(reader, peer_addr, &outlet, &handle) => {
            match r {
                Ok(_) => trace!("connection closed by peer"),
                Err(e) => debug!("error reading from connection: {}", e),
            }
        }
        r = write_loop(writer, receiver) => {
            match r {
                Ok(_) => trace!("connection closed locally"),
                Err(e) => warn!("error writing to connection: {}", e),
            }
        }
    }

    handle.on_connection_closed(peer_addr).await;
}

async fn read_loop<S: AsyncRead>(mut reader: ReadHalf<S>, peer_addr: SocketAddr, outlet: &PeerOutlet, handle: &SessionHandle) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
    loop {
        buf.reserve(READ_BUF_SIZE);
        if reader.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
        handle.on_inbound(peer_addr, outlet, buf.split().freeze()).await;
    }
}

async fn write_loop<S: AsyncWrite>(mut writer: WriteHalf<S>, mut commands: mpsc::UnboundedReceiver<StreamCommand>) -> anyhow::Result<()> {
    while let Some(command) = commands.recv().await {
        match command {
            StreamCommand::Write(data) => writer.write_all(&data).await?,
            StreamCommand::Close => {
                writer.shutdown().await?;
                return Ok(());
            }
        }
    }
    Ok(())
}
