use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::blit::blit_server::{new_blit_target, BlitServer, BlitTarget};
use crate::plug::behavior::{Behavior, RelayBehavior, Responder, StubBehavior};
use crate::plug::dump::DumpSink;
use crate::plug::feed::{FeedEngine, FeedOptions};
use crate::plug::operator_prompt::OperatorPrompt;
use crate::plug::peer::Transport;
use crate::plug::peer_registry::PeerRegistry;
use crate::plug::plug_config::{PlugConfig, SessionRole};
use crate::plug::session::Session;
use crate::plug::session_handle::SessionHandle;
use crate::plug::shutdown::{Shutdown, StopReason};
use crate::transport::tls::TlsClient;
use crate::transport::{tcp_endpoint, tls, udp_endpoint};

/// Creates a fresh responder for every data session a stub plug starts
pub type ResponderFactory = Arc<dyn Fn() -> Box<dyn Responder> + Send + Sync>;

/// What the data session does with inbound data. A new [Behavior] is built from this for every
///  (re)connect, so a reconnected feed starts over at its first message.
#[derive(Clone)]
pub enum BehaviorSpec {
    Relay,
    Feed(Arc<[Bytes]>),
    Stub(ResponderFactory),
}

impl BehaviorSpec {
    fn build(&self, feed_options: &FeedOptions) -> Behavior {
        match self {
            BehaviorSpec::Relay => Behavior::Relay(RelayBehavior),
            BehaviorSpec::Feed(messages) => Behavior::Feed(FeedEngine::new(messages.clone(), feed_options.clone())),
            BehaviorSpec::Stub(factory) => Behavior::Stub(StubBehavior::new(factory())),
        }
    }
}

type Driver = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A server's data endpoint is bound once, before anything runs
enum ServerEndpoint {
    Tcp(TcpListener, Option<TlsAcceptor>),
    Udp(UdpSocket),
}

/// A running process instance: one data session plus the Blit control listener that steers it.
pub struct Plug {
    config: PlugConfig,
    behavior: BehaviorSpec,
    dump: Arc<dyn DumpSink>,
    prompt: Arc<dyn OperatorPrompt>,
    shutdown: Shutdown,
    target: BlitTarget,
    blit: Option<BlitServer>,
    blit_addr: SocketAddr,
    server_endpoint: Option<ServerEndpoint>,
    data_addr: Option<SocketAddr>,
    tls_client: Option<TlsClient>,
}

impl Plug {
    /// Validates the configuration and binds all listening sockets. Nothing is bound if the
    ///  configuration is invalid.
    pub async fn start(
        config: PlugConfig,
        behavior: BehaviorSpec,
        dump: Arc<dyn DumpSink>,
        prompt: Arc<dyn OperatorPrompt>,
        shutdown: Shutdown,
    ) -> anyhow::Result<Plug> {
        config.validate()?;

        let tls_acceptor = match (&config.tls, config.role) {
            (Some(options), SessionRole::Server) => Some(tls::acceptor(options)?),
            _ => None,
        };
        let tls_client = match (&config.tls, config.role, config.target) {
            (Some(options), SessionRole::Client, Some(target)) => Some(tls::client(options, target)?),
            _ => None,
        };

        let (server_endpoint, data_addr) = if config.role == SessionRole::Server {
            let listen_addr = config.local_addr
                .ok_or_else(|| anyhow!("a server needs a listen address"))?;
            match config.transport {
                Transport::Tcp => {
                    let listener = TcpListener::bind(listen_addr).await
                        .map_err(|e| anyhow!("cannot listen on {}: {}", listen_addr, e))?;
                    let addr = listener.local_addr()?;
                    (Some(ServerEndpoint::Tcp(listener, tls_acceptor)), Some(addr))
                }
                Transport::Udp => {
                    let socket = udp_endpoint::bind(listen_addr).await
                        .map_err(|e| anyhow!("cannot bind to {}: {}", listen_addr, e))?;
                    let addr = socket.local_addr()?;
                    (Some(ServerEndpoint::Udp(socket)), Some(addr))
                }
            }
        }
        else {
            (None, None)
        };

        let target = new_blit_target();
        let blit = BlitServer::bind(config.blit_addr, config.blit_udp, target.clone(), shutdown.clone()).await?;
        let blit_addr = blit.local_addr()?;

        if let BehaviorSpec::Feed(messages) = &behavior {
            debug!("** FEED CONTAINS {} MESSAGES", messages.len());
        }

        Ok(Plug {
            config,
            behavior,
            dump,
            prompt,
            shutdown,
            target,
            blit: Some(blit),
            blit_addr,
            server_endpoint,
            data_addr,
            tls_client,
        })
    }

    pub fn blit_addr(&self) -> SocketAddr {
        self.blit_addr
    }

    /// The address a server's data endpoint is bound to; `None` for clients
    pub fn data_addr(&self) -> Option<SocketAddr> {
        self.data_addr
    }

    /// Runs until the process is told to stop (Blit `kill`, operator interrupt), or until the
    ///  data session is over and there is no reason to reconnect.
    pub async fn run(mut self) -> anyhow::Result<StopReason> {
        let blit = self.blit.take()
            .ok_or_else(|| anyhow!("Blit listener is not bound"))?;

        tokio::select! {
            r = blit.run() => {
                r?;
                Err(anyhow!("Blit listener stopped unexpectedly"))
            }
            r = self.run_data_sessions() => r,
        }
    }

    async fn run_data_sessions(&mut self) -> anyhow::Result<StopReason> {
        loop {
            let (handle, driver) = self.open_session().await?;
            *self.target.write().await = Some(handle.clone());

            let reason = tokio::select! {
                r = driver => {
                    if let Err(e) = r {
                        warn!("data session ended with an error: {}", e);
                    }
                    handle.stop_signal().reason().unwrap_or(StopReason::ConnectionClosed)
                }
                reason = handle.stop_signal().wait() => reason,
                reason = self.shutdown.wait() => reason,
            };
            handle.stop_signal().trigger(reason);
            *self.target.write().await = None;

            if reason != StopReason::ConnectionClosed || !self.reconnects() {
                return Ok(reason);
            }

            debug!("** RECONNECTING");
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                reason = self.shutdown.wait() => return Ok(reason),
            }
        }
    }

    fn reconnects(&self) -> bool {
        self.config.persist && self.config.role == SessionRole::Client
    }

    async fn open_session(&mut self) -> anyhow::Result<(SessionHandle, Driver)> {
        let config = &self.config;
        let behavior = self.behavior.build(&config.feed_options);

        match (config.transport, self.server_endpoint.take()) {
            (Transport::Tcp, Some(ServerEndpoint::Tcp(listener, tls_acceptor))) => {
                let mut session = Session::new(config.role, PeerRegistry::new_tcp(self.dump.clone()), behavior);
                session.set_local_addr(listener.local_addr()?);
                session.set_tls(tls_acceptor.is_some());
                let handle = self.new_handle(session);

                let driver: Driver = Box::pin(tcp_endpoint::serve(listener, tls_acceptor, handle.clone()));
                Ok((handle, driver))
            }
            (Transport::Tcp, None) => {
                let target = config.target
                    .ok_or_else(|| anyhow!("a client needs a target address"))?;
                let mut session = Session::new(config.role, PeerRegistry::new_tcp(self.dump.clone()), behavior);
                session.set_tls(self.tls_client.is_some());
                let handle = self.new_handle(session);

                let driver: Driver = Box::pin(tcp_endpoint::run_client(target, config.local_addr, self.tls_client.clone(), handle.clone()));
                Ok((handle, driver))
            }
            (Transport::Udp, endpoint) => {
                let socket = match endpoint {
                    Some(ServerEndpoint::Udp(socket)) => socket,
                    _ => {
                        let local_addr = match (config.local_addr, config.target) {
                            (Some(local_addr), _) => local_addr,
                            (None, Some(target)) => udp_endpoint::unspecified_for(target),
                            (None, None) => return Err(anyhow!("a UDP session needs a local or a target address")),
                        };
                        udp_endpoint::bind(local_addr).await?
                    }
                };

                let (sender, commands) = mpsc::unbounded_channel();
                let mut session = Session::new(config.role, PeerRegistry::new_udp(sender.clone(), self.dump.clone()), behavior);
                session.set_local_addr(socket.local_addr()?);

                // a UDP client always initiates, there is no other way to learn about the peer
                if config.role == SessionRole::Client {
                    let target = config.target
                        .ok_or_else(|| anyhow!("a client needs a target address"))?;
                    session.initiate(target)?;
                }
                let handle = self.new_handle(session);

                let driver_handle = handle.clone();
                let driver: Driver = Box::pin(async move {
                    udp_endpoint::run_socket(socket, sender, commands, driver_handle).await;
                    Ok(())
                });
                Ok((handle, driver))
            }
            (Transport::Tcp, Some(ServerEndpoint::Udp(_))) => Err(anyhow!("a TCP session cannot run on a UDP socket")),
        }
    }

    fn new_handle(&self, session: Session) -> SessionHandle {
        debug!("** {} Started", session.name());
        SessionHandle::new(session, self.prompt.clone())
    }
}
