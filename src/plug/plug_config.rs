use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail};

use crate::plug::feed::FeedOptions;
use crate::plug::peer::Transport;

pub const DEFAULT_BLIT_IPADDR: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub const DEFAULT_BLIT_PORT: u16 = 25195;

/// where a server listens if only a port is given
pub const DEFAULT_LISTEN_IPADDR: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

pub fn default_blit_addr() -> SocketAddr {
    SocketAddr::new(DEFAULT_BLIT_IPADDR, DEFAULT_BLIT_PORT)
}

/// Resolves a `host:port` argument. A bare port number stands for that port on `default_ip`.
pub async fn resolve_addr(arg: &str, default_ip: IpAddr) -> anyhow::Result<SocketAddr> {
    if let Ok(port) = arg.parse::<u16>() {
        return Ok(SocketAddr::new(default_ip, port));
    }

    tokio::net::lookup_host(arg).await
        .map_err(|e| anyhow!("cannot resolve {}: {}", arg, e))?
        .next()
        .ok_or_else(|| anyhow!("no address for {}", arg))
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DumpFormat {
    Hex,
    Raw,
}
impl FromStr for DumpFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hex" => Ok(DumpFormat::Hex),
            "raw" => Ok(DumpFormat::Raw),
            _ => Err(anyhow!("invalid dump format: {:?}", s)),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OutputTarget {
    Stderr,
    Stdout,
    File(PathBuf),
}

/// Output settings for everything a running plug reports: whether verbose notices are shown,
///  how relayed / injected messages are dumped, and where all of it goes.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub verbose: bool,
    /// `None` turns message dumps off completely
    pub dump_format: Option<DumpFormat>,
    pub output: OutputTarget,
}
impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            verbose: true,
            dump_format: Some(DumpFormat::Hex),
            output: OutputTarget::Stderr,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionRole {
    Client,
    Server,
    /// the Blit control listener
    Control,
}
impl Display for SessionRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionRole::Client => write!(f, "CLIENT"),
            SessionRole::Server => write!(f, "SERVER"),
            SessionRole::Control => write!(f, "BLITSRV"),
        }
    }
}

/// TLS settings of a TCP session. All files are PEM encoded.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct TlsOptions {
    /// the certificate chain a server presents; required for servers
    pub cert_chain: Option<PathBuf>,
    /// the private key belonging to `cert_chain`
    pub private_key: Option<PathBuf>,
    /// CA certificates a client verifies the server against. Without them, a client accepts
    ///  any server certificate.
    pub ca_certs: Option<PathBuf>,
    /// the name a client sends (SNI) and verifies; defaults to the target's IP address
    pub server_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlugConfig {
    pub transport: Transport,
    pub role: SessionRole,

    /// For servers, the address to listen on. For clients, an optional source address to bind
    ///  before connecting (UDP clients always bind, defaulting to an ephemeral port).
    pub local_addr: Option<SocketAddr>,
    /// the remote address a client connects / sends to
    pub target: Option<SocketAddr>,

    pub blit_addr: SocketAddr,
    /// whether the control listener also accepts Blit datagrams on the same address
    pub blit_udp: bool,

    /// reconnect endlessly when a client's connection is lost
    pub persist: bool,
    pub reconnect_delay: Duration,

    /// wrap TCP connections in TLS
    pub tls: Option<TlsOptions>,

    pub feed_options: FeedOptions,
    pub log: LogConfig,
}

impl PlugConfig {
    pub fn client(transport: Transport, target: SocketAddr) -> PlugConfig {
        PlugConfig {
            transport,
            role: SessionRole::Client,
            local_addr: None,
            target: Some(target),
            ..Self::defaults(transport)
        }
    }

    pub fn server(transport: Transport, listen_addr: SocketAddr) -> PlugConfig {
        PlugConfig {
            transport,
            role: SessionRole::Server,
            local_addr: Some(listen_addr),
            target: None,
            ..Self::defaults(transport)
        }
    }

    fn defaults(transport: Transport) -> PlugConfig {
        PlugConfig {
            transport,
            role: SessionRole::Client,
            local_addr: None,
            target: None,
            blit_addr: default_blit_addr(),
            blit_udp: true,
            persist: false,
            reconnect_delay: Duration::from_secs(1),
            tls: None,
            feed_options: FeedOptions::default(),
            log: LogConfig::default(),
        }
    }

    /// Checks the configuration for contradictions. This is done before any socket is bound, so
    ///  a bad configuration never leaves a half-started process behind.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.role {
            SessionRole::Client => {
                if self.target.is_none() {
                    bail!("a client needs a target address");
                }
            }
            SessionRole::Server => {
                if self.local_addr.is_none() {
                    bail!("a server needs a listen address");
                }
                if self.target.is_some() {
                    bail!("a server does not take a target address");
                }
            }
            SessionRole::Control => {
                bail!("the control role is reserved for the Blit listener");
            }
        }

        if let Some(tls) = &self.tls {
            if self.transport == Transport::Udp {
                bail!("TLS cannot be combined with UDP");
            }
            if self.role == SessionRole::Server && (tls.cert_chain.is_none() || tls.private_key.is_none()) {
                bail!("a TLS server needs a certificate chain and a private key");
            }
        }

        // port 0 picks distinct ephemeral ports
        let shares_blit_socket = self.transport == Transport::Tcp || self.blit_udp;
        if shares_blit_socket && self.blit_addr.port() != 0 && self.local_addr == Some(self.blit_addr) {
            bail!("the Blit listener and the data listener cannot share {}", self.blit_addr);
        }

        Ok(())
    }
}
