use std::net::SocketAddr;

use anyhow::bail;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::blit::blit_messages::BlitCommand;
use crate::plug::peer::Transport;
use crate::plug::plug_config::default_blit_addr;

/// Sends Blit commands to a running control listener. Every command uses a connection (or a
///  datagram) of its own.
#[derive(Debug, Clone)]
pub struct BlitClient {
    addr: SocketAddr,
    transport: Transport,
}

impl Default for BlitClient {
    fn default() -> Self {
        BlitClient::tcp(default_blit_addr())
    }
}

impl BlitClient {
    pub fn new(addr: SocketAddr, transport: Transport) -> BlitClient {
        BlitClient {
            addr,
            transport,
        }
    }

    pub fn tcp(addr: SocketAddr) -> BlitClient {
        Self::new(addr, Transport::Tcp)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Injects `data` into the controlled session, sending it to the peer at `peer_index`
    pub async fn send_message(&self, peer_index: u16, data: Bytes) -> anyhow::Result<usize> {
        self.send(&BlitCommand::SendMsg { peer: peer_index, data }).await
    }

    /// Returns the number of bytes written
    pub async fn send(&self, command: &BlitCommand) -> anyhow::Result<usize> {
        self.send_raw(&command.to_bytes()?).await
    }

    pub async fn send_raw(&self, buf: &[u8]) -> anyhow::Result<usize> {
        debug!("sending {} bytes to Blit listener at {}({})", buf.len(), self.addr, self.transport);

        match self.transport {
            Transport::Tcp => {
                let mut stream = TcpStream::connect(self.addr).await?;
                stream.write_all(buf).await?;
                stream.shutdown().await?;
                Ok(buf.len())
            }
            Transport::Udp => {
                let local: SocketAddr = if self.addr.is_ipv4() {
                    "0.0.0.0:0".parse()?
                }
                else {
                    "[::]:0".parse()?
                };
                let socket = UdpSocket::bind(local).await?;
                let written = socket.send_to(buf, self.addr).await?;
                if written != buf.len() {
                    bail!("datagram was truncated to {} of {} bytes", written, buf.len());
                }
                Ok(written)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::blit::blit_messages::MAX_SENDMSG_LEN;

    #[test]
    fn test_default_addr() {
        let client = BlitClient::default();
        assert_eq!(client.addr(), "127.0.0.1:25195".parse().unwrap());
    }

    #[tokio::test]
    async fn test_tcp_send_writes_frame_and_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = BlitClient::tcp(listener.local_addr().unwrap());

        let sent = tokio::spawn(async move {
            client.send_message(2, Bytes::from_static(b"abc")).await
        });

        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();

        assert_eq!(received, b"BLT\x05\x00\x02\x00\x00\x00\x03abc".to_vec());
        assert_eq!(sent.await.unwrap().unwrap(), 13);
    }

    #[tokio::test]
    async fn test_oversized_message_is_not_sent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = BlitClient::tcp(listener.local_addr().unwrap());

        let data = Bytes::from(vec![b'x'; MAX_SENDMSG_LEN as usize + 1]);
        assert!(client.send_message(0, data).await.is_err());
        assert!(tokio::time::timeout(std::time::Duration::from_millis(100), listener.accept()).await.is_err());
    }

    #[tokio::test]
    async fn test_udp_send_is_one_datagram() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = BlitClient::new(socket.local_addr().unwrap(), Transport::Udp);

        client.send(&BlitCommand::ListPeers).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"BLT\x06");
    }
}
