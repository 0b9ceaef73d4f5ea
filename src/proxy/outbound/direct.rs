use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::common::{Address, BoxUdpTransport, ProxyStream, UdpPacket, UdpTransport};
use crate::config::types::DirectOptions;
use crate::proxy::{OutboundHandler, Session};

use super::TYPE_DIRECT;

pub struct DirectOutbound {
    tag: String,
    connect_timeout: Duration,
}

impl DirectOutbound {
    pub fn new(tag: String, options: DirectOptions) -> Self {
        Self {
            tag,
            connect_timeout: options.connect_timeout(),
        }
    }
}

#[async_trait]
impl OutboundHandler for DirectOutbound {
    fn outbound_type(&self) -> &str {
        TYPE_DIRECT
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn connect(&self, session: &Session) -> Result<ProxyStream> {
        let addr = session.target.resolve().await?;
        debug!(target = %session.target, resolved = %addr, "direct connect");
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                anyhow::anyhow!("connect timeout after {:?} to {}", self.connect_timeout, addr)
            })??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn connect_udp(&self, session: &Session) -> Result<BoxUdpTransport> {
        let bind = match session.target.resolve().await {
            Ok(addr) if addr.is_ipv6() => "[::]:0",
            _ => "0.0.0.0:0",
        };
        let socket = UdpSocket::bind(bind).await?;
        debug!(local = %socket.local_addr()?, "direct UDP socket bound");
        Ok(Box::new(DirectUdpTransport {
            socket: Arc::new(socket),
        }))
    }
}

struct DirectUdpTransport {
    socket: Arc<UdpSocket>,
}

#[async_trait]
impl UdpTransport for DirectUdpTransport {
    async fn send(&self, packet: UdpPacket) -> Result<()> {
        let addr = packet.addr.resolve().await?;
        self.socket.send_to(&packet.data, addr).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<UdpPacket> {
        let mut buf = vec![0u8; 65535];
        let (n, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok(UdpPacket {
            addr: Address::Ip(from),
            data: Bytes::from(buf),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Network;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn direct_tcp_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let outbound = DirectOutbound::new("direct".into(), DirectOptions::default());
        let session = Session::new(Address::Ip(addr), Network::Tcp);
        let mut stream = outbound.connect(&session).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn direct_udp_roundtrip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&buf[..n], from).await.unwrap();
        });

        let outbound = DirectOutbound::new("direct".into(), DirectOptions::default());
        let session = Session::new(Address::Ip(addr), Network::Udp);
        let transport = outbound.connect_udp(&session).await.unwrap();
        transport
            .send(UdpPacket {
                addr: Address::Ip(addr),
                data: Bytes::from_static(b"dns?"),
            })
            .await
            .unwrap();
        let reply = transport.recv().await.unwrap();
        assert_eq!(&reply.data[..], b"dns?");
        assert_eq!(reply.addr, Address::Ip(addr));
    }
}
