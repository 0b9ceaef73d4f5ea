use std::any::Any;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use super::Address;

/// 出站返回的 TCP 流
pub type ProxyStream = Box<dyn AsyncStream>;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {
    fn as_any(&self) -> &dyn Any;
}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncStream for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 一个 UDP 数据包；addr 在发送时为目标，接收时为来源
#[derive(Debug, Clone)]
pub struct UdpPacket {
    pub addr: Address,
    pub data: Bytes,
}

/// 出站返回的 UDP 会话
#[async_trait]
pub trait UdpTransport: Send + Sync {
    async fn send(&self, packet: UdpPacket) -> Result<()>;
    async fn recv(&self) -> Result<UdpPacket>;
}

pub type BoxUdpTransport = Box<dyn UdpTransport>;
