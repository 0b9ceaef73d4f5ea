//! 中断组：跟踪代理组交出的连接，组的选择变化时统一关闭
//!
//! 返回给调用方的每个流或 UDP 传输都会被包装并登记，同时记录是否为外部连接。
//! `interrupt(include_external)` 关闭所有内部连接，需要时也关闭外部连接；
//! 中断之后新登记的连接不受影响。登记时还可以带上产生它的成员 tag，
//! 以便用 `interrupt_member` 只关闭某个失效成员的连接。

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

use super::error::OutboundError;
use super::{BoxUdpTransport, ProxyStream, UdpPacket, UdpTransport};

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: HashMap<u64, Entry>,
}

struct Entry {
    token: CancellationToken,
    external: bool,
    member: Option<String>,
}

#[derive(Clone, Default)]
pub struct InterruptGroup {
    registry: Arc<Mutex<Registry>>,
}

impl InterruptGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// 包装一个 TCP 流，使其可以被 interrupt 关闭
    pub fn new_conn(&self, stream: ProxyStream, external: bool) -> ProxyStream {
        self.wrap_conn(stream, external, None)
    }

    /// 同 new_conn，额外记录连接来自哪个成员
    pub fn new_member_conn(&self, stream: ProxyStream, external: bool, member: &str) -> ProxyStream {
        self.wrap_conn(stream, external, Some(member))
    }

    fn wrap_conn(&self, stream: ProxyStream, external: bool, member: Option<&str>) -> ProxyStream {
        let (token, registration) = self.register(external, member);
        Box::new(InterruptStream {
            inner: Some(stream),
            cancelled: Box::pin(token.cancelled_owned()),
            _registration: registration,
        })
    }

    /// 包装一个 UDP 传输
    pub fn new_packet_conn(&self, transport: BoxUdpTransport, external: bool) -> BoxUdpTransport {
        self.wrap_packet_conn(transport, external, None)
    }

    pub fn new_member_packet_conn(
        &self,
        transport: BoxUdpTransport,
        external: bool,
        member: &str,
    ) -> BoxUdpTransport {
        self.wrap_packet_conn(transport, external, Some(member))
    }

    fn wrap_packet_conn(
        &self,
        transport: BoxUdpTransport,
        external: bool,
        member: Option<&str>,
    ) -> BoxUdpTransport {
        let (token, registration) = self.register(external, member);
        Box::new(InterruptPacketConn {
            inner: transport,
            token,
            _registration: registration,
        })
    }

    /// 关闭已登记的连接，返回被关闭的数量
    pub fn interrupt(&self, include_external: bool) -> usize {
        self.close_matching(|entry| include_external || !entry.external)
    }

    /// 只关闭来自指定成员的连接
    pub fn interrupt_member(&self, member: &str, include_external: bool) -> usize {
        self.close_matching(|entry| {
            entry.member.as_deref() == Some(member) && (include_external || !entry.external)
        })
    }

    fn close_matching(&self, matches: impl Fn(&Entry) -> bool) -> usize {
        let closed: Vec<CancellationToken> = {
            let mut registry = self.registry.lock();
            let ids: Vec<u64> = registry
                .entries
                .iter()
                .filter(|(_, entry)| matches(entry))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| registry.entries.remove(&id))
                .map(|entry| entry.token)
                .collect()
        };
        for token in &closed {
            token.cancel();
        }
        if !closed.is_empty() {
            debug!(count = closed.len(), "interrupted connections");
        }
        closed.len()
    }

    /// 当前登记中的连接数
    pub fn len(&self) -> usize {
        self.registry.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn register(&self, external: bool, member: Option<&str>) -> (CancellationToken, Registration) {
        let token = CancellationToken::new();
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.insert(
            id,
            Entry {
                token: token.clone(),
                external,
                member: member.map(str::to_string),
            },
        );
        let registration = Registration {
            id,
            registry: Arc::downgrade(&self.registry),
        };
        (token, registration)
    }
}

/// Drop 时从所属 group 中注销
struct Registration {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().entries.remove(&self.id);
        }
    }
}

struct InterruptStream {
    inner: Option<ProxyStream>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    _registration: Registration,
}

impl InterruptStream {
    /// Returns the live stream, dropping (and thereby closing) it once the
    /// group has interrupted this registration.
    fn live(&mut self, cx: &mut Context<'_>) -> Option<&mut ProxyStream> {
        if self.inner.is_some() && self.cancelled.as_mut().poll(cx).is_ready() {
            self.inner = None;
        }
        self.inner.as_mut()
    }
}

fn interrupted() -> io::Error {
    OutboundError::Interrupted.into()
}

impl AsyncRead for InterruptStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.live(cx) {
            Some(inner) => Pin::new(inner).poll_read(cx, buf),
            None => Poll::Ready(Err(interrupted())),
        }
    }
}

impl AsyncWrite for InterruptStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.live(cx) {
            Some(inner) => Pin::new(inner).poll_write(cx, buf),
            None => Poll::Ready(Err(interrupted())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.live(cx) {
            Some(inner) => Pin::new(inner).poll_flush(cx),
            None => Poll::Ready(Err(interrupted())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.live(cx) {
            Some(inner) => Pin::new(inner).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

struct InterruptPacketConn {
    inner: BoxUdpTransport,
    token: CancellationToken,
    _registration: Registration,
}

#[async_trait]
impl UdpTransport for InterruptPacketConn {
    async fn send(&self, packet: UdpPacket) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(OutboundError::Interrupted.into());
        }
        self.inner.send(packet).await
    }

    async fn recv(&self) -> Result<UdpPacket> {
        tokio::select! {
            _ = self.token.cancelled() => Err(OutboundError::Interrupted.into()),
            packet = self.inner.recv() => packet,
        }
    }
}
