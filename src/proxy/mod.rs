pub mod group;
pub mod outbound;

use std::fmt;
use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;

use crate::common::{Address, BoxUdpTransport, OutboundError, ProxyStream};
use self::group::OutboundGroup;

/// 网络类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub const ALL: [Network; 2] = [Network::Tcp, Network::Udp];

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 连接会话元数据
#[derive(Debug, Clone)]
pub struct Session {
    pub target: Address,
    pub source: Option<SocketAddr>,
    pub inbound_tag: String,
    pub network: Network,
    /// 连接由外部连接管理器转交给分组（而非分组内部拨号），
    /// 分组切换时只有配置了 interrupt_exist_connections 才会被中断
    pub external: bool,
}

impl Session {
    pub fn new(target: Address, network: Network) -> Self {
        Self {
            target,
            source: None,
            inbound_tag: String::new(),
            network,
            external: false,
        }
    }

    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }
}

/// Lifecycle stages, replayed in this order by the outbound manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StartStage {
    Initialize,
    Start,
    PostStart,
    Started,
}

impl StartStage {
    pub const ALL: [StartStage; 4] = [
        StartStage::Initialize,
        StartStage::Start,
        StartStage::PostStart,
        StartStage::Started,
    ];

    pub fn action(self) -> &'static str {
        match self {
            StartStage::Initialize => "initialize",
            StartStage::Start => "start",
            StartStage::PostStart => "post-start",
            StartStage::Started => "finish start",
        }
    }
}

impl fmt::Display for StartStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action())
    }
}

/// 出站处理器 trait
///
/// Plain outbounds implement `connect`/`connect_udp`; groups additionally
/// expose themselves through `as_group`. Lifecycle hooks default to no-ops
/// so outbounds without start/close work can ignore them.
#[async_trait]
pub trait OutboundHandler: Send + Sync + 'static {
    fn outbound_type(&self) -> &str;

    fn tag(&self) -> &str;

    fn network(&self) -> Vec<Network> {
        Network::ALL.to_vec()
    }

    /// 启动前必须就绪的其他出站
    fn dependencies(&self) -> &[String] {
        &[]
    }

    async fn connect(&self, session: &Session) -> Result<ProxyStream>;

    async fn connect_udp(&self, _session: &Session) -> Result<BoxUdpTransport> {
        Err(OutboundError::Unsupported(format!("UDP by outbound '{}'", self.tag())).into())
    }

    async fn start(&self, _stage: StartStage) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn as_group(&self) -> Option<&dyn OutboundGroup> {
        None
    }

    /// 用于 downcasting 到具体类型
    fn as_any(&self) -> &dyn std::any::Any;
}
