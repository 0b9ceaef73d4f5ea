use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::common::{BoxUdpTransport, ProxyStream};
use crate::proxy::{OutboundHandler, Session};

use super::TYPE_BLOCK;

/// 拒绝一切连接的出站
pub struct BlockOutbound {
    tag: String,
}

impl BlockOutbound {
    pub fn new(tag: String) -> Self {
        Self { tag }
    }
}

#[async_trait]
impl OutboundHandler for BlockOutbound {
    fn outbound_type(&self) -> &str {
        TYPE_BLOCK
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn connect(&self, session: &Session) -> Result<ProxyStream> {
        debug!(target = %session.target, "block: connection rejected");
        anyhow::bail!("connection rejected by outbound '{}'", self.tag)
    }

    async fn connect_udp(&self, session: &Session) -> Result<BoxUdpTransport> {
        debug!(target = %session.target, "block: packet connection rejected");
        anyhow::bail!("connection rejected by outbound '{}'", self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Address;
    use crate::proxy::Network;

    #[tokio::test]
    async fn block_rejects_tcp_and_udp() {
        let outbound = BlockOutbound::new("block".into());
        let session = Session::new(Address::Domain("example.com".into(), 443), Network::Tcp);
        let err = outbound.connect(&session).await.err().unwrap();
        assert!(err.to_string().contains("rejected"));
        assert!(outbound.connect_udp(&session).await.is_err());
        assert_eq!(outbound.outbound_type(), "block");
    }
}
