use std::collections::HashMap;
use std::sync::{Arc, Weak};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::app::outbound_manager::OutboundManager;
use crate::app::registry::BuildContext;
use crate::common::{BoxUdpTransport, InterruptGroup, OutboundError, ProxyStream};
use crate::config::types::SelectorOptions;
use crate::proxy::{Network, OutboundHandler, Session, StartStage};

use super::persistence::CacheFile;
use super::{check_tags, not_started, resolve_members, OutboundGroup, TYPE_SELECTOR};

/// 手动选择代理组
///
/// 启动时依次尝试：缓存中记录的选择、配置的 default、第一个成员。
/// 切换选择会写回缓存并中断经由旧成员建立的连接。
pub struct Selector {
    tag: String,
    tags: Vec<String>,
    default_tag: Option<String>,
    interrupt_external: bool,
    manager: Weak<OutboundManager>,
    cache_file: Option<Arc<dyn CacheFile>>,
    outbounds: RwLock<HashMap<String, Arc<dyn OutboundHandler>>>,
    selected: RwLock<Option<Arc<dyn OutboundHandler>>>,
    interrupt: InterruptGroup,
}

impl Selector {
    pub fn new(ctx: &BuildContext, tag: &str, options: SelectorOptions) -> Result<Self> {
        check_tags(&options.outbounds)?;
        Ok(Self {
            tag: tag.to_string(),
            tags: options.outbounds,
            default_tag: options.default.filter(|d| !d.is_empty()),
            interrupt_external: options.interrupt_exist_connections,
            manager: ctx.manager(),
            cache_file: ctx.services().cache_file.clone(),
            outbounds: RwLock::new(HashMap::new()),
            selected: RwLock::new(None),
            interrupt: InterruptGroup::new(),
        })
    }

    /// 切换到指定成员；不是成员时返回 false
    pub fn select_outbound(&self, tag: &str) -> bool {
        let Some(detour) = self.outbounds.read().get(tag).cloned() else {
            return false;
        };
        {
            let mut selected = self.selected.write();
            if selected.as_ref().is_some_and(|s| s.tag() == tag) {
                return true;
            }
            *selected = Some(detour);
        }
        info!(group = %self.tag, selected = tag, "selector selection changed");
        if let Some(cache_file) = &self.cache_file {
            if let Err(e) = cache_file.store_selected(&self.tag, tag) {
                error!(group = %self.tag, error = %e, "store selected outbound failed");
            }
        }
        self.interrupt.interrupt(self.interrupt_external);
        true
    }

    pub fn selected(&self) -> Option<Arc<dyn OutboundHandler>> {
        self.selected.read().clone()
    }

    pub fn interrupt_group(&self) -> &InterruptGroup {
        &self.interrupt
    }

    fn restore(&self) -> Result<()> {
        let members = resolve_members(&self.manager, &self.tags)?;
        let outbounds: HashMap<String, Arc<dyn OutboundHandler>> = members
            .iter()
            .map(|o| (o.tag().to_string(), o.clone()))
            .collect();

        let cached = self
            .cache_file
            .as_ref()
            .and_then(|c| c.load_selected(&self.tag))
            .and_then(|tag| outbounds.get(&tag).cloned());
        let initial = match (cached, &self.default_tag) {
            (Some(cached), _) => {
                debug!(group = %self.tag, selected = cached.tag(), "restored selection from cache");
                cached
            }
            (None, Some(default)) => outbounds
                .get(default)
                .cloned()
                .ok_or_else(|| OutboundError::DefaultNotFound(default.clone()))?,
            (None, None) => members[0].clone(),
        };

        *self.outbounds.write() = outbounds;
        *self.selected.write() = Some(initial);
        Ok(())
    }

    fn current(&self) -> Result<Arc<dyn OutboundHandler>> {
        self.selected().ok_or_else(|| not_started(&self.tag))
    }
}

#[async_trait]
impl OutboundHandler for Selector {
    fn outbound_type(&self) -> &str {
        TYPE_SELECTOR
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn network(&self) -> Vec<Network> {
        match self.selected() {
            Some(selected) => selected.network(),
            None => Network::ALL.to_vec(),
        }
    }

    fn dependencies(&self) -> &[String] {
        &self.tags
    }

    async fn start(&self, stage: StartStage) -> Result<()> {
        if stage == StartStage::Start {
            self.restore()?;
        }
        Ok(())
    }

    async fn connect(&self, session: &Session) -> Result<ProxyStream> {
        let stream = self.current()?.connect(session).await?;
        Ok(self.interrupt.new_conn(stream, session.external))
    }

    async fn connect_udp(&self, session: &Session) -> Result<BoxUdpTransport> {
        let transport = self.current()?.connect_udp(session).await?;
        Ok(self.interrupt.new_packet_conn(transport, session.external))
    }

    fn as_group(&self) -> Option<&dyn OutboundGroup> {
        Some(self)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl OutboundGroup for Selector {
    fn now(&self) -> String {
        self.selected()
            .map(|s| s.tag().to_string())
            .unwrap_or_else(|| self.tags[0].clone())
    }

    fn all(&self) -> Vec<String> {
        self.tags.clone()
    }
}
