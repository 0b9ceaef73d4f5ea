use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use anyhow::Result;
use async_trait::async_trait;

use crate::app::outbound_manager::OutboundManager;
use crate::app::registry::BuildContext;
use crate::common::{BoxUdpTransport, ProxyStream};
use crate::config::types::{FallbackOptions, ProbeSettings};
use crate::proxy::{Network, OutboundHandler, Session, StartStage};

use super::auto::{AutoGroup, SelectPolicy};
use super::health::UrlProber;
use super::history::HistoryStorage;
use super::{check_tags, not_started, resolve_members, OutboundGroup, TYPE_FALLBACK};

/// 故障转移代理组：按配置顺序使用第一个测通过的成员
pub struct Fallback {
    tag: String,
    tags: Vec<String>,
    settings: ProbeSettings,
    interrupt_external: bool,
    manager: Weak<OutboundManager>,
    history: Arc<HistoryStorage>,
    prober: Arc<dyn UrlProber>,
    group: OnceLock<Arc<AutoGroup>>,
}

impl Fallback {
    pub fn new(ctx: &BuildContext, tag: &str, options: FallbackOptions) -> Result<Self> {
        check_tags(&options.outbounds)?;
        let settings = ProbeSettings::new(
            options.url.as_deref(),
            options.interval,
            options.idle_timeout,
        )?;
        Ok(Self {
            tag: tag.to_string(),
            tags: options.outbounds,
            settings,
            interrupt_external: options.interrupt_exist_connections,
            manager: ctx.manager(),
            history: ctx.services().history_storage(),
            prober: ctx.services().prober.clone(),
            group: OnceLock::new(),
        })
    }

    pub fn group(&self) -> Result<&Arc<AutoGroup>> {
        self.group.get().ok_or_else(|| not_started(&self.tag))
    }

    pub async fn url_test(&self) -> Result<HashMap<String, u16>> {
        Ok(self.group()?.url_test(true).await)
    }

    pub async fn check_outbounds(&self) -> Result<()> {
        self.group()?.check_outbounds(true).await;
        Ok(())
    }

    pub fn selected(&self, network: Network) -> Option<Arc<dyn OutboundHandler>> {
        self.group.get().and_then(|g| g.selected(network))
    }
}

#[async_trait]
impl OutboundHandler for Fallback {
    fn outbound_type(&self) -> &str {
        TYPE_FALLBACK
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn dependencies(&self) -> &[String] {
        &self.tags
    }

    async fn start(&self, stage: StartStage) -> Result<()> {
        match stage {
            StartStage::Start => {
                let outbounds = resolve_members(&self.manager, &self.tags)?;
                let group = AutoGroup::new(
                    &self.tag,
                    self.manager.clone(),
                    outbounds,
                    &self.settings,
                    SelectPolicy::FirstAvailable,
                    self.history.clone(),
                    self.prober.clone(),
                    self.interrupt_external,
                );
                self.group
                    .set(group)
                    .map_err(|_| anyhow::anyhow!("outbound group '{}' already started", self.tag))
            }
            StartStage::PostStart => {
                self.group()?.post_start();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<()> {
        if let Some(group) = self.group.get() {
            group.close();
        }
        Ok(())
    }

    async fn connect(&self, session: &Session) -> Result<ProxyStream> {
        self.group()?.connect(session).await
    }

    async fn connect_udp(&self, session: &Session) -> Result<BoxUdpTransport> {
        self.group()?.connect_udp(session).await
    }

    fn as_group(&self) -> Option<&dyn OutboundGroup> {
        Some(self)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl OutboundGroup for Fallback {
    fn now(&self) -> String {
        self.group.get().map(|g| g.now()).unwrap_or_default()
    }

    fn all(&self) -> Vec<String> {
        self.tags.clone()
    }
}
