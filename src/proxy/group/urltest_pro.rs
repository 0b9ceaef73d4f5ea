use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::app::outbound_manager::OutboundManager;
use crate::app::registry::BuildContext;
use crate::common::{BoxUdpTransport, OutboundError, ProxyStream};
use crate::config::types::{ProbeSettings, UrlTestProOptions, DEFAULT_TOLERANCE_MS};
use crate::proxy::{Network, OutboundHandler, Session, StartStage};

use super::auto::{AutoGroup, SelectPolicy};
use super::health::UrlProber;
use super::history::HistoryStorage;
use super::persistence::WeightStorage;
use super::{check_tags, not_started, resolve_members, OutboundGroup, TYPE_URLTEST_PRO};

/// 带权重的自动选择：score = delay / weight，weight 为 0 的成员被排除
pub struct UrlTestPro {
    tag: String,
    tags: Vec<String>,
    settings: ProbeSettings,
    tolerance: u16,
    interrupt_external: bool,
    manager: Weak<OutboundManager>,
    history: Arc<HistoryStorage>,
    prober: Arc<dyn UrlProber>,
    weights: Option<Arc<dyn WeightStorage>>,
    group: OnceLock<Arc<AutoGroup>>,
}

impl UrlTestPro {
    pub fn new(ctx: &BuildContext, tag: &str, options: UrlTestProOptions) -> Result<Self> {
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
            tolerance: match options.tolerance {
                Some(0) | None => DEFAULT_TOLERANCE_MS,
                Some(t) => t,
            },
            interrupt_external: options.interrupt_exist_connections,
            manager: ctx.manager(),
            history: ctx.services().history_storage(),
            prober: ctx.services().prober.clone(),
            weights: ctx.services().weights.clone(),
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

    /// 当前生效的成员（已排除 weight <= 0）
    pub fn members(&self) -> Vec<String> {
        self.group
            .get()
            .map(|g| g.outbounds().iter().map(|o| o.tag().to_string()).collect())
            .unwrap_or_default()
    }

    fn build_group(&self) -> Result<()> {
        let resolved = resolve_members(&self.manager, &self.tags)?;
        let mut weights = HashMap::new();
        let mut outbounds = Vec::with_capacity(resolved.len());
        for outbound in resolved {
            let weight = self
                .weights
                .as_ref()
                .and_then(|w| w.load_weight(outbound.tag()))
                .unwrap_or(1.0);
            if weight <= 0.0 {
                info!(group = %self.tag, outbound = outbound.tag(), "member disabled by weight");
                continue;
            }
            weights.insert(outbound.tag().to_string(), weight);
            outbounds.push(outbound);
        }
        if outbounds.is_empty() {
            return Err(OutboundError::NoEnabledMembers.into());
        }

        let group = AutoGroup::new(
            &self.tag,
            self.manager.clone(),
            outbounds,
            &self.settings,
            SelectPolicy::WeightedScore {
                tolerance: self.tolerance,
                weights,
            },
            self.history.clone(),
            self.prober.clone(),
            self.interrupt_external,
        );
        self.group
            .set(group)
            .map_err(|_| anyhow::anyhow!("outbound group '{}' already started", self.tag))?;
        debug!(group = %self.tag, "urltest-pro group started");
        Ok(())
    }
}

#[async_trait]
impl OutboundHandler for UrlTestPro {
    fn outbound_type(&self) -> &str {
        TYPE_URLTEST_PRO
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn dependencies(&self) -> &[String] {
        &self.tags
    }

    async fn start(&self, stage: StartStage) -> Result<()> {
        match stage {
            StartStage::Start => self.build_group(),
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

impl OutboundGroup for UrlTestPro {
    fn now(&self) -> String {
        self.group.get().map(|g| g.now()).unwrap_or_default()
    }

    fn all(&self) -> Vec<String> {
        match self.group.get() {
            Some(_) => self.members(),
            None => self.tags.clone(),
        }
    }
}
