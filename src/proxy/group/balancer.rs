//! 按可用性随机选择的负载均衡组，带目标地址亲和
//!
//! 成员探测失败会按配置重试，所有尝试都失败的成员被标记为不可用，直到后续
//! 某轮探测成功。同一目标在 `history_ttl` 内固定使用首次选中的成员，前提是
//! 该成员仍然可用。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::app::outbound_manager::OutboundManager;
use crate::app::registry::BuildContext;
use crate::common::{Address, BoxUdpTransport, InterruptGroup, OutboundError, ProxyStream};
use crate::config::types::{
    BalancerOptions, ProbeSettings, DEFAULT_HISTORY_TTL_SECS, DEFAULT_RETRY_COUNT,
    DEFAULT_RETRY_INTERVAL_MS,
};
use crate::proxy::{Network, OutboundHandler, Session, StartStage};

use super::health::UrlProber;
use super::scheduler::{IdleScheduler, ProbeRound};
use super::{
    check_tags, not_started, resolve_members, supports, OutboundGroup, PROBE_CONCURRENCY,
    PROBE_TIMEOUT, TYPE_BALANCER,
};

#[derive(Debug, Clone)]
struct Affinity {
    tag: String,
    time: Instant,
}

#[derive(Debug, Clone)]
pub struct BalancerSettings {
    pub probe: ProbeSettings,
    pub history_ttl: Duration,
    pub force_random: bool,
    pub retry_count: u32,
    pub retry_interval: Duration,
}

impl BalancerSettings {
    pub fn from_options(options: &BalancerOptions) -> Result<Self> {
        let probe = ProbeSettings::new(options.url.as_deref(), options.interval, options.idle_timeout)?;
        Ok(Self {
            probe,
            history_ttl: Duration::from_secs(match options.history_ttl {
                Some(0) | None => DEFAULT_HISTORY_TTL_SECS,
                Some(secs) => secs,
            }),
            force_random: options.force_random,
            retry_count: match options.retry_count {
                Some(0) | None => DEFAULT_RETRY_COUNT,
                Some(n) => n,
            },
            retry_interval: Duration::from_millis(match options.retry_interval {
                Some(0) | None => DEFAULT_RETRY_INTERVAL_MS,
                Some(ms) => ms,
            }),
        })
    }
}

pub struct BalancerGroup {
    tag: String,
    outbounds: Vec<Arc<dyn OutboundHandler>>,
    settings: BalancerSettings,
    prober: Arc<dyn UrlProber>,
    scheduler: IdleScheduler,
    checking: AtomicBool,
    availability: RwLock<HashMap<String, bool>>,
    affinity: RwLock<HashMap<String, Affinity>>,
    last_selected: RwLock<Option<String>>,
    interrupt: InterruptGroup,
    interrupt_external: bool,
    this: Weak<BalancerGroup>,
}

impl BalancerGroup {
    pub fn new(
        tag: &str,
        outbounds: Vec<Arc<dyn OutboundHandler>>,
        settings: BalancerSettings,
        prober: Arc<dyn UrlProber>,
        interrupt_external: bool,
    ) -> Arc<Self> {
        // 首轮探测完成前全部视为可用
        let availability = outbounds
            .iter()
            .map(|o| (o.tag().to_string(), true))
            .collect();
        Arc::new_cyclic(|this| Self {
            tag: tag.to_string(),
            scheduler: IdleScheduler::new(tag, settings.probe.interval, settings.probe.idle_timeout),
            outbounds,
            settings,
            prober,
            checking: AtomicBool::new(false),
            availability: RwLock::new(availability),
            affinity: RwLock::new(HashMap::new()),
            last_selected: RwLock::new(None),
            interrupt: InterruptGroup::new(),
            interrupt_external,
            this: this.clone(),
        })
    }

    pub fn post_start(&self) {
        self.scheduler.post_start(self.this.clone());
    }

    pub fn close(&self) {
        self.scheduler.close();
    }

    pub fn is_available(&self, tag: &str) -> bool {
        self.availability.read().get(tag).copied().unwrap_or(false)
    }

    pub fn available(&self) -> Vec<String> {
        self.outbounds
            .iter()
            .filter(|o| self.is_available(o.tag()))
            .map(|o| o.tag().to_string())
            .collect()
    }

    pub fn interrupt_group(&self) -> &InterruptGroup {
        &self.interrupt
    }

    /// 当前记录的目标亲和条目数
    pub fn affinity_len(&self) -> usize {
        self.affinity.read().len()
    }

    fn member(&self, tag: &str) -> Option<&Arc<dyn OutboundHandler>> {
        self.outbounds.iter().find(|o| o.tag() == tag)
    }

    pub fn select_outbound(
        &self,
        destination: &Address,
        network: Network,
    ) -> Result<Arc<dyn OutboundHandler>> {
        let key = destination.to_string();

        if !self.settings.force_random {
            let entry = self.affinity.read().get(&key).cloned();
            if let Some(entry) = entry {
                if entry.time.elapsed() < self.settings.history_ttl && self.is_available(&entry.tag) {
                    if let Some(outbound) = self
                        .member(&entry.tag)
                        .filter(|o| supports(o.as_ref(), network))
                    {
                        debug!(group = %self.tag, outbound = %entry.tag, destination = %key, "reuse outbound");
                        return Ok(outbound.clone());
                    }
                }
            }
        }

        let candidates: Vec<&Arc<dyn OutboundHandler>> = {
            let availability = self.availability.read();
            self.outbounds
                .iter()
                .filter(|o| availability.get(o.tag()).copied().unwrap_or(false))
                .filter(|o| supports(o.as_ref(), network))
                .collect()
        };
        let Some(chosen) = candidates.choose(&mut rand::thread_rng()).map(|o| (*o).clone()) else {
            warn!(group = %self.tag, destination = %key, "no available outbound");
            return Err(OutboundError::NoAvailableOutbound.into());
        };
        debug!(
            group = %self.tag,
            outbound = chosen.tag(),
            destination = %key,
            candidates = candidates.len(),
            "selected outbound"
        );

        self.affinity.write().insert(
            key,
            Affinity {
                tag: chosen.tag().to_string(),
                time: Instant::now(),
            },
        );
        *self.last_selected.write() = Some(chosen.tag().to_string());
        Ok(chosen)
    }

    /// 最近一次选中的成员；还没有选过时取第一个可用成员
    pub fn now(&self) -> String {
        if let Some(tag) = self.last_selected.read().clone() {
            return tag;
        }
        self.available().into_iter().next().unwrap_or_default()
    }

    /// 探测全部成员并重建可用性表，返回变为不可用的成员
    pub async fn check_availability(&self) -> Vec<String> {
        if self.checking.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        let _guard = CheckingGuard(&self.checking);

        let mut seen = HashSet::new();
        let jobs: Vec<_> = self
            .outbounds
            .iter()
            .filter(|o| seen.insert(o.tag().to_string()))
            .map(|o| self.probe_with_retry(o.clone()))
            .collect();
        let round = stream::iter(jobs)
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect::<Vec<_>>();
        let results: HashMap<String, bool> = tokio::select! {
            results = round => results.into_iter().collect(),
            _ = self.scheduler.closed() => return Vec::new(),
        };

        let lost: Vec<String> = {
            let mut availability = self.availability.write();
            let lost = results
                .iter()
                .filter(|(tag, ok)| !**ok && availability.get(*tag).copied().unwrap_or(false))
                .map(|(tag, _)| tag.clone())
                .collect();
            *availability = results;
            lost
        };

        let ttl = self.settings.history_ttl;
        self.affinity
            .write()
            .retain(|_, entry| entry.time.elapsed() < ttl && !lost.contains(&entry.tag));
        for tag in &lost {
            let closed = self.interrupt.interrupt_member(tag, self.interrupt_external);
            warn!(group = %self.tag, outbound = %tag, interrupted = closed, "outbound became unavailable");
        }
        lost
    }

    async fn probe_with_retry(&self, outbound: Arc<dyn OutboundHandler>) -> (String, bool) {
        let tag = outbound.tag().to_string();
        let attempts = self.settings.retry_count + 1;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.settings.retry_interval).await;
            }
            let result = tokio::time::timeout(
                PROBE_TIMEOUT,
                self.prober.url_test(outbound.as_ref(), &self.settings.probe.url),
            )
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("timeout after {:?}", PROBE_TIMEOUT)));
            match result {
                Ok(delay) => {
                    debug!(group = %self.tag, outbound = %tag, delay_ms = delay, attempt, "outbound available");
                    return (tag, true);
                }
                Err(e) => {
                    debug!(
                        group = %self.tag,
                        outbound = %tag,
                        attempt,
                        retry_count = self.settings.retry_count,
                        error = %e,
                        "outbound test failed"
                    );
                }
            }
        }
        (tag, false)
    }

    pub async fn connect(&self, session: &Session) -> Result<ProxyStream> {
        self.scheduler.touch(self.this.clone());
        let outbound = self.select_outbound(&session.target, Network::Tcp)?;
        let stream = outbound.connect(session).await?;
        Ok(self
            .interrupt
            .new_member_conn(stream, session.external, outbound.tag()))
    }

    pub async fn connect_udp(&self, session: &Session) -> Result<BoxUdpTransport> {
        self.scheduler.touch(self.this.clone());
        let outbound = self.select_outbound(&session.target, Network::Udp)?;
        let transport = outbound.connect_udp(session).await?;
        Ok(self
            .interrupt
            .new_member_packet_conn(transport, session.external, outbound.tag()))
    }
}

#[async_trait]
impl ProbeRound for BalancerGroup {
    async fn probe_round(&self) {
        self.check_availability().await;
    }
}

struct CheckingGuard<'a>(&'a AtomicBool);

impl Drop for CheckingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Balancer {
    tag: String,
    tags: Vec<String>,
    settings: BalancerSettings,
    interrupt_external: bool,
    manager: Weak<OutboundManager>,
    prober: Arc<dyn UrlProber>,
    group: OnceLock<Arc<BalancerGroup>>,
}

impl Balancer {
    pub fn new(ctx: &BuildContext, tag: &str, options: BalancerOptions) -> Result<Self> {
        check_tags(&options.outbounds)?;
        let settings = BalancerSettings::from_options(&options)?;
        Ok(Self {
            tag: tag.to_string(),
            tags: options.outbounds,
            settings,
            interrupt_external: options.interrupt_exist_connections,
            manager: ctx.manager(),
            prober: ctx.services().prober.clone(),
            group: OnceLock::new(),
        })
    }

    pub fn group(&self) -> Result<&Arc<BalancerGroup>> {
        self.group.get().ok_or_else(|| not_started(&self.tag))
    }

    pub fn select_outbound(
        &self,
        destination: &Address,
        network: Network,
    ) -> Result<Arc<dyn OutboundHandler>> {
        self.group()?.select_outbound(destination, network)
    }

    pub async fn check_outbounds(&self) -> Result<()> {
        self.group()?.check_availability().await;
        Ok(())
    }
}

#[async_trait]
impl OutboundHandler for Balancer {
    fn outbound_type(&self) -> &str {
        TYPE_BALANCER
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
                let group = BalancerGroup::new(
                    &self.tag,
                    outbounds,
                    self.settings.clone(),
                    self.prober.clone(),
                    self.interrupt_external,
                );
                debug!(group = %self.tag, members = self.tags.len(), "starting balancer group");
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

impl OutboundGroup for Balancer {
    fn now(&self) -> String {
        self.group.get().map(|g| g.now()).unwrap_or_default()
    }

    fn all(&self) -> Vec<String> {
        self.tags.clone()
    }
}
