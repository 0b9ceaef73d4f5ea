//! 自动选择类代理组（urltest / urltest-pro / fallback）的共用核心
//!
//! 每个组在 Start 阶段解析成员后构造一个 `AutoGroup`。核心按网络类型各缓存
//! 一个选择，每轮探测结束后重新评估，选择变化时中断经由本组建立的连接。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::app::outbound_manager::OutboundManager;
use crate::common::{BoxUdpTransport, InterruptGroup, OutboundError, ProxyStream};
use crate::config::types::ProbeSettings;
use crate::proxy::{Network, OutboundHandler, Session};

use super::health::UrlProber;
use super::history::{HistoryStorage, UrlTestHistory};
use super::scheduler::{IdleScheduler, ProbeRound};
use super::{real_tag, supports, PROBE_CONCURRENCY, PROBE_TIMEOUT};

/// 成员选择策略
#[derive(Debug, Clone)]
pub enum SelectPolicy {
    /// 最低延迟；当前成员只有被超过 tolerance 才会被替换
    LowestDelay { tolerance: u16 },
    /// 最低 delay / weight；weight 缺省为 1
    WeightedScore {
        tolerance: u16,
        weights: HashMap<String, f64>,
    },
    /// 配置顺序中第一个有探测历史的成员
    FirstAvailable,
}

impl SelectPolicy {
    fn weight(&self, tag: &str) -> f64 {
        match self {
            SelectPolicy::WeightedScore { weights, .. } => weights.get(tag).copied().unwrap_or(1.0),
            _ => 1.0,
        }
    }
}

pub struct AutoGroup {
    tag: String,
    manager: Weak<OutboundManager>,
    outbounds: Vec<Arc<dyn OutboundHandler>>,
    link: String,
    policy: SelectPolicy,
    history: Arc<HistoryStorage>,
    prober: Arc<dyn UrlProber>,
    scheduler: IdleScheduler,
    checking: AtomicBool,
    selected_tcp: RwLock<Option<Arc<dyn OutboundHandler>>>,
    selected_udp: RwLock<Option<Arc<dyn OutboundHandler>>>,
    interrupt: InterruptGroup,
    interrupt_external: bool,
    this: Weak<AutoGroup>,
}

impl AutoGroup {
    pub fn new(
        tag: &str,
        manager: Weak<OutboundManager>,
        outbounds: Vec<Arc<dyn OutboundHandler>>,
        settings: &ProbeSettings,
        policy: SelectPolicy,
        history: Arc<HistoryStorage>,
        prober: Arc<dyn UrlProber>,
        interrupt_external: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            tag: tag.to_string(),
            manager,
            outbounds,
            link: settings.url.clone(),
            policy,
            history,
            prober,
            scheduler: IdleScheduler::new(tag, settings.interval, settings.idle_timeout),
            checking: AtomicBool::new(false),
            selected_tcp: RwLock::new(None),
            selected_udp: RwLock::new(None),
            interrupt: InterruptGroup::new(),
            interrupt_external,
            this: this.clone(),
        })
    }

    pub fn outbounds(&self) -> &[Arc<dyn OutboundHandler>] {
        &self.outbounds
    }

    pub fn interval(&self) -> Duration {
        self.scheduler.interval()
    }

    pub fn interrupt_group(&self) -> &InterruptGroup {
        &self.interrupt
    }

    pub fn post_start(&self) {
        self.scheduler.post_start(self.this.clone());
    }

    pub fn touch(&self) {
        self.scheduler.touch(self.this.clone());
    }

    pub fn close(&self) {
        self.scheduler.close();
    }

    fn slot(&self, network: Network) -> &RwLock<Option<Arc<dyn OutboundHandler>>> {
        match network {
            Network::Tcp => &self.selected_tcp,
            Network::Udp => &self.selected_udp,
        }
    }

    /// 当前缓存的选择
    pub fn selected(&self, network: Network) -> Option<Arc<dyn OutboundHandler>> {
        self.slot(network).read().clone()
    }

    /// TCP 选择优先，其次 UDP，都没有时为空串
    pub fn now(&self) -> String {
        self.selected(Network::Tcp)
            .or_else(|| self.selected(Network::Udp))
            .map(|o| o.tag().to_string())
            .unwrap_or_default()
    }

    /// 按策略挑选成员；第二个值表示挑选是否基于探测结果
    pub fn select(&self, network: Network) -> (Option<Arc<dyn OutboundHandler>>, bool) {
        let capable = || {
            self.outbounds
                .iter()
                .filter(move |o| supports(o.as_ref(), network))
        };

        if let SelectPolicy::FirstAvailable = self.policy {
            if let Some(found) = capable().find(|o| {
                self.history
                    .load_url_test_history(&real_tag(o.as_ref()))
                    .is_some()
            }) {
                return (Some(found.clone()), true);
            }
            return (capable().next().cloned(), false);
        }

        let tolerance = match &self.policy {
            SelectPolicy::LowestDelay { tolerance } | SelectPolicy::WeightedScore { tolerance, .. } => {
                f64::from(*tolerance)
            }
            SelectPolicy::FirstAvailable => 0.0,
        };
        let score = |outbound: &dyn OutboundHandler| -> Option<f64> {
            let weight = self.policy.weight(outbound.tag());
            if weight <= 0.0 {
                return None;
            }
            self.history
                .load_url_test_history(&real_tag(outbound))
                .map(|h| f64::from(h.delay) / weight)
        };

        let incumbent = self
            .selected(network)
            .and_then(|current| score(current.as_ref()).map(|s| (current, s)));
        let mut challenger: Option<(Arc<dyn OutboundHandler>, f64)> = None;
        for outbound in capable() {
            if let Some(s) = score(outbound.as_ref()) {
                if challenger.as_ref().map_or(true, |(_, best)| s < *best) {
                    challenger = Some((outbound.clone(), s));
                }
            }
        }

        // 当前成员作为基线，挑战者必须好过它 tolerance 以上才替换
        let chosen = match (incumbent, challenger) {
            (Some((current, base)), Some((next, s))) => {
                if base - s > tolerance {
                    next
                } else {
                    current
                }
            }
            (Some((current, _)), None) => current,
            (None, Some((next, _))) => next,
            (None, None) => return (capable().next().cloned(), false),
        };
        (Some(chosen), true)
    }

    /// 重新评估缓存的选择；有成员切换时中断现有连接
    pub fn perform_update_check(&self) {
        let mut updated = false;
        for network in Network::ALL {
            let (candidate, confirmed) = self.select(network);
            let Some(candidate) = candidate else {
                continue;
            };
            let mut current = self.slot(network).write();
            let change = match current.as_ref() {
                None => true,
                Some(existing) => confirmed && existing.tag() != candidate.tag(),
            };
            if !change {
                continue;
            }
            if let Some(previous) = current.as_ref() {
                updated = true;
                info!(
                    group = %self.tag,
                    %network,
                    from = previous.tag(),
                    to = candidate.tag(),
                    "group selection changed"
                );
            }
            *current = Some(candidate);
        }
        if updated {
            self.interrupt.interrupt(self.interrupt_external);
        }
    }

    /// 执行一轮探测并重新评估选择，返回 成员 tag -> 延迟
    ///
    /// 已有一轮在进行时立即返回空结果。`force` 为 false 时跳过一个周期内测过的出站。
    pub async fn url_test(&self, force: bool) -> HashMap<String, u16> {
        if self.checking.swap(true, Ordering::AcqRel) {
            return HashMap::new();
        }
        let _guard = CheckingGuard(&self.checking);

        let Some(manager) = self.manager.upgrade() else {
            return HashMap::new();
        };

        let mut seen = HashSet::new();
        let mut jobs = Vec::new();
        for detour in &self.outbounds {
            let real = real_tag(detour.as_ref());
            if !seen.insert(real.clone()) {
                continue;
            }
            if !force {
                if let Some(history) = self.history.load_url_test_history(&real) {
                    if history.time.elapsed() < self.scheduler.interval() {
                        continue;
                    }
                }
            }
            let Some(target) = manager.outbound(&real) else {
                continue;
            };
            jobs.push(self.probe(detour.tag().to_string(), real, target));
        }
        drop(manager);

        let round = stream::iter(jobs)
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect::<Vec<_>>();
        let results = tokio::select! {
            results = round => results,
            _ = self.scheduler.closed() => return HashMap::new(),
        };
        self.perform_update_check();

        results
            .into_iter()
            .filter_map(|(tag, delay)| delay.map(|d| (tag, d)))
            .collect()
    }

    async fn probe(
        &self,
        tag: String,
        real: String,
        target: Arc<dyn OutboundHandler>,
    ) -> (String, Option<u16>) {
        let result = tokio::time::timeout(
            PROBE_TIMEOUT,
            self.prober.url_test(target.as_ref(), &self.link),
        )
        .await
        .unwrap_or_else(|_| Err(anyhow::anyhow!("timeout after {:?}", PROBE_TIMEOUT)));
        match result {
            Ok(delay) => {
                debug!(group = %self.tag, outbound = %real, delay_ms = delay, "url test succeeded");
                self.history
                    .store_url_test_history(&real, UrlTestHistory::new(delay));
                (tag, Some(delay))
            }
            Err(e) => {
                debug!(group = %self.tag, outbound = %real, error = %e, "url test failed");
                self.history.delete_url_test_history(&real);
                (tag, None)
            }
        }
    }

    pub async fn check_outbounds(&self, force: bool) {
        self.url_test(force).await;
    }

    fn pick(&self, network: Network) -> Result<Arc<dyn OutboundHandler>> {
        self.selected(network)
            .or_else(|| self.select(network).0)
            .ok_or_else(|| OutboundError::MissingSupportedOutbound.into())
    }

    fn dial_failed(&self, outbound: &dyn OutboundHandler, err: &anyhow::Error) {
        error!(group = %self.tag, outbound = outbound.tag(), error = %err, "dial through group failed");
        self.history.delete_url_test_history(&real_tag(outbound));
    }

    pub async fn connect(&self, session: &Session) -> Result<ProxyStream> {
        self.touch();
        let outbound = self.pick(Network::Tcp)?;
        match outbound.connect(session).await {
            Ok(stream) => Ok(self.interrupt.new_conn(stream, session.external)),
            Err(e) => {
                self.dial_failed(outbound.as_ref(), &e);
                Err(e)
            }
        }
    }

    pub async fn connect_udp(&self, session: &Session) -> Result<BoxUdpTransport> {
        self.touch();
        let outbound = self.pick(Network::Udp)?;
        match outbound.connect_udp(session).await {
            Ok(transport) => Ok(self.interrupt.new_packet_conn(transport, session.external)),
            Err(e) => {
                self.dial_failed(outbound.as_ref(), &e);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ProbeRound for AutoGroup {
    async fn probe_round(&self) {
        self.check_outbounds(false).await;
    }
}

struct CheckingGuard<'a>(&'a AtomicBool);

impl Drop for CheckingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
