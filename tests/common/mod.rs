//! 集成测试共用的 mock 出站与探测器
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::io::DuplexStream;

use openworld_outbound::app::outbound_manager::OutboundManager;
use openworld_outbound::app::registry::{OutboundRegistry, Services};
use openworld_outbound::common::{Address, ProxyStream};
use openworld_outbound::proxy::group::health::UrlProber;
use openworld_outbound::proxy::group::history::{HistoryStorage, UrlTestHistory};
use openworld_outbound::proxy::{Network, OutboundHandler, Session, StartStage};

pub type EventLog = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MockOptions {
    pub dependencies: Vec<String>,
    /// 为空表示 tcp + udp
    pub network: Vec<String>,
    pub fail_start: bool,
    pub fail_close: bool,
}

/// 记录生命周期调用的假出站；connect 返回内存管道
pub struct MockOutbound {
    tag: String,
    dependencies: Vec<String>,
    network: Vec<Network>,
    fail_start: bool,
    fail_close: bool,
    log: EventLog,
    pub fail_dial: AtomicBool,
    pub dials: AtomicUsize,
    peers: Mutex<Vec<DuplexStream>>,
}

impl MockOutbound {
    pub fn new(tag: &str, options: MockOptions, log: EventLog) -> Self {
        let network = if options.network.is_empty() {
            Network::ALL.to_vec()
        } else {
            options
                .network
                .iter()
                .map(|n| if n == "udp" { Network::Udp } else { Network::Tcp })
                .collect()
        };
        Self {
            tag: tag.to_string(),
            dependencies: options.dependencies,
            network,
            fail_start: options.fail_start,
            fail_close: options.fail_close,
            log,
            fail_dial: AtomicBool::new(false),
            dials: AtomicUsize::new(0),
            peers: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl OutboundHandler for MockOutbound {
    fn outbound_type(&self) -> &str {
        "mock"
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn network(&self) -> Vec<Network> {
        self.network.clone()
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    async fn connect(&self, _session: &Session) -> Result<ProxyStream> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.fail_dial.load(Ordering::SeqCst) {
            anyhow::bail!("mock dial failure on {}", self.tag);
        }
        let (local, peer) = tokio::io::duplex(1024);
        self.peers.lock().push(peer);
        Ok(Box::new(local))
    }

    async fn start(&self, stage: StartStage) -> Result<()> {
        self.log.lock().push(format!("{}:{}", stage.action(), self.tag));
        if self.fail_start && stage == StartStage::Start {
            anyhow::bail!("mock start failure");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.log.lock().push(format!("close:{}", self.tag));
        if self.fail_close {
            anyhow::bail!("mock close failure");
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// 按出站 tag 返回脚本化的延迟；未设置的出站探测失败
#[derive(Default)]
pub struct MockProber {
    delays: Mutex<HashMap<String, u16>>,
    /// 前 n 次探测失败，之后按 delays 返回
    failures: Mutex<HashMap<String, usize>>,
    /// link 含有其中任一子串时探测失败
    bad_links: Mutex<Vec<String>>,
    per_tag: Mutex<HashMap<String, usize>>,
    latency: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    pub peak: AtomicUsize,
    pub calls: AtomicUsize,
}

impl MockProber {
    pub fn set(&self, tag: &str, delay: u16) {
        self.delays.lock().insert(tag.to_string(), delay);
    }

    pub fn fail(&self, tag: &str) {
        self.delays.lock().remove(tag);
    }

    pub fn fail_times(&self, tag: &str, times: usize) {
        self.failures.lock().insert(tag.to_string(), times);
    }

    pub fn fail_link(&self, pattern: &str) {
        self.bad_links.lock().push(pattern.to_string());
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn calls_for(&self, tag: &str) -> usize {
        self.per_tag.lock().get(tag).copied().unwrap_or(0)
    }

    fn outcome(&self, tag: &str, link: &str) -> Result<u16> {
        if self.bad_links.lock().iter().any(|p| link.contains(p.as_str())) {
            anyhow::bail!("mock probe failure on {} via {}", tag, link);
        }
        if let Some(left) = self.failures.lock().get_mut(tag).filter(|n| **n > 0) {
            *left -= 1;
            anyhow::bail!("mock transient failure on {}", tag);
        }
        let delay = self.delays.lock().get(tag).copied();
        delay.ok_or_else(|| anyhow::anyhow!("mock probe failure on {}", tag))
    }
}

#[async_trait]
impl UrlProber for MockProber {
    async fn url_test(&self, outbound: &dyn OutboundHandler, link: &str) -> Result<u16> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.per_tag.lock().entry(outbound.tag().to_string()).or_default() += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.outcome(outbound.tag(), link)
    }
}

pub struct Harness {
    pub manager: Arc<OutboundManager>,
    pub prober: Arc<MockProber>,
    pub history: Arc<HistoryStorage>,
    pub log: EventLog,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_services(|s| s)
    }

    pub fn with_services(customize: impl FnOnce(Services) -> Services) -> Self {
        Self::build(None, customize)
    }

    pub fn with_default(default_tag: &str) -> Self {
        Self::build(Some(default_tag.to_string()), |s| s)
    }

    fn build(default_tag: Option<String>, customize: impl FnOnce(Services) -> Services) -> Self {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let prober = Arc::new(MockProber::default());
        let history = Arc::new(HistoryStorage::new());

        let mut registry = OutboundRegistry::with_defaults();
        let mock_log = log.clone();
        registry.register::<MockOptions, _>("mock", move |_, tag, options| {
            Ok(Arc::new(MockOutbound::new(tag, options, mock_log.clone())))
        });

        let services = customize(
            Services::default()
                .with_history(history.clone())
                .with_prober(prober.clone()),
        );
        let manager = OutboundManager::new(Arc::new(registry), services, default_tag);
        Self {
            manager,
            prober,
            history,
            log,
        }
    }

    pub async fn mock(&self, tag: &str) {
        self.manager.create(tag, "mock", json!({})).await.unwrap();
    }

    pub async fn mock_with(&self, tag: &str, options: serde_json::Value) {
        self.manager.create(tag, "mock", options).await.unwrap();
    }

    /// Initialize + Start；不进入 PostStart，避免后台探测与测试竞争
    pub async fn start(&self) -> Result<()> {
        self.manager.start(StartStage::Initialize).await?;
        self.manager.start(StartStage::Start).await
    }

    pub fn seed(&self, tag: &str, delay: u16) {
        self.history
            .store_url_test_history(tag, UrlTestHistory::new(delay));
    }

    pub fn events(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn mock_outbound(&self, tag: &str) -> Arc<dyn OutboundHandler> {
        self.manager.outbound(tag).unwrap()
    }
}

pub fn dial_count(outbound: &Arc<dyn OutboundHandler>) -> usize {
    outbound
        .as_any()
        .downcast_ref::<MockOutbound>()
        .map(|m| m.dials.load(Ordering::SeqCst))
        .unwrap_or(0)
}

pub fn set_fail_dial(outbound: &Arc<dyn OutboundHandler>, fail: bool) {
    if let Some(mock) = outbound.as_any().downcast_ref::<MockOutbound>() {
        mock.fail_dial.store(fail, Ordering::SeqCst);
    }
}

pub fn session(target: &str) -> Session {
    Session::new(target.parse::<Address>().unwrap(), Network::Tcp)
}
