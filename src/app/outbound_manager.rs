//! 出站管理器：按 tag 持有全部出站，按依赖顺序执行生命周期阶段，
//! 运行期间支持新建和移除。

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::common::OutboundError;
use crate::proxy::{OutboundHandler, StartStage};

use super::registry::{BuildContext, OutboundRegistry, Services};

/// 单个出站启动超过该时长时告警
pub const START_TIMEOUT: Duration = Duration::from_secs(10);
/// 单个出站关闭超过该时长时告警
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct State {
    started: bool,
    stage: Option<StartStage>,
    outbounds: Vec<Arc<dyn OutboundHandler>>,
    endpoints: Vec<Arc<dyn OutboundHandler>>,
    by_tag: HashMap<String, Arc<dyn OutboundHandler>>,
    /// dependency tag -> 依赖它的出站 tag
    depend_by: HashMap<String, Vec<String>>,
    default: Option<Arc<dyn OutboundHandler>>,
    default_fallback: Option<Arc<dyn OutboundHandler>>,
}

impl State {
    fn index_dependencies(&mut self, outbound: &dyn OutboundHandler) {
        for dependency in outbound.dependencies() {
            self.depend_by
                .entry(dependency.clone())
                .or_default()
                .push(outbound.tag().to_string());
        }
    }

    fn unindex_dependencies(&mut self, outbound: &dyn OutboundHandler) {
        for dependency in outbound.dependencies() {
            if let Some(dependents) = self.depend_by.get_mut(dependency) {
                dependents.retain(|t| t != outbound.tag());
                if dependents.is_empty() {
                    self.depend_by.remove(dependency);
                }
            }
        }
    }

    /// 启动顺序：出站在前，端点在后
    fn lifecycle_list(&self) -> Vec<Arc<dyn OutboundHandler>> {
        self.outbounds
            .iter()
            .chain(self.endpoints.iter())
            .cloned()
            .collect()
    }
}

pub struct OutboundManager {
    registry: Arc<OutboundRegistry>,
    services: Services,
    default_tag: Option<String>,
    /// 串行化 create / remove / start / close
    lifecycle: tokio::sync::Mutex<()>,
    state: RwLock<State>,
    this: Weak<OutboundManager>,
}

impl OutboundManager {
    pub fn new(
        registry: Arc<OutboundRegistry>,
        services: Services,
        default_tag: Option<String>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            registry,
            services,
            default_tag: default_tag.filter(|t| !t.is_empty()),
            lifecycle: tokio::sync::Mutex::new(()),
            state: RwLock::new(State::default()),
            this: this.clone(),
        })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn build_context(&self) -> BuildContext {
        BuildContext::new(self.services.clone(), self.this.clone())
    }

    /// 没有任何出站时使用的默认出站
    pub fn initialize(&self, fallback: Arc<dyn OutboundHandler>) {
        self.state.write().default_fallback = Some(fallback);
    }

    /// 端点与出站共享 tag 命名空间，随出站一起启动和关闭
    pub fn register_endpoint(&self, endpoint: Arc<dyn OutboundHandler>) -> Result<()> {
        let mut state = self.state.write();
        if state.by_tag.contains_key(endpoint.tag()) {
            anyhow::bail!(OutboundError::InvalidOption(format!(
                "duplicate outbound/endpoint tag: {}",
                endpoint.tag()
            )));
        }
        state.index_dependencies(endpoint.as_ref());
        state
            .by_tag
            .insert(endpoint.tag().to_string(), endpoint.clone());
        state.endpoints.push(endpoint);
        Ok(())
    }

    pub fn outbound(&self, tag: &str) -> Option<Arc<dyn OutboundHandler>> {
        self.state.read().by_tag.get(tag).cloned()
    }

    pub fn outbounds(&self) -> Vec<Arc<dyn OutboundHandler>> {
        self.state.read().outbounds.clone()
    }

    pub fn endpoints(&self) -> Vec<Arc<dyn OutboundHandler>> {
        self.state.read().endpoints.clone()
    }

    pub fn default_outbound(&self) -> Option<Arc<dyn OutboundHandler>> {
        let state = self.state.read();
        state
            .default
            .clone()
            .or_else(|| state.default_fallback.clone())
    }

    /// 依赖 `tag` 的出站
    pub fn dependents(&self, tag: &str) -> Vec<String> {
        self.state
            .read()
            .depend_by
            .get(tag)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stage(&self) -> Option<StartStage> {
        self.state.read().stage
    }

    /// 构造并登记一个出站；管理器已启动时先补跑已经过的阶段
    ///
    /// 同名出站会被替换，旧实例在管理器运行时被关闭。
    pub async fn create(
        &self,
        tag: &str,
        outbound_type: &str,
        options: serde_json::Value,
    ) -> Result<()> {
        if tag.is_empty() {
            return Err(OutboundError::EmptyTag.into());
        }
        let outbound = self
            .registry
            .create_outbound(&self.build_context(), tag, outbound_type, options)
            .with_context(|| format!("create outbound/{}[{}]", outbound_type, tag))?;

        let _lifecycle = self.lifecycle.lock().await;
        let (started, reached) = {
            let state = self.state.read();
            if state.endpoints.iter().any(|e| e.tag() == tag) {
                anyhow::bail!(OutboundError::InvalidOption(format!(
                    "duplicate outbound/endpoint tag: {}",
                    tag
                )));
            }
            (state.started, state.stage)
        };
        if started {
            for stage in StartStage::ALL.into_iter().filter(|s| Some(*s) <= reached) {
                run_stage(outbound.as_ref(), stage).await?;
            }
        }

        let replaced = {
            let mut state = self.state.write();
            let replaced = state.by_tag.remove(tag);
            if let Some(old) = &replaced {
                state.unindex_dependencies(old.as_ref());
                state.outbounds.retain(|o| o.tag() != tag);
            }
            state.index_dependencies(outbound.as_ref());
            state.by_tag.insert(tag.to_string(), outbound.clone());
            state.outbounds.push(outbound.clone());

            let is_default = match &self.default_tag {
                Some(default_tag) => default_tag == tag,
                None => state.default.as_ref().map_or(true, |d| d.tag() == tag),
            };
            if is_default {
                if state.started && state.default.is_some() {
                    info!(tag, "updated default outbound");
                }
                state.default = Some(outbound.clone());
            }
            replaced
        };

        info!(tag, outbound_type, "outbound created");
        // 新实例已经生效，旧实例关闭失败只记录
        if let (Some(old), true) = (replaced, started) {
            if let Err(e) = monitor(STOP_TIMEOUT, describe("close", old.as_ref()), old.close()).await {
                warn!(tag, error = %e, "close replaced outbound failed");
            }
        }
        Ok(())
    }

    /// 移除出站；仍被其他出站依赖时失败且不改变任何状态
    pub async fn remove(&self, tag: &str) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let (outbound, started) = {
            let mut state = self.state.write();
            let Some(index) = state.outbounds.iter().position(|o| o.tag() == tag) else {
                return Err(OutboundError::NotFound(tag.to_string()).into());
            };
            if let Some(dependents) = state.depend_by.get(tag).filter(|d| !d.is_empty()) {
                return Err(OutboundError::DependedBy {
                    tag: tag.to_string(),
                    dependents: dependents.clone(),
                }
                .into());
            }
            let outbound = state.outbounds.remove(index);
            state.by_tag.remove(tag);
            state.unindex_dependencies(outbound.as_ref());
            if state.default.as_ref().is_some_and(|d| d.tag() == tag) {
                state.default = state.outbounds.first().cloned();
                match &state.default {
                    Some(next) => info!(removed = tag, default = next.tag(), "default outbound changed"),
                    None => info!(removed = tag, "default outbound removed"),
                }
            }
            (outbound, state.started)
        };

        info!(tag, "outbound removed");
        if started {
            monitor(STOP_TIMEOUT, describe("close", outbound.as_ref()), outbound.close())
                .await
                .with_context(|| describe("close", outbound.as_ref()))?;
        }
        Ok(())
    }

    /// 推进到 `stage`
    ///
    /// 第一次调用时解析默认出站；Start 阶段按依赖顺序执行，其余阶段按登记顺序。
    pub async fn start(&self, stage: StartStage) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let list = {
            let mut state = self.state.write();
            if let Some(current) = state.stage {
                if stage <= current {
                    return Err(OutboundError::AlreadyStarted(current.to_string()).into());
                }
            }
            if !state.started {
                self.resolve_default(&mut state)?;
                state.started = true;
            }
            state.stage = Some(stage);
            state.lifecycle_list()
        };

        debug!(%stage, outbounds = list.len(), "starting outbounds");
        if stage == StartStage::Start {
            start_ordered(&list).await
        } else {
            for outbound in &list {
                run_stage(outbound.as_ref(), stage).await?;
            }
            Ok(())
        }
    }

    fn resolve_default(&self, state: &mut State) -> Result<()> {
        let resolved = match &self.default_tag {
            Some(tag) => Some(
                state
                    .outbounds
                    .iter()
                    .chain(state.endpoints.iter())
                    .find(|o| o.tag() == tag)
                    .cloned()
                    .ok_or_else(|| OutboundError::DefaultNotFound(tag.clone()))?,
            ),
            None => state
                .default
                .clone()
                .or_else(|| state.outbounds.first().cloned())
                .or_else(|| state.default_fallback.clone()),
        };
        if let Some(default) = &resolved {
            info!(tag = default.tag(), "default outbound resolved");
        }
        state.default = resolved;
        Ok(())
    }

    /// 关闭全部出站；单个失败不会阻止其余出站关闭
    pub async fn close(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let list = {
            let mut state = self.state.write();
            if !state.started {
                return Ok(());
            }
            state.started = false;
            state.stage = None;
            let list = state.lifecycle_list();
            state.outbounds.clear();
            state.endpoints.clear();
            state.by_tag.clear();
            state.depend_by.clear();
            state.default = None;
            list
        };

        let mut errors = Vec::new();
        for outbound in &list {
            let action = describe("close", outbound.as_ref());
            if let Err(e) = monitor(STOP_TIMEOUT, action.clone(), outbound.close()).await {
                warn!(error = %e, "{} failed", action);
                errors.push(format!("{}: {:#}", action, e));
            }
        }
        if errors.is_empty() {
            info!(outbounds = list.len(), "outbounds closed");
            Ok(())
        } else {
            Err(anyhow::anyhow!("{}", errors.join("; ")))
        }
    }
}

fn describe(action: &str, outbound: &dyn OutboundHandler) -> String {
    format!("{} outbound/{}[{}]", action, outbound.outbound_type(), outbound.tag())
}

async fn run_stage(outbound: &dyn OutboundHandler, stage: StartStage) -> Result<()> {
    let action = describe(stage.action(), outbound);
    monitor(START_TIMEOUT, action.clone(), outbound.start(stage))
        .await
        .context(action)
}

/// 反复扫描直到全部启动：依赖都已启动的出站才会被启动
///
/// 一轮没有任何进展时说明存在环或缺失的依赖。
async fn start_ordered(list: &[Arc<dyn OutboundHandler>]) -> Result<()> {
    let mut started: HashSet<String> = HashSet::new();
    loop {
        let mut progressed = false;
        for outbound in list {
            if started.contains(outbound.tag()) {
                continue;
            }
            if !outbound
                .dependencies()
                .iter()
                .all(|d| started.contains(d.as_str()))
            {
                continue;
            }
            started.insert(outbound.tag().to_string());
            progressed = true;
            run_stage(outbound.as_ref(), StartStage::Start).await?;
        }
        if started.len() >= list.len() {
            return Ok(());
        }
        if !progressed {
            return Err(trace_unresolved(list, &started).into());
        }
    }
}

/// 从第一个未启动的出站出发沿未启动的依赖走，直到回到路径上或走到不存在的出站
fn trace_unresolved(list: &[Arc<dyn OutboundHandler>], started: &HashSet<String>) -> OutboundError {
    let by_tag: HashMap<&str, &Arc<dyn OutboundHandler>> =
        list.iter().map(|o| (o.tag(), o)).collect();
    let Some(mut current) = list.iter().find(|o| !started.contains(o.tag())) else {
        return OutboundError::CircularDependency { path: Vec::new() };
    };
    let mut path = vec![current.tag().to_string()];
    loop {
        let Some(next) = current
            .dependencies()
            .iter()
            .find(|d| !started.contains(d.as_str()))
        else {
            return OutboundError::CircularDependency { path };
        };
        if path.contains(next) {
            path.push(next.clone());
            return OutboundError::CircularDependency { path };
        }
        match by_tag.get(next.as_str()) {
            Some(outbound) => {
                path.push(next.clone());
                current = *outbound;
            }
            None => {
                return OutboundError::MissingDependency {
                    dependency: next.clone(),
                    outbound: current.tag().to_string(),
                }
            }
        }
    }
}

/// 任务超过 `timeout` 仍未完成时告警，但继续等待
pub async fn monitor<F: Future>(timeout: Duration, task: String, fut: F) -> F::Output {
    tokio::pin!(fut);
    tokio::select! {
        output = &mut fut => return output,
        _ = tokio::time::sleep(timeout) => {
            warn!(task = %task, timeout = ?timeout, "task is taking longer than expected");
        }
    }
    fut.await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ProxyStream;
    use crate::proxy::Session;
    use async_trait::async_trait;

    struct Node {
        tag: String,
        deps: Vec<String>,
    }

    #[async_trait]
    impl OutboundHandler for Node {
        fn outbound_type(&self) -> &str {
            "node"
        }
        fn tag(&self) -> &str {
            &self.tag
        }
        fn dependencies(&self) -> &[String] {
            &self.deps
        }
        async fn connect(&self, _session: &Session) -> Result<ProxyStream> {
            anyhow::bail!("not dialable")
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn node(tag: &str, deps: &[&str]) -> Arc<dyn OutboundHandler> {
        Arc::new(Node {
            tag: tag.to_string(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
        })
    }

    #[test]
    fn trace_names_cycle() {
        let list = vec![node("a", &["b"]), node("b", &["a"])];
        let err = trace_unresolved(&list, &HashSet::new());
        assert_eq!(
            err,
            OutboundError::CircularDependency {
                path: vec!["a".into(), "b".into(), "a".into()]
            }
        );
    }

    #[test]
    fn trace_skips_started_dependencies() {
        let list = vec![node("ok", &[]), node("x", &["ok", "y"]), node("y", &["x"])];
        let started: HashSet<String> = ["ok".to_string()].into_iter().collect();
        let err = trace_unresolved(&list, &started);
        assert_eq!(err.to_string(), "circular outbound dependency: x -> y -> x");
    }

    #[test]
    fn trace_reports_missing() {
        let list = vec![node("a", &["b"]), node("b", &["ghost"])];
        let err = trace_unresolved(&list, &HashSet::new());
        assert_eq!(
            err.to_string(),
            "dependency[ghost] not found for outbound[b]"
        );
    }

    #[tokio::test]
    async fn ordered_start_respects_dependencies() {
        let list = vec![node("group", &["leaf"]), node("leaf", &[])];
        start_ordered(&list).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_returns_slow_output() {
        let output = monitor(Duration::from_millis(10), "slow".into(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            7
        })
        .await;
        assert_eq!(output, 7);
    }
}
