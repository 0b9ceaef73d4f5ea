pub mod auto;
pub mod balancer;
pub mod fallback;
pub mod health;
pub mod history;
pub mod persistence;
pub mod scheduler;
pub mod selector;
pub mod urltest;
pub mod urltest_pro;

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;

use crate::app::outbound_manager::OutboundManager;
use crate::common::OutboundError;
use crate::proxy::{Network, OutboundHandler};

pub const TYPE_SELECTOR: &str = "selector";
pub const TYPE_URLTEST: &str = "urltest";
pub const TYPE_URLTEST_PRO: &str = "urltest-pro";
pub const TYPE_FALLBACK: &str = "fallback";
pub const TYPE_BALANCER: &str = "balancer";

/// 单次探测的超时
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
/// 一轮探测中同时进行的探测数上限
pub const PROBE_CONCURRENCY: usize = 10;

/// 代理组能力：查询当前实际使用的成员以及全部成员
pub trait OutboundGroup: Send + Sync {
    /// 当前选中成员的 tag，未选中时为空串
    fn now(&self) -> String;
    fn all(&self) -> Vec<String>;
}

/// 组成员如果本身也是组，返回它当前实际使用的出站 tag
pub fn real_tag(outbound: &dyn OutboundHandler) -> String {
    match outbound.as_group() {
        Some(group) => group.now(),
        None => outbound.tag().to_string(),
    }
}

pub(crate) fn supports(outbound: &dyn OutboundHandler, network: Network) -> bool {
    outbound.network().contains(&network)
}

/// Turns configured member tags into live outbounds owned by the manager.
pub(crate) fn resolve_members(
    manager: &Weak<OutboundManager>,
    tags: &[String],
) -> Result<Vec<Arc<dyn OutboundHandler>>> {
    let manager = manager
        .upgrade()
        .ok_or_else(|| anyhow::anyhow!("outbound manager is gone"))?;
    tags.iter()
        .enumerate()
        .map(|(index, tag)| {
            manager.outbound(tag).ok_or_else(|| {
                OutboundError::MemberNotFound {
                    index,
                    tag: tag.clone(),
                }
                .into()
            })
        })
        .collect()
}

pub(crate) fn check_tags(tags: &[String]) -> Result<()> {
    if tags.is_empty() {
        return Err(OutboundError::MissingTags.into());
    }
    Ok(())
}

pub(crate) fn not_started(tag: &str) -> anyhow::Error {
    anyhow::anyhow!("outbound group '{}' is not started", tag)
}
