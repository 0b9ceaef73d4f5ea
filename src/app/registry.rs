use std::collections::HashMap;
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

use crate::common::OutboundError;
use crate::config::types::DirectOptions;
use crate::proxy::group::balancer::Balancer;
use crate::proxy::group::fallback::Fallback;
use crate::proxy::group::health::{HttpUrlProber, UrlProber};
use crate::proxy::group::history::HistoryStorage;
use crate::proxy::group::persistence::{CacheFile, WeightStorage};
use crate::proxy::group::selector::Selector;
use crate::proxy::group::urltest::UrlTest;
use crate::proxy::group::urltest_pro::UrlTestPro;
use crate::proxy::group::{
    TYPE_BALANCER, TYPE_FALLBACK, TYPE_SELECTOR, TYPE_URLTEST, TYPE_URLTEST_PRO,
};
use crate::proxy::outbound::block::BlockOutbound;
use crate::proxy::outbound::direct::DirectOutbound;
use crate::proxy::outbound::{TYPE_BLOCK, TYPE_DIRECT};
use crate::proxy::OutboundHandler;

use super::outbound_manager::OutboundManager;

/// 出站和代理组共享的运行期服务
#[derive(Clone)]
pub struct Services {
    /// 外部提供的共享延迟历史；为空时每个代理组各自持有一份
    pub history: Option<Arc<HistoryStorage>>,
    pub cache_file: Option<Arc<dyn CacheFile>>,
    pub weights: Option<Arc<dyn WeightStorage>>,
    pub prober: Arc<dyn UrlProber>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            history: None,
            cache_file: None,
            weights: None,
            prober: Arc::new(HttpUrlProber::new()),
        }
    }
}

impl Services {
    pub fn with_history(mut self, history: Arc<HistoryStorage>) -> Self {
        self.history = Some(history);
        self
    }

    /// 代理组使用的历史存储：有共享实例时复用，否则新建私有实例
    pub fn history_storage(&self) -> Arc<HistoryStorage> {
        match &self.history {
            Some(shared) => shared.clone(),
            None => Arc::new(HistoryStorage::new()),
        }
    }

    pub fn with_cache_file(mut self, cache_file: Arc<dyn CacheFile>) -> Self {
        self.cache_file = Some(cache_file);
        self
    }

    pub fn with_weights(mut self, weights: Arc<dyn WeightStorage>) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn with_prober(mut self, prober: Arc<dyn UrlProber>) -> Self {
        self.prober = prober;
        self
    }
}

/// 构造出站时可用的上下文
#[derive(Clone)]
pub struct BuildContext {
    services: Services,
    manager: Weak<OutboundManager>,
}

impl BuildContext {
    pub fn new(services: Services, manager: Weak<OutboundManager>) -> Self {
        Self { services, manager }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// 代理组在 Start 阶段通过它解析成员
    pub fn manager(&self) -> Weak<OutboundManager> {
        self.manager.clone()
    }
}

type Constructor = Box<
    dyn Fn(&BuildContext, &str, serde_json::Value) -> Result<Arc<dyn OutboundHandler>>
        + Send
        + Sync,
>;

/// 按类型名索引的出站构造器表
pub struct OutboundRegistry {
    constructors: HashMap<String, Constructor>,
}

impl OutboundRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// 内置类型：direct、block 以及全部代理组
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register::<DirectOptions, _>(TYPE_DIRECT, |_, tag, options| {
            Ok(Arc::new(DirectOutbound::new(tag.to_string(), options)))
        });
        registry.register::<serde_json::Value, _>(TYPE_BLOCK, |_, tag, _| {
            Ok(Arc::new(BlockOutbound::new(tag.to_string())))
        });
        registry.register(TYPE_SELECTOR, |ctx, tag, options| {
            Ok(Arc::new(Selector::new(ctx, tag, options)?))
        });
        registry.register(TYPE_URLTEST, |ctx, tag, options| {
            Ok(Arc::new(UrlTest::new(ctx, tag, options)?))
        });
        registry.register(TYPE_URLTEST_PRO, |ctx, tag, options| {
            Ok(Arc::new(UrlTestPro::new(ctx, tag, options)?))
        });
        registry.register(TYPE_FALLBACK, |ctx, tag, options| {
            Ok(Arc::new(Fallback::new(ctx, tag, options)?))
        });
        registry.register(TYPE_BALANCER, |ctx, tag, options| {
            Ok(Arc::new(Balancer::new(ctx, tag, options)?))
        });
        registry
    }

    /// 注册一个类型；选项以 JSON 反序列化为 `O`
    pub fn register<O, F>(&mut self, outbound_type: &str, constructor: F)
    where
        O: DeserializeOwned + 'static,
        F: Fn(&BuildContext, &str, O) -> Result<Arc<dyn OutboundHandler>> + Send + Sync + 'static,
    {
        let name = outbound_type.to_string();
        self.constructors.insert(
            outbound_type.to_string(),
            Box::new(move |ctx, tag, value| {
                let options: O = serde_json::from_value(value)
                    .with_context(|| format!("parse options of outbound/{}[{}]", name, tag))?;
                constructor(ctx, tag, options)
            }),
        );
    }

    pub fn contains(&self, outbound_type: &str) -> bool {
        self.constructors.contains_key(outbound_type)
    }

    pub fn create_outbound(
        &self,
        ctx: &BuildContext,
        tag: &str,
        outbound_type: &str,
        options: serde_json::Value,
    ) -> Result<Arc<dyn OutboundHandler>> {
        let constructor = self
            .constructors
            .get(outbound_type)
            .ok_or_else(|| OutboundError::UnknownType(outbound_type.to_string()))?;
        let options = match options {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other,
        };
        constructor(ctx, tag, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> BuildContext {
        BuildContext::new(Services::default(), Weak::new())
    }

    #[test]
    fn builtin_types_registered() {
        let registry = OutboundRegistry::with_defaults();
        for t in ["direct", "block", "selector", "urltest", "urltest-pro", "fallback", "balancer"] {
            assert!(registry.contains(t), "{} missing", t);
        }
    }

    #[test]
    fn unknown_type_rejected() {
        let registry = OutboundRegistry::with_defaults();
        let err = registry
            .create_outbound(&context(), "x", "vmess", json!({}))
            .err()
            .unwrap();
        assert_eq!(
            OutboundError::find(&err),
            Some(&OutboundError::UnknownType("vmess".into()))
        );
    }

    #[test]
    fn create_direct_with_null_options() {
        let registry = OutboundRegistry::with_defaults();
        let outbound = registry
            .create_outbound(&context(), "out", "direct", serde_json::Value::Null)
            .unwrap();
        assert_eq!(outbound.tag(), "out");
        assert_eq!(outbound.outbound_type(), "direct");
    }

    #[test]
    fn group_without_members_fails() {
        let registry = OutboundRegistry::with_defaults();
        let err = registry
            .create_outbound(&context(), "g", "selector", json!({ "outbounds": [] }))
            .err()
            .unwrap();
        assert_eq!(OutboundError::find(&err), Some(&OutboundError::MissingTags));
    }

    #[test]
    fn bad_options_name_the_outbound() {
        let registry = OutboundRegistry::with_defaults();
        let err = registry
            .create_outbound(&context(), "g", "urltest", json!({ "outbounds": "a" }))
            .err()
            .unwrap();
        assert!(err.to_string().contains("urltest[g]"));
    }
}
