pub mod outbound_manager;
pub mod registry;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::Config;
use crate::proxy::group::persistence::JsonCacheFile;
use crate::proxy::outbound::direct::DirectOutbound;
use crate::proxy::StartStage;

use outbound_manager::OutboundManager;
use registry::{OutboundRegistry, Services};

pub struct App {
    manager: Arc<OutboundManager>,
}

impl App {
    /// 按配置构造全部出站（尚未启动）
    pub async fn new(config: Config) -> Result<Self> {
        let mut services = Services::default();
        if config.cache_file.enabled {
            let cache = Arc::new(JsonCacheFile::load_or_default(config.cache_file.path()));
            info!(path = %cache.path().display(), "cache file enabled");
            services = services.with_cache_file(cache.clone()).with_weights(cache);
        }

        let registry = Arc::new(OutboundRegistry::with_defaults());
        let manager = OutboundManager::new(registry, services, config.default_outbound.clone());
        manager.initialize(Arc::new(DirectOutbound::new(
            "direct".to_string(),
            Default::default(),
        )));
        for outbound in &config.outbounds {
            manager
                .create(&outbound.tag, &outbound.outbound_type, outbound.options_value())
                .await?;
        }
        Ok(Self { manager })
    }

    pub fn manager(&self) -> &Arc<OutboundManager> {
        &self.manager
    }

    /// 依次执行全部启动阶段
    pub async fn start(&self) -> Result<()> {
        for stage in StartStage::ALL {
            self.manager.start(stage).await?;
        }
        if let Some(default) = self.manager.default_outbound() {
            info!(
                outbounds = self.manager.outbounds().len(),
                default = default.tag(),
                "outbounds started"
            );
        }
        Ok(())
    }

    pub async fn run(self) -> Result<()> {
        self.start().await?;
        info!("OpenWorld outbound manager started");
        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        self.manager.close().await
    }
}
