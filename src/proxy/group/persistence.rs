use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// selector 选中结果的持久化
pub trait CacheFile: Send + Sync {
    fn load_selected(&self, group: &str) -> Option<String>;
    fn store_selected(&self, group: &str, selected: &str) -> Result<()>;
}

/// url-test-pro 的成员权重来源
pub trait WeightStorage: Send + Sync {
    fn load_weight(&self, tag: &str) -> Option<f64>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct CacheState {
    #[serde(default)]
    selected: HashMap<String, String>,
    #[serde(default)]
    weights: HashMap<String, f64>,
}

/// JSON 文件实现的缓存
///
/// 文件格式：`{"selected": {"group": "member"}, "weights": {"tag": 1.5}}`。
/// 每次写入都会立即落盘，重启后读取恢复。读取只需要 `state` 锁，
/// 落盘在 `io` 锁下进行，不阻塞读取。
#[derive(Debug)]
pub struct JsonCacheFile {
    path: PathBuf,
    state: Mutex<CacheState>,
    io: Mutex<()>,
}

impl JsonCacheFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(CacheState::default()),
            io: Mutex::new(()),
        }
    }

    /// 从文件加载；文件不存在时保持空状态
    pub fn load(&self) -> Result<()> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "cache file not found, using defaults");
            return Ok(());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let loaded: CacheState = serde_json::from_str(&content)?;
        debug!(
            path = %self.path.display(),
            groups = loaded.selected.len(),
            weights = loaded.weights.len(),
            "loaded cache file"
        );
        *self.state.lock() = loaded;
        Ok(())
    }

    /// 尝试从文件加载，失败时使用空状态
    pub fn load_or_default(path: PathBuf) -> Self {
        let cache = Self::new(path);
        if let Err(e) = cache.load() {
            warn!(path = %cache.path.display(), error = %e, "failed to load cache file, using defaults");
        }
        cache
    }

    /// 修改内存状态后落盘；快照在 io 锁内生成，保证文件按修改顺序写入
    fn update(&self, apply: impl FnOnce(&mut CacheState)) -> Result<()> {
        let _io = self.io.lock();
        let content = {
            let mut state = self.state.lock();
            apply(&mut state);
            serde_json::to_string_pretty(&*state)?
        };
        self.write(&content)
    }

    fn write(&self, content: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, content)?;
        debug!(path = %self.path.display(), "saved cache file");
        Ok(())
    }

    pub fn set_weight(&self, tag: &str, weight: f64) -> Result<()> {
        self.update(|state| {
            state.weights.insert(tag.to_string(), weight);
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CacheFile for JsonCacheFile {
    fn load_selected(&self, group: &str) -> Option<String> {
        self.state.lock().selected.get(group).cloned()
    }

    fn store_selected(&self, group: &str, selected: &str) -> Result<()> {
        self.update(|state| {
            state
                .selected
                .insert(group.to_string(), selected.to_string());
        })
    }
}

impl WeightStorage for JsonCacheFile {
    fn load_weight(&self, tag: &str) -> Option<f64> {
        self.state.lock().weights.get(tag).copied()
    }
}
