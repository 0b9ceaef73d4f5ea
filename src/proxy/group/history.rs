use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::time::Instant;

/// 一次成功探测的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrlTestHistory {
    pub time: Instant,
    /// 延迟，毫秒
    pub delay: u16,
}

impl UrlTestHistory {
    pub fn new(delay: u16) -> Self {
        Self {
            time: Instant::now(),
            delay,
        }
    }
}

/// 进程内共享的探测历史，按出站 tag 索引
///
/// 所有代理组共用一份，成员本身是组时以它当前实际使用的出站 tag 记录。
#[derive(Debug, Default)]
pub struct HistoryStorage {
    entries: RwLock<HashMap<String, UrlTestHistory>>,
}

impl HistoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_url_test_history(&self, tag: &str) -> Option<UrlTestHistory> {
        self.entries.read().get(tag).copied()
    }

    pub fn store_url_test_history(&self, tag: &str, history: UrlTestHistory) {
        self.entries.write().insert(tag.to_string(), history);
    }

    pub fn delete_url_test_history(&self, tag: &str) {
        self.entries.write().remove(tag);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_load_delete() {
        let storage = HistoryStorage::new();
        assert!(storage.load_url_test_history("a").is_none());

        storage.store_url_test_history("a", UrlTestHistory::new(120));
        assert_eq!(storage.load_url_test_history("a").map(|h| h.delay), Some(120));
        assert_eq!(storage.len(), 1);

        storage.store_url_test_history("a", UrlTestHistory::new(80));
        assert_eq!(storage.load_url_test_history("a").map(|h| h.delay), Some(80));

        storage.delete_url_test_history("a");
        assert!(storage.is_empty());
        storage.delete_url_test_history("missing");
    }
}
