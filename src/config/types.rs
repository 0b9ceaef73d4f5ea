use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

pub const DEFAULT_TEST_URL: &str = "https://www.gstatic.com/generate_204";
/// 默认测速间隔（秒）
pub const DEFAULT_INTERVAL_SECS: u64 = 180;
/// 默认空闲超时（秒），超过后停止周期测速
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_TOLERANCE_MS: u16 = 50;
pub const DEFAULT_HISTORY_TTL_SECS: u64 = 300;
pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    pub outbounds: Vec<OutboundConfig>,
    /// 默认出站；为空时取第一个创建的出站
    #[serde(default)]
    pub default_outbound: Option<String>,
    #[serde(default)]
    pub cache_file: CacheFileConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.outbounds.is_empty() {
            anyhow::bail!("at least one outbound is required");
        }
        let mut seen = HashSet::new();
        for outbound in &self.outbounds {
            if outbound.tag.is_empty() {
                anyhow::bail!("outbound of type '{}' has an empty tag", outbound.outbound_type);
            }
            if !seen.insert(outbound.tag.as_str()) {
                anyhow::bail!("duplicate outbound tag '{}'", outbound.tag);
            }
        }
        if let Some(default) = &self.default_outbound {
            if !seen.contains(default.as_str()) {
                anyhow::bail!(
                    "default_outbound '{}' does not match any outbound tag",
                    default
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Default, Deserialize)]
pub struct CacheFileConfig {
    #[serde(default)]
    pub enabled: bool,
    pub path: Option<PathBuf>,
}

impl CacheFileConfig {
    pub fn path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| PathBuf::from("cache.json"))
    }
}

/// 单个出站配置；除 tag / type 以外的字段交给对应类型的构造器解析
#[derive(Debug, Clone, Deserialize)]
pub struct OutboundConfig {
    pub tag: String,
    #[serde(rename = "type")]
    pub outbound_type: String,
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl OutboundConfig {
    pub fn options_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.options.clone())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DirectOptions {
    /// Connect timeout in milliseconds. Default: 5000.
    pub connect_timeout: Option<u64>,
}

impl DirectOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout.unwrap_or(5000))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SelectorOptions {
    pub outbounds: Vec<String>,
    pub default: Option<String>,
    pub interrupt_exist_connections: bool,
}

/// url-test / url-test-pro 共用的选项
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UrlTestOptions {
    pub outbounds: Vec<String>,
    pub url: Option<String>,
    /// 秒
    pub interval: Option<u64>,
    /// 毫秒
    pub tolerance: Option<u16>,
    /// 秒
    pub idle_timeout: Option<u64>,
    pub interrupt_exist_connections: bool,
}

pub type UrlTestProOptions = UrlTestOptions;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FallbackOptions {
    pub outbounds: Vec<String>,
    pub url: Option<String>,
    pub interval: Option<u64>,
    pub idle_timeout: Option<u64>,
    pub interrupt_exist_connections: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BalancerOptions {
    pub outbounds: Vec<String>,
    pub url: Option<String>,
    pub interval: Option<u64>,
    pub idle_timeout: Option<u64>,
    /// 目标亲和记录有效期（秒）
    pub history_ttl: Option<u64>,
    pub force_random: bool,
    pub retry_count: Option<u32>,
    /// 毫秒
    pub retry_interval: Option<u64>,
    pub interrupt_exist_connections: bool,
}

/// 探测调度参数（已填充默认值）
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSettings {
    pub url: String,
    pub interval: Duration,
    pub idle_timeout: Duration,
}

impl ProbeSettings {
    pub fn new(url: Option<&str>, interval: Option<u64>, idle_timeout: Option<u64>) -> Result<Self> {
        let interval = Duration::from_secs(match interval {
            Some(0) | None => DEFAULT_INTERVAL_SECS,
            Some(secs) => secs,
        });
        let idle_timeout = Duration::from_secs(match idle_timeout {
            Some(0) | None => DEFAULT_IDLE_TIMEOUT_SECS,
            Some(secs) => secs,
        });
        if interval > idle_timeout {
            anyhow::bail!(crate::common::OutboundError::InvalidOption(
                "interval must be less or equal than idle_timeout".to_string()
            ));
        }
        let url = match url {
            Some(u) if !u.is_empty() => u.to_string(),
            _ => DEFAULT_TEST_URL.to_string(),
        };
        Ok(Self {
            url,
            interval,
            idle_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_settings_defaults() {
        let settings = ProbeSettings::new(None, None, None).unwrap();
        assert_eq!(settings.url, DEFAULT_TEST_URL);
        assert_eq!(settings.interval, Duration::from_secs(180));
        assert_eq!(settings.idle_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn probe_settings_rejects_interval_above_idle() {
        let err = ProbeSettings::new(None, Some(600), Some(60)).unwrap_err();
        assert!(err.to_string().contains("idle_timeout"));
    }

    #[test]
    fn outbound_config_keeps_extra_fields() {
        let yaml = r#"
tag: auto
type: urltest
outbounds: [a, b]
tolerance: 80
"#;
        let config: OutboundConfig = serde_yml::from_str(yaml).unwrap();
        assert_eq!(config.outbound_type, "urltest");
        let options: UrlTestOptions = serde_json::from_value(config.options_value()).unwrap();
        assert_eq!(options.outbounds, vec!["a", "b"]);
        assert_eq!(options.tolerance, Some(80));
        assert!(!options.interrupt_exist_connections);
    }

    #[test]
    fn validate_rejects_duplicates_and_unknown_default() {
        let yaml = r#"
outbounds:
  - { tag: a, type: direct }
  - { tag: a, type: block }
"#;
        let config: Config = serde_yml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());

        let yaml = r#"
default_outbound: missing
outbounds:
  - { tag: a, type: direct }
"#;
        let config: Config = serde_yml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
