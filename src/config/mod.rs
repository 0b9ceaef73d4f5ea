pub mod types;

use anyhow::{Context, Result};
use std::path::Path;

pub use types::Config;

pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    let config = parse_config(&content)?;
    tracing::debug!(path = %path.display(), outbounds = config.outbounds.len(), "config loaded");
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = serde_yml::from_str(content).context("parse config")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
log:
  level: debug
default_outbound: auto
cache_file:
  enabled: true
outbounds:
  - tag: direct
    type: direct
  - tag: auto
    type: urltest
    outbounds: [direct]
"#
        )
        .unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.outbounds.len(), 2);
        assert_eq!(config.default_outbound.as_deref(), Some("auto"));
        assert!(config.cache_file.enabled);
    }

    #[test]
    fn empty_outbounds_rejected() {
        assert!(parse_config("outbounds: []").is_err());
    }
}
