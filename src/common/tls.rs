use std::sync::Arc;

use anyhow::Result;
use rustls::crypto::ring as ring_provider;
use rustls::ClientConfig;

/// 构建 TLS ClientConfig（系统内置 webpki 根证书）
///
/// - `alpn`: 可选的 ALPN 协议列表（如 `["http/1.1"]`）
pub fn build_tls_config(alpn: Option<&[&str]>) -> Result<ClientConfig> {
    let provider = Arc::new(ring_provider::default_provider());
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("TLS config error: {}", e))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if let Some(protocols) = alpn {
        config.alpn_protocols = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_alpn() {
        let config = build_tls_config(Some(&["http/1.1"])).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
