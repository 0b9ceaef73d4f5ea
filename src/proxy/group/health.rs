use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use http::Uri;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::trace;

use crate::common::tls::build_tls_config;
use crate::common::Address;
use crate::proxy::{Network, OutboundHandler, Session};

/// 通过指定出站测量到某个 URL 的延迟（毫秒）
///
/// 超时由调用方控制。
#[async_trait]
pub trait UrlProber: Send + Sync {
    async fn url_test(&self, outbound: &dyn OutboundHandler, link: &str) -> Result<u16>;
}

/// 默认探测器：经出站发起一次 HTTP(S) GET，计时到收到响应头首字节
#[derive(Default)]
pub struct HttpUrlProber {
    tls: OnceCell<Arc<ClientConfig>>,
}

impl HttpUrlProber {
    pub fn new() -> Self {
        Self::default()
    }

    async fn tls_config(&self) -> Result<Arc<ClientConfig>> {
        self.tls
            .get_or_try_init(|| async { build_tls_config(Some(&["http/1.1"])).map(Arc::new) })
            .await
            .cloned()
    }
}

#[async_trait]
impl UrlProber for HttpUrlProber {
    async fn url_test(&self, outbound: &dyn OutboundHandler, link: &str) -> Result<u16> {
        let target = ProbeTarget::parse(link)?;
        let mut session = Session::new(target.address.clone(), Network::Tcp);
        session.inbound_tag = "url-test".to_string();

        let start = Instant::now();
        let mut stream = outbound.connect(&session).await?;
        if target.tls {
            let config = self.tls_config().await?;
            let server_name = ServerName::try_from(target.host.clone())
                .with_context(|| format!("invalid server name '{}'", target.host))?;
            let mut tls = TlsConnector::from(config)
                .connect(server_name, stream)
                .await?;
            request_head(&mut tls, &target).await?;
        } else {
            request_head(&mut stream, &target).await?;
        }

        let elapsed = start.elapsed().as_millis();
        trace!(outbound = outbound.tag(), link, elapsed_ms = elapsed as u64, "url test finished");
        Ok(u16::try_from(elapsed).unwrap_or(u16::MAX))
    }
}

async fn request_head<S>(stream: &mut S, target: &ProbeTarget) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: openworld\r\nConnection: close\r\n\r\n",
        target.path, target.host_header
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    // 读到状态行就够了
    let mut buf = [0u8; 512];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        anyhow::bail!("connection closed before response");
    }
    if !buf[..n].starts_with(b"HTTP/") {
        anyhow::bail!("unexpected response from {}", target.host_header);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
struct ProbeTarget {
    tls: bool,
    host: String,
    host_header: String,
    address: Address,
    path: String,
}

impl ProbeTarget {
    fn parse(link: &str) -> Result<Self> {
        let uri: Uri = link
            .parse()
            .with_context(|| format!("invalid test url '{}'", link))?;
        let tls = match uri.scheme_str() {
            Some("https") => true,
            Some("http") | None => false,
            Some(other) => anyhow::bail!("unsupported test url scheme '{}'", other),
        };
        let raw_host = uri
            .host()
            .ok_or_else(|| anyhow::anyhow!("test url '{}' has no host", link))?;
        let host = raw_host.trim_start_matches('[').trim_end_matches(']').to_string();
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
        let host_header = match uri.port_u16() {
            Some(port) => format!("{}:{}", raw_host, port),
            None => raw_host.to_string(),
        };
        let address = match host.parse::<IpAddr>() {
            Ok(ip) => Address::Ip(SocketAddr::new(ip, port)),
            Err(_) => Address::Domain(host.clone(), port),
        };
        let path = uri
            .path_and_query()
            .map(|p| p.as_str())
            .filter(|p| !p.is_empty())
            .unwrap_or("/")
            .to_string();
        Ok(Self {
            tls,
            host,
            host_header,
            address,
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::DirectOptions;
    use crate::proxy::outbound::direct::DirectOutbound;
    use tokio::net::TcpListener;

    #[test]
    fn parse_https_default_port() {
        let target = ProbeTarget::parse("https://www.gstatic.com/generate_204").unwrap();
        assert!(target.tls);
        assert_eq!(target.address, Address::Domain("www.gstatic.com".into(), 443));
        assert_eq!(target.path, "/generate_204");
        assert_eq!(target.host_header, "www.gstatic.com");
    }

    #[test]
    fn parse_http_with_port_and_query() {
        let target = ProbeTarget::parse("http://127.0.0.1:8080/health?x=1").unwrap();
        assert!(!target.tls);
        assert_eq!(target.address, Address::Ip("127.0.0.1:8080".parse().unwrap()));
        assert_eq!(target.path, "/health?x=1");
        assert_eq!(target.host_header, "127.0.0.1:8080");
    }

    #[test]
    fn parse_ipv6_and_no_path() {
        let target = ProbeTarget::parse("http://[::1]:81").unwrap();
        assert_eq!(target.address, Address::Ip("[::1]:81".parse().unwrap()));
        assert_eq!(target.path, "/");
    }

    #[test]
    fn parse_rejects_other_schemes() {
        assert!(ProbeTarget::parse("ftp://example.com/").is_err());
    }

    async fn serve_once(response: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket.write_all(response).await;
        });
        addr
    }

    #[tokio::test]
    async fn probe_through_direct() {
        let addr = serve_once(b"HTTP/1.1 204 No Content\r\n\r\n").await;
        let direct = DirectOutbound::new("direct".into(), DirectOptions::default());
        let prober = HttpUrlProber::new();
        let delay = prober
            .url_test(&direct, &format!("http://{}/generate_204", addr))
            .await
            .unwrap();
        assert!(delay < 5000);
    }

    #[tokio::test]
    async fn probe_fails_on_garbage_response() {
        let addr = serve_once(b"SSH-2.0-nope\r\n").await;
        let direct = DirectOutbound::new("direct".into(), DirectOptions::default());
        let prober = HttpUrlProber::new();
        assert!(prober
            .url_test(&direct, &format!("http://{}/", addr))
            .await
            .is_err());
    }
}
