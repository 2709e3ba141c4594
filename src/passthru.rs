use async_trait::async_trait;
use ip_network::IpNetwork;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::error;

pub const DEFAULT_TIMEOUT_MS: u64 = 2000;
pub const MAX_TIMEOUT_MS: u64 = 10000;

/// Loopback, RFC 1918, link-local, the cloud metadata gateway, and their
/// IPv6 relatives. A passthrough target resolving into any of these is
/// refused outright.
static FORBIDDEN_NETWORKS: LazyLock<Vec<IpNetwork>> = LazyLock::new(|| {
    [
        "127.0.0.0/8",
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "169.254.0.0/16",
        "168.63.129.16/32",
        "::1/128",
        "fc00::/7",
        "fe80::/10",
    ]
    .iter()
    .map(|net| net.parse().unwrap())
    .collect()
});

pub fn ip_is_forbidden(ip: IpAddr) -> bool {
    FORBIDDEN_NETWORKS.iter().any(|net| net.contains(ip))
}

/// Resolves `host` and classifies every returned address. Resolution
/// failures count as unsafe.
pub async fn host_is_safe(host: &str) -> bool {
    if host.is_empty() {
        return false;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return !ip_is_forbidden(ip);
    }
    match tokio::net::lookup_host((host, 80u16)).await {
        Ok(addrs) => {
            let addrs: Vec<_> = addrs.collect();
            !addrs.is_empty() && !addrs.iter().any(|a| ip_is_forbidden(a.ip()))
        }
        Err(e) => {
            error!("could not resolve host {}: {}", host, e);
            false
        }
    }
}

pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub timeout: Duration,
    pub verify_tls: bool,
}

pub struct OutboundResponse {
    pub status: i64,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// The outbound half of the passthrough actions. Injected so the rule
/// engine stays testable without network access.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn is_safe(&self, host: &str) -> bool;

    async fn send(&self, request: OutboundRequest) -> anyhow::Result<OutboundResponse>;
}

/// Production implementation: reqwest with redirects disabled.
pub struct ReqwestOutbound {
    verify: reqwest::Client,
    no_verify: reqwest::Client,
}

impl ReqwestOutbound {
    pub fn new() -> anyhow::Result<Self> {
        let verify = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let no_verify = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(ReqwestOutbound { verify, no_verify })
    }
}

#[async_trait]
impl Outbound for ReqwestOutbound {
    async fn is_safe(&self, host: &str) -> bool {
        host_is_safe(host).await
    }

    async fn send(&self, request: OutboundRequest) -> anyhow::Result<OutboundResponse> {
        let client = if request.verify_tls {
            &self.verify
        } else {
            &self.no_verify
        };
        let method = reqwest::Method::from_bytes(request.method.as_bytes())?;

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &request.headers {
            let Ok(name) = reqwest::header::HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            let Ok(value) = reqwest::header::HeaderValue::from_str(value) else {
                continue;
            };
            headers.insert(name, value);
        }

        let resp = client
            .request(method, request.url.as_str())
            .headers(headers)
            .body(request.body)
            .timeout(request.timeout)
            .send()
            .await?;

        let status = resp.status().as_u16() as i64;
        let mut out_headers = BTreeMap::new();
        for (name, value) in resp.headers() {
            out_headers.insert(
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            );
        }
        let body = resp.text().await.unwrap_or_default();

        Ok(OutboundResponse {
            status,
            headers: out_headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forbidden(ip: &str) -> bool {
        ip_is_forbidden(ip.parse().unwrap())
    }

    #[test]
    fn test_forbidden_ipv4_networks() {
        assert!(forbidden("127.0.0.1"));
        assert!(forbidden("127.255.255.255"));
        assert!(forbidden("10.0.0.1"));
        assert!(forbidden("172.16.0.1"));
        assert!(forbidden("172.31.255.254"));
        assert!(forbidden("192.168.1.1"));
        assert!(forbidden("169.254.169.254"));
        assert!(forbidden("168.63.129.16"));
    }

    #[test]
    fn test_allowed_ipv4() {
        assert!(!forbidden("1.1.1.1"));
        assert!(!forbidden("8.8.8.8"));
        assert!(!forbidden("172.15.0.1"));
        assert!(!forbidden("172.32.0.1"));
        assert!(!forbidden("168.63.129.17"));
    }

    #[test]
    fn test_forbidden_ipv6_networks() {
        assert!(forbidden("::1"));
        assert!(forbidden("fc00::1"));
        assert!(forbidden("fdff::1"));
        assert!(forbidden("fe80::1"));
    }

    #[test]
    fn test_allowed_ipv6() {
        assert!(!forbidden("2001:4860:4860::8888"));
        assert!(!forbidden("2606:4700::1111"));
    }

    #[tokio::test]
    async fn test_host_is_safe_ip_literals() {
        assert!(!host_is_safe("127.0.0.1").await);
        assert!(!host_is_safe("169.254.169.254").await);
        assert!(!host_is_safe("::1").await);
        assert!(host_is_safe("1.1.1.1").await);
    }

    #[tokio::test]
    async fn test_host_is_safe_empty_host() {
        assert!(!host_is_safe("").await);
    }
}
