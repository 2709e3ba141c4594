use crate::model::{DnsRequest, DnsResponse, HttpResponse, Request, Response};
use crate::store::Store;
use rand::seq::SliceRandom;
use serde_json::json;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::warn;

const FALLBACK_TTL: u32 = 3600;
const DEFAULT_MX_PRIORITY: u16 = 10;

/// Builds the fallback response for any request that no rule answers.
///
/// DNS answers draw from the domain's public address pool (already cached at
/// the store layer) so pool edits propagate within the cache TTL.
pub struct DefaultFactory {
    store: Arc<dyn Store>,
    ipv6_pool: Vec<Ipv6Addr>,
    caa_issuer: String,
    contact_email: Option<String>,
    soa_serial: u32,
}

impl DefaultFactory {
    pub fn new(
        store: Arc<dyn Store>,
        ipv6_pool: Vec<Ipv6Addr>,
        caa_issuer: String,
        contact_email: Option<String>,
        soa_serial: u32,
    ) -> Self {
        DefaultFactory {
            store,
            ipv6_pool,
            caa_issuer,
            contact_email,
            soa_serial,
        }
    }

    pub async fn response_for(&self, request: &Request) -> Response {
        match request {
            Request::Dns(req) => Response::Dns(self.dns_default(req).await),
            Request::Http(_) => Response::Http(self.http_default()),
        }
    }

    pub fn http_default(&self) -> HttpResponse {
        HttpResponse::empty()
    }

    pub async fn dns_default(&self, req: &DnsRequest) -> DnsResponse {
        let qtype = req.qtype.to_uppercase();
        let data = match qtype.as_str() {
            "A" => json!({ "ip": self.public_ip(&req.domain).await.to_string() }),
            "AAAA" => json!({ "ip": self.public_ipv6().to_string() }),
            "MX" => json!({
                "name": format!("mail.{}", req.domain),
                "priority": DEFAULT_MX_PRIORITY,
            }),
            "NS" => json!({ "ns": self.public_ip(&req.domain).await.to_string() }),
            "CAA" => self.caa_default(),
            "SOA" => self.soa_default(&req.domain).await,
            "TXT" => json!({ "txt": "txt" }),
            "CNAME" => json!({ "cname": format!("cname.{}.", req.domain) }),
            _ => json!({}),
        };

        DnsResponse {
            rtype: qtype,
            rname: req.req_fqdn.clone(),
            rdata: data,
            ttl: if req.ttl > 0 { req.ttl } else { FALLBACK_TTL },
        }
    }

    pub fn caa_default(&self) -> serde_json::Value {
        json!({ "flags": 0, "tag": "issue", "value": self.caa_issuer })
    }

    pub async fn soa_default(&self, domain: &str) -> serde_json::Value {
        json!({
            "mname": self.public_ip(domain).await.to_string(),
            "rname": self.contact(domain).replace('@', "."),
            "times": [self.soa_serial, 7200, 10800, 259200, 3600],
        })
    }

    /// Contact address used for the SOA rname and the apex CAA extras.
    pub fn contact(&self, domain: &str) -> String {
        self.contact_email
            .clone()
            .unwrap_or_else(|| format!("info@{}", domain))
    }

    async fn public_ip(&self, domain: &str) -> Ipv4Addr {
        let pool = match self.store.public_ips(domain).await {
            Ok(pool) => pool,
            Err(e) => {
                warn!("public ip lookup failed: {}", e);
                Vec::new()
            }
        };
        if let Some(ip) = pool.choose(&mut rand::thread_rng()) {
            return *ip;
        }
        // No pool configured yet; answer with something harmless.
        *[Ipv4Addr::new(127, 0, 0, 8), Ipv4Addr::new(127, 0, 0, 9)]
            .choose(&mut rand::thread_rng())
            .unwrap()
    }

    fn public_ipv6(&self) -> Ipv6Addr {
        self.ipv6_pool
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(Ipv6Addr::UNSPECIFIED)
    }
}
