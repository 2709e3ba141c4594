use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

const SUMMARY_PATH_LEN: usize = 20;

/// Network protocol a rule or request belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Dns,
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Dns => "dns",
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct DnsRequest {
    pub req_fqdn: String,
    pub zone_fqdn: String,
    /// Query type in its uppercase text form ("A", "AAAA", ...).
    pub qtype: String,
    pub remote_addr: IpAddr,
    pub domain: String,
    pub ttl: u32,
}

impl DnsRequest {
    pub fn summary(&self) -> String {
        format!("{}/{}", self.qtype, self.req_fqdn)
    }

    pub fn json(&self) -> String {
        json!({
            "request_type": self.qtype,
            "ttl": self.ttl,
        })
        .to_string()
    }
}

impl fmt::Display for DnsRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DNS {} {}", self.qtype, self.req_fqdn)
    }
}

/// Answer data for one resource record. `rdata` mirrors the shape rules
/// store in the database: `{"ip": ...}`, `{"cname": ...}`, and so on.
#[derive(Clone, Debug)]
pub struct DnsResponse {
    pub rtype: String,
    pub rname: String,
    pub rdata: serde_json::Value,
    pub ttl: u32,
}

impl DnsResponse {
    pub fn rtype(&self) -> String {
        self.rtype.to_uppercase()
    }

    fn field(&self, key: &str) -> String {
        match self.rdata.get(key) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => String::new(),
        }
    }

    pub fn summary(&self) -> String {
        match self.rtype().as_str() {
            "A" | "AAAA" => self.field("ip"),
            "CAA" => format!(
                "{} {} {}",
                self.field("flags"),
                self.field("tag"),
                self.field("value")
            ),
            "CNAME" => self.field("cname"),
            "NS" => self.field("ns"),
            "NXDOMAIN" => "NXDOMAIN".to_string(),
            "MX" => format!("{} {}", self.field("priority"), self.field("name")),
            "SOA" => format!("{} {}", self.field("mname"), self.field("rname")),
            "TXT" => self.field("txt"),
            _ => self.rdata.to_string(),
        }
    }

    pub fn json(&self) -> String {
        json!({
            "type": self.rtype(),
            "name": self.rname,
            "data": self.rdata,
            "ttl": self.ttl,
        })
        .to_string()
    }
}

impl fmt::Display for DnsResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DNS {}/{}", self.rtype(), self.summary())
    }
}

#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub req_fqdn: String,
    pub zone_fqdn: String,
    pub remote_addr: IpAddr,
    pub method: String,
    pub path: String,
    pub version: String,
    /// Header names are stored lowercase, as parsed off the wire.
    pub headers: BTreeMap<String, String>,
    /// UTF-8 body, when it decodes cleanly.
    pub body: Option<String>,
    /// Base64 of the raw bytes, when the body is not valid UTF-8.
    pub body_b64: Option<String>,
    pub tls: bool,
}

impl HttpRequest {
    pub fn summary(&self) -> String {
        let path = if self.path.len() > SUMMARY_PATH_LEN {
            format!("{}..", &self.path[..SUMMARY_PATH_LEN])
        } else {
            self.path.clone()
        };
        format!("{} {}", self.method, path)
    }

    pub fn json(&self) -> String {
        json!({
            "method": self.method,
            "path": self.path,
            "version": self.version,
            "headers": self.headers,
            "body": self.body,
            "body_b64": self.body_b64,
            "tls": self.tls,
        })
        .to_string()
    }
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}{}",
            if self.tls { "HTTPS" } else { "HTTP" },
            self.method,
            self.req_fqdn,
            self.path
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HttpResponse {
    /// Kept wide on purpose: rules may program any integer here and the
    /// listener clamps at emission time.
    pub status_code: i64,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    /// The silent reply: 200, no headers, no body.
    pub fn empty() -> Self {
        HttpResponse {
            status_code: 200,
            headers: BTreeMap::new(),
            body: String::new(),
        }
    }

    pub fn summary(&self) -> String {
        format!("HTTP {}", self.status_code)
    }

    pub fn json(&self) -> String {
        json!({
            "code": self.status_code,
            "headers": self.headers,
            "body": self.body,
        })
        .to_string()
    }
}

/// A typed inbound request, owned by the listener that accepted it.
#[derive(Clone, Debug)]
pub enum Request {
    Dns(DnsRequest),
    Http(HttpRequest),
}

impl Request {
    pub fn protocol(&self) -> Protocol {
        match self {
            Request::Dns(_) => Protocol::Dns,
            Request::Http(r) if r.tls => Protocol::Https,
            Request::Http(_) => Protocol::Http,
        }
    }

    pub fn req_fqdn(&self) -> &str {
        match self {
            Request::Dns(r) => &r.req_fqdn,
            Request::Http(r) => &r.req_fqdn,
        }
    }

    pub fn zone_fqdn(&self) -> &str {
        match self {
            Request::Dns(r) => &r.zone_fqdn,
            Request::Http(r) => &r.zone_fqdn,
        }
    }

    pub fn remote_addr(&self) -> IpAddr {
        match self {
            Request::Dns(r) => r.remote_addr,
            Request::Http(r) => r.remote_addr,
        }
    }

    pub fn summary(&self) -> String {
        match self {
            Request::Dns(r) => r.summary(),
            Request::Http(r) => r.summary(),
        }
    }

    pub fn json(&self) -> String {
        match self {
            Request::Dns(r) => r.json(),
            Request::Http(r) => r.json(),
        }
    }

    pub fn as_http(&self) -> Option<&HttpRequest> {
        match self {
            Request::Http(r) => Some(r),
            Request::Dns(_) => None,
        }
    }

    pub fn as_dns(&self) -> Option<&DnsRequest> {
        match self {
            Request::Dns(r) => Some(r),
            Request::Http(_) => None,
        }
    }
}

/// The reply being assembled for a request.
#[derive(Clone, Debug)]
pub enum Response {
    Dns(DnsResponse),
    Http(HttpResponse),
}

impl Response {
    pub fn summary(&self) -> String {
        match self {
            Response::Dns(r) => r.summary(),
            Response::Http(r) => r.summary(),
        }
    }

    pub fn json(&self) -> String {
        match self {
            Response::Dns(r) => r.json(),
            Response::Http(r) => r.json(),
        }
    }

    pub fn as_http_mut(&mut self) -> Option<&mut HttpResponse> {
        match self {
            Response::Http(r) => Some(r),
            Response::Dns(_) => None,
        }
    }

    pub fn as_dns_mut(&mut self) -> Option<&mut DnsResponse> {
        match self {
            Response::Dns(r) => Some(r),
            Response::Http(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dns_request(qtype: &str) -> DnsRequest {
        DnsRequest {
            req_fqdn: "foo.z.d.test".to_string(),
            zone_fqdn: "z.d.test".to_string(),
            qtype: qtype.to_string(),
            remote_addr: "203.0.113.7".parse().unwrap(),
            domain: "d.test".to_string(),
            ttl: 60,
        }
    }

    #[test]
    fn test_dns_request_summary() {
        assert_eq!(dns_request("A").summary(), "A/foo.z.d.test");
        assert_eq!(dns_request("TXT").summary(), "TXT/foo.z.d.test");
    }

    #[test]
    fn test_dns_response_summaries() {
        let a = DnsResponse {
            rtype: "a".to_string(),
            rname: "foo.z.d.test".to_string(),
            rdata: json!({"ip": "1.1.1.1"}),
            ttl: 60,
        };
        assert_eq!(a.summary(), "1.1.1.1");
        assert_eq!(a.rtype(), "A");

        let mx = DnsResponse {
            rtype: "MX".to_string(),
            rname: "foo.z.d.test".to_string(),
            rdata: json!({"name": "mail.d.test", "priority": 10}),
            ttl: 60,
        };
        assert_eq!(mx.summary(), "10 mail.d.test");
    }

    #[test]
    fn test_http_request_summary_truncates_path() {
        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), "z.d.test".to_string());
        let req = HttpRequest {
            req_fqdn: "z.d.test".to_string(),
            zone_fqdn: "z.d.test".to_string(),
            remote_addr: "203.0.113.7".parse().unwrap(),
            method: "GET".to_string(),
            path: "/a/very/long/path/that/keeps/going".to_string(),
            version: "HTTP/1.1".to_string(),
            headers,
            body: None,
            body_b64: None,
            tls: false,
        };
        assert_eq!(req.summary(), "GET /a/very/long/path/th..");
    }

    #[test]
    fn test_http_protocol_follows_tls() {
        let mut req = HttpRequest {
            req_fqdn: "z.d.test".to_string(),
            zone_fqdn: "z.d.test".to_string(),
            remote_addr: "203.0.113.7".parse().unwrap(),
            method: "GET".to_string(),
            path: "/".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: BTreeMap::new(),
            body: None,
            body_b64: None,
            tls: false,
        };
        assert_eq!(Request::Http(req.clone()).protocol(), Protocol::Http);
        req.tls = true;
        assert_eq!(Request::Http(req).protocol(), Protocol::Https);
    }

    #[test]
    fn test_empty_http_response() {
        let empty = HttpResponse::empty();
        assert_eq!(empty.status_code, 200);
        assert!(empty.headers.is_empty());
        assert!(empty.body.is_empty());
        assert_eq!(empty.summary(), "HTTP 200");
    }
}
