use crate::engine::{EvalContext, Predicate, Registry, ResultAction};
use crate::model::Request;
use crate::passthru::{DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS, Outbound, OutboundRequest};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub fn register(registry: &mut Registry, outbound: Arc<dyn Outbound>) {
    registry.register_predicate("http.tls", Box::new(TlsPredicate));
    registry.register_predicate("http.method", Box::new(MethodPredicate));
    registry.register_predicate("http.path", Box::new(PathPredicate));
    registry.register_predicate("http.body", Box::new(BodyPredicate));
    registry.register_predicate("http.header", Box::new(HeaderPresentPredicate));
    registry.register_predicate("http.headers.keys", Box::new(HeaderKeysPredicate));
    registry.register_predicate("http.headers.values", Box::new(HeaderValuesPredicate));
    registry.register_predicate("http.headers.regexes", Box::new(HeaderRegexesPredicate));

    registry.register_result("http.code", Box::new(SetCodeResult));
    registry.register_result("http.body", Box::new(SetBodyResult));
    registry.register_result("http.header", Box::new(SetHeaderResult));
    registry.register_result("http.headers", Box::new(SetHeadersResult));
    registry.register_result(
        "http.passthru",
        Box::new(PassthruResult {
            outbound: outbound.clone(),
        }),
    );
    registry.register_result("http.passthru2", Box::new(Passthru2Result { outbound }));
}

/// Compiles the parameter, treating a bad pattern as a skipped component
/// (the rule is neither matched nor failed by it).
fn compile(parameter: &str) -> Option<Regex> {
    match Regex::new(parameter) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!("bad regex in rule component: {}", e);
            None
        }
    }
}

fn parse_header_map(parameter: &str) -> Option<BTreeMap<String, String>> {
    let object: serde_json::Map<String, serde_json::Value> =
        match serde_json::from_str(parameter) {
            Ok(object) => object,
            Err(e) => {
                warn!("header parameter is not a JSON object: {}", e);
                return None;
            }
        };
    Some(
        object
            .into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect(),
    )
}

struct TlsPredicate;

impl Predicate for TlsPredicate {
    fn satisfied_by(&self, request: &Request, _parameter: &str) -> bool {
        request.as_http().map(|r| r.tls).unwrap_or(false)
    }
}

/// Method is one of the comma-separated methods in the parameter.
struct MethodPredicate;

impl Predicate for MethodPredicate {
    fn satisfied_by(&self, request: &Request, parameter: &str) -> bool {
        let Some(req) = request.as_http() else {
            return false;
        };
        parameter
            .split(',')
            .any(|method| method.trim().eq_ignore_ascii_case(&req.method))
    }
}

struct PathPredicate;

impl Predicate for PathPredicate {
    fn satisfied_by(&self, request: &Request, parameter: &str) -> bool {
        let Some(req) = request.as_http() else {
            return false;
        };
        compile(parameter).is_none_or(|re| re.is_match(&req.path))
    }
}

struct BodyPredicate;

impl Predicate for BodyPredicate {
    fn satisfied_by(&self, request: &Request, parameter: &str) -> bool {
        let Some(req) = request.as_http() else {
            return false;
        };
        let body = req.body.as_deref().unwrap_or("");
        compile(parameter).is_none_or(|re| re.is_match(body))
    }
}

/// The named header is present (names are case-insensitive; the request
/// map stores them lowercase).
struct HeaderPresentPredicate;

impl Predicate for HeaderPresentPredicate {
    fn satisfied_by(&self, request: &Request, parameter: &str) -> bool {
        let Some(req) = request.as_http() else {
            return false;
        };
        req.headers.contains_key(&parameter.trim().to_lowercase())
    }
}

/// All comma-separated header names are present.
struct HeaderKeysPredicate;

impl Predicate for HeaderKeysPredicate {
    fn satisfied_by(&self, request: &Request, parameter: &str) -> bool {
        let Some(req) = request.as_http() else {
            return false;
        };
        parameter
            .split(',')
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .all(|key| req.headers.contains_key(&key.to_lowercase()))
    }
}

/// Every `name: value` pair of the JSON parameter matches exactly.
struct HeaderValuesPredicate;

impl Predicate for HeaderValuesPredicate {
    fn satisfied_by(&self, request: &Request, parameter: &str) -> bool {
        let Some(req) = request.as_http() else {
            return false;
        };
        let Some(required) = parse_header_map(parameter) else {
            return true;
        };
        required.iter().all(|(name, value)| {
            req.headers.get(&name.to_lowercase()) == Some(value)
        })
    }
}

/// Every header named in the JSON parameter matches its regex.
struct HeaderRegexesPredicate;

impl Predicate for HeaderRegexesPredicate {
    fn satisfied_by(&self, request: &Request, parameter: &str) -> bool {
        let Some(req) = request.as_http() else {
            return false;
        };
        let Some(required) = parse_header_map(parameter) else {
            return true;
        };
        required.iter().all(|(name, pattern)| {
            match req.headers.get(&name.to_lowercase()) {
                Some(value) => compile(pattern).is_none_or(|re| re.is_match(value)),
                None => false,
            }
        })
    }
}

struct SetCodeResult;

#[async_trait::async_trait]
impl ResultAction for SetCodeResult {
    async fn execute(&self, ctx: &mut EvalContext<'_>, parameter: &str) {
        let code = match parameter.trim().parse() {
            Ok(code) => code,
            Err(_) => {
                warn!("http.code is not an integer: {}", parameter);
                return;
            }
        };
        if let Some(resp) = ctx.response.as_http_mut() {
            resp.status_code = code;
        }
    }
}

struct SetBodyResult;

#[async_trait::async_trait]
impl ResultAction for SetBodyResult {
    async fn execute(&self, ctx: &mut EvalContext<'_>, parameter: &str) {
        if let Some(resp) = ctx.response.as_http_mut() {
            resp.body = parameter.to_string();
        }
    }
}

/// Adds or replaces one header. Parameter format: `Name: value`.
struct SetHeaderResult;

#[async_trait::async_trait]
impl ResultAction for SetHeaderResult {
    async fn execute(&self, ctx: &mut EvalContext<'_>, parameter: &str) {
        let Some((name, value)) = parameter.split_once(':') else {
            warn!("http.header needs a `name: value` parameter");
            return;
        };
        if let Some(resp) = ctx.response.as_http_mut() {
            resp.headers
                .insert(name.trim().to_string(), value.trim().to_string());
        }
    }
}

/// Replaces the whole header map with the JSON parameter.
struct SetHeadersResult;

#[async_trait::async_trait]
impl ResultAction for SetHeadersResult {
    async fn execute(&self, ctx: &mut EvalContext<'_>, parameter: &str) {
        let Some(headers) = parse_header_map(parameter) else {
            return;
        };
        if let Some(resp) = ctx.response.as_http_mut() {
            resp.headers = headers;
        }
    }
}

/// Scheme, host, and authority of a passthrough target. Unknown schemes
/// fall back to plain http.
fn target_parts(raw: &str) -> Option<(String, String, String)> {
    let url = url::Url::parse(raw).ok()?;
    let host = url.host_str()?.to_string();
    let scheme = match url.scheme() {
        "http" | "https" => url.scheme().to_string(),
        _ => "http".to_string(),
    };
    let authority = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.clone(),
    };
    Some((scheme, host, authority))
}

/// Proxies the original request to the parameter URL and folds the
/// upstream reply into the response. Refuses targets resolving into
/// private or metadata networks.
struct PassthruResult {
    outbound: Arc<dyn Outbound>,
}

#[async_trait::async_trait]
impl ResultAction for PassthruResult {
    async fn execute(&self, ctx: &mut EvalContext<'_>, parameter: &str) {
        let Some(req) = ctx.request.as_http() else {
            return;
        };
        let Some((scheme, host, authority)) = target_parts(parameter) else {
            warn!("http.passthru target is not a URL: {}", parameter);
            return;
        };
        if !self.outbound.is_safe(&host).await {
            error!("dangerous target for http.passthru: {}", parameter);
            return;
        }

        let mut headers = req.headers.clone();
        headers.insert("host".to_string(), authority.clone());

        let url = format!("{}://{}{}", scheme, authority, req.path);
        info!("http.passthru for {}{}", authority, req.path);

        let outbound_req = OutboundRequest {
            method: req.method.to_uppercase(),
            url,
            headers,
            body: req.body.clone().unwrap_or_default(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            verify_tls: true,
        };
        match self.outbound.send(outbound_req).await {
            Ok(upstream) => {
                if let Some(resp) = ctx.response.as_http_mut() {
                    resp.status_code = upstream.status;
                    resp.headers = upstream.headers;
                    resp.body = upstream.body;
                }
            }
            Err(e) => error!("http.passthru to {} failed: {:#}", authority, e),
        }
    }
}

#[derive(Deserialize)]
struct Passthru2Spec {
    url: String,
    #[serde(default)]
    skip_tls_check: bool,
    #[serde(default = "default_timeout_ms")]
    timeout_in_ms: u64,
    #[serde(default)]
    skip_xff: bool,
    #[serde(default)]
    subs: BTreeMap<String, String>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// The rewriting proxy: like `http.passthru`, plus substring substitutions
/// over the forwarded header values and body, an `X-Forwarded-For` header
/// unless suppressed, and a configurable timeout.
struct Passthru2Result {
    outbound: Arc<dyn Outbound>,
}

#[async_trait::async_trait]
impl ResultAction for Passthru2Result {
    async fn execute(&self, ctx: &mut EvalContext<'_>, parameter: &str) {
        let Some(req) = ctx.request.as_http() else {
            return;
        };
        let spec: Passthru2Spec = match serde_json::from_str(parameter) {
            Ok(spec) => spec,
            Err(e) => {
                warn!("malformed http.passthru2 parameter: {}", e);
                return;
            }
        };
        let Some((scheme, host, authority)) = target_parts(&spec.url) else {
            warn!("http.passthru2 target is not a URL: {}", spec.url);
            return;
        };
        if !self.outbound.is_safe(&host).await {
            error!("dangerous target for http.passthru2: {}", spec.url);
            return;
        }

        let timeout_ms = if spec.timeout_in_ms > MAX_TIMEOUT_MS {
            DEFAULT_TIMEOUT_MS
        } else {
            spec.timeout_in_ms
        };

        let mut headers = req.headers.clone();
        let mut body = req.body.clone().unwrap_or_default();
        for (from, to) in &spec.subs {
            for value in headers.values_mut() {
                if value.contains(from) {
                    *value = value.replace(from, to);
                }
            }
            if body.contains(from) {
                body = body.replace(from, to);
            }
        }

        if !spec.skip_xff && !headers.contains_key("x-forwarded-for") {
            headers.insert(
                "x-forwarded-for".to_string(),
                req.remote_addr.to_string(),
            );
        }
        headers.insert("host".to_string(), authority.clone());

        let url = format!("{}://{}{}", scheme, authority, req.path);
        info!("http.passthru2 for {}{}", authority, req.path);

        let outbound_req = OutboundRequest {
            method: req.method.to_uppercase(),
            url,
            headers,
            body,
            timeout: Duration::from_millis(timeout_ms),
            verify_tls: !spec.skip_tls_check,
        };
        match self.outbound.send(outbound_req).await {
            Ok(upstream) => {
                if let Some(resp) = ctx.response.as_http_mut() {
                    resp.status_code = upstream.status;
                    resp.headers = upstream.headers;
                    resp.body = upstream.body;
                }
            }
            Err(e) => error!("http.passthru2 to {} failed: {:#}", authority, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HttpRequest;

    fn request() -> Request {
        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), "z.d.test".to_string());
        headers.insert("content-type".to_string(), "application/json".to_string());
        headers.insert("x-token".to_string(), "abc123".to_string());
        Request::Http(HttpRequest {
            req_fqdn: "z.d.test".to_string(),
            zone_fqdn: "z.d.test".to_string(),
            remote_addr: "203.0.113.7".parse().unwrap(),
            method: "POST".to_string(),
            path: "/api/v1/ping".to_string(),
            version: "HTTP/1.1".to_string(),
            headers,
            body: Some("{\"cmd\": \"ping\"}".to_string()),
            body_b64: None,
            tls: false,
        })
    }

    #[test]
    fn test_method_predicate() {
        let p = MethodPredicate;
        assert!(p.satisfied_by(&request(), "post"));
        assert!(p.satisfied_by(&request(), "GET, POST"));
        assert!(!p.satisfied_by(&request(), "GET,PUT"));
    }

    #[test]
    fn test_tls_predicate() {
        assert!(!TlsPredicate.satisfied_by(&request(), "1"));
    }

    #[test]
    fn test_path_predicate_regex_search() {
        let p = PathPredicate;
        assert!(p.satisfied_by(&request(), "^/api/"));
        assert!(p.satisfied_by(&request(), "ping$"));
        assert!(!p.satisfied_by(&request(), "^/admin"));
        // A broken pattern skips the component rather than failing the rule.
        assert!(p.satisfied_by(&request(), "["));
    }

    #[test]
    fn test_body_predicate() {
        let p = BodyPredicate;
        assert!(p.satisfied_by(&request(), "\"cmd\""));
        assert!(!p.satisfied_by(&request(), "shutdown"));
    }

    #[test]
    fn test_header_present_predicate_case_insensitive() {
        let p = HeaderPresentPredicate;
        assert!(p.satisfied_by(&request(), "X-Token"));
        assert!(p.satisfied_by(&request(), "content-type"));
        assert!(!p.satisfied_by(&request(), "authorization"));
    }

    #[test]
    fn test_header_keys_predicate() {
        let p = HeaderKeysPredicate;
        assert!(p.satisfied_by(&request(), "Host,X-Token"));
        assert!(p.satisfied_by(&request(), "host, content-type,"));
        assert!(!p.satisfied_by(&request(), "host,missing"));
    }

    #[test]
    fn test_header_values_predicate() {
        let p = HeaderValuesPredicate;
        assert!(p.satisfied_by(&request(), r#"{"X-Token": "abc123"}"#));
        assert!(!p.satisfied_by(&request(), r#"{"X-Token": "wrong"}"#));
        assert!(!p.satisfied_by(&request(), r#"{"Missing": "x"}"#));
    }

    #[test]
    fn test_header_regexes_predicate() {
        let p = HeaderRegexesPredicate;
        assert!(p.satisfied_by(&request(), r#"{"x-token": "^abc"}"#));
        assert!(!p.satisfied_by(&request(), r#"{"x-token": "^xyz"}"#));
        assert!(!p.satisfied_by(&request(), r#"{"missing": ".*"}"#));
    }

    #[test]
    fn test_target_parts() {
        assert_eq!(
            target_parts("http://example.net/ignored"),
            Some((
                "http".to_string(),
                "example.net".to_string(),
                "example.net".to_string()
            ))
        );
        assert_eq!(
            target_parts("https://example.net:8443/"),
            Some((
                "https".to_string(),
                "example.net".to_string(),
                "example.net:8443".to_string()
            ))
        );
        // Unknown schemes downgrade to http.
        assert_eq!(
            target_parts("gopher://example.net/"),
            Some((
                "http".to_string(),
                "example.net".to_string(),
                "example.net".to_string()
            ))
        );
        assert_eq!(target_parts("not a url"), None);
    }

    #[test]
    fn test_parse_header_map_stringifies_scalars() {
        let map = parse_header_map(r#"{"a": "x", "b": 7}"#).unwrap();
        assert_eq!(map.get("a").map(String::as_str), Some("x"));
        assert_eq!(map.get("b").map(String::as_str), Some("7"));
        assert!(parse_header_map("[1,2]").is_none());
    }
}
