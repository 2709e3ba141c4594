use crate::engine::RuleEngine;
use crate::fqdn::{self, FqdnMatcher};
use crate::model::{HttpRequest, HttpResponse, Request, Response};
use crate::recorder::Recorder;
use anyhow::Context;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{CONTENT_LENGTH, HOST, HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const MAX_CONTENT_LENGTH: usize = 10 * 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS", "HEAD"];

/// Strips an optional port off a Host header and normalises the rest.
fn normalize_host(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let host = match raw.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => raw,
    };
    fqdn::normalize(host)
}

fn decode_body(bytes: &Bytes) -> (Option<String>, Option<String>) {
    if bytes.is_empty() {
        return (None, None);
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => (Some(text.to_string()), None),
        Err(_) => (None, Some(BASE64.encode(bytes))),
    }
}

fn status_only(code: u16) -> hyper::Response<Full<Bytes>> {
    let mut response = hyper::Response::new(Full::new(Bytes::new()));
    *response.status_mut() = hyper::StatusCode::from_u16(code).unwrap_or(hyper::StatusCode::OK);
    response
}

/// Puts a rule-built response on the wire. Status codes outside the
/// sendable range fall back to 200, and the client never controls the
/// emitted Content-Length: hyper frames the final body itself.
fn emit_response(http_response: &HttpResponse) -> hyper::Response<Full<Bytes>> {
    let code = if (100..=599).contains(&http_response.status_code) {
        http_response.status_code as u16
    } else {
        warn!(
            "invalid status code {}, sending default",
            http_response.status_code
        );
        200
    };

    let mut response =
        hyper::Response::new(Full::new(Bytes::from(http_response.body.clone().into_bytes())));
    *response.status_mut() = hyper::StatusCode::from_u16(code).unwrap_or(hyper::StatusCode::OK);

    for (name, value) in &http_response.headers {
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!("skipping invalid response header name: {}", name);
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            warn!("skipping invalid response header value for {}", name);
            continue;
        };
        response.headers_mut().insert(name, value);
    }
    response
}

/// Certificate/key material for the TLS side of the listener. rustls only
/// speaks TLS 1.2/1.3 with modern suites and never compresses.
pub fn load_tls_config(crt: &Path, key: &Path) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let crt_file =
        File::open(crt).with_context(|| format!("tls cert file {} not found", crt.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(crt_file))
        .collect::<Result<Vec<_>, _>>()
        .context("unable to parse tls cert file")?;

    let key_file =
        File::open(key).with_context(|| format!("tls key file {} not found", key.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .context("unable to parse tls key file")?
        .context("tls key file holds no private key")?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid tls certificate/key pair")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Task-per-connection HTTP/1.1 responder, optionally behind TLS.
pub struct HttpListener {
    matcher: Arc<FqdnMatcher>,
    engine: Arc<RuleEngine>,
    recorder: Arc<Recorder>,
    tls: Option<TlsAcceptor>,
}

impl HttpListener {
    pub fn new(
        matcher: Arc<FqdnMatcher>,
        engine: Arc<RuleEngine>,
        recorder: Arc<Recorder>,
        tls: Option<TlsAcceptor>,
    ) -> Self {
        HttpListener {
            matcher,
            engine,
            recorder,
            tls,
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                },
            };
            let this = self.clone();
            tokio::spawn(async move { this.handle_connection(stream, peer).await });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        match self.tls.clone() {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => self.serve_io(tls_stream, peer, true).await,
                Err(e) => debug!("tls handshake with {} failed: {}", peer, e),
            },
            None => self.serve_io(stream, peer, false).await,
        }
    }

    async fn serve_io<I>(self: Arc<Self>, io: I, peer: SocketAddr, tls: bool)
    where
        I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let this = self.clone();
        let service = service_fn(move |req| {
            let this = this.clone();
            async move { Ok::<_, Infallible>(this.handle(req, peer.ip(), tls).await) }
        });

        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .header_read_timeout(READ_TIMEOUT)
            .auto_date_header(false);
        if let Err(e) = builder.serve_connection(TokioIo::new(io), service).await {
            debug!("connection from {} ended: {}", peer, e);
        }
    }

    async fn handle(
        &self,
        req: hyper::Request<Incoming>,
        remote_addr: IpAddr,
        tls: bool,
    ) -> hyper::Response<Full<Bytes>> {
        metrics::counter!("http_requests_total").increment(1);

        let method = req.method().as_str().to_uppercase();
        if !ALLOWED_METHODS.contains(&method.as_str()) {
            warn!("invalid method {}", method);
            return status_only(405);
        }

        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        if !path.starts_with('/') {
            warn!("invalid path {}", path);
            return status_only(400);
        }

        let declared_len = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        if declared_len > MAX_CONTENT_LENGTH {
            warn!(
                "content length {} exceeds maximum {}",
                declared_len, MAX_CONTENT_LENGTH
            );
            return status_only(413);
        }

        let version = format!("{:?}", req.version());
        let (parts, body) = req.into_parts();

        let body_bytes = match Limited::new(body, MAX_CONTENT_LENGTH).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("error reading body content: {}", e);
                return status_only(413);
            }
        };

        // The domain list is never revealed: anything we do not serve gets
        // the same silent empty reply.
        let host_raw = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let Some(req_fqdn) = normalize_host(host_raw) else {
            return emit_response(&HttpResponse::empty());
        };

        let matched = match self.matcher.resolve(&req_fqdn).await {
            Ok(matched) => matched,
            Err(e) => {
                warn!("domain lookup failed: {}", e);
                None
            }
        };
        let Some(matched) = matched else {
            return emit_response(&HttpResponse::empty());
        };
        let Some(zone) = matched.zone else {
            debug!("zone not found for request {}", req_fqdn);
            return emit_response(&HttpResponse::empty());
        };

        let mut headers = BTreeMap::new();
        for (name, value) in parts.headers.iter() {
            headers.insert(
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            );
        }
        let (body, body_b64) = decode_body(&body_bytes);

        let request = Request::Http(HttpRequest {
            req_fqdn,
            zone_fqdn: zone,
            remote_addr,
            method,
            path,
            version,
            headers,
            body,
            body_b64,
            tls,
        });

        let response = self.engine.respond(&request).await;
        let http_response = match &response {
            Response::Http(r) => r.clone(),
            Response::Dns(_) => {
                error!("engine produced a non-http response");
                HttpResponse::empty()
            }
        };

        let wire = emit_response(&http_response);

        let recorder = self.recorder.clone();
        tokio::spawn(async move { recorder.record(&request, &response).await });

        wire
    }
}
