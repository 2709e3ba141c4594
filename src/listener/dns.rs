use crate::defaults::DefaultFactory;
use crate::engine::RuleEngine;
use crate::fqdn::{self, FqdnMatcher};
use crate::model::{DnsRequest, DnsResponse, Request, Response};
use crate::recorder::Recorder;
use crate::store::Store;
use hickory_proto::op::{Edns, Header, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::caa::CAA;
use hickory_proto::rr::rdata::{A, AAAA, CNAME, MX, NS, SOA, TXT};
use hickory_proto::rr::{DNSClass, IntoName, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecoder, Restrict};
use hickory_server::authority::{MessageResponse, MessageResponseBuilder};
use hickory_server::server::{Request as DnsMessage, RequestHandler, ResponseHandler, ResponseInfo};
use serde_json::json;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, instrument, warn};
use url::Url;

const VERSION_BIND: &str = "version.bind.";
const VERSION_STRING: &str = "dusseldorf";
const DEFAULT_TTL: u32 = 60;

fn record_name(raw: &str) -> Option<Name> {
    let absolute = if raw.ends_with('.') {
        raw.to_string()
    } else {
        format!("{}.", raw)
    };
    Name::from_ascii(&absolute).ok()
}

fn json_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn caa_rdata(flags: u8, tag: &str, value: &str) -> Option<CAA> {
    let issuer_critical = flags & 0x80 != 0;
    let caa = match tag {
        "issue" => CAA::new_issue(issuer_critical, Name::from_ascii(value).ok(), Vec::new()),
        "issuewild" => CAA::new_issuewild(issuer_critical, Name::from_ascii(value).ok(), Vec::new()),
        "iodef" => CAA::new_iodef(issuer_critical, Url::parse(value).ok()?),
        other => {
            let tag_bytes = other.as_bytes();
            let value_bytes = value.as_bytes();
            let mut wire = Vec::with_capacity(2 + tag_bytes.len() + value_bytes.len());
            wire.push(flags);
            wire.push(u8::try_from(tag_bytes.len()).ok()?);
            wire.extend_from_slice(tag_bytes);
            wire.extend_from_slice(value_bytes);
            let mut decoder = BinDecoder::new(&wire);
            let length = Restrict::new(u16::try_from(wire.len()).ok()?);
            match RData::read(&mut decoder, RecordType::CAA, length).ok()? {
                RData::CAA(caa) => caa,
                _ => return None,
            }
        }
    };
    Some(caa)
}

/// Turns a response into an answer record. Unsupported types degrade to an
/// empty TXT; missing or unusable rdata yields `None` and the caller
/// answers NXDOMAIN.
fn make_record(response: &DnsResponse) -> Option<Record> {
    let name = record_name(&response.rname)?;
    let data = &response.rdata;

    let rdata = match response.rtype().as_str() {
        "A" => {
            let ip = data.get("ip")?.as_str()?;
            let addr: Ipv4Addr = ip.parse().unwrap_or_else(|_| {
                warn!("invalid ipv4 address: {}", ip);
                Ipv4Addr::UNSPECIFIED
            });
            RData::A(A(addr))
        }
        "AAAA" => {
            let ip = data.get("ip")?.as_str()?;
            let addr: Ipv6Addr = ip.parse().unwrap_or_else(|_| {
                warn!("invalid ipv6 address: {}", ip);
                Ipv6Addr::UNSPECIFIED
            });
            RData::AAAA(AAAA(addr))
        }
        "CNAME" => {
            let target = data.get("cname")?.as_str()?;
            RData::CNAME(CNAME(Name::from_ascii(target).ok()?))
        }
        "MX" => {
            let exchange = data.get("name")?.as_str()?;
            let priority = data.get("priority").and_then(json_u64)? as u16;
            RData::MX(MX::new(priority, Name::from_ascii(exchange).ok()?))
        }
        "NS" => {
            let target = data.get("ns")?.as_str()?;
            RData::NS(NS(Name::from_ascii(target).ok()?))
        }
        "CAA" => {
            let flags = data.get("flags").and_then(json_u64).unwrap_or(0) as u8;
            let tag = data.get("tag")?.as_str()?;
            let value = data.get("value")?.as_str()?;
            RData::CAA(caa_rdata(flags, tag, value)?)
        }
        "SOA" => {
            let mname = Name::from_ascii(data.get("mname")?.as_str()?).ok()?;
            let rname = Name::from_ascii(data.get("rname")?.as_str()?).ok()?;
            let times = data.get("times")?.as_array()?;
            if times.len() != 5 {
                return None;
            }
            let t = |i: usize| times.get(i).and_then(json_u64);
            RData::SOA(SOA::new(
                mname,
                rname,
                t(0)? as u32,
                t(1)? as i32,
                t(2)? as i32,
                t(3)? as i32,
                t(4)? as u32,
            ))
        }
        "TXT" => RData::TXT(TXT::new(vec![data.get("txt")?.as_str()?.to_string()])),
        other => {
            warn!("unsupported answer type: {}", other);
            RData::TXT(TXT::new(Vec::new()))
        }
    };

    let mut record = Record::from_rdata(name, response.ttl, rdata);
    record.set_dns_class(DNSClass::IN);
    Some(record)
}

fn version_bind_record() -> Record {
    let name = Name::from_ascii(VERSION_BIND).unwrap();
    let mut record = Record::from_rdata(
        name,
        0,
        RData::TXT(TXT::new(vec![VERSION_STRING.to_string()])),
    );
    record.set_dns_class(DNSClass::IN);
    record
}

/// The authoritative responder for every registered domain: resolves the
/// query name to a zone, runs the rule engine, and records the exchange.
pub struct ZoneRequestHandler {
    store: Arc<dyn Store>,
    matcher: Arc<FqdnMatcher>,
    engine: Arc<RuleEngine>,
    defaults: Arc<DefaultFactory>,
    recorder: Arc<Recorder>,
}

impl ZoneRequestHandler {
    pub fn new(
        store: Arc<dyn Store>,
        matcher: Arc<FqdnMatcher>,
        engine: Arc<RuleEngine>,
        defaults: Arc<DefaultFactory>,
        recorder: Arc<Recorder>,
    ) -> Self {
        ZoneRequestHandler {
            store,
            matcher,
            engine,
            defaults,
            recorder,
        }
    }

    fn dns_request(
        fqdn: &str,
        zone_fqdn: &str,
        qtype: &str,
        remote_addr: IpAddr,
        domain: &str,
    ) -> DnsRequest {
        DnsRequest {
            req_fqdn: fqdn.to_string(),
            zone_fqdn: zone_fqdn.to_string(),
            qtype: qtype.to_string(),
            remote_addr,
            domain: domain.to_string(),
            ttl: DEFAULT_TTL,
        }
    }

    /// Apex, `ns1.` and `ns2.` answers are fixed and never consult rules.
    /// Returns `None` when the name is not reserved; an empty answer set
    /// means synthesis failed and the reply should be NXDOMAIN.
    async fn reserved_answers(
        &self,
        fqdn: &str,
        domain: &str,
        qtype: &str,
        remote_addr: IpAddr,
    ) -> Option<Vec<Record>> {
        let reserved = fqdn == domain
            || fqdn == format!("ns1.{}", domain)
            || fqdn == format!("ns2.{}", domain);
        if !reserved {
            return None;
        }

        let req = Self::dns_request(fqdn, "", qtype, remote_addr, domain);
        let response = self.defaults.dns_default(&req).await;
        let Some(record) = make_record(&response) else {
            warn!("could not make rr for zone request {}/{}", qtype, fqdn);
            return Some(Vec::new());
        };
        let mut answers = vec![record];

        if qtype == "CAA" && fqdn == domain {
            let contact = self.defaults.contact(domain);
            let extras = [
                json!({ "flags": 0, "tag": "contactemail", "value": contact }),
                json!({ "flags": 0, "tag": "iodef", "value": format!("mailto:{}", contact) }),
            ];
            for rdata in extras {
                let extra = DnsResponse {
                    rtype: "CAA".to_string(),
                    rname: fqdn.to_string(),
                    rdata,
                    ttl: DEFAULT_TTL,
                };
                if let Some(record) = make_record(&extra) {
                    answers.push(record);
                }
            }
        }

        Some(answers)
    }

    async fn answer<R: ResponseHandler>(
        &self,
        response_edns: Option<Edns>,
        request: &DnsMessage,
        response_handle: R,
        answers: &[Record],
    ) -> anyhow::Result<ResponseInfo> {
        let response_builder = MessageResponseBuilder::from_message_request(request);
        let mut response_header = Header::response_from_request(request.header());
        response_header.set_response_code(ResponseCode::NoError);
        response_header.set_authoritative(true);

        let response = response_builder.build(
            response_header,
            answers,
            &[] as &[Record],
            &[] as &[Record],
            &[] as &[Record],
        );
        Ok(send_response(response_edns, response, response_handle).await?)
    }

    async fn refuse<R: ResponseHandler>(
        &self,
        response_edns: Option<Edns>,
        request: &DnsMessage,
        response_handle: R,
        code: ResponseCode,
    ) -> anyhow::Result<ResponseInfo> {
        let response_builder = MessageResponseBuilder::from_message_request(request);
        let mut response_header = Header::response_from_request(request.header());
        response_header.set_response_code(code);
        response_header.set_authoritative(true);

        let response = response_builder.build_no_records(response_header);
        Ok(send_response(response_edns, response, response_handle).await?)
    }

    #[instrument(skip_all)]
    async fn handle_query<R: ResponseHandler>(
        &self,
        response_edns: Option<Edns>,
        request: &DnsMessage,
        response_handle: R,
    ) -> anyhow::Result<ResponseInfo> {
        let request_info = request.request_info()?;

        let name = request_info.query.name().into_name()?;
        let qtype = request_info.query.query_type().to_string().to_uppercase();
        let raw_name = name.to_string().to_ascii_lowercase();
        let remote_addr = request_info.src.ip();

        if raw_name == VERSION_BIND {
            let answers = [version_bind_record()];
            return self
                .answer(response_edns, request, response_handle, &answers)
                .await;
        }

        let Some(fqdn) = fqdn::normalize(&raw_name) else {
            debug!("malformed query name {}", raw_name);
            metrics::counter!("dns_refused_total").increment(1);
            return self
                .refuse(response_edns, request, response_handle, ResponseCode::NXDomain)
                .await;
        };

        let domain = match self.matcher.domain_for(&fqdn).await {
            Ok(Some(domain)) => domain,
            Ok(None) => {
                debug!("not a registered domain: {}", fqdn);
                metrics::counter!("dns_refused_total").increment(1);
                return self
                    .refuse(response_edns, request, response_handle, ResponseCode::NXDomain)
                    .await;
            }
            Err(e) => {
                warn!("domain lookup failed: {}", e);
                return self
                    .refuse(response_edns, request, response_handle, ResponseCode::NXDomain)
                    .await;
            }
        };

        if let Some(answers) = self
            .reserved_answers(&fqdn, &domain, &qtype, remote_addr)
            .await
        {
            return if answers.is_empty() {
                self.refuse(response_edns, request, response_handle, ResponseCode::NXDomain)
                    .await
            } else {
                self.answer(response_edns, request, response_handle, &answers)
                    .await
            };
        }

        let zone = match self.store.zone_for_fqdn(&fqdn).await {
            Ok(zone) => zone,
            Err(e) => {
                warn!("zone lookup failed: {}", e);
                None
            }
        };

        let Some(zone) = zone else {
            // Names under a live domain but outside any zone still get a
            // benign typed answer; only foreign names see NXDOMAIN.
            let req = Self::dns_request(&fqdn, "", &qtype, remote_addr, &domain);
            let response = self.defaults.dns_default(&req).await;
            metrics::counter!("dns_default_total").increment(1);
            return match make_record(&response) {
                Some(record) => {
                    let answers = [record];
                    self.answer(response_edns, request, response_handle, &answers)
                        .await
                }
                None => {
                    warn!("could not make rr for {}/{}", qtype, fqdn);
                    self.refuse(response_edns, request, response_handle, ResponseCode::NXDomain)
                        .await
                }
            };
        };

        let started = Instant::now();
        let req = Request::Dns(Self::dns_request(&fqdn, &zone, &qtype, remote_addr, &domain));
        let response = self.engine.respond(&req).await;

        let Response::Dns(dns_response) = &response else {
            error!("engine produced a non-dns response for {}", fqdn);
            return self
                .refuse(response_edns, request, response_handle, ResponseCode::ServFail)
                .await;
        };
        let Some(record) = make_record(dns_response) else {
            warn!("could not make rr for {}/{}", qtype, fqdn);
            return self
                .refuse(response_edns, request, response_handle, ResponseCode::NXDomain)
                .await;
        };
        let resolve_seconds = started.elapsed().as_secs_f64();

        metrics::counter!("dns_answered_total").increment(1);
        let answers = [record];
        let response_info = self
            .answer(response_edns, request, response_handle, &answers)
            .await?;

        let write_started = Instant::now();
        self.recorder.record(&req, &response).await;
        debug!(
            "dns resp: {:.3} s, db write: {:.3} s",
            resolve_seconds,
            write_started.elapsed().as_secs_f64()
        );

        Ok(response_info)
    }

    #[instrument(skip_all)]
    async fn server_not_implement<R: ResponseHandler>(
        &self,
        response_edns: Option<Edns>,
        request: &DnsMessage,
        response_handle: R,
    ) -> anyhow::Result<ResponseInfo> {
        let response = MessageResponseBuilder::from_message_request(request);
        let response_info = send_response(
            response_edns,
            response.error_msg(request.header(), ResponseCode::NotImp),
            response_handle,
        )
        .await?;

        Ok(response_info)
    }
}

#[async_trait::async_trait]
impl RequestHandler for ZoneRequestHandler {
    #[instrument(skip_all, fields(dns.src, dns.name, dns.query_type, dns.op_code, dns.response_code))]
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &DnsMessage,
        mut response_handle: R,
    ) -> ResponseInfo {
        match request.request_info() {
            Ok(request_info) => {
                {
                    let src = request_info.src.to_string();
                    tracing::Span::current().record("dns.src", &src);
                    let name = request_info.query.name().to_string();
                    tracing::Span::current().record("dns.name", &name);
                    let query_type = request_info.query.query_type().to_string();
                    tracing::Span::current().record("dns.query_type", &query_type);
                    let op_code = request_info.header.op_code().to_string();
                    tracing::Span::current().record("dns.op_code", &op_code);
                };

                metrics::counter!("dns_requests_total").increment(1);

                // check if it's edns
                let response_edns = if let Some(req_edns) = request.edns() {
                    let mut response = MessageResponseBuilder::from_message_request(request);
                    let mut response_header = Header::response_from_request(request.header());

                    let mut resp_edns: Edns = Edns::new();

                    let our_version = 0;
                    resp_edns.set_dnssec_ok(req_edns.flags().dnssec_ok);
                    resp_edns.set_max_payload(1232);
                    resp_edns.set_version(our_version);

                    if req_edns.version() > our_version {
                        warn!(
                            "request edns version greater than {}: {}",
                            our_version,
                            req_edns.version()
                        );
                        response_header.set_response_code(ResponseCode::BADVERS);
                        resp_edns.set_rcode_high(ResponseCode::BADVERS.high());
                        response.edns(resp_edns);

                        let result = response_handle
                            .send_response(response.build_no_records(response_header))
                            .await;

                        return result.unwrap_or_else(|e| {
                            error!("request error: {}", e);
                            let mut header = Header::response_from_request(request.header());
                            header.set_response_code(ResponseCode::ServFail);
                            header.into()
                        });
                    }

                    Some(resp_edns)
                } else {
                    None
                };

                let result = match request.message_type() {
                    MessageType::Query => match request.op_code() {
                        OpCode::Query => {
                            self.handle_query(response_edns, request, response_handle)
                                .await
                        }
                        c => {
                            warn!("unimplemented op_code: {:?}", c);
                            self.server_not_implement(response_edns, request, response_handle)
                                .await
                        }
                    },
                    MessageType::Response => {
                        self.server_not_implement(response_edns, request, response_handle)
                            .await
                    }
                };

                match result {
                    Ok(response_info) => {
                        let response_code = response_info.response_code().to_string();
                        tracing::Span::current().record("dns.response_code", &response_code);
                        response_info
                    }
                    Err(e) => {
                        error!("request failed: {}", e);
                        tracing::Span::current()
                            .record("dns.response_code", ResponseCode::ServFail.to_string());
                        let mut header = Header::response_from_request(request.header());
                        header.set_response_code(ResponseCode::ServFail);
                        header.into()
                    }
                }
            }
            Err(e) => {
                error!("request failed: {}", e);
                tracing::Span::current()
                    .record("dns.response_code", ResponseCode::ServFail.to_string());
                let mut header = Header::response_from_request(request.header());
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}

#[instrument(skip_all)]
async fn send_response<'a, R: ResponseHandler>(
    response_edns: Option<Edns>,
    mut response: MessageResponse<
        '_,
        'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
    >,
    mut response_handle: R,
) -> io::Result<ResponseInfo> {
    if let Some(resp_edns) = response_edns {
        response.set_edns(resp_edns);
    }

    response_handle.send_response(response).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(rtype: &str, rdata: serde_json::Value) -> DnsResponse {
        DnsResponse {
            rtype: rtype.to_string(),
            rname: "foo.z.d.test".to_string(),
            rdata,
            ttl: 60,
        }
    }

    #[test]
    fn test_make_a_record() {
        let record = make_record(&response("A", json!({"ip": "1.1.1.1"}))).unwrap();
        assert_eq!(record.record_type(), hickory_proto::rr::RecordType::A);
        assert_eq!(record.ttl(), 60);
        assert_eq!(record.name().to_string(), "foo.z.d.test.");
        match record.data() {
            RData::A(a) => assert_eq!(a.0, Ipv4Addr::new(1, 1, 1, 1)),
            other => panic!("unexpected rdata {:?}", other),
        }
    }

    #[test]
    fn test_make_a_record_invalid_ip_degrades() {
        let record = make_record(&response("A", json!({"ip": "not-an-ip"}))).unwrap();
        match record.data() {
            RData::A(a) => assert_eq!(a.0, Ipv4Addr::UNSPECIFIED),
            other => panic!("unexpected rdata {:?}", other),
        }
    }

    #[test]
    fn test_make_aaaa_record_invalid_ip_degrades() {
        let record = make_record(&response("AAAA", json!({"ip": "nope"}))).unwrap();
        match record.data() {
            RData::AAAA(a) => assert_eq!(a.0, Ipv6Addr::UNSPECIFIED),
            other => panic!("unexpected rdata {:?}", other),
        }
    }

    #[test]
    fn test_make_cname_and_mx_records() {
        let record = make_record(&response("CNAME", json!({"cname": "cname.d.test."}))).unwrap();
        assert_eq!(record.record_type(), hickory_proto::rr::RecordType::CNAME);

        let record = make_record(&response(
            "MX",
            json!({"name": "mail.d.test", "priority": 10}),
        ))
        .unwrap();
        match record.data() {
            RData::MX(mx) => {
                assert_eq!(mx.preference(), 10);
                assert_eq!(mx.exchange().to_string(), "mail.d.test");
            }
            other => panic!("unexpected rdata {:?}", other),
        }
    }

    #[test]
    fn test_make_soa_record() {
        let record = make_record(&response(
            "SOA",
            json!({
                "mname": "1.1.1.1",
                "rname": "info.d.test",
                "times": [2025022101u32, 7200, 10800, 259200, 3600],
            }),
        ))
        .unwrap();
        match record.data() {
            RData::SOA(soa) => {
                assert_eq!(soa.serial(), 2025022101);
                assert_eq!(soa.minimum(), 3600);
            }
            other => panic!("unexpected rdata {:?}", other),
        }
    }

    #[test]
    fn test_make_txt_record() {
        let record = make_record(&response("TXT", json!({"txt": "hello"}))).unwrap();
        match record.data() {
            RData::TXT(txt) => {
                let joined: String = txt.iter().map(|b| String::from_utf8_lossy(b)).collect();
                assert_eq!(joined, "hello");
            }
            other => panic!("unexpected rdata {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_type_degrades_to_empty_txt() {
        let record = make_record(&response("WKS", json!({}))).unwrap();
        assert_eq!(record.record_type(), hickory_proto::rr::RecordType::TXT);
    }

    #[test]
    fn test_missing_rdata_yields_none() {
        assert!(make_record(&response("A", json!({}))).is_none());
        assert!(make_record(&response("MX", json!({"name": "x"}))).is_none());
        assert!(make_record(&response("SOA", json!({"mname": "a", "rname": "b", "times": [1]}))).is_none());
    }

    #[test]
    fn test_caa_records() {
        let record = make_record(&response(
            "CAA",
            json!({"flags": 0, "tag": "issue", "value": "letsencrypt.org"}),
        ))
        .unwrap();
        assert_eq!(record.record_type(), hickory_proto::rr::RecordType::CAA);

        let record = make_record(&response(
            "CAA",
            json!({"flags": 0, "tag": "iodef", "value": "mailto:info@d.test"}),
        ))
        .unwrap();
        assert_eq!(record.record_type(), hickory_proto::rr::RecordType::CAA);

        let record = make_record(&response(
            "CAA",
            json!({"flags": 0, "tag": "contactemail", "value": "info@d.test"}),
        ))
        .unwrap();
        match record.data() {
            RData::CAA(caa) => {
                assert_eq!(*caa.tag(), hickory_proto::rr::rdata::caa::Property::Unknown("contactemail".to_string()));
            }
            other => panic!("unexpected rdata {:?}", other),
        }
    }

    #[test]
    fn test_version_bind_record() {
        let record = version_bind_record();
        assert_eq!(record.name().to_string(), VERSION_BIND);
        assert_eq!(record.record_type(), hickory_proto::rr::RecordType::TXT);
    }

    #[test]
    fn test_record_name_appends_root() {
        assert_eq!(
            record_name("foo.z.d.test").unwrap().to_string(),
            "foo.z.d.test."
        );
        assert_eq!(
            record_name("foo.z.d.test.").unwrap().to_string(),
            "foo.z.d.test."
        );
    }

    struct NoOutbound;

    #[async_trait::async_trait]
    impl crate::passthru::Outbound for NoOutbound {
        async fn is_safe(&self, _host: &str) -> bool {
            false
        }
        async fn send(
            &self,
            _request: crate::passthru::OutboundRequest,
        ) -> anyhow::Result<crate::passthru::OutboundResponse> {
            anyhow::bail!("no network in tests")
        }
    }

    fn make_handler(store: Arc<crate::store::MemoryStore>) -> ZoneRequestHandler {
        let defaults = Arc::new(DefaultFactory::new(
            store.clone(),
            vec![],
            "letsencrypt.org".to_string(),
            None,
            2025022101,
        ));
        let matcher = Arc::new(FqdnMatcher::new(store.clone()));
        let engine = Arc::new(RuleEngine::new(
            store.clone(),
            defaults.clone(),
            Arc::new(NoOutbound),
        ));
        let recorder = Arc::new(Recorder::new(store.clone()));
        ZoneRequestHandler::new(store, matcher, engine, defaults, recorder)
    }

    #[tokio::test]
    async fn test_reserved_answers_cover_apex_and_ns_labels() {
        use crate::store::MemoryStore;

        let store = Arc::new(MemoryStore::new());
        store.add_domain("d.test", &["1.1.1.1"]).await;
        let handler = make_handler(store);

        let remote: IpAddr = "203.0.113.7".parse().unwrap();

        assert!(
            handler
                .reserved_answers("foo.d.test", "d.test", "A", remote)
                .await
                .is_none()
        );

        let apex = handler
            .reserved_answers("d.test", "d.test", "A", remote)
            .await
            .unwrap();
        assert_eq!(apex.len(), 1);

        let ns1 = handler
            .reserved_answers("ns1.d.test", "d.test", "A", remote)
            .await
            .unwrap();
        assert_eq!(ns1.len(), 1);

        // Apex CAA queries pick up the contact and iodef extras.
        let caa = handler
            .reserved_answers("d.test", "d.test", "CAA", remote)
            .await
            .unwrap();
        assert_eq!(caa.len(), 3);

        let ns1_caa = handler
            .reserved_answers("ns1.d.test", "d.test", "CAA", remote)
            .await
            .unwrap();
        assert_eq!(ns1_caa.len(), 1);
    }

    #[tokio::test]
    async fn test_udp_end_to_end() {
        use crate::model::Protocol;
        use crate::store::MemoryStore;
        use hickory_client::client::{Client, ClientHandle};
        use hickory_proto::rr::RecordType;
        use hickory_proto::runtime::TokioRuntimeProvider;
        use hickory_proto::udp::UdpClientStream;
        use hickory_server::ServerFuture;

        let store = Arc::new(MemoryStore::new());
        store.add_domain("d.test", &["1.1.1.1"]).await;
        store.add_zone("z.d.test", "d.test").await;
        store.add_zone("r.d.test", "d.test").await;
        store
            .add_rule(
                "r1",
                "r.d.test",
                Protocol::Dns,
                100,
                &[
                    (true, "dns.type", "A"),
                    (false, "dns.data", r#"{"ip": "9.9.9.9"}"#),
                ],
            )
            .await;

        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = socket.local_addr().unwrap();
        let mut server = ServerFuture::new(make_handler(store.clone()));
        server.register_socket(socket);
        tokio::spawn(async move {
            let _ = server.block_until_done().await;
        });

        let conn = UdpClientStream::builder(server_addr, TokioRuntimeProvider::new()).build();
        let (mut client, bg) = Client::connect(conn).await.unwrap();
        tokio::spawn(bg);

        // Foreign name: NXDOMAIN without answers.
        let resp = client
            .query(
                Name::from_ascii("other.example.").unwrap(),
                DNSClass::IN,
                RecordType::A,
            )
            .await
            .unwrap();
        assert_eq!(resp.response_code(), ResponseCode::NXDomain);
        assert!(resp.answers().is_empty());

        // Registered domain without a zone: a benign typed answer.
        let resp = client
            .query(
                Name::from_ascii("stray.d.test.").unwrap(),
                DNSClass::IN,
                RecordType::A,
            )
            .await
            .unwrap();
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert_eq!(resp.answers().len(), 1);

        // Zone without rules: answer from the public pool.
        let resp = client
            .query(
                Name::from_ascii("foo.z.d.test.").unwrap(),
                DNSClass::IN,
                RecordType::A,
            )
            .await
            .unwrap();
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        match resp.answers()[0].data() {
            RData::A(a) => assert_eq!(a.0, Ipv4Addr::new(1, 1, 1, 1)),
            other => panic!("unexpected rdata {:?}", other),
        }

        // Rule override on the other zone.
        let resp = client
            .query(
                Name::from_ascii("r.d.test.").unwrap(),
                DNSClass::IN,
                RecordType::A,
            )
            .await
            .unwrap();
        match resp.answers()[0].data() {
            RData::A(a) => assert_eq!(a.0, Ipv4Addr::new(9, 9, 9, 9)),
            other => panic!("unexpected rdata {:?}", other),
        }

        // Apex CAA queries carry the contact and iodef extras.
        let resp = client
            .query(
                Name::from_ascii("d.test.").unwrap(),
                DNSClass::IN,
                RecordType::CAA,
            )
            .await
            .unwrap();
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert_eq!(resp.answers().len(), 3);

        // version.bind answers its banner before any domain checks.
        let resp = client
            .query(
                Name::from_ascii(VERSION_BIND).unwrap(),
                DNSClass::CH,
                RecordType::TXT,
            )
            .await
            .unwrap();
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert_eq!(resp.answers().len(), 1);

        // Zone-bound queries land in the interaction log.
        let mut summaries: Vec<String> = Vec::new();
        for _ in 0..100 {
            summaries = store
                .recorded_interactions()
                .await
                .iter()
                .map(|(_, i)| i.reqsummary.clone())
                .collect();
            if summaries.len() >= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(summaries.contains(&"A/foo.z.d.test".to_string()));
        assert!(summaries.contains(&"A/r.d.test".to_string()));
        // Reserved and zoneless names never reach the recorder.
        assert!(!summaries.iter().any(|s| s.contains("stray")));
    }
}
