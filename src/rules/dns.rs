use crate::engine::{EvalContext, Predicate, Registry, ResultAction};
use crate::model::Request;
use tracing::warn;

pub fn register(registry: &mut Registry) {
    registry.register_predicate("dns.type", Box::new(DnsTypePredicate));
    registry.register_result("dns.data", Box::new(SetDataResult));
    registry.register_result("dns.ttl", Box::new(SetTtlResult));
    registry.register_result("dns.type", Box::new(SetTypeResult));
}

/// Query type is one of the comma-separated types in the parameter.
struct DnsTypePredicate;

impl Predicate for DnsTypePredicate {
    fn satisfied_by(&self, request: &Request, parameter: &str) -> bool {
        let Some(req) = request.as_dns() else {
            return false;
        };
        parameter
            .split(',')
            .any(|qtype| qtype.trim().eq_ignore_ascii_case(&req.qtype))
    }
}

/// Replaces the answer rdata with the JSON parameter.
struct SetDataResult;

#[async_trait::async_trait]
impl ResultAction for SetDataResult {
    async fn execute(&self, ctx: &mut EvalContext<'_>, parameter: &str) {
        let data = match serde_json::from_str(parameter) {
            Ok(data) => data,
            Err(e) => {
                warn!("malformed dns.data parameter: {}", e);
                return;
            }
        };
        if let Some(resp) = ctx.response.as_dns_mut() {
            resp.rdata = data;
        }
    }
}

struct SetTtlResult;

#[async_trait::async_trait]
impl ResultAction for SetTtlResult {
    async fn execute(&self, ctx: &mut EvalContext<'_>, parameter: &str) {
        let ttl = match parameter.trim().parse() {
            Ok(ttl) => ttl,
            Err(_) => {
                warn!("dns.ttl is not an integer: {}", parameter);
                return;
            }
        };
        if let Some(resp) = ctx.response.as_dns_mut() {
            resp.ttl = ttl;
        }
    }
}

/// Overrides the answer type (the rdata normally changes with it).
struct SetTypeResult;

#[async_trait::async_trait]
impl ResultAction for SetTypeResult {
    async fn execute(&self, ctx: &mut EvalContext<'_>, parameter: &str) {
        if let Some(resp) = ctx.response.as_dns_mut() {
            resp.rtype = parameter.trim().to_string();
        }
    }
}
