use crate::defaults::DefaultFactory;
use crate::model::{Protocol, Request, Response};
use crate::passthru::Outbound;
use crate::rules;
use crate::store::Store;
use rand::distributions::{Distribution, WeightedIndex};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Mutable state shared by the result actions of one matched rule.
pub struct EvalContext<'a> {
    pub response: Response,
    pub zone: String,
    pub request: &'a Request,
    pub rule_id: String,
    pub component_id: String,
}

/// A boolean test over a request, keyed by catalogue name.
pub trait Predicate: Send + Sync {
    fn satisfied_by(&self, request: &Request, parameter: &str) -> bool;
}

/// An action that mutates the evaluation context's response.
#[async_trait::async_trait]
pub trait ResultAction: Send + Sync {
    async fn execute(&self, ctx: &mut EvalContext<'_>, parameter: &str);
}

/// Name-keyed dispatch tables. New predicate or result kinds are added by
/// registering an implementation at engine init.
#[derive(Default)]
pub struct Registry {
    predicates: FxHashMap<&'static str, Box<dyn Predicate>>,
    results: FxHashMap<&'static str, Box<dyn ResultAction>>,
}

impl Registry {
    pub fn register_predicate(&mut self, name: &'static str, predicate: Box<dyn Predicate>) {
        self.predicates.insert(name, predicate);
    }

    pub fn register_result(&mut self, name: &'static str, result: Box<dyn ResultAction>) {
        self.results.insert(name, result);
    }
}

/// Calculates the response to a request from the rules of its zone.
pub struct RuleEngine {
    store: Arc<dyn Store>,
    defaults: Arc<DefaultFactory>,
    dns: Registry,
    http: Registry,
}

impl RuleEngine {
    pub fn new(
        store: Arc<dyn Store>,
        defaults: Arc<DefaultFactory>,
        outbound: Arc<dyn Outbound>,
    ) -> Self {
        let mut dns = Registry::default();
        rules::dns::register(&mut dns);
        let mut http = Registry::default();
        rules::http::register(&mut http, outbound);
        RuleEngine {
            store,
            defaults,
            dns,
            http,
        }
    }

    fn registry_for(&self, protocol: Protocol) -> &Registry {
        match protocol {
            Protocol::Dns => &self.dns,
            Protocol::Http | Protocol::Https => &self.http,
        }
    }

    /// Walks the zone's rules in priority order and applies the first one
    /// whose predicates are all satisfied. Falls back to the default
    /// response when nothing matches or the store is unreachable.
    #[instrument(skip_all, fields(zone = request.zone_fqdn()))]
    pub async fn respond(&self, request: &Request) -> Response {
        let registry = self.registry_for(request.protocol());
        let rules = match self
            .store
            .predicates_for(request.zone_fqdn(), request.protocol())
            .await
        {
            Ok(rules) => rules,
            Err(e) => {
                warn!("rule lookup failed, serving default: {}", e);
                return self.defaults.response_for(request).await;
            }
        };

        for rule in &rules {
            if self.satisfied(registry, request, &rule.predicates) {
                debug!(rule_id = %rule.rule_id, "rule matched");
                return self.apply_rule(registry, request, &rule.rule_id).await;
            }
        }
        self.defaults.response_for(request).await
    }

    fn satisfied(
        &self,
        registry: &Registry,
        request: &Request,
        predicates: &[(String, String)],
    ) -> bool {
        for (name, value) in predicates {
            let Some(predicate) = registry.predicates.get(name.as_str()) else {
                warn!("unknown predicate type `{}`", name);
                continue;
            };
            // An empty parameter requires nothing.
            if value.is_empty() {
                continue;
            }
            if !predicate.satisfied_by(request, value) {
                return false;
            }
        }
        true
    }

    async fn apply_rule(
        &self,
        registry: &Registry,
        request: &Request,
        rule_id: &str,
    ) -> Response {
        let results = match self.store.results_for(rule_id).await {
            Ok(results) => results,
            Err(e) => {
                warn!("result lookup failed for rule {}: {}", rule_id, e);
                Vec::new()
            }
        };

        let mut ctx = EvalContext {
            response: self.defaults.response_for(request).await,
            zone: request.zone_fqdn().to_string(),
            request,
            rule_id: rule_id.to_string(),
            component_id: String::new(),
        };
        // Substitutions run after every other action of the rule so they
        // see the final body and header values.
        let mut deferred: Vec<(String, String)> = Vec::new();

        for component in &results {
            let (name, value) = match component.name.as_str() {
                "random" => match sample_random(&component.value) {
                    Some((name, value)) if name == "random" => {
                        warn!("nested random result skipped");
                        continue;
                    }
                    Some(sampled) => sampled,
                    None => continue,
                },
                _ => (component.name.clone(), component.value.clone()),
            };

            if name == "var" {
                deferred.push((component.component_id.clone(), value));
                continue;
            }

            let Some(action) = registry.results.get(name.as_str()) else {
                warn!("unknown result action `{}`", name);
                continue;
            };
            ctx.component_id = component.component_id.clone();
            action.execute(&mut ctx, &value).await;
        }

        for (component_id, value) in deferred {
            ctx.component_id = component_id;
            apply_var(&mut ctx, &value);
        }

        debug!(
            rule_id = %ctx.rule_id,
            last_component = %ctx.component_id,
            "rule results applied"
        );
        ctx.response
    }
}

#[derive(Deserialize)]
struct RandomChoice {
    #[serde(rename = "type")]
    kind: String,
    parameter: String,
}

#[derive(Deserialize)]
struct RandomSpec {
    results: Vec<RandomChoice>,
    weights: Vec<f64>,
}

/// Samples one sub-action from a `random` parameter. Returns `None` (and
/// logs) when the parameter is malformed, so the component is skipped.
fn sample_random(parameter: &str) -> Option<(String, String)> {
    let spec: RandomSpec = match serde_json::from_str(parameter) {
        Ok(spec) => spec,
        Err(e) => {
            warn!("malformed random parameter: {}", e);
            return None;
        }
    };
    if spec.results.is_empty()
        || spec.results.len() != spec.weights.len()
        || !spec.weights.iter().all(|w| (0.0..=1.0).contains(w))
    {
        warn!("random parameter fails validation, skipping");
        return None;
    }
    let index = WeightedIndex::new(&spec.weights)
        .ok()?
        .sample(&mut rand::thread_rng());
    let choice = &spec.results[index];
    Some((choice.kind.clone(), choice.parameter.clone()))
}

/// Substring substitution over the response body and header values.
/// `uuid()` and `zone()` on the replacement side expand before applying.
fn apply_var(ctx: &mut EvalContext<'_>, parameter: &str) {
    let Some((from, to)) = parameter.split_once(':') else {
        return;
    };
    if from.trim().is_empty() {
        return;
    }
    let to = match to {
        "uuid()" => Uuid::new_v4().to_string(),
        "zone()" => ctx.zone.clone(),
        other => other.to_string(),
    };

    if let Some(resp) = ctx.response.as_http_mut() {
        resp.body = resp.body.replace(from, &to);
        for value in resp.headers.values_mut() {
            if value.contains(from) {
                *value = value.replace(from, &to);
            }
        }
    }
}
