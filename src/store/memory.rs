use super::{Domain, Interaction, RulePredicates, RuleResultComponent, Store, StoreError};
use crate::model::Protocol;
use chrono::Utc;
use std::net::Ipv4Addr;
use tokio::sync::RwLock;

#[derive(Clone)]
struct StoredComponent {
    component_id: String,
    is_predicate: bool,
    name: String,
    value: String,
}

#[derive(Clone)]
struct StoredRule {
    rule_id: String,
    zone: String,
    protocol: String,
    priority: i32,
    components: Vec<StoredComponent>,
}

#[derive(Default)]
struct Inner {
    domains: Vec<Domain>,
    /// `(zone_fqdn, domain)` pairs.
    zones: Vec<(String, String)>,
    rules: Vec<StoredRule>,
    interactions: Vec<(i64, Interaction)>,
}

/// In-memory store with the same query semantics as the production backend.
/// Used by tests; the builder methods seed fixtures and
/// `recorded_interactions` inspects what the data plane wrote back.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_domain(&self, domain: &str, ips: &[&str]) {
        let public_ips = ips.iter().filter_map(|ip| ip.parse().ok()).collect();
        self.inner.write().await.domains.push(Domain {
            domain: domain.to_string(),
            public_ips,
        });
    }

    pub async fn add_zone(&self, fqdn: &str, domain: &str) {
        self.inner
            .write()
            .await
            .zones
            .push((fqdn.to_string(), domain.to_string()));
    }

    /// Adds a rule from `(is_predicate, name, value)` triples; component ids
    /// are generated.
    pub async fn add_rule(
        &self,
        rule_id: &str,
        zone: &str,
        protocol: Protocol,
        priority: i32,
        components: &[(bool, &str, &str)],
    ) {
        let components = components
            .iter()
            .enumerate()
            .map(|(i, (is_predicate, name, value))| StoredComponent {
                component_id: format!("{}-{}", rule_id, i),
                is_predicate: *is_predicate,
                name: name.to_string(),
                value: value.to_string(),
            })
            .collect();
        self.inner.write().await.rules.push(StoredRule {
            rule_id: rule_id.to_string(),
            zone: zone.to_string(),
            protocol: protocol.as_str().to_string(),
            priority,
            components,
        });
    }

    pub async fn recorded_interactions(&self) -> Vec<(i64, Interaction)> {
        self.inner.read().await.interactions.clone()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn domains(&self) -> Result<Vec<Domain>, StoreError> {
        Ok(self.inner.read().await.domains.clone())
    }

    async fn public_ips(&self, domain: &str) -> Result<Vec<Ipv4Addr>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .domains
            .iter()
            .find(|d| domain.is_empty() || d.domain == domain)
            .map(|d| d.public_ips.clone())
            .unwrap_or_default())
    }

    async fn zone_for_fqdn(&self, req_fqdn: &str) -> Result<Option<String>, StoreError> {
        let req_fqdn = req_fqdn.to_lowercase();
        let inner = self.inner.read().await;
        if let Some((fqdn, _)) = inner.zones.iter().find(|(fqdn, _)| *fqdn == req_fqdn) {
            return Ok(Some(fqdn.clone()));
        }
        Ok(inner
            .zones
            .iter()
            .filter(|(fqdn, _)| req_fqdn.ends_with(&format!(".{}", fqdn)))
            .max_by_key(|(fqdn, _)| fqdn.len())
            .map(|(fqdn, _)| fqdn.clone()))
    }

    async fn predicates_for(
        &self,
        zone_fqdn: &str,
        protocol: Protocol,
    ) -> Result<Vec<RulePredicates>, StoreError> {
        let inner = self.inner.read().await;
        let mut rules: Vec<RulePredicates> = inner
            .rules
            .iter()
            .filter(|r| r.zone == zone_fqdn && r.protocol == protocol.as_str())
            .filter_map(|r| {
                let predicates: Vec<(String, String)> = r
                    .components
                    .iter()
                    .filter(|c| c.is_predicate)
                    .map(|c| (c.name.clone(), c.value.clone()))
                    .collect();
                (!predicates.is_empty()).then(|| RulePredicates {
                    rule_id: r.rule_id.clone(),
                    priority: r.priority,
                    predicates,
                })
            })
            .collect();
        rules.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        Ok(rules)
    }

    async fn results_for(&self, rule_id: &str) -> Result<Vec<RuleResultComponent>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .rules
            .iter()
            .find(|r| r.rule_id == rule_id)
            .map(|r| {
                r.components
                    .iter()
                    .filter(|c| !c.is_predicate)
                    .map(|c| RuleResultComponent {
                        component_id: c.component_id.clone(),
                        name: c.name.clone(),
                        value: c.value.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn record_interaction(&self, interaction: Interaction) -> Result<i64, StoreError> {
        let time = Utc::now().timestamp();
        self.inner
            .write()
            .await
            .interactions
            .push((time, interaction));
        Ok(time)
    }
}
