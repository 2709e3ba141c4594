use super::{Domain, Interaction, RulePredicates, RuleResultComponent, Store, StoreError};
use crate::cache::TtlCache;
use crate::model::Protocol;
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::bson::doc;
use mongodb::options::FindOptions;
use mongodb::{Client, Database};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

const DEFAULT_DB: &str = "dusseldorf";
const RULE_FETCH_LIMIT: i64 = 1000;

const PING_TTL: Duration = Duration::from_secs(30);
const DOMAIN_TTL: Duration = Duration::from_secs(30);
const ZONE_TTL: Duration = Duration::from_secs(30);
const RULE_TTL: Duration = Duration::from_secs(1);

#[derive(Deserialize)]
struct DomainDoc {
    domain: String,
    #[serde(default)]
    public_ips: Vec<String>,
}

#[derive(Deserialize)]
struct ZoneDoc {
    fqdn: String,
}

#[derive(Deserialize)]
struct ComponentDoc {
    componentid: String,
    ispredicate: bool,
    actionname: String,
    #[serde(default)]
    actionvalue: String,
}

#[derive(Deserialize)]
struct RuleDoc {
    ruleid: String,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    rulecomponents: Vec<ComponentDoc>,
}

/// MongoDB-backed store. All reads go through short-lived caches so a hot
/// zone does not hammer the database; rule reads use a one-second TTL so
/// edits become visible quickly.
pub struct MongoStore {
    uri: String,
    client: RwLock<Client>,
    dbname: String,
    ping_cache: TtlCache<(), ()>,
    domains_cache: TtlCache<(), Vec<Domain>>,
    ips_cache: TtlCache<String, Vec<Ipv4Addr>>,
    zone_cache: TtlCache<String, Option<String>>,
    preds_cache: TtlCache<(String, &'static str), Vec<RulePredicates>>,
    results_cache: TtlCache<String, Vec<RuleResultComponent>>,
}

impl MongoStore {
    /// Parses the connection string and sets up the client. Connectivity is
    /// only verified by the first `ping`.
    pub async fn connect(uri: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let dbname = client
            .default_database()
            .map(|d| d.name().to_string())
            .unwrap_or_else(|| DEFAULT_DB.to_string());

        let cap = |n: usize| NonZeroUsize::new(n).unwrap();
        Ok(MongoStore {
            uri: uri.to_string(),
            client: RwLock::new(client),
            dbname,
            ping_cache: TtlCache::new(cap(1), PING_TTL),
            domains_cache: TtlCache::new(cap(1), DOMAIN_TTL),
            ips_cache: TtlCache::new(cap(64), DOMAIN_TTL),
            zone_cache: TtlCache::new(cap(256), ZONE_TTL),
            preds_cache: TtlCache::new(cap(256), RULE_TTL),
            results_cache: TtlCache::new(cap(256), RULE_TTL),
        })
    }

    async fn db(&self) -> Database {
        self.client.read().await.database(&self.dbname)
    }

    async fn ping_once(&self) -> Result<(), mongodb::error::Error> {
        self.db().await.run_command(doc! { "ping": 1 }, None).await?;
        Ok(())
    }

    /// TTL-cached connectivity check. On failure the client is rebuilt once
    /// before the operation is allowed to fail.
    async fn guarantee(&self) -> Result<(), StoreError> {
        if self.ping_cache.get(&()).await.is_some() {
            return Ok(());
        }
        if self.ping_once().await.is_ok() {
            self.ping_cache.put((), ()).await;
            return Ok(());
        }

        warn!("database connection down, attempting to reconnect");
        let fresh = Client::with_uri_str(&self.uri)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        *self.client.write().await = fresh;
        self.ping_once()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.ping_cache.put((), ()).await;
        Ok(())
    }

    fn parse_ips(raw: &[String]) -> Vec<Ipv4Addr> {
        raw.iter().filter_map(|ip| ip.parse().ok()).collect()
    }
}

#[async_trait::async_trait]
impl Store for MongoStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.ping_once()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn domains(&self) -> Result<Vec<Domain>, StoreError> {
        if let Some(hit) = self.domains_cache.get(&()).await {
            return Ok(hit);
        }
        self.guarantee().await?;

        let mut cursor = self
            .db()
            .await
            .collection::<DomainDoc>("domains")
            .find(doc! {}, None)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut domains = Vec::new();
        while let Some(d) = cursor
            .try_next()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?
        {
            domains.push(Domain {
                domain: d.domain,
                public_ips: Self::parse_ips(&d.public_ips),
            });
        }

        self.domains_cache.put((), domains.clone()).await;
        Ok(domains)
    }

    async fn public_ips(&self, domain: &str) -> Result<Vec<Ipv4Addr>, StoreError> {
        if let Some(hit) = self.ips_cache.get(&domain.to_string()).await {
            return Ok(hit);
        }
        self.guarantee().await?;

        let filter = if domain.is_empty() {
            doc! {}
        } else {
            doc! { "domain": domain }
        };
        let found = self
            .db()
            .await
            .collection::<DomainDoc>("domains")
            .find_one(filter, None)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let ips = found
            .map(|d| Self::parse_ips(&d.public_ips))
            .unwrap_or_default();
        self.ips_cache.put(domain.to_string(), ips.clone()).await;
        Ok(ips)
    }

    async fn zone_for_fqdn(&self, req_fqdn: &str) -> Result<Option<String>, StoreError> {
        let req_fqdn = req_fqdn.to_lowercase();
        if let Some(hit) = self.zone_cache.get(&req_fqdn).await {
            return Ok(hit);
        }
        self.guarantee().await?;

        let zones = self.db().await.collection::<ZoneDoc>("zones");

        let exact = zones
            .find_one(doc! { "fqdn": &req_fqdn }, None)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        if let Some(zone) = exact {
            self.zone_cache
                .put(req_fqdn, Some(zone.fqdn.clone()))
                .await;
            return Ok(Some(zone.fqdn));
        }

        let mut cursor = zones
            .find(doc! {}, None)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let mut best: Option<String> = None;
        while let Some(zone) = cursor
            .try_next()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?
        {
            let fqdn = zone.fqdn.to_lowercase();
            if req_fqdn.ends_with(&format!(".{}", fqdn))
                && best.as_ref().is_none_or(|b| fqdn.len() > b.len())
            {
                best = Some(fqdn);
            }
        }

        self.zone_cache.put(req_fqdn, best.clone()).await;
        Ok(best)
    }

    async fn predicates_for(
        &self,
        zone_fqdn: &str,
        protocol: Protocol,
    ) -> Result<Vec<RulePredicates>, StoreError> {
        let key = (zone_fqdn.to_string(), protocol.as_str());
        if let Some(hit) = self.preds_cache.get(&key).await {
            return Ok(hit);
        }
        self.guarantee().await?;

        let options = FindOptions::builder()
            .sort(doc! { "priority": 1 })
            .limit(RULE_FETCH_LIMIT)
            .build();
        let mut cursor = self
            .db()
            .await
            .collection::<RuleDoc>("rules")
            .find(
                doc! { "zone": zone_fqdn, "networkprotocol": protocol.as_str() },
                options,
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut rules = Vec::new();
        while let Some(rule) = cursor
            .try_next()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?
        {
            let predicates: Vec<(String, String)> = rule
                .rulecomponents
                .iter()
                .filter(|c| c.ispredicate)
                .map(|c| (c.actionname.clone(), c.actionvalue.clone()))
                .collect();
            if predicates.is_empty() {
                continue;
            }
            rules.push(RulePredicates {
                rule_id: rule.ruleid,
                priority: rule.priority,
                predicates,
            });
        }
        // Duplicate priorities should not exist; rule id keeps the order
        // stable if they ever do.
        rules.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });

        self.preds_cache.put(key, rules.clone()).await;
        Ok(rules)
    }

    async fn results_for(&self, rule_id: &str) -> Result<Vec<RuleResultComponent>, StoreError> {
        if let Some(hit) = self.results_cache.get(&rule_id.to_string()).await {
            return Ok(hit);
        }
        self.guarantee().await?;

        let rule = self
            .db()
            .await
            .collection::<RuleDoc>("rules")
            .find_one(doc! { "ruleid": rule_id }, None)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let results: Vec<RuleResultComponent> = rule
            .map(|r| {
                r.rulecomponents
                    .into_iter()
                    .filter(|c| !c.ispredicate)
                    .map(|c| RuleResultComponent {
                        component_id: c.componentid,
                        name: c.actionname,
                        value: c.actionvalue,
                    })
                    .collect()
            })
            .unwrap_or_default();

        self.results_cache
            .put(rule_id.to_string(), results.clone())
            .await;
        Ok(results)
    }

    async fn record_interaction(&self, interaction: Interaction) -> Result<i64, StoreError> {
        self.guarantee().await?;

        let time = Utc::now().timestamp();
        self.db()
            .await
            .collection::<mongodb::bson::Document>("requests")
            .insert_one(
                doc! {
                    "zone": interaction.zone,
                    "fqdn": interaction.fqdn,
                    "protocol": interaction.protocol,
                    "clientip": interaction.clientip,
                    "request": interaction.request,
                    "response": interaction.response,
                    "reqsummary": interaction.reqsummary,
                    "respsummary": interaction.respsummary,
                    "time": time,
                },
                None,
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(time)
    }
}
