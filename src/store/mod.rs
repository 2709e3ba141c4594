pub mod memory;
pub use memory::MemoryStore;

pub mod mongo;
pub use mongo::MongoStore;

use crate::model::Protocol;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// A parent domain the platform answers for, with its public address pool.
#[derive(Clone, Debug, PartialEq)]
pub struct Domain {
    pub domain: String,
    pub public_ips: Vec<Ipv4Addr>,
}

/// The predicate half of one rule, aggregated for evaluation: the engine
/// walks these in `(priority, rule_id)` order.
#[derive(Clone, Debug, PartialEq)]
pub struct RulePredicates {
    pub rule_id: String,
    pub priority: i32,
    /// `(actionname, actionvalue)` pairs in stored order.
    pub predicates: Vec<(String, String)>,
}

/// One result component of a rule, in stored order.
#[derive(Clone, Debug, PartialEq)]
pub struct RuleResultComponent {
    pub component_id: String,
    pub name: String,
    pub value: String,
}

/// A finished request/response pair, ready to persist.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Interaction {
    pub zone: String,
    pub fqdn: String,
    pub protocol: String,
    pub clientip: String,
    pub request: String,
    pub response: String,
    pub reqsummary: String,
    pub respsummary: String,
}

#[derive(Debug)]
pub enum StoreError {
    /// The backing store cannot be reached, even after a reconnect attempt.
    Unavailable(String),
    /// A query or insert failed for a reason other than connectivity.
    Query(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {}", msg),
            StoreError::Query(msg) => write!(f, "store query failed: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Read-mostly view of domains, zones and rules, plus the append-only
/// interaction log. Implementations cache reads; callers treat every
/// method as fallible and degrade per protocol when it is.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Connectivity self-check.
    async fn ping(&self) -> Result<(), StoreError>;

    /// All registered parent domains.
    async fn domains(&self) -> Result<Vec<Domain>, StoreError>;

    /// Public IPv4 pool for one domain; empty string means "any domain".
    async fn public_ips(&self, domain: &str) -> Result<Vec<Ipv4Addr>, StoreError>;

    /// The zone owning `req_fqdn`: exact match first, else the longest
    /// zone FQDN that `req_fqdn` sits underneath.
    async fn zone_for_fqdn(&self, req_fqdn: &str) -> Result<Option<String>, StoreError>;

    /// Predicate sets per rule for `(zone, protocol)`, ordered by ascending
    /// priority (ties broken by rule id). Rules without predicates are
    /// omitted; they can never match.
    async fn predicates_for(
        &self,
        zone_fqdn: &str,
        protocol: Protocol,
    ) -> Result<Vec<RulePredicates>, StoreError>;

    /// Result components of one rule, in stored order.
    async fn results_for(&self, rule_id: &str) -> Result<Vec<RuleResultComponent>, StoreError>;

    /// Appends an interaction, stamping it with the insertion time.
    /// Returns the Unix-second timestamp assigned.
    async fn record_interaction(&self, interaction: Interaction) -> Result<i64, StoreError>;
}
