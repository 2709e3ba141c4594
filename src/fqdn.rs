use crate::cache::TtlCache;
use crate::store::{Store, StoreError};
use regex::Regex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::instrument;

const MAX_NAME_LEN: usize = 253;
const CACHE_CAP: usize = 1024;
const CACHE_TTL: Duration = Duration::from_secs(30);

static LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").unwrap());

/// Normalises a raw query name into the internal FQDN form: lowercase,
/// ASCII (IDNA-encoded if needed), no trailing dot. Returns `None` for
/// anything that is not a well-formed DNS name.
pub fn normalize(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return None;
    }

    let ascii = if trimmed.is_ascii() {
        trimmed.to_ascii_lowercase()
    } else {
        idna::domain_to_ascii(trimmed).ok()?
    };

    is_valid(&ascii).then_some(ascii)
}

/// A valid name is at most 253 chars with every label matching
/// `[a-z0-9-]`, at most 63 chars, and no leading or trailing hyphen.
pub fn is_valid(fqdn: &str) -> bool {
    if fqdn.is_empty() || fqdn.len() > MAX_NAME_LEN {
        return false;
    }
    fqdn.split('.').all(|label| LABEL.is_match(label))
}

/// Whether `fqdn` equals `domain` or sits underneath it.
pub fn in_domain(fqdn: &str, domain: &str) -> bool {
    fqdn == domain || fqdn.ends_with(&format!(".{}", domain))
}

/// Resolves a normalised request FQDN to its parent domain and zone.
pub struct FqdnMatcher {
    store: Arc<dyn Store>,
    domain_cache: TtlCache<String, Option<String>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ZoneMatch {
    pub domain: String,
    pub zone: Option<String>,
}

impl FqdnMatcher {
    pub fn new(store: Arc<dyn Store>) -> Self {
        FqdnMatcher {
            store,
            domain_cache: TtlCache::new(NonZeroUsize::new(CACHE_CAP).unwrap(), CACHE_TTL),
        }
    }

    /// The registered domain that owns `fqdn`, if any. Longest suffix wins
    /// when domains nest.
    #[instrument(skip(self))]
    pub async fn domain_for(&self, fqdn: &str) -> Result<Option<String>, StoreError> {
        if let Some(hit) = self.domain_cache.get(&fqdn.to_string()).await {
            metrics::gauge!("fqdn_cache_entries").set(self.domain_cache.len().await as f64);
            return Ok(hit);
        }

        let domains = self.store.domains().await?;
        let matched = domains
            .iter()
            .filter(|d| in_domain(fqdn, &d.domain))
            .max_by_key(|d| d.domain.len())
            .map(|d| d.domain.clone());

        self.domain_cache
            .put(fqdn.to_string(), matched.clone())
            .await;
        metrics::gauge!("fqdn_cache_entries").set(self.domain_cache.len().await as f64);
        Ok(matched)
    }

    /// Domain plus zone resolution in one step. `Ok(None)` means the name is
    /// outside every registered domain.
    pub async fn resolve(&self, fqdn: &str) -> Result<Option<ZoneMatch>, StoreError> {
        let Some(domain) = self.domain_for(fqdn).await? else {
            return Ok(None);
        };
        let zone = self.store.zone_for_fqdn(fqdn).await?;
        Ok(Some(ZoneMatch { domain, zone }))
    }
}
