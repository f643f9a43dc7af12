use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{CacheEntry, CacheError};

/// All the kinds of resources that are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// The surge-stock triggers of one trading session.
    TriggerSession,
    /// A generated analysis of a single company for one day.
    Analysis,
    /// A market open or close report.
    MarketReport,
    /// Static metadata of a listed stock.
    StockMetadata,
    /// Rate-limit counters of API clients.
    RateLimit,
}

impl ResourceType {
    /// All the known resource types.
    pub const ALL: [ResourceType; 5] = [
        Self::TriggerSession,
        Self::Analysis,
        Self::MarketReport,
        Self::StockMetadata,
        Self::RateLimit,
    ];

    /// The number of identifier fields that make up a key of this resource type.
    pub fn arity(&self) -> usize {
        match self {
            // session date, session name
            Self::TriggerSession => 2,
            // ticker, date
            Self::Analysis => 2,
            // market, date, open/close
            Self::MarketReport => 3,
            // ticker
            Self::StockMetadata => 1,
            // client id
            Self::RateLimit => 1,
        }
    }

    /// The time-to-live used when nothing else is configured.
    pub fn default_ttl(&self) -> Duration {
        match self {
            Self::TriggerSession => Duration::from_secs(3600),
            Self::Analysis => Duration::from_secs(3600 * 24),
            Self::MarketReport => Duration::from_secs(3600 * 12),
            Self::StockMetadata => Duration::from_secs(3600 * 24 * 7),
            Self::RateLimit => Duration::from_secs(60),
        }
    }
}

impl AsRef<str> for ResourceType {
    fn as_ref(&self) -> &str {
        match self {
            Self::TriggerSession => "trigger_session",
            Self::Analysis => "analysis",
            Self::MarketReport => "market_report",
            Self::StockMetadata => "stock_metadata",
            Self::RateLimit => "rate_limit",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

impl FromStr for ResourceType {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_ref() == s)
            .ok_or_else(|| CacheError::UnknownResourceType(s.to_owned()))
    }
}

/// The static mapping of [`ResourceType`] to time-to-live.
///
/// This is built once on startup from the configured overrides and is immutable afterwards.
/// Unknown resource types are rejected when building the policy, so a lookup can never fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlPolicy {
    ttls: BTreeMap<ResourceType, Duration>,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        let ttls = ResourceType::ALL
            .into_iter()
            .map(|ty| (ty, ty.default_ttl()))
            .collect();
        Self { ttls }
    }
}

impl TtlPolicy {
    /// Builds the policy from the default table and the configured overrides, given in seconds.
    ///
    /// Fails with [`CacheError::UnknownResourceType`] for names that are not a [`ResourceType`],
    /// and with [`CacheError::InvalidTtl`] for a time-to-live of zero.
    pub fn from_overrides(overrides: &BTreeMap<String, u64>) -> CacheEntry<Self> {
        let mut policy = Self::default();
        for (name, secs) in overrides {
            let ty: ResourceType = name.parse()?;
            if *secs == 0 {
                return Err(CacheError::InvalidTtl(format!(
                    "`{name}` must not expire immediately"
                )));
            }
            policy.ttls.insert(ty, Duration::from_secs(*secs));
        }
        Ok(policy)
    }

    /// Returns the time-to-live of the given resource type.
    pub fn ttl_for(&self, resource_type: ResourceType) -> Duration {
        self.ttls
            .get(&resource_type)
            .copied()
            .unwrap_or_else(|| resource_type.default_ttl())
    }

    /// Looks up the time-to-live by resource type name.
    pub fn ttl_for_name(&self, name: &str) -> CacheEntry<Duration> {
        Ok(self.ttl_for(name.parse()?))
    }
}
