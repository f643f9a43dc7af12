//! The artifacts served through the cache.
//!
//! The cache store itself only deals in bytes. Artifacts are serialized to JSON, internally tagged
//! by their `resource_type`, when they cross into the cache or the durable store.

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::caching::ResourceType;

/// A single stock that surged during a trading session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurgeTrigger {
    pub ticker: String,
    pub name: String,
    /// Price change against the previous close, in percent.
    pub change_percent: f64,
    pub volume: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// All the surge triggers detected in one session of a trading day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSession {
    pub session_date: NaiveDate,
    /// The session name, for example `morning` or `afternoon`.
    pub session: String,
    pub triggers: Vec<SurgeTrigger>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

/// A generated analysis of a company on a given day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyAnalysis {
    pub ticker: String,
    pub company_name: String,
    pub date: NaiveDate,
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    pub sentiment: Sentiment,
    /// The model that generated this analysis.
    pub model: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Open,
    Close,
}

impl AsRef<str> for ReportKind {
    fn as_ref(&self) -> &str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
        }
    }
}

/// A report published at market open or close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketReport {
    pub market: String,
    pub date: NaiveDate,
    pub kind: ReportKind,
    pub headline: String,
    pub body: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMetadata {
    pub ticker: String,
    pub name: String,
    pub market: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
}

/// Requests counted for one client in the current rate limiting window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitCounter {
    pub count: u64,
    pub window_started_at: DateTime<Utc>,
}

/// Any artifact that can be cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resource_type", rename_all = "snake_case")]
pub enum Artifact {
    TriggerSession(TriggerSession),
    Analysis(CompanyAnalysis),
    MarketReport(MarketReport),
    StockMetadata(StockMetadata),
    RateLimit(RateLimitCounter),
}

impl Artifact {
    /// The resource type this artifact is cached as.
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::TriggerSession(_) => ResourceType::TriggerSession,
            Self::Analysis(_) => ResourceType::Analysis,
            Self::MarketReport(_) => ResourceType::MarketReport,
            Self::StockMetadata(_) => ResourceType::StockMetadata,
            Self::RateLimit(_) => ResourceType::RateLimit,
        }
    }

    /// Serializes the artifact into its cached representation.
    pub fn to_bytes(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Deserializes an artifact from its cached representation.
    pub fn from_slice(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}
