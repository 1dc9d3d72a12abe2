use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EngineError;

/// Normalized industry identifier, e.g. `tech-software-development`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndustryKey(String);

impl IndustryKey {
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        let normalized = raw
            .split_whitespace()
            .map(|word| word.to_lowercase())
            .collect::<Vec<_>>()
            .join("-");
        if normalized.is_empty() {
            return Err(EngineError::InvalidIndustry(
                "industry key must not be empty".to_string(),
            ));
        }
        if normalized.chars().any(char::is_control) {
            return Err(EngineError::InvalidIndustry(format!(
                "industry key contains control characters: {:?}",
                raw
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IndustryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DemandLevel {
    High,
    Medium,
    Low,
}

impl DemandLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HIGH" => Some(Self::High),
            "MEDIUM" => Some(Self::Medium),
            "LOW" => Some(Self::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketOutlook {
    Positive,
    Neutral,
    Negative,
}

impl MarketOutlook {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "POSITIVE",
            Self::Neutral => "NEUTRAL",
            Self::Negative => "NEGATIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "POSITIVE" => Some(Self::Positive),
            "NEUTRAL" => Some(Self::Neutral),
            "NEGATIVE" => Some(Self::Negative),
            _ => None,
        }
    }
}

/// Compensation band for one role, in whole INR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalaryRange {
    pub role: String,
    pub min: i64,
    pub median: i64,
    pub max: i64,
    pub location: String,
}

/// Validated generator output, before it is keyed and timestamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightPayload {
    pub salary_ranges: Vec<SalaryRange>,
    pub growth_rate: f64,
    pub demand_level: DemandLevel,
    pub top_skills: Vec<String>,
    pub market_outlook: MarketOutlook,
    pub key_trends: Vec<String>,
    pub recommended_skills: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightRecord {
    pub industry: IndustryKey,
    #[serde(flatten)]
    pub payload: InsightPayload,
    pub generated_at: DateTime<Utc>,
    pub next_update: DateTime<Utc>,
}

impl InsightRecord {
    /// Stamps a payload. `next_update` is `generated_at + interval`, clamped to
    /// the latest representable time if that would overflow.
    ///
    /// Timestamps are truncated to milliseconds, the precision they are stored at.
    pub fn new(
        industry: IndustryKey,
        payload: InsightPayload,
        generated_at: DateTime<Utc>,
        interval: chrono::Duration,
    ) -> Self {
        let generated_at =
            DateTime::from_timestamp_millis(generated_at.timestamp_millis()).unwrap_or(generated_at);
        Self {
            industry,
            payload,
            generated_at,
            next_update: generated_at
                .checked_add_signed(interval)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.next_update <= now
    }
}

/// Opaque, already-authenticated caller plus the session claims used when the
/// profile row is first created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

impl CallerIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            name: None,
        }
    }

    /// Resolves an optional caller, rejecting absent or blank identities.
    pub fn require(caller: Option<&CallerIdentity>) -> Result<&CallerIdentity, EngineError> {
        match caller {
            Some(c) if !c.user_id.trim().is_empty() => Ok(c),
            _ => Err(EngineError::Unauthorized),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub external_id: String,
    pub email: String,
    pub name: String,
    pub industry: Option<IndustryKey>,
    pub experience: Option<u32>,
    pub bio: Option<String>,
    pub skills: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields written by a profile update.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileUpdate {
    pub industry: IndustryKey,
    pub experience: Option<u32>,
    pub bio: Option<String>,
    pub skills: Vec<String>,
}

/// Result of the prepare phase of a profile update, consumed by the commit.
#[derive(Debug, Clone)]
pub enum PreparedInsight {
    /// Record already present when the update started.
    Existing(InsightRecord),
    /// Freshly generated; must be created at commit, or discarded if another
    /// caller created the key first.
    Candidate(InsightRecord),
}

impl PreparedInsight {
    pub fn industry(&self) -> &IndustryKey {
        match self {
            PreparedInsight::Existing(r) | PreparedInsight::Candidate(r) => &r.industry,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingStatus {
    pub is_onboarded: bool,
}
