use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod config;
mod engine;
mod feedback;
mod identity;
mod metrics;
mod ranking;
mod repository;
#[cfg(test)]
mod test_support;

pub use config::{resolve_session_key, HealingConfig, ResultRetention, DEFAULT_PROJECT};
pub use engine::{
    persist_results, reconcile, resolve_or_create, save_healing, HealingAttempt, SavedHealing,
};
pub use feedback::{apply_feedback, FeedbackTransition};
pub use identity::{derive_healing_id, DigestSelectorIdentity, SelectorIdentityProvider};
pub use metrics::{
    MetricsError, MetricsFailure, MetricsGateway, MetricsPartition, MetricsTask, MetricsUpload,
    PartitionMove,
};
pub use ranking::{rank_healings, sort_by_score, RankedCandidate, RankedSelectorView};
pub use repository::{
    HealingQuery, HealingRepository, HealingResultRepository, HealingStore, ReportRepository,
    SelectorRepository,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum HealingError {
    /// The caller referenced a selector that was never registered.
    #[error("selector is not registered: {0}")]
    MissingSelector(SelectorId),
    /// Persisted state disagrees with the request that produced it.
    #[error("internal consistency error: {0}")]
    InternalConsistency(String),
    /// A unique key already exists. Raised by stores, absorbed by the resolver.
    #[error("identity already exists: {0}")]
    DuplicateIdentity(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct SelectorId(pub String);

impl SelectorId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SelectorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content-addressed identifier of one healing attempt, see [`derive_healing_id`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct HealingId(pub String);

impl HealingId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for HealingId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HealingResultId(pub Ulid);

impl HealingResultId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for HealingResultId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for HealingResultId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ReportRecordId(pub Ulid);

impl ReportRecordId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ReportRecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ReportRecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A locator descriptor: lookup strategy (`css`, `xpath`, `id`, ...) plus its value.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Locator {
    pub strategy: String,
    pub value: String,
}

impl Locator {
    #[must_use]
    pub fn new(strategy: impl Into<String>, value: impl Into<String>) -> Self {
        Self { strategy: strategy.into(), value: value.into() }
    }
}

/// Stable identity of one locator used by one test method.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Selector {
    pub selector_id: SelectorId,
    pub class_name: String,
    pub method_name: String,
    pub locator: Locator,
    pub url: String,
    pub command: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// One self-healing attempt for a selector against a specific page state.
///
/// A successful attempt owns at least one [`HealingResult`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Healing {
    pub healing_id: HealingId,
    pub selector: Selector,
    pub page_content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub results: Vec<HealingResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealingResult {
    pub healing_result_id: HealingResultId,
    pub healing_id: HealingId,
    pub locator: Locator,
    pub score: f64,
    pub success: Option<bool>,
    #[serde(default)]
    pub superseded: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl HealingResult {
    #[must_use]
    pub fn feedback_state(&self) -> FeedbackState {
        FeedbackState::from_flag(self.success)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackState {
    Unknown,
    Successful,
    Unsuccessful,
}

impl FeedbackState {
    #[must_use]
    pub fn from_flag(success: Option<bool>) -> Self {
        match success {
            None => Self::Unknown,
            Some(true) => Self::Successful,
            Some(false) => Self::Unsuccessful,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Successful => "successful",
            Self::Unsuccessful => "unsuccessful",
        }
    }
}

/// A proposed alternative locator as reported by the automation client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateResult {
    pub locator: Locator,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReportRecord {
    pub report_record_id: ReportRecordId,
    pub session_key: Option<String>,
    pub healing_id: HealingId,
    pub healing_result_id: HealingResultId,
    pub selector_id: SelectorId,
    pub screenshot: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
