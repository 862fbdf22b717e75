use std::path::PathBuf;

use anyhow::Result;
use locator_healing_core::{
    apply_feedback, rank_healings, save_healing, sort_by_score, CandidateResult,
    DigestSelectorIdentity, FeedbackTransition, HealingAttempt, HealingConfig, HealingError,
    HealingQuery, HealingRepository, HealingResult, HealingResultId, Locator, MetricsTask,
    MetricsUpload, RankedSelectorView, SavedHealing, Selector, SelectorId,
    SelectorIdentityProvider, SelectorRepository,
};
use locator_healing_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod metrics;

pub use metrics::{HttpMetricsGateway, MetricsDispatcher, DEFAULT_WORKER_QUEUE_CAPACITY};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterSelectorRequest {
    pub class_name: String,
    pub method_name: String,
    pub locator: Locator,
    pub url: String,
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SaveHealingRequest {
    /// The original locator that failed; together with `url` and `command` it names the selector.
    pub locator: Locator,
    pub url: String,
    pub command: String,
    pub page_content: String,
    pub results: Vec<CandidateResult>,
    pub used_result: CandidateResult,
    #[serde(default)]
    pub screenshot: Option<String>,
    /// Raw client metrics forwarded to the metrics gateway when collection is enabled.
    #[serde(default)]
    pub metrics: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealingResultsRequest {
    pub locator: Locator,
    pub url: String,
    pub command: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedbackRequest {
    pub healing_result_id: HealingResultId,
    pub success: bool,
}

/// Per-call values resolved from transport headers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestContext {
    pub session_key: Option<String>,
    pub project_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LocatorHealingApi {
    db_path: PathBuf,
    config: HealingConfig,
    identity: DigestSelectorIdentity,
    metrics: MetricsDispatcher,
}

impl LocatorHealingApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            config: HealingConfig::default(),
            identity: DigestSelectorIdentity,
            metrics: MetricsDispatcher::disabled(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: HealingConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsDispatcher) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn config(&self) -> &HealingConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    fn selector_id_for(&self, locator: &Locator, url: &str, command: &str) -> SelectorId {
        self.identity.derive_selector_id(locator, url, command, self.config.url_for_key)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run `SQLite` integrity probes.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or probed.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Register a selector, returning the stored row when it already exists.
    ///
    /// # Errors
    /// Returns [`HealingError::Validation`] for a blank locator value, or persistence errors.
    pub fn register_selector(&self, input: RegisterSelectorRequest) -> Result<Selector> {
        if input.locator.value.trim().is_empty() {
            return Err(
                HealingError::Validation("locator value MUST be non-empty".to_string()).into()
            );
        }

        let selector_id = self.selector_id_for(&input.locator, &input.url, &input.command);
        let mut store = self.open_migrated_store()?;
        let mut tx = store.begin_write()?;

        if let Some(existing) = tx.find_selector(&selector_id)? {
            tracing::debug!(%selector_id, "selector already registered");
            return Ok(existing);
        }

        let selector = Selector {
            selector_id,
            class_name: input.class_name,
            method_name: input.method_name,
            locator: input.locator,
            url: input.url,
            command: input.command,
            created_at: OffsetDateTime::now_utc(),
        };
        tx.insert_selector(&selector)?;
        tx.commit()?;

        tracing::info!(selector_id = %selector.selector_id, "registered selector");
        Ok(selector)
    }

    /// Persist one healing attempt atomically, then push its metrics best-effort.
    ///
    /// # Errors
    /// Returns [`HealingError::MissingSelector`], [`HealingError::Validation`],
    /// [`HealingError::InternalConsistency`] or persistence errors. Metrics failures are
    /// never returned.
    pub fn save_healing(
        &self,
        input: SaveHealingRequest,
        context: &RequestContext,
    ) -> Result<SavedHealing> {
        let selector_id = self.selector_id_for(&input.locator, &input.url, &input.command);
        tracing::debug!(%selector_id, candidates = input.results.len(), "saving healing");

        let attempt = HealingAttempt {
            selector_id,
            page_content: input.page_content,
            candidates: input.results,
            used_locator_value: input.used_result.locator.value,
            session_key: context.session_key.clone(),
            screenshot: input.screenshot,
        };

        let mut store = self.open_migrated_store()?;
        let mut tx = store.begin_write()?;
        let saved = match save_healing(
            &mut tx,
            &attempt,
            self.config.result_retention,
            OffsetDateTime::now_utc(),
        ) {
            Ok(saved) => saved,
            Err(err @ HealingError::InternalConsistency(_)) => {
                tracing::error!(selector_id = %attempt.selector_id, error = %err, "save rejected");
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };
        tx.commit()?;

        tracing::info!(
            healing_id = %saved.healing.healing_id,
            healing_result_id = %saved.selected.healing_result_id,
            results = saved.results.len(),
            "saved healing"
        );

        if self.config.collect_metrics {
            if let Some(payload) = input.metrics {
                let project_id = self.config.project_or_default(context.project_id.as_deref());
                self.metrics.dispatch(MetricsTask::Upload(MetricsUpload::for_selected(
                    payload,
                    &saved,
                    project_id,
                    input.url,
                )));
            }
        }

        Ok(saved)
    }

    /// Ranked view per selector over every healing matching `query`.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn get_healings(&self, query: &HealingQuery) -> Result<Vec<RankedSelectorView>> {
        let mut store = self.open_migrated_store()?;
        let tx = store.begin_read()?;
        let healings = tx.find_healings(query)?;
        Ok(rank_healings(&healings))
    }

    /// Every current result recorded for the selector, best score first.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn get_healing_results(&self, input: &HealingResultsRequest) -> Result<Vec<HealingResult>> {
        let selector_id = self.selector_id_for(&input.locator, &input.url, &input.command);
        let mut store = self.open_migrated_store()?;
        let tx = store.begin_read()?;
        let query = HealingQuery { selector_id: Some(selector_id), ..HealingQuery::default() };
        let healings = tx.find_healings(&query)?;

        let mut results = healings
            .into_iter()
            .flat_map(|healing| healing.results)
            .filter(|result| !result.superseded)
            .collect::<Vec<_>>();
        sort_by_score(&mut results);
        Ok(results)
    }

    /// Record feedback on one result, then relocate its metrics best-effort.
    ///
    /// Returns `None` when the result is unknown.
    ///
    /// # Errors
    /// Returns an error when the update cannot be persisted.
    pub fn apply_feedback(&self, input: FeedbackRequest) -> Result<Option<FeedbackTransition>> {
        let mut store = self.open_migrated_store()?;
        let mut tx = store.begin_write()?;
        let Some(transition) = apply_feedback(&mut tx, input.healing_result_id, input.success)?
        else {
            tracing::debug!(
                healing_result_id = %input.healing_result_id,
                "feedback for unknown healing result dropped"
            );
            return Ok(None);
        };
        tx.commit()?;

        tracing::info!(
            healing_result_id = %input.healing_result_id,
            previous = transition.previous.as_str(),
            current = transition.current.as_str(),
            "applied feedback"
        );

        if self.config.collect_metrics {
            self.metrics.dispatch(MetricsTask::Move(transition.relocation()));
        }

        Ok(Some(transition))
    }
}
