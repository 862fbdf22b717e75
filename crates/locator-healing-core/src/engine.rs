use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    derive_healing_id, CandidateResult, Healing, HealingError, HealingRepository, HealingResult,
    HealingResultId, HealingResultRepository, HealingStore, ReportRecord, ReportRecordId,
    ResultRetention, SelectorId, SelectorRepository,
};

/// Everything one save call needs once the selector id has been derived.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealingAttempt {
    pub selector_id: SelectorId,
    pub page_content: String,
    pub candidates: Vec<CandidateResult>,
    pub used_locator_value: String,
    pub session_key: Option<String>,
    pub screenshot: Option<String>,
}

impl HealingAttempt {
    /// # Errors
    /// Returns [`HealingError::Validation`] when there are no candidates, a locator value is
    /// blank, or a score is not finite.
    pub fn validate(&self) -> Result<(), HealingError> {
        if self.candidates.is_empty() {
            return Err(HealingError::Validation(
                "at least one candidate result MUST be provided".to_string(),
            ));
        }

        for candidate in &self.candidates {
            if candidate.locator.value.trim().is_empty() {
                return Err(HealingError::Validation(
                    "candidate locator value MUST be non-empty".to_string(),
                ));
            }
            if !candidate.score.is_finite() {
                return Err(HealingError::Validation(format!(
                    "candidate score MUST be finite for locator `{}`",
                    candidate.locator.value
                )));
            }
        }

        if self.used_locator_value.trim().is_empty() {
            return Err(HealingError::Validation(
                "used locator value MUST be non-empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SavedHealing {
    pub healing: Healing,
    pub results: Vec<HealingResult>,
    pub selected: HealingResult,
    pub report: ReportRecord,
}

/// Return the healing for `(selector_id, page_content)`, creating it on first sight.
///
/// A concurrent first writer surfaces as [`HealingError::DuplicateIdentity`] from the
/// store; that row is re-read and returned.
///
/// # Errors
/// Returns [`HealingError::MissingSelector`] when the selector is not registered, or
/// propagates store failures.
pub fn resolve_or_create<S>(
    store: &mut S,
    selector_id: &SelectorId,
    page_content: &str,
    now: OffsetDateTime,
) -> Result<Healing, HealingError>
where
    S: SelectorRepository + HealingRepository + ?Sized,
{
    let healing_id = derive_healing_id(selector_id, page_content);
    if let Some(existing) = store.find_healing(&healing_id)? {
        return Ok(existing);
    }

    let Some(selector) = store.find_selector(selector_id)? else {
        return Err(HealingError::MissingSelector(selector_id.clone()));
    };

    let healing = Healing {
        healing_id: healing_id.clone(),
        selector,
        page_content: page_content.to_string(),
        created_at: now,
        results: Vec::new(),
    };

    match store.insert_healing(&healing) {
        Ok(()) => Ok(healing),
        Err(HealingError::DuplicateIdentity(_)) => {
            tracing::debug!(%healing_id, "healing created by a concurrent writer, re-reading");
            store.find_healing(&healing_id)?.ok_or_else(|| {
                HealingError::InternalConsistency(format!(
                    "healing {healing_id} was reported as existing but cannot be read"
                ))
            })
        }
        Err(err) => Err(err),
    }
}

/// Persist one result per candidate, owned by `healing`, in candidate order.
///
/// # Errors
/// Propagates store failures; the caller's transaction discards partial writes.
pub fn persist_results<S>(
    store: &mut S,
    candidates: &[CandidateResult],
    healing: &Healing,
    retention: ResultRetention,
    now: OffsetDateTime,
) -> Result<Vec<HealingResult>, HealingError>
where
    S: HealingResultRepository + ?Sized,
{
    if retention == ResultRetention::Supersede {
        store.supersede_results(&healing.healing_id)?;
    }

    let results = candidates
        .iter()
        .map(|candidate| HealingResult {
            healing_result_id: HealingResultId::new(),
            healing_id: healing.healing_id.clone(),
            locator: candidate.locator.clone(),
            score: candidate.score,
            success: None,
            superseded: false,
            created_at: now,
        })
        .collect::<Vec<_>>();
    store.insert_results(&results)?;
    Ok(results)
}

/// Find the persisted result whose locator value is the one the client used.
///
/// # Errors
/// Returns [`HealingError::InternalConsistency`] when no persisted result matches.
pub fn reconcile<'a>(
    results: &'a [HealingResult],
    used_locator_value: &str,
) -> Result<&'a HealingResult, HealingError> {
    results.iter().find(|result| result.locator.value == used_locator_value).ok_or_else(|| {
        HealingError::InternalConsistency(format!(
            "selected locator `{used_locator_value}` is not among the {} persisted results",
            results.len()
        ))
    })
}

/// Record one healing attempt: resolve the healing, persist candidates, reconcile the used
/// one and write its report record. Run inside a single store transaction.
///
/// # Errors
/// Returns [`HealingError::Validation`] for malformed attempts,
/// [`HealingError::MissingSelector`] for unknown selectors,
/// [`HealingError::InternalConsistency`] when reconciliation fails, or store failures.
pub fn save_healing<S>(
    store: &mut S,
    attempt: &HealingAttempt,
    retention: ResultRetention,
    now: OffsetDateTime,
) -> Result<SavedHealing, HealingError>
where
    S: HealingStore + ?Sized,
{
    attempt.validate()?;

    let healing = resolve_or_create(store, &attempt.selector_id, &attempt.page_content, now)?;
    let results = persist_results(store, &attempt.candidates, &healing, retention, now)?;
    let selected = reconcile(&results, &attempt.used_locator_value)?.clone();

    let report = ReportRecord {
        report_record_id: ReportRecordId::new(),
        session_key: attempt.session_key.clone(),
        healing_id: healing.healing_id.clone(),
        healing_result_id: selected.healing_result_id,
        selector_id: healing.selector.selector_id.clone(),
        screenshot: attempt.screenshot.clone(),
        created_at: now,
    };
    store.insert_report_record(&report)?;

    Ok(SavedHealing { healing, results, selected, report })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture_time, mk_selector, InMemoryStore};
    use crate::{HealingQuery, Locator};

    fn candidate(value: &str, score: f64) -> CandidateResult {
        CandidateResult { locator: Locator::new("css", value), score }
    }

    fn attempt(selector_id: &str, page_content: &str, used: &str) -> HealingAttempt {
        HealingAttempt {
            selector_id: SelectorId(selector_id.to_string()),
            page_content: page_content.to_string(),
            candidates: vec![candidate("#a", 0.8), candidate("#b", 0.6)],
            used_locator_value: used.to_string(),
            session_key: Some("session-1".to_string()),
            screenshot: None,
        }
    }

    fn store_with_selector(selector_id: &str) -> InMemoryStore {
        let mut store = InMemoryStore::default();
        store.seed_selector(mk_selector(selector_id));
        store
    }

    #[test]
    fn resolve_twice_returns_same_healing_and_creates_one_row() {
        let mut store = store_with_selector("sel1");
        let selector_id = SelectorId("sel1".to_string());

        let first = resolve_or_create(&mut store, &selector_id, "<html>A</html>", fixture_time());
        let second = resolve_or_create(&mut store, &selector_id, "<html>A</html>", fixture_time());

        let (first, second) = match (first, second) {
            (Ok(first), Ok(second)) => (first, second),
            (first, second) => panic!("resolve should succeed: {first:?} / {second:?}"),
        };
        assert_eq!(first.healing_id, second.healing_id);
        assert_eq!(first.healing_id, derive_healing_id(&selector_id, "<html>A</html>"));
        assert_eq!(store.healing_count(), 1);
    }

    #[test]
    fn resolve_without_selector_fails_with_missing_selector() {
        let mut store = InMemoryStore::default();
        let selector_id = SelectorId("ghost".to_string());

        let result = resolve_or_create(&mut store, &selector_id, "<html/>", fixture_time());

        assert_eq!(result, Err(HealingError::MissingSelector(selector_id)));
        assert_eq!(store.healing_count(), 0);
    }

    #[test]
    fn resolve_absorbs_concurrent_first_writer() {
        let mut store = store_with_selector("sel1");
        store.simulate_concurrent_healing_insert = true;
        let selector_id = SelectorId("sel1".to_string());

        let healing = match resolve_or_create(&mut store, &selector_id, "<html/>", fixture_time())
        {
            Ok(healing) => healing,
            Err(err) => panic!("duplicate identity should be absorbed: {err}"),
        };

        assert_eq!(healing.healing_id, derive_healing_id(&selector_id, "<html/>"));
        assert_eq!(store.healing_count(), 1);
    }

    #[test]
    fn reconcile_returns_matching_result() {
        let healing_id = derive_healing_id(&SelectorId("sel1".to_string()), "<html/>");
        let results = vec![
            crate::test_support::mk_result(&healing_id, "#a", 0.9),
            crate::test_support::mk_result(&healing_id, "#b", 0.4),
        ];

        let selected = match reconcile(&results, "#b") {
            Ok(selected) => selected,
            Err(err) => panic!("#b should reconcile: {err}"),
        };
        assert_eq!(selected.healing_result_id, results[1].healing_result_id);

        let missing = reconcile(&results, "#c");
        assert!(matches!(missing, Err(HealingError::InternalConsistency(_))));
    }

    #[test]
    fn save_persists_healing_results_and_report() {
        let mut store = store_with_selector("sel1");

        let saved = match save_healing(
            &mut store,
            &attempt("sel1", "<html>A</html>", "#b"),
            ResultRetention::Append,
            fixture_time(),
        ) {
            Ok(saved) => saved,
            Err(err) => panic!("save should succeed: {err}"),
        };

        assert_eq!(store.healing_count(), 1);
        assert_eq!(store.results.len(), 2);
        assert_eq!(store.reports.len(), 1);
        assert_eq!(saved.selected.locator.value, "#b");
        assert_eq!(saved.report.healing_result_id, saved.selected.healing_result_id);
        assert_eq!(saved.report.session_key.as_deref(), Some("session-1"));
        assert!(saved.results.iter().all(|result| result.success.is_none()));
    }

    #[test]
    fn save_with_unknown_used_locator_is_internal_consistency_error() {
        let mut store = store_with_selector("sel1");

        let result = save_healing(
            &mut store,
            &attempt("sel1", "<html>A</html>", "#c"),
            ResultRetention::Append,
            fixture_time(),
        );

        assert!(matches!(result, Err(HealingError::InternalConsistency(_))));
        assert!(store.reports.is_empty());
    }

    #[test]
    fn save_rejects_attempt_without_candidates() {
        let mut store = store_with_selector("sel1");
        let mut empty = attempt("sel1", "<html>A</html>", "#a");
        empty.candidates.clear();

        let result = save_healing(&mut store, &empty, ResultRetention::Append, fixture_time());

        assert!(matches!(result, Err(HealingError::Validation(_))));
        assert_eq!(store.healing_count(), 0);
    }

    #[test]
    fn save_rejects_non_finite_scores() {
        let mut store = store_with_selector("sel1");
        let mut broken = attempt("sel1", "<html>A</html>", "#a");
        broken.candidates.push(candidate("#nan", f64::NAN));

        let result = save_healing(&mut store, &broken, ResultRetention::Append, fixture_time());

        assert!(matches!(result, Err(HealingError::Validation(_))));
    }

    #[test]
    fn repeated_attempts_append_results_by_default() {
        let mut store = store_with_selector("sel1");
        for _ in 0..2 {
            if let Err(err) = save_healing(
                &mut store,
                &attempt("sel1", "<html>A</html>", "#a"),
                ResultRetention::Append,
                fixture_time(),
            ) {
                panic!("save should succeed: {err}");
            }
        }

        assert_eq!(store.healing_count(), 1);
        assert_eq!(store.results.len(), 4);
        assert!(store.results.iter().all(|result| !result.superseded));
    }

    #[test]
    fn supersede_retention_marks_earlier_results() {
        let mut store = store_with_selector("sel1");
        for _ in 0..2 {
            if let Err(err) = save_healing(
                &mut store,
                &attempt("sel1", "<html>A</html>", "#a"),
                ResultRetention::Supersede,
                fixture_time(),
            ) {
                panic!("save should succeed: {err}");
            }
        }

        assert_eq!(store.results.len(), 4);
        assert_eq!(store.results.iter().filter(|result| result.superseded).count(), 2);

        let healings = match store.find_healings(&HealingQuery::default()) {
            Ok(healings) => healings,
            Err(err) => panic!("query should succeed: {err}"),
        };
        let views = crate::rank_healings(&healings);
        assert_eq!(views[0].results.len(), 2);
    }
}
