use time::{Duration, OffsetDateTime};

use crate::{
    Healing, HealingError, HealingId, HealingQuery, HealingRepository, HealingResult,
    HealingResultId, HealingResultRepository, Locator, ReportRecord, ReportRepository, Selector,
    SelectorId, SelectorRepository,
};

pub fn fixture_time() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
}

/// Exact-match evaluation of a [`HealingQuery`], mirroring the store's SQL filter.
pub fn query_matches(query: &HealingQuery, selector: &Selector) -> bool {
    fn field_matches(filter: Option<&str>, value: &str) -> bool {
        match filter {
            Some(expected) => expected == value,
            None => true,
        }
    }

    let selector_id = query.selector_id.as_ref().map(SelectorId::as_str);

    field_matches(selector_id, selector.selector_id.as_str())
        && field_matches(query.class_name.as_deref(), &selector.class_name)
        && field_matches(query.method_name.as_deref(), &selector.method_name)
        && field_matches(query.locator_value.as_deref(), &selector.locator.value)
        && field_matches(query.url.as_deref(), &selector.url)
}

pub fn mk_selector(id: &str) -> Selector {
    Selector {
        selector_id: SelectorId(id.to_string()),
        class_name: "LoginTest".to_string(),
        method_name: "testLogin".to_string(),
        locator: Locator::new("css", "#login"),
        url: "http://localhost/login".to_string(),
        command: "findElement".to_string(),
        created_at: fixture_time(),
    }
}

pub fn mk_result(healing_id: &HealingId, value: &str, score: f64) -> HealingResult {
    HealingResult {
        healing_result_id: HealingResultId::new(),
        healing_id: healing_id.clone(),
        locator: Locator::new("css", value),
        score,
        success: None,
        superseded: false,
        created_at: fixture_time(),
    }
}

/// Vec-backed store. `simulate_concurrent_healing_insert` makes the next healing insert
/// behave as if another writer committed the same row first.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    pub selectors: Vec<Selector>,
    pub healings: Vec<Healing>,
    pub results: Vec<HealingResult>,
    pub reports: Vec<ReportRecord>,
    pub simulate_concurrent_healing_insert: bool,
}

impl InMemoryStore {
    pub fn seed_selector(&mut self, selector: Selector) {
        self.selectors.push(selector);
    }

    pub fn healing_count(&self) -> usize {
        self.healings.len()
    }

    fn with_results(&self, healing: &Healing) -> Healing {
        let mut loaded = healing.clone();
        loaded.results = self
            .results
            .iter()
            .filter(|result| result.healing_id == healing.healing_id)
            .cloned()
            .collect();
        loaded
    }
}

impl SelectorRepository for InMemoryStore {
    fn find_selector(&self, selector_id: &SelectorId) -> Result<Option<Selector>, HealingError> {
        Ok(self.selectors.iter().find(|selector| selector.selector_id == *selector_id).cloned())
    }

    fn insert_selector(&mut self, selector: &Selector) -> Result<(), HealingError> {
        if self.find_selector(&selector.selector_id)?.is_some() {
            return Err(HealingError::DuplicateIdentity(selector.selector_id.to_string()));
        }
        self.selectors.push(selector.clone());
        Ok(())
    }
}

impl HealingRepository for InMemoryStore {
    fn find_healing(&self, healing_id: &HealingId) -> Result<Option<Healing>, HealingError> {
        Ok(self
            .healings
            .iter()
            .find(|healing| healing.healing_id == *healing_id)
            .map(|healing| self.with_results(healing)))
    }

    fn insert_healing(&mut self, healing: &Healing) -> Result<(), HealingError> {
        if self.simulate_concurrent_healing_insert {
            self.simulate_concurrent_healing_insert = false;
            self.healings.push(Healing { results: Vec::new(), ..healing.clone() });
            return Err(HealingError::DuplicateIdentity(healing.healing_id.to_string()));
        }
        if self.healings.iter().any(|existing| existing.healing_id == healing.healing_id) {
            return Err(HealingError::DuplicateIdentity(healing.healing_id.to_string()));
        }
        self.healings.push(Healing { results: Vec::new(), ..healing.clone() });
        Ok(())
    }

    fn find_healings(&self, query: &HealingQuery) -> Result<Vec<Healing>, HealingError> {
        Ok(self
            .healings
            .iter()
            .filter(|healing| query_matches(query, &healing.selector))
            .map(|healing| self.with_results(healing))
            .collect())
    }
}

impl HealingResultRepository for InMemoryStore {
    fn insert_results(&mut self, results: &[HealingResult]) -> Result<(), HealingError> {
        self.results.extend_from_slice(results);
        Ok(())
    }

    fn supersede_results(&mut self, healing_id: &HealingId) -> Result<usize, HealingError> {
        let mut changed = 0;
        for result in &mut self.results {
            if result.healing_id == *healing_id && !result.superseded {
                result.superseded = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn find_result(
        &self,
        healing_result_id: HealingResultId,
    ) -> Result<Option<HealingResult>, HealingError> {
        Ok(self.results.iter().find(|result| result.healing_result_id == healing_result_id).cloned())
    }

    fn update_result_success(
        &mut self,
        healing_result_id: HealingResultId,
        success: bool,
    ) -> Result<(), HealingError> {
        match self.results.iter_mut().find(|result| result.healing_result_id == healing_result_id)
        {
            Some(result) => {
                result.success = Some(success);
                Ok(())
            }
            None => Err(HealingError::Storage(format!(
                "healing result not found: {healing_result_id}"
            ))),
        }
    }
}

impl ReportRepository for InMemoryStore {
    fn insert_report_record(&mut self, record: &ReportRecord) -> Result<(), HealingError> {
        self.reports.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_filters_are_conjunctive_and_empty_matches_everything() {
        let selector = mk_selector("sel-1");
        assert!(query_matches(&HealingQuery::default(), &selector));

        let by_class =
            HealingQuery { class_name: Some("LoginTest".to_string()), ..HealingQuery::default() };
        assert!(query_matches(&by_class, &selector));

        let mismatched = HealingQuery {
            url: Some("http://localhost/other".to_string()),
            ..by_class
        };
        assert!(!query_matches(&mismatched, &selector));
    }
}
