use serde::{Deserialize, Serialize};

use crate::{
    Healing, HealingError, HealingId, HealingResult, HealingResultId, ReportRecord, Selector,
    SelectorId,
};

/// Conjunctive exact-match filter over selector attributes; empty matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct HealingQuery {
    pub selector_id: Option<SelectorId>,
    pub class_name: Option<String>,
    pub method_name: Option<String>,
    pub locator_value: Option<String>,
    pub url: Option<String>,
}

pub trait SelectorRepository {
    /// # Errors
    /// Returns [`HealingError::Storage`] when the lookup fails.
    fn find_selector(&self, selector_id: &SelectorId) -> Result<Option<Selector>, HealingError>;

    /// # Errors
    /// Returns [`HealingError::DuplicateIdentity`] when the selector id already exists.
    fn insert_selector(&mut self, selector: &Selector) -> Result<(), HealingError>;
}

pub trait HealingRepository {
    /// Load one healing with its selector and results in insertion order.
    ///
    /// # Errors
    /// Returns [`HealingError::Storage`] when the lookup fails.
    fn find_healing(&self, healing_id: &HealingId) -> Result<Option<Healing>, HealingError>;

    /// Insert a healing row. `healing.results` is ignored.
    ///
    /// # Errors
    /// Returns [`HealingError::DuplicateIdentity`] when the healing id already exists.
    fn insert_healing(&mut self, healing: &Healing) -> Result<(), HealingError>;

    /// Load matching healings in creation order, each with results in insertion order.
    ///
    /// # Errors
    /// Returns [`HealingError::Storage`] when the query fails.
    fn find_healings(&self, query: &HealingQuery) -> Result<Vec<Healing>, HealingError>;
}

pub trait HealingResultRepository {
    /// Insert every result or none of them.
    ///
    /// # Errors
    /// Returns [`HealingError::Storage`] when any insert fails.
    fn insert_results(&mut self, results: &[HealingResult]) -> Result<(), HealingError>;

    /// Mark all current results of a healing superseded, returning how many changed.
    ///
    /// # Errors
    /// Returns [`HealingError::Storage`] when the update fails.
    fn supersede_results(&mut self, healing_id: &HealingId) -> Result<usize, HealingError>;

    /// # Errors
    /// Returns [`HealingError::Storage`] when the lookup fails.
    fn find_result(
        &self,
        healing_result_id: HealingResultId,
    ) -> Result<Option<HealingResult>, HealingError>;

    /// # Errors
    /// Returns [`HealingError::Storage`] when the update fails.
    fn update_result_success(
        &mut self,
        healing_result_id: HealingResultId,
        success: bool,
    ) -> Result<(), HealingError>;
}

pub trait ReportRepository {
    /// # Errors
    /// Returns [`HealingError::Storage`] when the insert fails.
    fn insert_report_record(&mut self, record: &ReportRecord) -> Result<(), HealingError>;
}

/// Everything one save or feedback unit of work touches.
pub trait HealingStore:
    SelectorRepository + HealingRepository + HealingResultRepository + ReportRepository
{
}

impl<T> HealingStore for T where
    T: SelectorRepository + HealingRepository + HealingResultRepository + ReportRepository + ?Sized
{
}
