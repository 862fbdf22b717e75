use std::borrow::Borrow;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{Healing, HealingResult, HealingResultId, Locator, Selector, SelectorId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedCandidate {
    pub healing_result_id: HealingResultId,
    pub locator: Locator,
    pub score: f64,
    pub success: Option<bool>,
}

impl From<&HealingResult> for RankedCandidate {
    fn from(result: &HealingResult) -> Self {
        Self {
            healing_result_id: result.healing_result_id,
            locator: result.locator.clone(),
            score: result.score,
            success: result.success,
        }
    }
}

/// Best-known alternatives for one selector, highest score first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedSelectorView {
    pub selector_id: SelectorId,
    pub class_name: String,
    pub method_name: String,
    pub locator: String,
    pub results: Vec<RankedCandidate>,
}

/// Stable sort by score descending; equal scores keep encounter order.
pub fn sort_by_score<T: Borrow<HealingResult>>(results: &mut [T]) {
    results.sort_by(|lhs, rhs| {
        rhs.borrow().score.partial_cmp(&lhs.borrow().score).unwrap_or(Ordering::Equal)
    });
}

/// Group healings by selector and keep the highest-scored result per distinct locator value.
///
/// Results are pooled per selector in encounter order (healing order, then result order).
/// Superseded results do not take part. Views are ordered by selector id.
#[must_use]
pub fn rank_healings(records: &[Healing]) -> Vec<RankedSelectorView> {
    let mut groups: BTreeMap<&SelectorId, (&Selector, Vec<&HealingResult>)> = BTreeMap::new();
    for healing in records {
        let (_, pool) = groups
            .entry(&healing.selector.selector_id)
            .or_insert_with(|| (&healing.selector, Vec::new()));
        pool.extend(healing.results.iter().filter(|result| !result.superseded));
    }

    groups
        .into_values()
        .map(|(selector, pool)| RankedSelectorView {
            selector_id: selector.selector_id.clone(),
            class_name: selector.class_name.clone(),
            method_name: selector.method_name.clone(),
            locator: selector.locator.value.clone(),
            results: best_per_locator(pool),
        })
        .collect()
}

fn best_per_locator(mut pool: Vec<&HealingResult>) -> Vec<RankedCandidate> {
    sort_by_score(&mut pool);

    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut ranked = Vec::new();
    for result in pool {
        if seen.insert(result.locator.value.as_str()) {
            ranked.push(RankedCandidate::from(result));
        }
    }
    ranked
}
