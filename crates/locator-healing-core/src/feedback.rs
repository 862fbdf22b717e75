use serde::{Deserialize, Serialize};

use crate::{
    FeedbackState, HealingError, HealingResult, HealingResultId, HealingResultRepository,
    PartitionMove,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackTransition {
    pub result: HealingResult,
    pub previous: FeedbackState,
    pub current: FeedbackState,
}

impl FeedbackTransition {
    /// Metrics relocation mirroring the new success flag.
    #[must_use]
    pub fn relocation(&self) -> PartitionMove {
        let success = self.current == FeedbackState::Successful;
        PartitionMove::for_outcome(self.result.healing_result_id, success)
    }
}

/// Set a result's success flag. Feedback for an unknown result is dropped (`Ok(None)`).
///
/// Later feedback overwrites earlier feedback.
///
/// # Errors
/// Propagates store failures.
pub fn apply_feedback<S>(
    store: &mut S,
    healing_result_id: HealingResultId,
    success: bool,
) -> Result<Option<FeedbackTransition>, HealingError>
where
    S: HealingResultRepository + ?Sized,
{
    let Some(mut result) = store.find_result(healing_result_id)? else {
        return Ok(None);
    };

    let previous = result.feedback_state();
    store.update_result_success(healing_result_id, success)?;
    result.success = Some(success);

    Ok(Some(FeedbackTransition { previous, current: result.feedback_state(), result }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{mk_result, InMemoryStore};
    use crate::{HealingId, MetricsPartition};

    fn seeded_store() -> (InMemoryStore, HealingResultId) {
        let mut store = InMemoryStore::default();
        let result = mk_result(&HealingId("h1".to_string()), "#a", 0.9);
        let id = result.healing_result_id;
        store.results.push(result);
        (store, id)
    }

    fn stored_flag(store: &InMemoryStore, id: HealingResultId) -> Option<bool> {
        store
            .results
            .iter()
            .find(|result| result.healing_result_id == id)
            .and_then(|result| result.success)
    }

    #[test]
    fn feedback_moves_unknown_result_to_successful() {
        let (mut store, id) = seeded_store();

        let transition = match apply_feedback(&mut store, id, true) {
            Ok(Some(transition)) => transition,
            other => panic!("feedback should apply: {other:?}"),
        };

        assert_eq!(transition.previous, FeedbackState::Unknown);
        assert_eq!(transition.current, FeedbackState::Successful);
        assert_eq!(transition.relocation().to, MetricsPartition::Successful);
        assert_eq!(transition.relocation().from, MetricsPartition::Unsuccessful);
        assert_eq!(stored_flag(&store, id), Some(true));
    }

    #[test]
    fn last_feedback_wins() {
        let (mut store, id) = seeded_store();

        for success in [true, false] {
            if let Err(err) = apply_feedback(&mut store, id, success) {
                panic!("feedback should apply: {err}");
            }
        }

        assert_eq!(stored_flag(&store, id), Some(false));
    }

    #[test]
    fn repeated_feedback_reports_previous_state() {
        let (mut store, id) = seeded_store();
        if let Err(err) = apply_feedback(&mut store, id, false) {
            panic!("feedback should apply: {err}");
        }

        let transition = match apply_feedback(&mut store, id, true) {
            Ok(Some(transition)) => transition,
            other => panic!("feedback should apply: {other:?}"),
        };

        assert_eq!(transition.previous, FeedbackState::Unsuccessful);
        assert_eq!(transition.current, FeedbackState::Successful);
    }

    #[test]
    fn feedback_for_unknown_result_is_a_no_op() {
        let (mut store, id) = seeded_store();

        let outcome = apply_feedback(&mut store, HealingResultId::new(), true);

        assert_eq!(outcome, Ok(None));
        assert_eq!(stored_flag(&store, id), None);
    }
}
