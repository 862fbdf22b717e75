use serde::{Deserialize, Serialize};

use crate::{HealingId, HealingResultId, Locator, SavedHealing, SelectorId};

/// Named partition of the external metrics store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum MetricsPartition {
    #[serde(rename = "successful-healing")]
    Successful,
    #[serde(rename = "unsuccessful-healing")]
    Unsuccessful,
}

impl MetricsPartition {
    #[must_use]
    pub fn for_outcome(success: bool) -> Self {
        if success {
            Self::Successful
        } else {
            Self::Unsuccessful
        }
    }

    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Successful => Self::Unsuccessful,
            Self::Unsuccessful => Self::Successful,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Successful => "successful-healing",
            Self::Unsuccessful => "unsuccessful-healing",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct PartitionMove {
    pub from: MetricsPartition,
    pub to: MetricsPartition,
    pub healing_result_id: HealingResultId,
}

impl PartitionMove {
    /// Relocate a result's telemetry into the partition matching `success`.
    #[must_use]
    pub fn for_outcome(healing_result_id: HealingResultId, success: bool) -> Self {
        let to = MetricsPartition::for_outcome(success);
        Self { from: to.opposite(), to, healing_result_id }
    }
}

/// Raw client metrics tagged with the reconciled result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsUpload {
    pub payload: String,
    pub healing_result_id: HealingResultId,
    pub healing_id: HealingId,
    pub selector_id: SelectorId,
    pub locator: Locator,
    pub score: f64,
    pub project_id: String,
    pub url: String,
}

impl MetricsUpload {
    #[must_use]
    pub fn for_selected(
        payload: String,
        saved: &SavedHealing,
        project_id: String,
        url: String,
    ) -> Self {
        Self {
            payload,
            healing_result_id: saved.selected.healing_result_id,
            healing_id: saved.healing.healing_id.clone(),
            selector_id: saved.healing.selector.selector_id.clone(),
            locator: saved.selected.locator.clone(),
            score: saved.selected.score,
            project_id,
            url,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MetricsError {
    #[error("metrics transport error: {0}")]
    Transport(String),
    #[error("metrics gateway rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("metrics dispatcher unavailable: {0}")]
    Unavailable(String),
}

/// Remote store holding per-result telemetry.
pub trait MetricsGateway: Send + Sync {
    /// # Errors
    /// Returns [`MetricsError`] when the upload does not reach the gateway.
    fn upload_metrics(&self, upload: &MetricsUpload) -> Result<(), MetricsError>;

    /// # Errors
    /// Returns [`MetricsError`] when the relocation does not reach the gateway.
    fn move_result(&self, relocation: &PartitionMove) -> Result<(), MetricsError>;
}

/// One best-effort side effect, executed after the primary transaction commits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum MetricsTask {
    Upload(MetricsUpload),
    Move(PartitionMove),
}

impl MetricsTask {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Upload(_) => "upload",
            Self::Move(_) => "move",
        }
    }

    #[must_use]
    pub fn healing_result_id(&self) -> HealingResultId {
        match self {
            Self::Upload(upload) => upload.healing_result_id,
            Self::Move(relocation) => relocation.healing_result_id,
        }
    }

    /// # Errors
    /// Propagates the gateway's [`MetricsError`].
    pub fn run(&self, gateway: &dyn MetricsGateway) -> Result<(), MetricsError> {
        match self {
            Self::Upload(upload) => gateway.upload_metrics(upload),
            Self::Move(relocation) => gateway.move_result(relocation),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsFailure {
    pub task: MetricsTask,
    pub error: MetricsError,
}
