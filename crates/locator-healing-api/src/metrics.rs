use std::fmt;
use std::sync::mpsc::{self, Sender, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use locator_healing_core::{
    MetricsError, MetricsFailure, MetricsGateway, MetricsTask, MetricsUpload, PartitionMove,
};

/// Tasks the worker holds before new ones are dropped.
pub const DEFAULT_WORKER_QUEUE_CAPACITY: usize = 1024;

/// Runs metrics side effects after the primary transaction has committed.
///
/// Failures never reach the caller: they are logged at `warn` and, when a failure sink is
/// attached, forwarded to it as [`MetricsFailure`].
#[derive(Clone, Default)]
pub struct MetricsDispatcher {
    mode: DispatchMode,
}

#[derive(Clone, Default)]
enum DispatchMode {
    #[default]
    Disabled,
    Inline {
        gateway: Arc<dyn MetricsGateway>,
        failures: Option<Sender<MetricsFailure>>,
    },
    Worker {
        sender: SyncSender<MetricsTask>,
        failures: Option<Sender<MetricsFailure>>,
    },
}

impl fmt::Debug for MetricsDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsDispatcher").field("mode", &self.mode_name()).finish()
    }
}

impl MetricsDispatcher {
    #[must_use]
    pub fn disabled() -> Self {
        Self { mode: DispatchMode::Disabled }
    }

    /// Run every task on the calling thread.
    #[must_use]
    pub fn inline(
        gateway: Arc<dyn MetricsGateway>,
        failures: Option<Sender<MetricsFailure>>,
    ) -> Self {
        Self { mode: DispatchMode::Inline { gateway, failures } }
    }

    /// Hand tasks to a dedicated background thread through a queue of `capacity` slots.
    /// When the queue is full the task is dropped and reported as
    /// [`MetricsError::Unavailable`]. The thread exits once every clone of the returned
    /// dispatcher has been dropped.
    ///
    /// # Errors
    /// Returns an error when the worker thread cannot be spawned.
    pub fn worker(
        gateway: Arc<dyn MetricsGateway>,
        failures: Option<Sender<MetricsFailure>>,
        capacity: usize,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<MetricsTask>(capacity.max(1));
        let worker_failures = failures.clone();
        thread::Builder::new()
            .name("metrics-dispatch".to_string())
            .spawn(move || {
                for task in receiver {
                    run_task(gateway.as_ref(), task, worker_failures.as_ref());
                }
                tracing::debug!("metrics dispatcher stopped");
            })
            .context("failed to spawn metrics dispatcher thread")?;
        Ok(Self { mode: DispatchMode::Worker { sender, failures } })
    }

    #[must_use]
    pub fn mode_name(&self) -> &'static str {
        match self.mode {
            DispatchMode::Disabled => "disabled",
            DispatchMode::Inline { .. } => "inline",
            DispatchMode::Worker { .. } => "worker",
        }
    }

    pub fn dispatch(&self, task: MetricsTask) {
        match &self.mode {
            DispatchMode::Disabled => {
                tracing::debug!(task = task.label(), "metrics dispatch disabled, skipping");
            }
            DispatchMode::Inline { gateway, failures } => {
                run_task(gateway.as_ref(), task, failures.as_ref());
            }
            DispatchMode::Worker { sender, failures } => {
                let (task, reason) = match sender.try_send(task) {
                    Ok(()) => return,
                    Err(TrySendError::Full(task)) => (task, "metrics queue is full"),
                    Err(TrySendError::Disconnected(task)) => (task, "metrics worker is gone"),
                };
                tracing::warn!(
                    task = task.label(),
                    healing_result_id = %task.healing_result_id(),
                    reason,
                    "dropping metrics task"
                );
                if let Some(sink) = failures {
                    let _ = sink.send(MetricsFailure {
                        task,
                        error: MetricsError::Unavailable(reason.to_string()),
                    });
                }
            }
        }
    }
}

fn run_task(
    gateway: &dyn MetricsGateway,
    task: MetricsTask,
    failures: Option<&Sender<MetricsFailure>>,
) {
    match task.run(gateway) {
        Ok(()) => {
            tracing::debug!(
                task = task.label(),
                healing_result_id = %task.healing_result_id(),
                "metrics side effect delivered"
            );
        }
        Err(error) => {
            tracing::warn!(
                task = task.label(),
                healing_result_id = %task.healing_result_id(),
                %error,
                "metrics side effect failed"
            );
            if let Some(sink) = failures {
                let _ = sink.send(MetricsFailure { task, error });
            }
        }
    }
}

/// Metrics gateway speaking JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpMetricsGateway {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpMetricsGateway {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { endpoint, agent }
    }

    fn post(&self, path: &str, body: &serde_json::Value) -> Result<(), MetricsError> {
        let url = format!("{}{path}", self.endpoint);
        match self.agent.post(&url).send_json(body) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(status, response)) => Err(MetricsError::Rejected {
                status,
                message: response.into_string().unwrap_or_default(),
            }),
            Err(err) => Err(MetricsError::Transport(format!("{url}: {err}"))),
        }
    }
}

impl MetricsGateway for HttpMetricsGateway {
    fn upload_metrics(&self, upload: &MetricsUpload) -> Result<(), MetricsError> {
        let body = serde_json::json!({
            "payload": upload.payload,
            "tags": {
                "healing_result_id": upload.healing_result_id,
                "healing_id": upload.healing_id,
                "selector_id": upload.selector_id,
                "locator": upload.locator,
                "score": upload.score,
                "project_id": upload.project_id,
                "url": upload.url,
            },
        });
        self.post("/metrics", &body)
    }

    fn move_result(&self, relocation: &PartitionMove) -> Result<(), MetricsError> {
        let body = serde_json::json!({
            "from": relocation.from,
            "to": relocation.to,
            "healing_result_id": relocation.healing_result_id,
        });
        self.post("/metrics/move", &body)
    }
}
