//! Fire-and-forget delivery of terminal tasks to a history sink

use crate::collaborators::HistorySink;
use crate::tasks::Task;
use crossbeam_channel::{bounded, Sender, TrySendError};
use std::sync::Arc;

/// Default queue depth between the task store and the sink
pub const HISTORY_QUEUE: usize = 256;

/// Hands terminal tasks to a sink on a background thread
///
/// `notify` never blocks: a full queue drops the task with a warning.
#[derive(Clone)]
pub struct HistoryDispatcher {
    tx: Sender<Task>,
}

impl HistoryDispatcher {
    pub fn spawn(sink: Arc<dyn HistorySink>, capacity: usize) -> Self {
        let (tx, rx) = bounded::<Task>(capacity.max(1));
        let spawned = std::thread::Builder::new()
            .name("parley-history".into())
            .spawn(move || {
                for task in rx.iter() {
                    sink.record(&task);
                }
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to start history thread");
        }
        Self { tx }
    }

    pub fn notify(&self, task: &Task) {
        match self.tx.try_send(task.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) => {
                tracing::warn!(task_id = %task.id, "history queue full, dropping task");
            }
            Err(TrySendError::Disconnected(task)) => {
                tracing::debug!(task_id = %task.id, "history sink gone");
            }
        }
    }
}

/// Logs each finished task
pub struct TracingHistory;

impl HistorySink for TracingHistory {
    fn record(&self, task: &Task) {
        tracing::info!(
            task_id = %task.id,
            status = %task.status,
            direction = ?task.direction,
            artifacts = task.artifacts.len(),
            error = ?task.error.as_ref().map(|e| e.kind.as_str()),
            "task finished"
        );
    }
}
