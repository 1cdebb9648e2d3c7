//! Task records: the queue-side work item and the registry tracking every
//! task from admission to its terminal state.
//!
//! Status transitions form a DAG: PENDING -> (PROCESSING -> COMPLETED |
//! FAILED) | CANCELLED. Terminal tasks stay queryable in a bounded history.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::api::{EnrichedResult, MatchConfig, Roi, TaskPriority, TaskSpec, TaskStatus};
use crate::error::TaskError;
use crate::recognizer::RecognizeOptions;

pub(crate) type TaskOutcome = Result<EnrichedResult, TaskError>;

/// The work item owned by the queue, then by the worker processing it.
#[derive(Debug)]
pub(crate) struct QueuedTask {
    pub(crate) id: Uuid,
    pub(crate) payload: Arc<crate::api::ImagePayload>,
    pub(crate) roi: Option<Roi>,
    pub(crate) keywords: Vec<String>,
    pub(crate) priority: TaskPriority,
    pub(crate) matching: MatchConfig,
    pub(crate) options: RecognizeOptions,
    pub(crate) max_retries: u32,
    pub(crate) retry_count: u32,
    pub(crate) cancelled: Arc<AtomicBool>,
}

impl QueuedTask {
    pub(crate) fn from_spec(id: Uuid, spec: TaskSpec, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            id,
            payload: Arc::new(spec.payload),
            roi: spec.roi,
            keywords: spec.keywords,
            priority: spec.priority,
            matching: spec.matching,
            options: spec.options,
            max_retries: spec.max_retries,
            retry_count: 0,
            cancelled,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub(crate) struct TaskEntry {
    pub(crate) status: TaskStatus,
    pub(crate) priority: TaskPriority,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
    pub(crate) retry_count: u32,
    pub(crate) instance_id: Option<String>,
    pub(crate) result: Option<EnrichedResult>,
    pub(crate) error: Option<TaskError>,
    pub(crate) done_tx: Option<oneshot::Sender<TaskOutcome>>,
    pub(crate) cancelled: Arc<AtomicBool>,
}

/// All tasks the pool knows about, keyed by id. Terminal entries are
/// evicted oldest-first once the history cap is reached.
pub(crate) struct TaskRegistry {
    entries: HashMap<Uuid, TaskEntry>,
    terminal: VecDeque<Uuid>,
    terminal_cap: usize,
}

impl TaskRegistry {
    pub(crate) const DEFAULT_TERMINAL_CAP: usize = 1000;

    pub(crate) fn new(terminal_cap: usize) -> Self {
        Self {
            entries: HashMap::new(),
            terminal: VecDeque::new(),
            terminal_cap: terminal_cap.max(1),
        }
    }

    pub(crate) fn insert(
        &mut self,
        id: Uuid,
        priority: TaskPriority,
        cancelled: Arc<AtomicBool>,
        done_tx: Option<oneshot::Sender<TaskOutcome>>,
    ) {
        self.entries.insert(
            id,
            TaskEntry {
                status: TaskStatus::Pending,
                priority,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                retry_count: 0,
                instance_id: None,
                result: None,
                error: None,
                done_tx,
                cancelled,
            },
        );
    }

    pub(crate) fn remove(&mut self, id: &Uuid) {
        self.entries.remove(id);
    }

    pub(crate) fn status(&self, id: &Uuid) -> Option<TaskStatus> {
        self.entries.get(id).map(|entry| entry.status)
    }

    pub(crate) fn result(&self, id: &Uuid) -> Option<EnrichedResult> {
        self.entries
            .get(id)
            .filter(|entry| entry.status == TaskStatus::Completed)
            .and_then(|entry| entry.result.clone())
    }

    pub(crate) fn entry(&self, id: &Uuid) -> Option<&TaskEntry> {
        self.entries.get(id)
    }

    /// PENDING -> PROCESSING when a worker binds the task to an instance.
    pub(crate) fn set_processing(&mut self, id: &Uuid, instance_id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            if entry.status == TaskStatus::Pending {
                entry.status = TaskStatus::Processing;
                entry.started_at = Some(Utc::now());
                entry.instance_id = Some(instance_id.to_string());
            }
        }
    }

    /// PROCESSING -> PENDING on a retryable failure.
    pub(crate) fn set_retrying(&mut self, id: &Uuid, retry_count: u32) {
        if let Some(entry) = self.entries.get_mut(id) {
            if entry.status == TaskStatus::Processing {
                entry.status = TaskStatus::Pending;
                entry.retry_count = retry_count;
                entry.instance_id = None;
            }
        }
    }

    /// Resolve a task. The completion handle fires exactly once; later
    /// calls on a terminal task are ignored.
    pub(crate) fn finish(&mut self, id: &Uuid, outcome: TaskOutcome) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        if entry.status.is_terminal() {
            return;
        }

        entry.completed_at = Some(Utc::now());
        match &outcome {
            Ok(result) => {
                entry.status = TaskStatus::Completed;
                entry.result = Some(result.clone());
            }
            Err(TaskError::Cancelled) => {
                entry.status = TaskStatus::Cancelled;
                entry.error = Some(TaskError::Cancelled);
            }
            Err(err) => {
                entry.status = TaskStatus::Failed;
                entry.error = Some(err.clone());
            }
        }

        if let Some(tx) = entry.done_tx.take() {
            let _ = tx.send(outcome);
        }

        self.terminal.push_back(*id);
        while self.terminal.len() > self.terminal_cap {
            if let Some(old) = self.terminal.pop_front() {
                self.entries.remove(&old);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::OptimizationInfo;

    fn empty_result() -> EnrichedResult {
        EnrichedResult {
            original_result: Vec::new(),
            processed_result: Vec::new(),
            keyword_matches: Vec::new(),
            optimization_info: OptimizationInfo::default(),
        }
    }

    fn insert_task(reg: &mut TaskRegistry) -> Uuid {
        let id = Uuid::new_v4();
        reg.insert(id, TaskPriority::Normal, Arc::new(AtomicBool::new(false)), None);
        id
    }

    #[test]
    fn status_progresses_along_the_dag_only() {
        let mut reg = TaskRegistry::new(10);
        let id = insert_task(&mut reg);
        assert_eq!(reg.status(&id), Some(TaskStatus::Pending));

        reg.set_processing(&id, "ocr-a");
        assert_eq!(reg.status(&id), Some(TaskStatus::Processing));

        reg.finish(&id, Ok(empty_result()));
        assert_eq!(reg.status(&id), Some(TaskStatus::Completed));

        // Terminal is terminal: a late failure changes nothing.
        reg.finish(&id, Err(TaskError::Recognition("late".to_string())));
        assert_eq!(reg.status(&id), Some(TaskStatus::Completed));
        assert!(reg.result(&id).is_some());
    }

    #[test]
    fn pending_may_cancel_without_processing() {
        let mut reg = TaskRegistry::new(10);
        let id = insert_task(&mut reg);
        reg.finish(&id, Err(TaskError::Cancelled));
        assert_eq!(reg.status(&id), Some(TaskStatus::Cancelled));
        assert!(reg.result(&id).is_none());
    }

    #[test]
    fn retry_returns_the_task_to_pending() {
        let mut reg = TaskRegistry::new(10);
        let id = insert_task(&mut reg);
        reg.set_processing(&id, "ocr-a");
        reg.set_retrying(&id, 1);
        assert_eq!(reg.status(&id), Some(TaskStatus::Pending));
        assert_eq!(reg.entry(&id).unwrap().retry_count, 1);
        assert!(reg.entry(&id).unwrap().instance_id.is_none());
    }

    #[test]
    fn completion_handle_fires_once_with_the_outcome() {
        let mut reg = TaskRegistry::new(10);
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        reg.insert(id, TaskPriority::High, Arc::new(AtomicBool::new(false)), Some(tx));

        reg.set_processing(&id, "ocr-a");
        reg.finish(&id, Err(TaskError::Recognition("boom".to_string())));

        let outcome = rx.blocking_recv().unwrap();
        assert_eq!(outcome, Err(TaskError::Recognition("boom".to_string())));
    }

    #[test]
    fn terminal_history_is_bounded() {
        let mut reg = TaskRegistry::new(3);
        let ids: Vec<Uuid> = (0..5).map(|_| insert_task(&mut reg)).collect();
        for id in &ids {
            reg.finish(id, Ok(empty_result()));
        }
        // The two oldest terminal tasks were evicted.
        assert!(reg.status(&ids[0]).is_none());
        assert!(reg.status(&ids[1]).is_none());
        assert!(reg.status(&ids[4]).is_some());
    }
}
