//! Admission-controlled priority queue: four FIFO lanes swept from
//! CRITICAL down to LOW, bounded by a single total capacity.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use uuid::Uuid;

use crate::api::QueueDepths;
use crate::task::QueuedTask;

pub(crate) struct TaskQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

struct QueueState {
    lanes: [VecDeque<QueuedTask>; 4],
    closed: bool,
}

impl QueueState {
    fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    fn pop_next(&mut self) -> Option<QueuedTask> {
        self.lanes.iter_mut().find_map(VecDeque::pop_front)
    }
}

impl TaskQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                lanes: Default::default(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().expect("task queue lock poisoned")
    }

    /// Admit a task at the tail of its priority lane. On denial the task is
    /// handed back untouched and queue contents are unchanged.
    pub(crate) fn try_push(&self, task: QueuedTask) -> Result<(), QueuedTask> {
        {
            let mut state = self.lock();
            if state.closed || state.len() >= self.capacity {
                return Err(task);
            }
            let lane = task.priority.lane();
            state.lanes[lane].push_back(task);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Put a task back at the head of its lane (dispatch found no eligible
    /// instance; ordering within the priority is preserved).
    pub(crate) fn push_front(&self, task: QueuedTask) {
        {
            let mut state = self.lock();
            let lane = task.priority.lane();
            state.lanes[lane].push_front(task);
        }
        self.notify.notify_one();
    }

    /// Take the next task, sweeping lanes highest-priority first. `None`
    /// after `timeout`, or immediately once the queue is closed and empty
    /// of claimable work.
    pub(crate) async fn take(&self, timeout: Duration) -> Option<QueuedTask> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(task) = state.pop_next() {
                    return Some(task);
                }
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);

            // Re-check after registering for wakeups so a push between the
            // two cannot be missed.
            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(task) = state.pop_next() {
                    return Some(task);
                }
            }

            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                return None;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Remove a pending task by id. True iff it was queued.
    pub(crate) fn remove(&self, id: Uuid) -> bool {
        let mut state = self.lock();
        for lane in state.lanes.iter_mut() {
            if let Some(pos) = lane.iter().position(|task| task.id == id) {
                lane.remove(pos);
                return true;
            }
        }
        false
    }

    /// Stop admitting and waking; `take` returns `None` from now on.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub(crate) fn depths(&self) -> QueueDepths {
        let state = self.lock();
        QueueDepths {
            critical: state.lanes[0].len(),
            high: state.lanes[1].len(),
            normal: state.lanes[2].len(),
            low: state.lanes[3].len(),
        }
    }

    /// Remove and return everything still queued (shutdown path).
    pub(crate) fn drain(&self) -> Vec<QueuedTask> {
        let mut state = self.lock();
        let mut out = Vec::with_capacity(state.len());
        for lane in state.lanes.iter_mut() {
            out.extend(lane.drain(..));
        }
        out
    }
}
