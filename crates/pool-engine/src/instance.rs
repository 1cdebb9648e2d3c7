//! One pooled worker unit: a recognizer handle plus identity, lifecycle
//! state and usage statistics.
//!
//! Status rules: an instance is eligible for dispatch iff READY or IDLE.
//! A selected instance is RUNNING while bound to a task and BUSY strictly
//! during the blocking recognizer call. ERROR excludes it from dispatch
//! until restarted; STOPPED releases its port.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};

use hony_pool_core::ModelConfig;

use crate::api::{InstanceDetail, InstanceModelInfo, InstanceStatus, InstanceSummary};
use crate::recognizer::{Recognizer, RecognizerError, RecognizerFactory, warmup_image};

const RESPONSE_RING_CAP: usize = 100;
const LOG_RING_CAP: usize = 200;

pub(crate) struct Instance {
    pub(crate) id: String,
    port: AtomicU16,
    pub(crate) created_at: DateTime<Utc>,
    state: Mutex<InstanceState>,
    recognizer: tokio::sync::Mutex<Option<Box<dyn Recognizer>>>,
}

struct InstanceState {
    status: InstanceStatus,
    last_activity: DateTime<Utc>,
    last_used: Option<DateTime<Utc>>,
    processed_requests: u64,
    error_count: u64,
    response_times: VecDeque<f64>,
    memory_mb: f64,
    cpu_percent: f64,
    error_since: Option<Instant>,
    log: VecDeque<String>,
}

impl InstanceState {
    fn avg_response_time(&self) -> f64 {
        if self.response_times.is_empty() {
            return 0.0;
        }
        self.response_times.iter().sum::<f64>() / self.response_times.len() as f64
    }
}

impl Instance {
    pub(crate) fn new(id: String, port: u16) -> Self {
        let now = Utc::now();
        Self {
            id,
            port: AtomicU16::new(port),
            created_at: now,
            state: Mutex::new(InstanceState {
                status: InstanceStatus::Starting,
                last_activity: now,
                last_used: None,
                processed_requests: 0,
                error_count: 0,
                response_times: VecDeque::with_capacity(RESPONSE_RING_CAP),
                memory_mb: 0.0,
                cpu_percent: 0.0,
                error_since: None,
                log: VecDeque::with_capacity(LOG_RING_CAP),
            }),
            recognizer: tokio::sync::Mutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InstanceState> {
        self.state.lock().expect("instance state lock poisoned")
    }

    /// Currently allocated port. Released on STOPPED and replaced on a
    /// later start.
    pub(crate) fn port(&self) -> u16 {
        self.port.load(Ordering::Relaxed)
    }

    pub(crate) fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::Relaxed);
    }

    pub(crate) fn status(&self) -> InstanceStatus {
        self.lock().status
    }

    pub(crate) fn set_status(&self, status: InstanceStatus) {
        let mut state = self.lock();
        Self::apply_status(&mut state, &self.id, status);
    }

    fn apply_status(state: &mut InstanceState, id: &str, status: InstanceStatus) {
        if state.status == status {
            return;
        }
        state.status = status;
        state.last_activity = Utc::now();
        state.error_since = match status {
            InstanceStatus::Error => Some(Instant::now()),
            _ => None,
        };
        Self::log_line(state, format!("instance {id} -> {}", status.as_str()));
    }

    /// Atomically claim an eligible instance for a task.
    pub(crate) fn try_mark_running(&self) -> bool {
        let mut state = self.lock();
        if !state.status.is_eligible() {
            return false;
        }
        Self::apply_status(&mut state, &self.id, InstanceStatus::Running);
        true
    }

    /// RUNNING -> BUSY around the blocking recognizer call.
    pub(crate) fn mark_busy(&self) {
        let mut state = self.lock();
        if state.status == InstanceStatus::Running {
            Self::apply_status(&mut state, &self.id, InstanceStatus::Busy);
        }
    }

    /// Return the instance to the available set after an attempt. Exactly
    /// one caller (the worker that ran the task) invokes this per dispatch.
    pub(crate) fn release(&self, response_time_sec: Option<f64>, success: bool) {
        let mut state = self.lock();
        if let Some(elapsed) = response_time_sec {
            if state.response_times.len() == RESPONSE_RING_CAP {
                state.response_times.pop_front();
            }
            state.response_times.push_back(elapsed);
        }
        if success {
            state.processed_requests += 1;
        } else {
            state.error_count += 1;
        }
        state.last_used = Some(Utc::now());
        if matches!(state.status, InstanceStatus::Running | InstanceStatus::Busy) {
            Self::apply_status(&mut state, &self.id, InstanceStatus::Idle);
        }
    }

    /// Return the instance to the available set without touching the
    /// success/failure counters (bad input, discarded cancellation output).
    pub(crate) fn release_neutral(&self, response_time_sec: Option<f64>) {
        let mut state = self.lock();
        if let Some(elapsed) = response_time_sec {
            if state.response_times.len() == RESPONSE_RING_CAP {
                state.response_times.pop_front();
            }
            state.response_times.push_back(elapsed);
        }
        state.last_used = Some(Utc::now());
        if matches!(state.status, InstanceStatus::Running | InstanceStatus::Busy) {
            Self::apply_status(&mut state, &self.id, InstanceStatus::Idle);
        }
    }

    /// Record a failure and move to ERROR: the handle is unusable.
    pub(crate) fn mark_error(&self, message: &str) {
        let mut state = self.lock();
        state.error_count += 1;
        state.last_used = Some(Utc::now());
        Self::log_line(&mut state, format!("fatal: {message}"));
        Self::apply_status(&mut state, &self.id, InstanceStatus::Error);
    }

    /// How long the instance has been in ERROR, if it is.
    pub(crate) fn error_age(&self) -> Option<std::time::Duration> {
        self.lock().error_since.map(|since| since.elapsed())
    }

    pub(crate) fn response_times(&self) -> Vec<f64> {
        self.lock().response_times.iter().copied().collect()
    }

    /// Dispatch weight; lower is better. Combines work done, observed
    /// latency, failure rate and resident footprint.
    pub(crate) fn load_score(&self) -> f64 {
        let state = self.lock();
        let processed = state.processed_requests as f64;
        let error_rate = state.error_count as f64 / processed.max(1.0);
        0.3 * processed + 0.4 * state.avg_response_time() + 0.2 * error_rate
            + 0.1 * state.memory_mb
    }

    /// Refresh memory/CPU figures from the recognizer capability. Skipped
    /// while a worker holds the handle.
    pub(crate) fn sample_usage(&self) {
        let Ok(guard) = self.recognizer.try_lock() else {
            return;
        };
        let usage = match guard.as_ref() {
            Some(recognizer) => recognizer.usage(),
            None => return,
        };
        drop(guard);
        let mut state = self.lock();
        state.memory_mb = usage.memory_mb;
        state.cpu_percent = usage.cpu_percent;
    }

    pub(crate) fn push_log(&self, line: impl Into<String>) {
        let mut state = self.lock();
        Self::log_line(&mut state, line.into());
    }

    fn log_line(state: &mut InstanceState, line: String) {
        if state.log.len() == LOG_RING_CAP {
            state.log.pop_front();
        }
        state.log.push_back(format!("{} {line}", Utc::now().to_rfc3339()));
    }

    pub(crate) fn logs(&self) -> Vec<String> {
        self.lock().log.iter().cloned().collect()
    }

    pub(crate) fn summary(&self) -> InstanceSummary {
        let state = self.lock();
        InstanceSummary {
            instance_id: self.id.clone(),
            port: self.port(),
            status: state.status,
            created_at: self.created_at,
            last_activity: state.last_activity,
            processed_requests: state.processed_requests,
            error_count: state.error_count,
            memory_mb: state.memory_mb,
            cpu_percent: state.cpu_percent,
        }
    }

    pub(crate) fn detail(&self, model: &ModelConfig) -> InstanceDetail {
        let summary = self.summary();
        let state = self.lock();
        let response_times: Vec<f64> = state
            .response_times
            .iter()
            .rev()
            .take(10)
            .rev()
            .copied()
            .collect();
        InstanceDetail {
            last_used: state.last_used,
            request_count: state.processed_requests + state.error_count,
            response_times,
            config: InstanceModelInfo::from(model),
            summary,
        }
    }

    /// Load the model and run the warmup self-test. STARTING -> READY, or
    /// ERROR when model files are absent or warmup fails. Model load and
    /// warmup are blocking, so both run off the async threads.
    pub(crate) async fn start(
        &self,
        factory: Arc<dyn RecognizerFactory>,
        model: &ModelConfig,
    ) -> Result<(), RecognizerError> {
        self.set_status(InstanceStatus::Starting);

        if let Some(dir) = &model.storage_directory {
            if !dir.is_dir() {
                let err = RecognizerError::Fatal(format!(
                    "model directory missing: {}",
                    dir.display()
                ));
                self.mark_error(&err.to_string());
                return Err(err);
            }
        }

        let model = model.clone();
        let warmed = tokio::task::spawn_blocking(move || {
            let mut recognizer = factory.create(&model)?;
            let image = warmup_image();
            recognizer
                .read_text(&image, &crate::recognizer::RecognizeOptions::default())
                .map(|_| recognizer)
        })
        .await
        .map_err(|err| RecognizerError::Fatal(format!("warmup task failed: {err}")))?;

        match warmed {
            Ok(recognizer) => {
                *self.recognizer.lock().await = Some(recognizer);
                self.set_status(InstanceStatus::Ready);
                Ok(())
            }
            Err(err) => {
                self.mark_error(&err.to_string());
                Err(err)
            }
        }
    }

    /// Release the recognizer handle. Idempotent; the caller releases the
    /// port once this returns.
    pub(crate) async fn stop(&self) {
        if self.status() == InstanceStatus::Stopped {
            return;
        }
        self.set_status(InstanceStatus::Stopping);
        self.recognizer.lock().await.take();
        self.set_status(InstanceStatus::Stopped);
    }

    /// Take the recognizer handle for one blocking call. The single-toucher
    /// rule: only the worker that claimed the instance calls this.
    pub(crate) async fn take_recognizer(&self) -> Option<Box<dyn Recognizer>> {
        self.recognizer.lock().await.take()
    }

    pub(crate) async fn put_recognizer(&self, recognizer: Box<dyn Recognizer>) {
        *self.recognizer.lock().await = Some(recognizer);
    }
}
