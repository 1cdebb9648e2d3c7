//! Public API types for the in-process OCR instance pool.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hony_pool_core::{ModelConfig, PoolConfig};

use crate::error::{PoolError, TaskError};
use crate::history::{Region, RegionPredictor};
use crate::recognizer::{RawRegion, RecognizeOptions, RecognizerFactory};

/// Task priority. Higher values are dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Background work.
    Low = 1,
    /// Default priority.
    Normal = 2,
    /// Latency-sensitive work.
    High = 3,
    /// Jumps every other lane.
    Critical = 4,
}

impl TaskPriority {
    /// All priorities, highest first. The queue sweep order.
    pub const SWEEP: [TaskPriority; 4] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];

    /// Lane index used by the queue (0 = critical).
    pub(crate) fn lane(self) -> usize {
        match self {
            TaskPriority::Critical => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Admitted, waiting in the queue.
    Pending,
    /// Bound to an instance, recognition in progress.
    Processing,
    /// Terminal: a result is available.
    Completed,
    /// Terminal: failed beyond the retry budget (or not retryable).
    Failed,
    /// Terminal: cancelled before recognition completed.
    Cancelled,
}

impl TaskStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Model loading and warmup in progress.
    Starting,
    /// Warmup succeeded; never dispatched yet.
    Ready,
    /// Eligible for dispatch.
    Idle,
    /// Bound to a task.
    Running,
    /// Inside the blocking recognizer call.
    Busy,
    /// Recognizer handle unusable; excluded from dispatch until restarted.
    Error,
    /// Teardown in progress.
    Stopping,
    /// Stopped; port released.
    Stopped,
}

impl InstanceStatus {
    /// Whether the instance may be selected by the dispatcher.
    pub fn is_eligible(self) -> bool {
        matches!(self, Self::Ready | Self::Idle)
    }

    /// Lowercase name, as serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

/// Typed image payload. Routing is by variant, never by content sniffing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum ImagePayload {
    /// Raw encoded image bytes (PNG or JPEG).
    Bytes(Vec<u8>),
    /// Standard base64 of encoded image bytes.
    Base64(String),
    /// Path of an image file on the local filesystem.
    Path(PathBuf),
}

/// Region of interest cropped out of the input before preprocessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    /// Left edge, pixels.
    pub x: u32,
    /// Top edge, pixels.
    pub y: u32,
    /// Width, pixels.
    pub w: u32,
    /// Height, pixels.
    pub h: u32,
}

/// Keyword matching strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStrategy {
    /// Exact textual equality.
    Exact,
    /// Case-insensitive, whitespace-trimmed containment (default).
    Contains,
    /// Normalized edit-distance similarity above a threshold.
    Fuzzy,
}

/// Keyword matching settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Strategy applied to every keyword of the task.
    pub strategy: MatchStrategy,
    /// Regions below this confidence never match.
    pub min_confidence: f64,
    /// Similarity floor for [`MatchStrategy::Fuzzy`].
    pub fuzzy_threshold: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            strategy: MatchStrategy::Contains,
            min_confidence: 0.5,
            fuzzy_threshold: 0.8,
        }
    }
}

/// Specification of one unit of work submitted to the pool.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// The image to recognize.
    pub payload: ImagePayload,
    /// Optional crop applied before preprocessing.
    pub roi: Option<Roi>,
    /// Target keywords to mark in the result, in caller order.
    pub keywords: Vec<String>,
    /// Queue priority.
    pub priority: TaskPriority,
    /// Retry budget for transient recognition failures.
    pub max_retries: u32,
    /// Keyword matching settings.
    pub matching: MatchConfig,
    /// Options forwarded to the recognizer.
    pub options: RecognizeOptions,
}

impl TaskSpec {
    /// Default retry budget.
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// A spec with default settings for `payload`.
    pub fn new(payload: ImagePayload) -> Self {
        Self {
            payload,
            roi: None,
            keywords: Vec::new(),
            priority: TaskPriority::Normal,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            matching: MatchConfig::default(),
            options: RecognizeOptions::default(),
        }
    }
}

/// A normalized text region: axis-aligned box, text and confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRegion {
    /// `[x1, y1, x2, y2]` in pixels of the preprocessed image.
    pub bbox: [i32; 4],
    /// Recognized text.
    pub text: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
}

/// A keyword that matched a recognized region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordMatch {
    /// The keyword as submitted.
    pub keyword: String,
    /// The text of the region that matched.
    pub matched_text: String,
    /// Confidence of the matching region.
    pub confidence: f64,
    /// Bounding rectangle of the matching region.
    pub bbox: [i32; 4],
}

/// Pipeline metadata attached to every result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OptimizationInfo {
    /// Names of the preprocessing stages that ran, in order.
    pub preprocess_applied: Vec<String>,
    /// Post-pipeline sharpness estimate in `[0, 1]`. Informational only.
    pub quality_score: f64,
    /// Whether a region of interest was cropped out of the input.
    pub roi_applied: bool,
    /// Hint regions from the history capability, when wired.
    pub predicted_regions: Vec<Region>,
    /// Wall time of the recognizer call, milliseconds.
    pub recognize_ms: u64,
    /// Wall time of the full pipeline, milliseconds.
    pub total_ms: u64,
}

/// The one stable result shape: raw tuples, normalized regions, keyword
/// matches (empty when no keywords were given) and pipeline metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedResult {
    /// Raw recognizer tuples, untouched.
    pub original_result: Vec<RawRegion>,
    /// Normalized regions.
    pub processed_result: Vec<TextRegion>,
    /// Keyword matches, in keyword submission order.
    pub keyword_matches: Vec<KeywordMatch>,
    /// Pipeline metadata.
    pub optimization_info: OptimizationInfo,
}

/// Queue depth per priority lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    /// Critical lane.
    pub critical: usize,
    /// High lane.
    pub high: usize,
    /// Normal lane.
    pub normal: usize,
    /// Low lane.
    pub low: usize,
}

impl QueueDepths {
    /// Total queued tasks.
    pub fn total(&self) -> usize {
        self.critical + self.high + self.normal + self.low
    }
}

/// A scaling action issued by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingAction {
    /// Grow the pool by the configured step.
    Up,
    /// Shrink the pool by the configured step.
    Down,
}

/// One recorded scaling decision: timestamp, metric snapshot, action, reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecisionRecord {
    /// Unix timestamp of the decision.
    pub timestamp_unix: i64,
    /// The action taken.
    pub action: ScalingAction,
    /// Human-readable trigger description.
    pub reason: String,
    /// Queue depth at decision time.
    pub queue_depth: usize,
    /// p95 recognition latency (seconds) across the pool's ring buffers.
    pub p95_latency_sec: f64,
    /// Average CPU percentage across working instances.
    pub avg_cpu_percent: f64,
    /// Fraction of instances idle.
    pub idle_fraction: f64,
    /// Instance count after the action.
    pub instances: usize,
}

/// Derived snapshot of the whole pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Total instances, any state.
    pub total_instances: usize,
    /// Instances warming up.
    pub starting_instances: usize,
    /// Instances warmed but never dispatched.
    pub ready_instances: usize,
    /// Instances eligible and previously used.
    pub idle_instances: usize,
    /// Instances bound to a task (running or busy).
    pub running_instances: usize,
    /// Instances in the error state.
    pub error_instances: usize,
    /// Instances stopping or stopped.
    pub stopped_instances: usize,
    /// Tasks admitted since start.
    pub total_requests: u64,
    /// Tasks completed successfully.
    pub successful_requests: u64,
    /// Tasks failed terminally.
    pub failed_requests: u64,
    /// Mean of all response times currently held in instance ring buffers,
    /// seconds.
    pub average_response_time: f64,
    /// Sum of per-instance resident memory, MiB.
    pub memory_mb: f64,
    /// Average per-instance CPU percentage.
    pub cpu_percent: f64,
    /// Queue depth per priority.
    pub queue_depths: QueueDepths,
    /// Seconds since the pool started.
    pub uptime_seconds: u64,
    /// Whether shutdown has been requested.
    pub shutting_down: bool,
    /// Most recent scaling decision, if any.
    pub last_scaling_action: Option<ScalingDecisionRecord>,
}

/// Compact per-instance view served by `GET /instances`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    /// Instance id.
    pub instance_id: String,
    /// Allocated port.
    pub port: u16,
    /// Lifecycle state.
    pub status: InstanceStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last state change or recognition.
    pub last_activity: DateTime<Utc>,
    /// Successful recognitions performed.
    pub processed_requests: u64,
    /// Recognition failures observed.
    pub error_count: u64,
    /// Resident memory, MiB.
    pub memory_mb: f64,
    /// CPU usage, percent.
    pub cpu_percent: f64,
}

/// Detailed per-instance view served by `GET /instances/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDetail {
    /// The summary fields.
    #[serde(flatten)]
    pub summary: InstanceSummary,
    /// Last time the instance served a request.
    pub last_used: Option<DateTime<Utc>>,
    /// Total requests routed to the instance (successes + failures).
    pub request_count: u64,
    /// The ten most recent response times, seconds.
    pub response_times: Vec<f64>,
    /// Model configuration the instance was created with.
    pub config: InstanceModelInfo,
}

/// Model settings echoed in [`InstanceDetail`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceModelInfo {
    /// Recognition languages.
    pub languages: Vec<String>,
    /// Whether GPU use was requested.
    pub gpu_enabled: bool,
    /// Model storage directory, when configured.
    pub model_storage_directory: Option<PathBuf>,
}

impl From<&ModelConfig> for InstanceModelInfo {
    fn from(model: &ModelConfig) -> Self {
        Self {
            languages: model.languages.clone(),
            gpu_enabled: model.gpu_enabled,
            model_storage_directory: model.storage_directory.clone(),
        }
    }
}

/// Pool event stream payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PoolEvent {
    /// The pool finished warmup and is serving.
    Started,
    /// A task was admitted to the queue.
    TaskQueued {
        /// Task id.
        task_id: Uuid,
        /// Queue priority.
        priority: TaskPriority,
    },
    /// A task was bound to an instance.
    TaskStarted {
        /// Task id.
        task_id: Uuid,
        /// The selected instance.
        instance_id: String,
    },
    /// A task completed successfully.
    TaskCompleted {
        /// Task id.
        task_id: Uuid,
        /// Wall time of the attempt, milliseconds.
        total_ms: u64,
    },
    /// A task failed terminally.
    TaskFailed {
        /// Task id.
        task_id: Uuid,
        /// Failure description.
        error: String,
    },
    /// A task was re-enqueued after a transient failure.
    TaskRetried {
        /// Task id.
        task_id: Uuid,
        /// Attempts so far.
        retry_count: u32,
    },
    /// A task was cancelled.
    TaskCancelled {
        /// Task id.
        task_id: Uuid,
    },
    /// A new instance was created.
    InstanceCreated {
        /// Instance id.
        instance_id: String,
    },
    /// An instance finished warmup.
    InstanceReady {
        /// Instance id.
        instance_id: String,
    },
    /// An instance moved to the error state.
    InstanceError {
        /// Instance id.
        instance_id: String,
        /// What happened.
        message: String,
    },
    /// An instance stopped and released its port.
    InstanceStopped {
        /// Instance id.
        instance_id: String,
    },
    /// The scaling controller acted.
    ScalingDecision {
        /// The decision record.
        decision: ScalingDecisionRecord,
    },
    /// A non-fatal warning.
    Warning {
        /// Warning message.
        message: String,
    },
    /// A non-fatal error.
    Error {
        /// Error message.
        message: String,
    },
    /// Graceful shutdown was requested.
    ShutdownRequested,
    /// The pool stopped.
    Stopped,
}

/// Everything the pool needs at startup, wired explicitly by the caller.
pub struct PoolOptions {
    /// Validated pool configuration.
    pub config: PoolConfig,
    /// Creates recognizer handles for new instances.
    pub factory: Arc<dyn RecognizerFactory>,
    /// Optional region-history capability.
    pub predictor: Option<Arc<dyn RegionPredictor>>,
    /// Directory for daily performance samples; disabled when `None`.
    pub performance_log_dir: Option<PathBuf>,
}

impl PoolOptions {
    /// Options with only the mandatory pieces.
    pub fn new(config: PoolConfig, factory: Arc<dyn RecognizerFactory>) -> Self {
        Self {
            config,
            factory,
            predictor: None,
            performance_log_dir: None,
        }
    }
}

/// Awaitable one-shot handle to a submitted task's terminal outcome.
pub struct TaskHandle {
    /// The task's id.
    pub task_id: Uuid,
    pub(crate) rx: tokio::sync::oneshot::Receiver<Result<EnrichedResult, TaskError>>,
}

impl TaskHandle {
    /// Wait for the terminal outcome, up to `timeout`.
    ///
    /// On timeout the underlying task keeps running; cancel it explicitly if
    /// the result is no longer wanted.
    pub async fn wait(self, timeout: Duration) -> Result<EnrichedResult, TaskError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TaskError::Recognition(
                "completion handle dropped".to_string(),
            )),
            Err(_) => Err(TaskError::Timeout),
        }
    }
}

/// Handle to a running pool. Cloneable; all clones drive the same pool.
#[derive(Clone)]
pub struct PoolHandle {
    pub(crate) inner: Arc<crate::pool::PoolInner>,
    pub(crate) workers: Arc<tokio::sync::Mutex<tokio::task::JoinSet<()>>>,
    pub(crate) background: Arc<tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl PoolHandle {
    /// Admit a task. Returns immediately with its id.
    pub fn submit(&self, spec: TaskSpec) -> Result<Uuid, TaskError> {
        self.inner.submit(spec, false).map(|(id, _)| id)
    }

    /// Admit a task and keep a completion handle for it.
    pub fn submit_with_handle(&self, spec: TaskSpec) -> Result<TaskHandle, TaskError> {
        let (task_id, rx) = self.inner.submit(spec, true)?;
        Ok(TaskHandle {
            task_id,
            rx: rx.expect("submit(with_handle) always returns a receiver"),
        })
    }

    /// Submit and wait for the result. `timeout` defaults to the configured
    /// `request_timeout_sec`.
    pub async fn process_sync(
        &self,
        spec: TaskSpec,
        timeout: Option<Duration>,
    ) -> Result<EnrichedResult, TaskError> {
        let timeout = timeout.unwrap_or_else(|| self.inner.cfg.request_timeout());
        self.submit_with_handle(spec)?.wait(timeout).await
    }

    /// Cancel a task. True iff this call changed its fate: removed it from
    /// the queue, or flagged an in-flight attempt (best-effort).
    pub fn cancel(&self, task_id: Uuid) -> bool {
        self.inner.cancel(task_id)
    }

    /// Status of a known task.
    pub fn task_status(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.inner.task_status(task_id)
    }

    /// Result of a completed task, `None` otherwise.
    pub fn task_result(&self, task_id: Uuid) -> Option<EnrichedResult> {
        self.inner.task_result(task_id)
    }

    /// A freshly computed pool snapshot.
    pub fn statistics(&self) -> PoolStatus {
        self.inner.build_status()
    }

    /// Subscribe to the pool event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PoolEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Watch receiver over periodically pushed snapshots.
    pub fn watch_status(&self) -> tokio::sync::watch::Receiver<PoolStatus> {
        self.inner.snapshot_rx.clone()
    }

    /// Summaries of all instances, ordered by id.
    pub fn instance_summaries(&self) -> Vec<InstanceSummary> {
        self.inner.instance_summaries()
    }

    /// Detailed view of one instance.
    pub fn instance_detail(&self, instance_id: &str) -> Result<InstanceDetail, PoolError> {
        self.inner.instance_detail(instance_id)
    }

    /// Recent log lines of one instance.
    pub fn instance_logs(&self, instance_id: &str) -> Result<Vec<String>, PoolError> {
        self.inner.instance_logs(instance_id)
    }

    /// Create one instance beyond the current set. Rejected at
    /// `max_instances`.
    pub fn add_instance(&self) -> Result<String, PoolError> {
        self.inner.add_instance()
    }

    /// Stop and remove an instance.
    pub async fn remove_instance(&self, instance_id: &str) -> Result<(), PoolError> {
        self.inner.remove_instance(instance_id).await
    }

    /// Start a stopped instance (re-runs warmup).
    pub async fn start_instance(&self, instance_id: &str) -> Result<(), PoolError> {
        self.inner.start_instance(instance_id).await
    }

    /// Stop an instance without removing it.
    pub async fn stop_instance(&self, instance_id: &str) -> Result<(), PoolError> {
        self.inner.stop_instance(instance_id).await
    }

    /// Stop (if needed) and re-run warmup on an instance. The recovery path
    /// for instances in the error state.
    pub async fn restart_instance(&self, instance_id: &str) -> Result<(), PoolError> {
        self.inner.restart_instance(instance_id).await
    }

    /// Grow the pool by up to `n` instances. Returns how many were created.
    pub fn grow(&self, n: usize) -> usize {
        self.inner.grow(n)
    }

    /// Shrink the pool by up to `n` idle instances. Returns how many were
    /// drained.
    pub fn shrink(&self, n: usize) -> usize {
        self.inner.shrink(n)
    }

    /// The recorded scaling decisions, oldest first.
    pub fn scaling_log(&self) -> Vec<ScalingDecisionRecord> {
        self.inner.scaling_log()
    }

    /// The configured default synchronous timeout.
    pub fn request_timeout(&self) -> Duration {
        self.inner.cfg.request_timeout()
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    /// Graceful shutdown: stop admitting work, give in-flight tasks a grace
    /// window, then stop every instance. Idempotent.
    pub async fn shutdown(&self) {
        crate::pool::shutdown(self).await;
    }
}

/// Start a pool: warm `min_instances` (returning once at least one is
/// ready), then spawn the worker, health and scaling loops.
pub async fn start_pool(options: PoolOptions) -> anyhow::Result<PoolHandle> {
    crate::pool::start_pool(options).await
}
