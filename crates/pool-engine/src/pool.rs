//! The pool manager: owns the instance table and the queue, admits tasks,
//! supervises worker/health/scaling loops and is the sole mutation point
//! for the instance set.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinSet;
use uuid::Uuid;

use hony_pool_core::PoolConfig;

use crate::api::{
    InstanceDetail, InstanceStatus, InstanceSummary, PoolEvent, PoolHandle, PoolOptions,
    PoolStatus, ScalingAction, ScalingDecisionRecord, TaskSpec, TaskStatus,
};
use crate::error::{PoolError, TaskError};
use crate::history::RegionPredictor;
use crate::instance::Instance;
use crate::perflog::PerformanceLog;
use crate::ports::PortAllocator;
use crate::queue::TaskQueue;
use crate::recognizer::RecognizerFactory;
use crate::scaling::ScalingMetrics;
use crate::task::{QueuedTask, TaskOutcome, TaskRegistry};
use crate::worker::run_worker;

const WARMUP_TIMEOUT: Duration = Duration::from_secs(120);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const HEALTH_INTERVAL: Duration = Duration::from_secs(5);
/// How long an instance may sit in ERROR before the health check stops it
/// and backfills a replacement.
const ERROR_GRACE: Duration = Duration::from_secs(30);
const SCALING_LOG_CAP: usize = 100;
const EVENT_CHANNEL_CAP: usize = 1024;

pub(crate) struct PoolInner {
    pub(crate) cfg: PoolConfig,
    pub(crate) factory: Arc<dyn RecognizerFactory>,
    pub(crate) predictor: Option<Arc<dyn RegionPredictor>>,
    perf_log: Option<PerformanceLog>,
    instances: Mutex<BTreeMap<String, Arc<Instance>>>,
    pub(crate) queue: TaskQueue,
    tasks: Mutex<TaskRegistry>,
    ports: PortAllocator,
    pub(crate) total_requests: AtomicU64,
    pub(crate) successful_requests: AtomicU64,
    pub(crate) failed_requests: AtomicU64,
    pub(crate) event_tx: broadcast::Sender<PoolEvent>,
    snapshot_tx: watch::Sender<PoolStatus>,
    pub(crate) snapshot_rx: watch::Receiver<PoolStatus>,
    shutting_down: AtomicBool,
    started_at: Instant,
    scaling: Mutex<ScalingState>,
}

struct ScalingState {
    last_action_at: Option<Instant>,
    log: VecDeque<ScalingDecisionRecord>,
}

impl PoolInner {
    pub(crate) fn instances(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Arc<Instance>>> {
        self.instances.lock().expect("instance table lock poisoned")
    }

    pub(crate) fn tasks(&self) -> std::sync::MutexGuard<'_, TaskRegistry> {
        self.tasks.lock().expect("task registry lock poisoned")
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn emit(&self, event: PoolEvent) {
        tracing::debug!(?event, "pool event");
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn push_snapshot(&self) {
        let _ = self.snapshot_tx.send(self.build_status());
    }

    // ---- admission ----

    pub(crate) fn submit(
        &self,
        spec: TaskSpec,
        with_handle: bool,
    ) -> Result<(Uuid, Option<oneshot::Receiver<TaskOutcome>>), TaskError> {
        if self.is_shutting_down() {
            return Err(TaskError::QueueFull);
        }

        let id = Uuid::new_v4();
        let cancelled = Arc::new(AtomicBool::new(false));
        let (tx, rx) = if with_handle {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let priority = spec.priority;
        self.tasks().insert(id, priority, Arc::clone(&cancelled), tx);

        let task = QueuedTask::from_spec(id, spec, cancelled);
        match self.queue.try_push(task) {
            Ok(()) => {
                self.total_requests.fetch_add(1, Ordering::Relaxed);
                self.emit(PoolEvent::TaskQueued {
                    task_id: id,
                    priority,
                });
                self.push_snapshot();
                Ok((id, rx))
            }
            Err(_rejected) => {
                // Denied admission leaves no trace.
                self.tasks().remove(&id);
                Err(TaskError::QueueFull)
            }
        }
    }

    pub(crate) fn cancel(&self, task_id: Uuid) -> bool {
        if self.queue.remove(task_id) {
            self.emit(PoolEvent::TaskCancelled { task_id });
            self.tasks().finish(&task_id, Err(TaskError::Cancelled));
            self.push_snapshot();
            return true;
        }

        let tasks = self.tasks();
        let Some(entry) = tasks.entry(&task_id) else {
            return false;
        };
        if entry.status != TaskStatus::Processing {
            return false;
        }
        // Best-effort: flag the in-flight attempt; the worker marks the
        // task CANCELLED on return. True only for the call that flipped it.
        !entry.cancelled.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn task_status(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.tasks().status(&task_id)
    }

    pub(crate) fn task_result(&self, task_id: Uuid) -> Option<crate::api::EnrichedResult> {
        self.tasks().result(&task_id)
    }

    // ---- instance management ----

    fn new_instance_id() -> String {
        let uuid = Uuid::new_v4().simple().to_string();
        format!("ocr-{}", &uuid[..8])
    }

    pub(crate) fn add_instance(self: &Arc<Self>) -> Result<String, PoolError> {
        if self.is_shutting_down() {
            return Err(PoolError::ShuttingDown);
        }

        let instance = {
            let mut table = self.instances();
            if table.len() >= self.cfg.max_instances {
                return Err(PoolError::AtMaxInstances(self.cfg.max_instances));
            }
            let port = self.ports.allocate().ok_or(PoolError::NoPortAvailable)?;
            let id = Self::new_instance_id();
            let instance = Arc::new(Instance::new(id.clone(), port));
            table.insert(id, Arc::clone(&instance));
            instance
        };

        self.emit(PoolEvent::InstanceCreated {
            instance_id: instance.id.clone(),
        });
        self.push_snapshot();
        self.spawn_start(Arc::clone(&instance));
        Ok(instance.id.clone())
    }

    fn spawn_start(self: &Arc<Self>, instance: Arc<Instance>) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            match instance
                .start(Arc::clone(&shared.factory), &shared.cfg.model)
                .await
            {
                Ok(()) => shared.emit(PoolEvent::InstanceReady {
                    instance_id: instance.id.clone(),
                }),
                Err(err) => shared.emit(PoolEvent::InstanceError {
                    instance_id: instance.id.clone(),
                    message: err.to_string(),
                }),
            }
            shared.push_snapshot();
        });
    }

    fn get_instance(&self, instance_id: &str) -> Result<Arc<Instance>, PoolError> {
        self.instances()
            .get(instance_id)
            .cloned()
            .ok_or_else(|| PoolError::UnknownInstance(instance_id.to_string()))
    }

    pub(crate) fn instance_summaries(&self) -> Vec<InstanceSummary> {
        self.instances().values().map(|inst| inst.summary()).collect()
    }

    pub(crate) fn instance_detail(&self, instance_id: &str) -> Result<InstanceDetail, PoolError> {
        Ok(self.get_instance(instance_id)?.detail(&self.cfg.model))
    }

    pub(crate) fn instance_logs(&self, instance_id: &str) -> Result<Vec<String>, PoolError> {
        Ok(self.get_instance(instance_id)?.logs())
    }

    pub(crate) async fn remove_instance(&self, instance_id: &str) -> Result<(), PoolError> {
        let instance = {
            let mut table = self.instances();
            table
                .remove(instance_id)
                .ok_or_else(|| PoolError::UnknownInstance(instance_id.to_string()))?
        };
        self.stop_and_release(&instance).await;
        self.push_snapshot();
        Ok(())
    }

    async fn stop_and_release(&self, instance: &Arc<Instance>) {
        instance.stop().await;
        self.ports.release(instance.port());
        self.emit(PoolEvent::InstanceStopped {
            instance_id: instance.id.clone(),
        });
    }

    pub(crate) async fn stop_instance(&self, instance_id: &str) -> Result<(), PoolError> {
        let instance = self.get_instance(instance_id)?;
        if matches!(instance.status(), InstanceStatus::Stopping | InstanceStatus::Stopped) {
            return Ok(());
        }
        self.stop_and_release(&instance).await;
        self.push_snapshot();
        Ok(())
    }

    pub(crate) async fn start_instance(&self, instance_id: &str) -> Result<(), PoolError> {
        let instance = self.get_instance(instance_id)?;
        let status = instance.status();
        if status != InstanceStatus::Stopped {
            return Err(PoolError::InvalidState {
                id: instance_id.to_string(),
                state: status.as_str().to_string(),
            });
        }
        self.start_with_fresh_port(&instance).await
    }

    async fn start_with_fresh_port(&self, instance: &Arc<Instance>) -> Result<(), PoolError> {
        let port = self.ports.allocate().ok_or(PoolError::NoPortAvailable)?;
        instance.set_port(port);

        match instance
            .start(Arc::clone(&self.factory), &self.cfg.model)
            .await
        {
            Ok(()) => {
                self.emit(PoolEvent::InstanceReady {
                    instance_id: instance.id.clone(),
                });
                self.push_snapshot();
                Ok(())
            }
            Err(err) => {
                self.ports.release(port);
                self.emit(PoolEvent::InstanceError {
                    instance_id: instance.id.clone(),
                    message: err.to_string(),
                });
                self.push_snapshot();
                Err(PoolError::InvalidState {
                    id: instance.id.clone(),
                    state: InstanceStatus::Error.as_str().to_string(),
                })
            }
        }
    }

    /// Stop (releasing the handle and port) and re-run warmup. The recovery
    /// path for ERROR instances.
    pub(crate) async fn restart_instance(&self, instance_id: &str) -> Result<(), PoolError> {
        let instance = self.get_instance(instance_id)?;
        if instance.status() != InstanceStatus::Stopped {
            self.stop_and_release(&instance).await;
        }
        self.start_with_fresh_port(&instance).await
    }

    // ---- scaling commands ----

    /// Create up to `n` instances, clamped to `max_instances`. Returns how
    /// many were actually created.
    pub(crate) fn grow(self: &Arc<Self>, n: usize) -> usize {
        let mut created = 0;
        for _ in 0..n {
            match self.add_instance() {
                Ok(_) => created += 1,
                Err(_) => break,
            }
        }
        created
    }

    /// Drain and stop up to `n` unoccupied instances, never going below
    /// `min_instances`. The victim is the eligible instance with the
    /// highest load score (the least valuable one).
    pub(crate) fn shrink(self: &Arc<Self>, n: usize) -> usize {
        let mut removed = 0;
        for _ in 0..n {
            let victim = {
                let mut table = self.instances();
                if table.len() <= self.cfg.min_instances {
                    break;
                }
                let victim_id = table
                    .values()
                    .filter(|inst| inst.status().is_eligible())
                    .max_by(|a, b| {
                        a.load_score()
                            .partial_cmp(&b.load_score())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|inst| inst.id.clone());
                match victim_id {
                    Some(id) => {
                        let instance = table.remove(&id).expect("victim id came from the table");
                        // Claimed under the table lock, so no worker can
                        // bind it between selection and stop.
                        instance.set_status(InstanceStatus::Stopping);
                        instance
                    }
                    None => break,
                }
            };

            let shared = Arc::clone(self);
            tokio::spawn(async move {
                shared.stop_and_release(&victim).await;
                shared.push_snapshot();
            });
            removed += 1;
        }
        removed
    }

    pub(crate) fn scaling_cooldown_elapsed(&self, cooldown: Duration) -> bool {
        let scaling = self.scaling.lock().expect("scaling state lock poisoned");
        scaling
            .last_action_at
            .is_none_or(|at| at.elapsed() >= cooldown)
    }

    pub(crate) fn record_scaling_decision(
        &self,
        action: ScalingAction,
        reason: String,
        metrics: &ScalingMetrics,
    ) -> ScalingDecisionRecord {
        let record = ScalingDecisionRecord {
            timestamp_unix: chrono::Utc::now().timestamp(),
            action,
            reason,
            queue_depth: metrics.queue_depth,
            p95_latency_sec: metrics.p95_latency_sec,
            avg_cpu_percent: metrics.avg_cpu_percent,
            idle_fraction: metrics.idle_fraction,
            instances: self.instances().len(),
        };

        let mut scaling = self.scaling.lock().expect("scaling state lock poisoned");
        scaling.last_action_at = Some(Instant::now());
        if scaling.log.len() == SCALING_LOG_CAP {
            scaling.log.pop_front();
        }
        scaling.log.push_back(record.clone());
        record
    }

    pub(crate) fn scaling_log(&self) -> Vec<ScalingDecisionRecord> {
        let scaling = self.scaling.lock().expect("scaling state lock poisoned");
        scaling.log.iter().cloned().collect()
    }

    // ---- derived views ----

    pub(crate) fn build_status(&self) -> PoolStatus {
        let instances = self.instances();
        let mut status = PoolStatus {
            total_instances: instances.len(),
            ..PoolStatus::default()
        };

        let mut response_times: Vec<f64> = Vec::new();
        let mut cpu_sum = 0.0;
        for instance in instances.values() {
            let summary = instance.summary();
            match summary.status {
                InstanceStatus::Starting => status.starting_instances += 1,
                InstanceStatus::Ready => status.ready_instances += 1,
                InstanceStatus::Idle => status.idle_instances += 1,
                InstanceStatus::Running | InstanceStatus::Busy => {
                    status.running_instances += 1
                }
                InstanceStatus::Error => status.error_instances += 1,
                InstanceStatus::Stopping | InstanceStatus::Stopped => {
                    status.stopped_instances += 1
                }
            }
            status.memory_mb += summary.memory_mb;
            cpu_sum += summary.cpu_percent;
            response_times.extend(instance.response_times());
        }
        drop(instances);

        if status.total_instances > 0 {
            status.cpu_percent = cpu_sum / status.total_instances as f64;
        }
        if !response_times.is_empty() {
            status.average_response_time =
                response_times.iter().sum::<f64>() / response_times.len() as f64;
        }

        status.total_requests = self.total_requests.load(Ordering::Relaxed);
        status.successful_requests = self.successful_requests.load(Ordering::Relaxed);
        status.failed_requests = self.failed_requests.load(Ordering::Relaxed);
        status.queue_depths = self.queue.depths();
        status.uptime_seconds = self.started_at.elapsed().as_secs();
        status.shutting_down = self.is_shutting_down();
        status.last_scaling_action = {
            let scaling = self.scaling.lock().expect("scaling state lock poisoned");
            scaling.log.back().cloned()
        };
        status
    }

    pub(crate) fn scaling_metrics(&self) -> ScalingMetrics {
        let instances = self.instances();
        let total = instances.len();
        let mut response_times: Vec<f64> = Vec::new();
        let mut working = 0usize;
        let mut working_cpu = 0.0;
        let mut idle = 0usize;

        for instance in instances.values() {
            response_times.extend(instance.response_times());
            match instance.status() {
                InstanceStatus::Running | InstanceStatus::Busy => {
                    working += 1;
                    working_cpu += instance.summary().cpu_percent;
                }
                InstanceStatus::Ready | InstanceStatus::Idle => idle += 1,
                _ => {}
            }
        }
        drop(instances);

        response_times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let p95 = if response_times.is_empty() {
            0.0
        } else {
            let rank = ((response_times.len() as f64) * 0.95).ceil() as usize;
            response_times[rank.clamp(1, response_times.len()) - 1]
        };

        ScalingMetrics {
            queue_depth: self.queue.depths().total(),
            p95_latency_sec: p95,
            avg_cpu_percent: if working > 0 {
                working_cpu / working as f64
            } else {
                0.0
            },
            idle_fraction: if total > 0 {
                idle as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

pub(crate) async fn start_pool(options: PoolOptions) -> anyhow::Result<PoolHandle> {
    let PoolOptions {
        config,
        factory,
        predictor,
        performance_log_dir,
    } = options;
    config.validate()?;

    let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAP);
    let (snapshot_tx, snapshot_rx) = watch::channel(PoolStatus::default());

    let inner = Arc::new(PoolInner {
        queue: TaskQueue::new(config.max_queue_size),
        cfg: config,
        factory,
        predictor,
        perf_log: performance_log_dir.map(PerformanceLog::new),
        instances: Mutex::new(BTreeMap::new()),
        tasks: Mutex::new(TaskRegistry::new(TaskRegistry::DEFAULT_TERMINAL_CAP)),
        ports: PortAllocator::default(),
        total_requests: AtomicU64::new(0),
        successful_requests: AtomicU64::new(0),
        failed_requests: AtomicU64::new(0),
        event_tx,
        snapshot_tx,
        snapshot_rx,
        shutting_down: AtomicBool::new(false),
        started_at: Instant::now(),
        scaling: Mutex::new(ScalingState {
            last_action_at: None,
            log: VecDeque::new(),
        }),
    });

    // Warmup: create min_instances and return once at least one is READY.
    // The rest keep warming in the background.
    let mut events = inner.event_tx.subscribe();
    for _ in 0..inner.cfg.min_instances {
        inner
            .add_instance()
            .map_err(|err| anyhow::anyhow!("failed to create initial instance: {err}"))?;
    }

    let min_instances = inner.cfg.min_instances;
    let warmup = async {
        let mut failures = 0usize;
        loop {
            match events.recv().await {
                Ok(PoolEvent::InstanceReady { .. }) => return Ok(()),
                Ok(PoolEvent::InstanceError { message, .. }) => {
                    failures += 1;
                    if failures >= min_instances {
                        return Err(anyhow::anyhow!("no instance became ready: {message}"));
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(anyhow::anyhow!("event stream closed during warmup"));
                }
            }
        }
    };
    tokio::time::timeout(WARMUP_TIMEOUT, warmup)
        .await
        .map_err(|_| anyhow::anyhow!("pool warmup timed out"))??;

    inner.emit(PoolEvent::Started);
    inner.push_snapshot();

    let mut workers = JoinSet::new();
    for worker_idx in 0..inner.cfg.max_workers {
        workers.spawn(run_worker(Arc::clone(&inner), worker_idx));
    }

    let background = vec![
        tokio::spawn(run_health_loop(Arc::clone(&inner))),
        tokio::spawn(crate::scaling::run_scaling_loop(Arc::clone(&inner))),
    ];

    Ok(PoolHandle {
        inner,
        workers: Arc::new(tokio::sync::Mutex::new(workers)),
        background: Arc::new(tokio::sync::Mutex::new(background)),
    })
}

async fn run_health_loop(shared: Arc<PoolInner>) {
    let mut tick = tokio::time::interval(HEALTH_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tick.tick().await;
        if shared.is_shutting_down() {
            break;
        }

        let instances: Vec<Arc<Instance>> = shared.instances().values().cloned().collect();
        for instance in &instances {
            instance.sample_usage();
        }

        // Expire instances stuck in ERROR past the grace period; the pool
        // backfills below if that drops it under min_instances.
        for instance in &instances {
            if instance.status() == InstanceStatus::Error
                && instance.error_age().is_some_and(|age| age >= ERROR_GRACE)
            {
                shared.instances().remove(&instance.id);
                shared.stop_and_release(instance).await;
                shared.emit(PoolEvent::Warning {
                    message: format!(
                        "instance {} removed after {}s in error",
                        instance.id,
                        ERROR_GRACE.as_secs()
                    ),
                });
            }
        }

        let deficit = shared
            .cfg
            .min_instances
            .saturating_sub(shared.instances().len());
        if deficit > 0 {
            shared.grow(deficit);
        }

        let status = shared.build_status();
        if let Some(perf_log) = &shared.perf_log {
            perf_log.append(&status);
        }
        let _ = shared.snapshot_tx.send(status);
    }
}

pub(crate) async fn shutdown(handle: &PoolHandle) {
    let inner = &handle.inner;
    if inner.shutting_down.swap(true, Ordering::SeqCst) {
        return;
    }

    inner.emit(PoolEvent::ShutdownRequested);
    inner.queue.close();

    // Queued-but-unstarted work is lost by design; resolve its handles.
    for task in inner.queue.drain() {
        inner.emit(PoolEvent::TaskCancelled { task_id: task.id });
        inner.tasks().finish(&task.id, Err(TaskError::Cancelled));
    }

    // Give in-flight tasks the grace window, then cut the workers loose.
    {
        let mut workers = handle.workers.lock().await;
        let all_done = async {
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, all_done).await.is_err() {
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
    }

    // A worker may have pushed a task back while draining; resolve those
    // too so every admitted task's handle fires.
    for task in inner.queue.drain() {
        inner.emit(PoolEvent::TaskCancelled { task_id: task.id });
        inner.tasks().finish(&task.id, Err(TaskError::Cancelled));
    }

    let instances: Vec<Arc<Instance>> = {
        let mut table = inner.instances();
        let drained: Vec<Arc<Instance>> = table.values().cloned().collect();
        table.clear();
        drained
    };
    for instance in instances {
        inner.stop_and_release(&instance).await;
    }

    {
        let mut background = handle.background.lock().await;
        for task in background.drain(..) {
            task.abort();
        }
    }

    inner.emit(PoolEvent::Stopped);
    inner.push_snapshot();
}
