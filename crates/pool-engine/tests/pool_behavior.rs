//! End-to-end pool behavior against the deterministic scripted recognizer:
//! admission, ordering, retries, cancellation, failover, scaling, shutdown.

use std::sync::Arc;
use std::time::Duration;

use hony_pool_core::PoolConfig;
use hony_pool_engine::testing::{Script, ScriptedFactory};
use hony_pool_engine::{
    ImagePayload, PoolEvent, PoolHandle, PoolOptions, TaskError, TaskPriority, TaskSpec,
    TaskStatus, start_pool,
};

fn config(min: usize, max: usize, queue: usize, workers: usize) -> PoolConfig {
    let mut cfg = PoolConfig::default();
    cfg.min_instances = min;
    cfg.max_instances = max;
    cfg.max_queue_size = queue;
    cfg.max_workers = workers;
    // Keep the controller quiet unless a test opts in.
    cfg.scaling.queue_up_threshold = 10_000;
    cfg.scaling.latency_up_threshold_sec = 10_000.0;
    cfg.scaling.cpu_up_threshold = 100.0;
    cfg.scaling.idle_down_threshold = 1.0;
    cfg
}

async fn pool_with(cfg: PoolConfig, factory: Arc<ScriptedFactory>) -> PoolHandle {
    start_pool(PoolOptions::new(cfg, factory))
        .await
        .expect("pool should start")
}

fn text_png() -> Vec<u8> {
    let mut img = image::GrayImage::from_pixel(64, 32, image::Luma([255]));
    for x in 10..30 {
        img.put_pixel(x, 15, image::Luma([0]));
    }
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageLuma8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn white_png() -> Vec<u8> {
    let img = image::GrayImage::from_pixel(64, 32, image::Luma([255]));
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageLuma8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn spec(priority: TaskPriority) -> TaskSpec {
    let mut spec = TaskSpec::new(ImagePayload::Bytes(text_png()));
    spec.priority = priority;
    spec
}

async fn wait_for<F: Fn() -> bool>(what: &str, timeout: Duration, check: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn single_recognize_with_keywords() {
    let pool = pool_with(
        config(1, 1, 10, 1),
        ScriptedFactory::shared(&["7 apples", "3 pears"]),
    )
    .await;

    let mut task = spec(TaskPriority::Normal);
    task.keywords = vec!["apples".to_string()];

    let result = pool.process_sync(task, None).await.expect("recognition succeeds");
    assert_eq!(result.processed_result.len(), 2);
    assert!(result.processed_result.iter().any(|r| r.text.contains("apples")));
    assert_eq!(result.keyword_matches.len(), 1);
    assert_eq!(result.keyword_matches[0].keyword, "apples");
    assert_eq!(result.keyword_matches[0].matched_text, "7 apples");
    assert!(!result.original_result.is_empty());

    let stats = pool.statistics();
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(stats.failed_requests, 0);
    // One recognition, one ring entry: the reported average is exactly it.
    assert!(stats.average_response_time > 0.0);

    pool.shutdown().await;
}

#[tokio::test]
async fn all_white_image_yields_an_empty_result_list() {
    let pool = pool_with(
        config(1, 1, 10, 1),
        ScriptedFactory::shared(&["never returned"]),
    )
    .await;

    let mut task = TaskSpec::new(ImagePayload::Bytes(white_png()));
    task.keywords = vec!["anything".to_string()];

    let result = pool.process_sync(task, None).await.unwrap();
    assert!(result.original_result.is_empty());
    assert!(result.processed_result.is_empty());
    assert!(result.keyword_matches.is_empty());

    pool.shutdown().await;
}

#[tokio::test]
async fn identical_submissions_produce_identical_text() {
    let pool = pool_with(
        config(1, 1, 10, 1),
        ScriptedFactory::shared(&["alpha", "beta"]),
    )
    .await;

    let first = pool.process_sync(spec(TaskPriority::Normal), None).await.unwrap();
    let second = pool.process_sync(spec(TaskPriority::Normal), None).await.unwrap();

    let texts = |r: &hony_pool_engine::EnrichedResult| {
        r.processed_result.iter().map(|t| t.text.clone()).collect::<Vec<_>>()
    };
    assert_eq!(texts(&first), texts(&second));

    pool.shutdown().await;
}

#[tokio::test]
async fn undecodable_input_fails_immediately_without_retry() {
    let pool = pool_with(config(1, 1, 10, 1), ScriptedFactory::shared(&["x"])).await;
    let mut events = pool.subscribe();

    let err = pool
        .process_sync(TaskSpec::new(ImagePayload::Bytes(b"garbage".to_vec())), None)
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::BadImage(_)));

    let stats = pool.statistics();
    assert_eq!(stats.failed_requests, 1);

    // No retry event was emitted for the bad-image task.
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, PoolEvent::TaskRetried { .. }));
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn queue_admission_bound_is_exact() {
    let mut script = Script::with_lines(&["slow"]);
    script.delay = Duration::from_millis(300);
    let pool = pool_with(config(1, 1, 2, 1), Arc::new(ScriptedFactory::new(script))).await;

    // Occupy the single worker, then fill the queue to its bound.
    let busy = pool.submit_with_handle(spec(TaskPriority::Normal)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let h1 = pool.submit_with_handle(spec(TaskPriority::Normal)).unwrap();
    let h2 = pool.submit_with_handle(spec(TaskPriority::Normal)).unwrap();

    let denied = pool.submit(spec(TaskPriority::Normal));
    assert_eq!(denied.unwrap_err(), TaskError::QueueFull);
    // Admission denial altered nothing: both queued tasks are still there.
    assert_eq!(pool.statistics().queue_depths.total(), 2);

    for handle in [busy, h1, h2] {
        handle.wait(Duration::from_secs(5)).await.expect("admitted tasks complete");
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn tasks_start_in_fifo_order_within_a_priority() {
    let mut script = Script::with_lines(&["serial"]);
    script.delay = Duration::from_millis(30);
    let pool = pool_with(config(1, 1, 20, 1), Arc::new(ScriptedFactory::new(script))).await;
    let mut events = pool.subscribe();

    let mut submitted = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..5 {
        let handle = pool.submit_with_handle(spec(TaskPriority::Normal)).unwrap();
        submitted.push(handle.task_id);
        handles.push(handle);
    }
    for handle in handles {
        handle.wait(Duration::from_secs(5)).await.unwrap();
    }

    let mut started = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::TaskStarted { task_id, .. } = event {
            started.push(task_id);
        }
    }
    assert_eq!(started, submitted);

    pool.shutdown().await;
}

#[tokio::test]
async fn higher_priority_tasks_start_first() {
    let mut script = Script::with_lines(&["blocker"]);
    script.delay = Duration::from_millis(250);
    let pool = pool_with(config(1, 1, 20, 1), Arc::new(ScriptedFactory::new(script))).await;
    let mut events = pool.subscribe();

    // A running CRITICAL task holds the single worker while we queue.
    let blocker = pool.submit_with_handle(spec(TaskPriority::Critical)).unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let normals: Vec<_> = (0..3)
        .map(|_| pool.submit_with_handle(spec(TaskPriority::Normal)).unwrap())
        .collect();
    let critical = pool.submit_with_handle(spec(TaskPriority::Critical)).unwrap();

    let mut expected = vec![blocker.task_id, critical.task_id];
    expected.extend(normals.iter().map(|h| h.task_id));

    blocker.wait(Duration::from_secs(5)).await.unwrap();
    critical.wait(Duration::from_secs(5)).await.unwrap();
    for handle in normals {
        handle.wait(Duration::from_secs(5)).await.unwrap();
    }

    let mut started = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::TaskStarted { task_id, .. } = event {
            started.push(task_id);
        }
    }
    assert_eq!(started, expected);

    pool.shutdown().await;
}

#[tokio::test]
async fn transient_failures_retry_to_success() {
    let mut script = Script::with_lines(&["finally"]);
    script.transient_failures = 2;
    let pool = pool_with(config(1, 1, 10, 1), Arc::new(ScriptedFactory::new(script))).await;
    let mut events = pool.subscribe();

    let mut task = spec(TaskPriority::Normal);
    task.max_retries = 3;
    let result = pool.process_sync(task, Some(Duration::from_secs(5))).await;
    assert!(result.is_ok(), "third attempt succeeds: {result:?}");

    let mut retries = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::TaskRetried { retry_count, .. } = event {
            retries.push(retry_count);
        }
    }
    assert_eq!(retries, vec![1, 2]);

    pool.shutdown().await;
}

#[tokio::test]
async fn failures_beyond_the_retry_budget_fail_the_task() {
    let mut script = Script::with_lines(&["never"]);
    script.transient_failures = 10;
    let pool = pool_with(config(1, 1, 10, 1), Arc::new(ScriptedFactory::new(script))).await;

    let mut task = spec(TaskPriority::Normal);
    task.max_retries = 2;
    let err = pool
        .process_sync(task, Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::Recognition(_)));
    assert_eq!(pool.statistics().failed_requests, 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn fatal_instance_error_fails_over_to_another_instance() {
    // One of the two warmed instances holds a recognizer that dies on its
    // first call; load balancing routes the two sequential tasks to
    // different instances, so the fatal one is hit exactly once and its
    // task retries on the healthy instance.
    let mut script = Script::with_lines(&["survived"]);
    script.fatal_failures = 1;
    let pool = pool_with(
        config(2, 2, 10, 1),
        Arc::new(ScriptedFactory::fatal_first_instance(script)),
    )
    .await;
    wait_for("both instances ready", Duration::from_secs(5), || {
        pool.statistics().ready_instances == 2
    })
    .await;

    for _ in 0..2 {
        let result = pool
            .process_sync(spec(TaskPriority::Normal), Some(Duration::from_secs(5)))
            .await;
        assert!(result.is_ok(), "task survives the instance failure: {result:?}");
    }
    assert_eq!(pool.statistics().error_instances, 1);
    assert_eq!(pool.statistics().successful_requests, 2);

    pool.shutdown().await;
}

#[tokio::test]
async fn pending_cancellation_is_immediate_and_idempotent() {
    let mut script = Script::with_lines(&["slow"]);
    script.delay = Duration::from_millis(400);
    let pool = pool_with(config(1, 1, 10, 1), Arc::new(ScriptedFactory::new(script))).await;

    let running = pool.submit_with_handle(spec(TaskPriority::Normal)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let pending = pool.submit_with_handle(spec(TaskPriority::Normal)).unwrap();

    assert!(pool.cancel(pending.task_id));
    // Repeated cancels return false after the first.
    assert!(!pool.cancel(pending.task_id));
    assert_eq!(pool.task_status(pending.task_id), Some(TaskStatus::Cancelled));
    assert!(pool.task_result(pending.task_id).is_none());
    assert_eq!(
        pending.wait(Duration::from_secs(2)).await.unwrap_err(),
        TaskError::Cancelled
    );

    running.wait(Duration::from_secs(5)).await.unwrap();
    pool.shutdown().await;
}

#[tokio::test]
async fn in_flight_cancellation_discards_the_output() {
    let mut script = Script::with_lines(&["discarded"]);
    script.delay = Duration::from_millis(300);
    let pool = pool_with(config(1, 1, 10, 1), Arc::new(ScriptedFactory::new(script))).await;

    let handle = pool.submit_with_handle(spec(TaskPriority::Normal)).unwrap();
    wait_for("task processing", Duration::from_secs(2), || {
        pool.task_status(handle.task_id) == Some(TaskStatus::Processing)
    })
    .await;

    assert!(pool.cancel(handle.task_id));
    let task_id = handle.task_id;
    assert_eq!(
        handle.wait(Duration::from_secs(2)).await.unwrap_err(),
        TaskError::Cancelled
    );
    assert_eq!(pool.task_status(task_id), Some(TaskStatus::Cancelled));
    assert!(pool.task_result(task_id).is_none());

    pool.shutdown().await;
}

#[tokio::test]
async fn sync_timeout_leaves_the_task_running() {
    let mut script = Script::with_lines(&["late"]);
    script.delay = Duration::from_millis(300);
    let pool = pool_with(config(1, 1, 10, 1), Arc::new(ScriptedFactory::new(script))).await;

    let handle = pool.submit_with_handle(spec(TaskPriority::Normal)).unwrap();
    let task_id = handle.task_id;
    let err = handle.wait(Duration::from_millis(50)).await.unwrap_err();
    assert_eq!(err, TaskError::Timeout);

    // The caller's deadline never cancels the underlying task.
    wait_for("task completion", Duration::from_secs(2), || {
        pool.task_status(task_id) == Some(TaskStatus::Completed)
    })
    .await;
    assert!(pool.task_result(task_id).is_some());

    pool.shutdown().await;
}

#[tokio::test]
async fn concurrent_recognitions_never_exceed_max_workers() {
    let mut script = Script::with_lines(&["bounded"]);
    script.delay = Duration::from_millis(100);
    let cfg = config(3, 3, 30, 2);
    let pool = pool_with(cfg, Arc::new(ScriptedFactory::new(script))).await;
    wait_for("instances ready", Duration::from_secs(5), || {
        pool.statistics().ready_instances == 3
    })
    .await;

    let handles: Vec<_> = (0..10)
        .map(|_| pool.submit_with_handle(spec(TaskPriority::Normal)).unwrap())
        .collect();

    for _ in 0..20 {
        let stats = pool.statistics();
        assert!(stats.running_instances <= 2, "running {}", stats.running_instances);
        assert!(stats.total_instances == 3);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    for handle in handles {
        handle.wait(Duration::from_secs(10)).await.unwrap();
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn grow_and_shrink_respect_the_configured_bounds() {
    let pool = pool_with(config(1, 3, 10, 1), ScriptedFactory::shared(&["x"])).await;

    assert_eq!(pool.grow(10), 2);
    wait_for("grown instances ready", Duration::from_secs(5), || {
        pool.statistics().ready_instances == 3
    })
    .await;

    assert_eq!(pool.shrink(10), 2);
    wait_for("shrunk to min", Duration::from_secs(5), || {
        pool.statistics().total_instances == 1
    })
    .await;
    // Never below min_instances.
    assert_eq!(pool.shrink(1), 0);

    pool.shutdown().await;
}

#[tokio::test]
async fn controller_scales_up_under_load_and_back_down_when_idle() {
    let mut script = Script::with_lines(&["scaling"]);
    script.delay = Duration::from_millis(150);

    let mut cfg = config(1, 3, 50, 1);
    cfg.scaling.queue_up_threshold = 2;
    cfg.scaling.cpu_up_threshold = 100.0;
    cfg.scaling.latency_up_threshold_sec = 10_000.0;
    cfg.scaling.cooldown_sec = 1;
    cfg.scaling.sample_interval_sec = 1;
    cfg.scaling.idle_down_threshold = 0.5;
    cfg.scaling.cpu_down_threshold = 20.0;

    let pool = pool_with(cfg, Arc::new(ScriptedFactory::new(script))).await;

    let handles: Vec<_> = (0..30)
        .map(|_| pool.submit_with_handle(spec(TaskPriority::Normal)).unwrap())
        .collect();

    wait_for("scale up", Duration::from_secs(10), || {
        pool.statistics().total_instances >= 2
    })
    .await;

    for handle in handles {
        handle.wait(Duration::from_secs(30)).await.unwrap();
    }

    wait_for("scale back down", Duration::from_secs(15), || {
        pool.statistics().total_instances == 1
    })
    .await;

    // Every recorded decision stayed inside the configured bounds.
    let log = pool.scaling_log();
    assert!(!log.is_empty());
    for decision in &log {
        assert!(decision.instances >= 1 && decision.instances <= 3);
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn shutdown_resolves_everything_and_stops_admission() {
    let mut script = Script::with_lines(&["draining"]);
    script.delay = Duration::from_millis(200);
    let pool = pool_with(config(1, 1, 20, 1), Arc::new(ScriptedFactory::new(script))).await;

    let handles: Vec<_> = (0..5)
        .map(|_| pool.submit_with_handle(spec(TaskPriority::Normal)).unwrap())
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.shutdown().await;

    // Admission is closed.
    assert_eq!(
        pool.submit(spec(TaskPriority::Normal)).unwrap_err(),
        TaskError::QueueFull
    );

    // Every admitted task resolved: completed before the grace expired or
    // cancelled with the queue.
    for handle in handles {
        let outcome = handle.wait(Duration::from_secs(1)).await;
        assert!(
            matches!(outcome, Ok(_) | Err(TaskError::Cancelled)),
            "unresolved outcome: {outcome:?}"
        );
    }

    let stats = pool.statistics();
    assert!(stats.shutting_down);
    assert_eq!(stats.total_instances, 0);
}

#[tokio::test]
async fn pool_fails_to_start_when_no_instance_warms_up() {
    let factory = Arc::new(ScriptedFactory::failing_first(Script::default(), 10));
    let result = start_pool(PoolOptions::new(config(1, 1, 10, 1), factory)).await;
    assert!(result.is_err());
}
