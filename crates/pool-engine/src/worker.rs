//! Worker tasks: pull from the queue, bind an instance, run the
//! preprocess -> recognize -> postprocess pipeline, resolve or retry.
//!
//! A worker releases the instance it claimed exactly once per attempt, and
//! never crashes the pool on per-task errors.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::api::{EnrichedResult, OptimizationInfo, PoolEvent};
use crate::error::TaskError;
use crate::history::Region;
use crate::instance::Instance;
use crate::pool::PoolInner;
use crate::recognizer::RecognizerError;
use crate::task::QueuedTask;
use crate::{dispatch, postprocess, preprocess};

const TAKE_TIMEOUT: Duration = Duration::from_millis(500);
const BACKOFF_MIN: Duration = Duration::from_millis(10);
const BACKOFF_MAX: Duration = Duration::from_millis(100);

pub(crate) async fn run_worker(shared: Arc<PoolInner>, worker_idx: usize) {
    let mut backoff = BACKOFF_MIN;
    loop {
        let Some(task) = shared.queue.take(TAKE_TIMEOUT).await else {
            if shared.queue.is_closed() {
                break;
            }
            continue;
        };

        // Cancellation observed before recognition: never dispatched.
        if task.is_cancelled() {
            finish_cancelled(&shared, &task);
            continue;
        }

        let selected = {
            let table = shared.instances();
            dispatch::select(&table)
        };
        let Some(instance) = selected else {
            // No eligible instance; put the task back at the head of its
            // lane and back off briefly.
            shared.queue.push_front(task);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_MAX);
            continue;
        };
        backoff = BACKOFF_MIN;

        process_on(&shared, worker_idx, instance, task).await;
    }
    tracing::debug!(worker_idx, "worker stopped");
}

async fn process_on(
    shared: &Arc<PoolInner>,
    worker_idx: usize,
    instance: Arc<Instance>,
    mut task: QueuedTask,
) {
    // Cancellation may have landed between the queue take and the claim.
    if task.is_cancelled() {
        instance.release_neutral(None);
        finish_cancelled(shared, &task);
        return;
    }

    {
        let mut tasks = shared.tasks();
        tasks.set_processing(&task.id, &instance.id);
    }
    shared.emit(PoolEvent::TaskStarted {
        task_id: task.id,
        instance_id: instance.id.clone(),
    });
    instance.push_log(format!("task {} started (worker {worker_idx})", task.id));
    shared.push_snapshot();

    let started = Instant::now();
    let attempt = run_attempt(shared, &instance, &task).await;
    let elapsed = started.elapsed();
    let elapsed_sec = elapsed.as_secs_f64();

    // Output produced after a cancellation request is discarded.
    let attempt = if task.cancelled.load(Ordering::SeqCst) {
        Attempt {
            result: Err(TaskError::Cancelled),
            reached_recognizer: attempt.reached_recognizer,
            fatal: attempt.fatal,
        }
    } else {
        attempt
    };

    match attempt.result {
        Ok(mut result) => {
            result.optimization_info.total_ms = elapsed.as_millis() as u64;
            instance.release(Some(elapsed_sec), true);
            record_history(shared, &task, &result);
            shared.successful_requests.fetch_add(1, Ordering::Relaxed);
            shared.emit(PoolEvent::TaskCompleted {
                task_id: task.id,
                total_ms: elapsed.as_millis() as u64,
            });
            shared.tasks().finish(&task.id, Ok(result));
        }
        Err(TaskError::Cancelled) => {
            if let Some(message) = attempt.fatal.as_deref() {
                fail_instance(shared, &instance, message);
            } else {
                let time = attempt.reached_recognizer.then_some(elapsed_sec);
                instance.release_neutral(time);
            }
            finish_cancelled(shared, &task);
        }
        Err(err @ TaskError::BadImage(_)) => {
            // Undecodable input: the instance did nothing wrong and the
            // task is never retried.
            instance.release_neutral(None);
            fail_task(shared, &task, err);
        }
        Err(err) => {
            match attempt.fatal.as_deref() {
                Some(message) => fail_instance(shared, &instance, message),
                None => instance.release(Some(elapsed_sec), false),
            }

            if task.retry_count < task.max_retries {
                task.retry_count += 1;
                let retry_count = task.retry_count;
                let task_id = task.id;
                shared.tasks().set_retrying(&task_id, retry_count);
                match shared.queue.try_push(task) {
                    Ok(()) => {
                        shared.emit(PoolEvent::TaskRetried {
                            task_id,
                            retry_count,
                        });
                    }
                    Err(rejected) => fail_task(shared, &rejected, err),
                }
            } else {
                fail_task(shared, &task, err);
            }
        }
    }
    shared.push_snapshot();
}

struct Attempt {
    result: Result<EnrichedResult, TaskError>,
    reached_recognizer: bool,
    fatal: Option<String>,
}

async fn run_attempt(shared: &Arc<PoolInner>, instance: &Arc<Instance>, task: &QueuedTask) -> Attempt {
    let Some(recognizer) = instance.take_recognizer().await else {
        // The instance lost its handle under us (stop/restart race).
        return Attempt {
            result: Err(TaskError::Recognition(
                "recognizer handle unavailable".to_string(),
            )),
            reached_recognizer: false,
            fatal: None,
        };
    };

    instance.mark_busy();

    let payload = Arc::clone(&task.payload);
    let roi = task.roi;
    let options = task.options.clone();
    let preprocess_cfg = shared.cfg.preprocess.clone();
    let predictor = shared.predictor.clone();
    let target = task.keywords.first().cloned();
    let mut recognizer = recognizer;

    let joined = tokio::task::spawn_blocking(move || {
        let bytes = match preprocess::resolve_payload(&payload) {
            Ok(bytes) => bytes,
            Err(err) => return (recognizer, Err(err), false),
        };
        let prepared = match preprocess::run(&bytes, roi, &preprocess_cfg) {
            Ok(prepared) => prepared,
            Err(err) => return (recognizer, Err(err), false),
        };

        let predicted = predictor
            .map(|p| {
                p.predict(
                    (prepared.image.width(), prepared.image.height()),
                    target.as_deref(),
                )
            })
            .unwrap_or_default();

        let recognize_started = Instant::now();
        let raw = recognizer.read_text(&prepared.image, &options);
        let recognize_ms = recognize_started.elapsed().as_millis() as u64;

        (recognizer, Ok((prepared, predicted, raw, recognize_ms)), true)
    })
    .await;

    let (recognizer, outcome, reached) = match joined {
        Ok(parts) => parts,
        Err(err) => {
            // The blocking task panicked; the handle is gone with it.
            return Attempt {
                result: Err(TaskError::FatalInstance(format!(
                    "recognition task aborted: {err}"
                ))),
                reached_recognizer: true,
                fatal: Some(format!("recognition task aborted: {err}")),
            };
        }
    };

    match outcome {
        Err(err) => {
            instance.put_recognizer(recognizer).await;
            Attempt {
                result: Err(err),
                reached_recognizer: reached,
                fatal: None,
            }
        }
        Ok((prepared, predicted, raw, recognize_ms)) => match raw {
            Ok(raw) => {
                instance.put_recognizer(recognizer).await;
                let (processed, matches) =
                    postprocess::run(&raw, &task.keywords, &task.matching);
                Attempt {
                    result: Ok(EnrichedResult {
                        original_result: raw,
                        processed_result: processed,
                        keyword_matches: matches,
                        optimization_info: OptimizationInfo {
                            preprocess_applied: prepared.applied,
                            quality_score: prepared.quality_score,
                            roi_applied: prepared.roi_applied,
                            predicted_regions: predicted,
                            recognize_ms,
                            total_ms: 0,
                        },
                    }),
                    reached_recognizer: true,
                    fatal: None,
                }
            }
            Err(RecognizerError::Transient(message)) => {
                instance.put_recognizer(recognizer).await;
                Attempt {
                    result: Err(TaskError::Recognition(message)),
                    reached_recognizer: true,
                    fatal: None,
                }
            }
            Err(RecognizerError::Fatal(message)) => {
                // The handle is unusable; drop it instead of returning it.
                drop(recognizer);
                Attempt {
                    result: Err(TaskError::FatalInstance(message.clone())),
                    reached_recognizer: true,
                    fatal: Some(message),
                }
            }
        },
    }
}

/// Record keyword hits and misses with the history capability, off the hot
/// path and with failures swallowed.
fn record_history(shared: &Arc<PoolInner>, task: &QueuedTask, result: &EnrichedResult) {
    let Some(predictor) = shared.predictor.clone() else {
        return;
    };
    if task.keywords.is_empty() {
        return;
    }

    let keywords = task.keywords.clone();
    let matches: Vec<(String, [i32; 4])> = result
        .keyword_matches
        .iter()
        .map(|m| (m.keyword.clone(), m.bbox))
        .collect();

    // Detached: the pipeline never waits for history bookkeeping.
    let handle = tokio::task::spawn_blocking(move || {
        for keyword in &keywords {
            match matches.iter().find(|(k, _)| k == keyword) {
                Some((_, bbox)) => {
                    let region = Region {
                        x: bbox[0],
                        y: bbox[1],
                        w: bbox[2] - bbox[0],
                        h: bbox[3] - bbox[1],
                        confidence: 1.0,
                        source: "ocr".to_string(),
                        region_type: "exact_match".to_string(),
                    };
                    predictor.record_success(&region, keyword);
                }
                None => predictor.record_failure(keyword),
            }
        }
    });
    drop(handle);
}

fn fail_instance(shared: &Arc<PoolInner>, instance: &Arc<Instance>, message: &str) {
    instance.mark_error(message);
    shared.emit(PoolEvent::InstanceError {
        instance_id: instance.id.clone(),
        message: message.to_string(),
    });
}

fn fail_task(shared: &Arc<PoolInner>, task: &QueuedTask, err: TaskError) {
    shared.failed_requests.fetch_add(1, Ordering::Relaxed);
    shared.emit(PoolEvent::TaskFailed {
        task_id: task.id,
        error: err.to_string(),
    });
    shared.tasks().finish(&task.id, Err(err));
}

fn finish_cancelled(shared: &Arc<PoolInner>, task: &QueuedTask) {
    shared.emit(PoolEvent::TaskCancelled { task_id: task.id });
    shared.tasks().finish(&task.id, Err(TaskError::Cancelled));
}
