//! Daily performance log: one JSON line per sample, one file per day.
//! Best-effort; the pool never depends on these files.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use crate::api::PoolStatus;

pub(crate) struct PerformanceLog {
    dir: PathBuf,
    write_warned: AtomicBool,
}

#[derive(Serialize)]
struct PerfSample<'a> {
    timestamp: String,
    total_instances: usize,
    running_instances: usize,
    idle_instances: usize,
    error_instances: usize,
    queue_depth: usize,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    average_response_time: f64,
    memory_mb: f64,
    cpu_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_scaling_action: Option<&'a str>,
}

impl PerformanceLog {
    pub(crate) fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            write_warned: AtomicBool::new(false),
        }
    }

    /// Append one sample derived from a pool snapshot.
    pub(crate) fn append(&self, status: &PoolStatus) {
        let now = chrono::Utc::now();
        let sample = PerfSample {
            timestamp: now.to_rfc3339(),
            total_instances: status.total_instances,
            running_instances: status.running_instances,
            idle_instances: status.idle_instances,
            error_instances: status.error_instances,
            queue_depth: status.queue_depths.total(),
            total_requests: status.total_requests,
            successful_requests: status.successful_requests,
            failed_requests: status.failed_requests,
            average_response_time: status.average_response_time,
            memory_mb: status.memory_mb,
            cpu_percent: status.cpu_percent,
            last_scaling_action: status
                .last_scaling_action
                .as_ref()
                .map(|decision| decision.reason.as_str()),
        };

        if let Err(err) = self.write_line(&sample, &now.format("%Y-%m-%d").to_string()) {
            if !self.write_warned.swap(true, Ordering::SeqCst) {
                tracing::warn!("performance log disabled: {err:#}");
            }
        }
    }

    fn write_line(&self, sample: &PerfSample<'_>, day: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("perf_{day}.log"));
        let line = serde_json::to_string(sample)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}
