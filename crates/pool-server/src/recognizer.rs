//! Recognizer binding over an external OCR worker process.
//!
//! Each instance owns one child process speaking JSON-lines over
//! stdin/stdout: an `init` message at spawn, then one `recognize` message
//! per call. A broken pipe or a dead child is fatal for the handle; the
//! pool replaces the instance through its normal error path.
//!
//! The worker script itself is deployed by the operator, not compiled in:
//! the factory loads `ocr_worker.py` from `model.storage_directory`, next
//! to the model files it serves. A reference implementation of the
//! protocol (backed by EasyOCR) ships at
//! `crates/pool-server/scripts/ocr_worker.py`; copy it into the storage
//! directory alongside the models.

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use hony_pool_core::ModelConfig;
use hony_pool_engine::{
    RawRegion, RecognizeOptions, Recognizer, RecognizerError, RecognizerFactory, ResourceUsage,
};

const WORKER_SCRIPT: &str = "ocr_worker.py";

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum WorkerMessage<'a> {
    Init {
        languages: &'a [String],
        gpu: bool,
        model_dir: &'a str,
    },
    Recognize {
        image: String,
        options: &'a RecognizeOptions,
    },
    Shutdown,
}

#[derive(Deserialize)]
struct WorkerResponse {
    status: String,
    #[serde(default)]
    regions: Vec<RawRegion>,
    #[serde(default)]
    message: Option<String>,
}

pub struct ExternalProcessRecognizer {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl ExternalProcessRecognizer {
    fn spawn(python_bin: &str, script: &PathBuf, model: &ModelConfig) -> Result<Self, RecognizerError> {
        let mut child = Command::new(python_bin)
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| {
                RecognizerError::Fatal(format!("failed to spawn OCR worker: {err}"))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RecognizerError::Fatal("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RecognizerError::Fatal("worker stdout unavailable".to_string()))?;

        let mut recognizer = Self {
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout),
        };

        let model_dir = model
            .storage_directory
            .as_ref()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default();
        let response = recognizer.round_trip(&WorkerMessage::Init {
            languages: &model.languages,
            gpu: model.gpu_enabled,
            model_dir: &model_dir,
        })?;
        if response.status != "ok" {
            return Err(RecognizerError::Fatal(format!(
                "worker init rejected: {}",
                response.message.unwrap_or_default()
            )));
        }

        Ok(recognizer)
    }

    fn round_trip(&mut self, message: &WorkerMessage<'_>) -> Result<WorkerResponse, RecognizerError> {
        let line = serde_json::to_string(message)
            .map_err(|err| RecognizerError::Transient(format!("encode request: {err}")))?;
        writeln!(self.stdin, "{line}")
            .and_then(|()| self.stdin.flush())
            .map_err(|err| RecognizerError::Fatal(format!("worker pipe closed: {err}")))?;

        let mut response = String::new();
        let read = self
            .stdout
            .read_line(&mut response)
            .map_err(|err| RecognizerError::Fatal(format!("worker read failed: {err}")))?;
        if read == 0 {
            return Err(RecognizerError::Fatal("worker exited".to_string()));
        }

        serde_json::from_str(&response)
            .map_err(|err| RecognizerError::Fatal(format!("malformed worker response: {err}")))
    }
}

impl Recognizer for ExternalProcessRecognizer {
    fn read_text(
        &mut self,
        image: &DynamicImage,
        options: &RecognizeOptions,
    ) -> Result<Vec<RawRegion>, RecognizerError> {
        let mut png = std::io::Cursor::new(Vec::new());
        image
            .write_to(&mut png, image::ImageFormat::Png)
            .map_err(|err| RecognizerError::Transient(format!("encode image: {err}")))?;

        let response = self.round_trip(&WorkerMessage::Recognize {
            image: B64.encode(png.into_inner()),
            options,
        })?;

        match response.status.as_str() {
            "ok" => Ok(response.regions),
            _ => Err(RecognizerError::Transient(
                response.message.unwrap_or_else(|| "worker error".to_string()),
            )),
        }
    }

    fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            memory_mb: process_memory_mb(self.child.id()).unwrap_or(0.0),
            cpu_percent: 0.0,
        }
    }
}

impl Drop for ExternalProcessRecognizer {
    fn drop(&mut self) {
        let _ = self.round_trip(&WorkerMessage::Shutdown);
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Resident set of the worker process in MiB, from procfs when available.
fn process_memory_mb(pid: u32) -> Option<f64> {
    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let resident_pages: f64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096.0 / 1024.0 / 1024.0)
}

/// Factory spawning one worker process per instance.
///
/// Refuses to create handles until `model.storage_directory` holds an
/// `ocr_worker.py` (see the module docs for the shipped reference script),
/// so a misdeployed model directory fails at warmup rather than on the
/// first request.
pub struct ExternalProcessFactory {
    python_bin: String,
}

impl ExternalProcessFactory {
    pub fn new(python_bin: String) -> Self {
        Self { python_bin }
    }
}

impl RecognizerFactory for ExternalProcessFactory {
    fn create(&self, model: &ModelConfig) -> Result<Box<dyn Recognizer>, RecognizerError> {
        let dir = model.storage_directory.as_ref().ok_or_else(|| {
            RecognizerError::Fatal("model.storage_directory is not configured".to_string())
        })?;
        let script = dir.join(WORKER_SCRIPT);
        if !script.is_file() {
            return Err(RecognizerError::Fatal(format!(
                "worker script missing: {}",
                script.display()
            )));
        }

        Ok(Box::new(ExternalProcessRecognizer::spawn(
            &self.python_bin,
            &script,
            model,
        )?))
    }
}
