//! Pool configuration: file model, defaults and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the OCR pool service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Minimum number of recognizer instances kept alive.
    pub min_instances: usize,
    /// Maximum number of recognizer instances.
    pub max_instances: usize,
    /// Admission bound: total tasks queued across all priorities.
    pub max_queue_size: usize,
    /// Number of worker tasks performing recognitions concurrently.
    pub max_workers: usize,
    /// Default timeout for synchronous processing, in seconds.
    pub request_timeout_sec: u64,
    /// Dynamic scaling thresholds.
    pub scaling: ScalingConfig,
    /// Image preprocessing stages.
    pub preprocess: PreprocessConfig,
    /// Recognizer model settings.
    pub model: ModelConfig,
}

/// Closed-loop scaling controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// Queue depth above which the pool scales up.
    pub queue_up_threshold: usize,
    /// p95 recognition latency (seconds) above which the pool scales up.
    pub latency_up_threshold_sec: f64,
    /// Average CPU percentage above which the pool scales up.
    pub cpu_up_threshold: f64,
    /// Average CPU percentage below which a scale-down is considered.
    pub cpu_down_threshold: f64,
    /// Fraction of idle instances above which a scale-down is considered.
    pub idle_down_threshold: f64,
    /// Minimum interval between opposing scaling actions, in seconds.
    pub cooldown_sec: u64,
    /// Instances added or removed per scaling action.
    pub step: usize,
    /// Controller sampling cadence, in seconds.
    pub sample_interval_sec: u64,
}

/// Configuration-gated preprocessing stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Resize bound width. Aspect ratio is preserved.
    pub resize_max_w: u32,
    /// Resize bound height.
    pub resize_max_h: u32,
    /// Apply denoising after resize.
    pub denoise: bool,
    /// Apply contrast enhancement after denoise.
    pub contrast: bool,
    /// Apply adaptive binarization last (single-channel output).
    pub binarize: bool,
}

/// Recognizer model settings passed through to the engine binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Recognition languages, e.g. `["en"]`.
    pub languages: Vec<String>,
    /// Whether the engine may use a GPU. Advisory only.
    pub gpu_enabled: bool,
    /// Directory holding the model files. Resolved against the project root
    /// when unset.
    pub storage_directory: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_instances: 1,
            max_instances: 4,
            max_queue_size: 100,
            max_workers: 4,
            request_timeout_sec: 30,
            scaling: ScalingConfig::default(),
            preprocess: PreprocessConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            queue_up_threshold: 10,
            latency_up_threshold_sec: 2.0,
            cpu_up_threshold: 70.0,
            cpu_down_threshold: 20.0,
            idle_down_threshold: 0.5,
            cooldown_sec: 60,
            step: 1,
            sample_interval_sec: 5,
        }
    }
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            resize_max_w: 1920,
            resize_max_h: 1080,
            denoise: true,
            contrast: true,
            binarize: false,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            languages: vec!["en".to_string()],
            gpu_enabled: false,
            storage_directory: None,
        }
    }
}

impl PoolConfig {
    /// Default synchronous-processing timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec.max(1))
    }

    /// Load the configuration from `path`.
    ///
    /// Returns `Ok(None)` when no file exists; parse failures are errors so
    /// a malformed file is never silently replaced by defaults.
    pub fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&raw)?;
        Ok(Some(cfg))
    }

    /// Validate field ranges and cross-field consistency.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_instances == 0 {
            anyhow::bail!("min_instances must be >= 1");
        }
        if self.max_instances < self.min_instances {
            anyhow::bail!(
                "max_instances ({}) must be >= min_instances ({})",
                self.max_instances,
                self.min_instances
            );
        }
        if self.max_queue_size == 0 {
            anyhow::bail!("max_queue_size must be >= 1");
        }
        if self.max_workers == 0 {
            anyhow::bail!("max_workers must be >= 1");
        }
        self.scaling.validate()?;
        self.preprocess.validate()?;
        if self.model.languages.is_empty() {
            anyhow::bail!("model.languages must name at least one language");
        }
        Ok(())
    }
}

impl ScalingConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.latency_up_threshold_sec <= 0.0 {
            anyhow::bail!("scaling.latency_up_threshold_sec must be positive");
        }
        if !(0.0..=100.0).contains(&self.cpu_up_threshold)
            || !(0.0..=100.0).contains(&self.cpu_down_threshold)
        {
            anyhow::bail!("scaling CPU thresholds must be percentages in 0..=100");
        }
        if self.cpu_down_threshold >= self.cpu_up_threshold {
            anyhow::bail!(
                "scaling.cpu_down_threshold ({}) must be below cpu_up_threshold ({})",
                self.cpu_down_threshold,
                self.cpu_up_threshold
            );
        }
        if !(0.0..=1.0).contains(&self.idle_down_threshold) {
            anyhow::bail!("scaling.idle_down_threshold must be a fraction in 0..=1");
        }
        if self.step == 0 {
            anyhow::bail!("scaling.step must be >= 1");
        }
        if self.sample_interval_sec == 0 {
            anyhow::bail!("scaling.sample_interval_sec must be >= 1");
        }
        Ok(())
    }

    /// Controller cadence as a [`Duration`].
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_sec)
    }

    /// Cooldown between opposing actions as a [`Duration`].
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_sec)
    }
}

impl PreprocessConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.resize_max_w < 32 || self.resize_max_h < 32 {
            anyhow::bail!("preprocess resize bound must be at least 32x32");
        }
        Ok(())
    }
}
