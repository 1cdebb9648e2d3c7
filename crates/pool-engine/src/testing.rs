//! Deterministic recognizer implementations for tests.
//!
//! A [`ScriptedRecognizer`] replays a fixed region list, optionally after a
//! configured number of injected failures, and returns an empty result for
//! uniform (e.g. all-white) images the way a real engine would.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use image::DynamicImage;

use hony_pool_core::ModelConfig;

use crate::recognizer::{
    RawRegion, RecognizeOptions, Recognizer, RecognizerError, RecognizerFactory, ResourceUsage,
};

/// Behavior shared by every recognizer a [`ScriptedFactory`] creates.
#[derive(Debug, Clone)]
pub struct Script {
    /// Regions returned for any non-uniform image.
    pub regions: Vec<RawRegion>,
    /// Sleep inserted into every call, to simulate a slow engine.
    pub delay: Duration,
    /// Number of leading calls failing with a transient error.
    pub transient_failures: u32,
    /// Number of leading calls failing fatally (handle unusable).
    pub fatal_failures: u32,
    /// Usage figures reported by the handle.
    pub usage: ResourceUsage,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            delay: Duration::ZERO,
            transient_failures: 0,
            fatal_failures: 0,
            usage: ResourceUsage::default(),
        }
    }
}

impl Script {
    /// A script that recognizes the given lines, laid out top to bottom.
    pub fn with_lines(lines: &[&str]) -> Self {
        let regions = lines
            .iter()
            .enumerate()
            .map(|(row, text)| {
                let top = 10.0 + row as f32 * 20.0;
                RawRegion::from_rect(*text, 0.95, 10.0, top, 200.0, top + 16.0)
            })
            .collect();
        Self {
            regions,
            ..Self::default()
        }
    }
}

/// A recognizer that replays its script. Exactly one worker drives a handle
/// at a time, so plain fields suffice.
pub struct ScriptedRecognizer {
    regions: Vec<RawRegion>,
    delay: Duration,
    usage: ResourceUsage,
    transient_left: u32,
    fatal_left: u32,
}

impl ScriptedRecognizer {
    /// Build a recognizer directly (factory-less tests).
    pub fn new(script: Script) -> Self {
        Self {
            regions: script.regions,
            delay: script.delay,
            usage: script.usage,
            transient_left: script.transient_failures,
            fatal_left: script.fatal_failures,
        }
    }
}

fn is_uniform(image: &DynamicImage) -> bool {
    let gray = image.to_luma8();
    let mut pixels = gray.pixels();
    let Some(first) = pixels.next() else {
        return true;
    };
    pixels.all(|px| px == first)
}

impl Recognizer for ScriptedRecognizer {
    fn read_text(
        &mut self,
        image: &DynamicImage,
        _options: &RecognizeOptions,
    ) -> Result<Vec<RawRegion>, RecognizerError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        // Uniform frames (the warmup self-test included) always succeed, so
        // injected failures hit real work rather than instance startup.
        if is_uniform(image) {
            return Ok(Vec::new());
        }
        if self.fatal_left > 0 {
            self.fatal_left -= 1;
            return Err(RecognizerError::Fatal("injected fatal failure".to_string()));
        }
        if self.transient_left > 0 {
            self.transient_left -= 1;
            return Err(RecognizerError::Transient(
                "injected transient failure".to_string(),
            ));
        }
        Ok(self.regions.clone())
    }

    fn usage(&self) -> ResourceUsage {
        self.usage
    }
}

/// Factory handing out [`ScriptedRecognizer`]s; can be told to fail its
/// first `n` creations to exercise warmup failures.
pub struct ScriptedFactory {
    script: Script,
    create_failures: AtomicU32,
    fatal_only_first: bool,
    created: AtomicU32,
}

impl ScriptedFactory {
    /// A factory whose recognizers follow `script`.
    pub fn new(script: Script) -> Self {
        Self {
            script,
            create_failures: AtomicU32::new(0),
            fatal_only_first: false,
            created: AtomicU32::new(0),
        }
    }

    /// Fail the first `n` `create` calls.
    pub fn failing_first(script: Script, n: u32) -> Self {
        Self {
            create_failures: AtomicU32::new(n),
            ..Self::new(script)
        }
    }

    /// Apply the script's fatal failures to the first recognizer only;
    /// later handles behave normally. Exercises instance failover.
    pub fn fatal_first_instance(script: Script) -> Self {
        Self {
            fatal_only_first: true,
            ..Self::new(script)
        }
    }

    /// Convenience: an `Arc`'d factory recognizing `lines`.
    pub fn shared(lines: &[&str]) -> Arc<Self> {
        Arc::new(Self::new(Script::with_lines(lines)))
    }
}

impl RecognizerFactory for ScriptedFactory {
    fn create(&self, _model: &ModelConfig) -> Result<Box<dyn Recognizer>, RecognizerError> {
        let left = self.create_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.create_failures.store(left - 1, Ordering::SeqCst);
            return Err(RecognizerError::Fatal(
                "injected factory failure".to_string(),
            ));
        }

        let nth = self.created.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.clone();
        if self.fatal_only_first && nth > 0 {
            script.fatal_failures = 0;
        }
        Ok(Box::new(ScriptedRecognizer::new(script)))
    }
}
