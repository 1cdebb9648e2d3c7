//! The text-recognition capability consumed by the pool.
//!
//! The pool never embeds a recognition engine; it drives anything that
//! implements [`Recognizer`] through a [`RecognizerFactory`] wired at
//! startup. Options mirror the EasyOCR `readtext` surface; the pool passes
//! through only the keys it recognizes.

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use hony_pool_core::ModelConfig;

/// Decoding strategy passed through to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decoder {
    /// Greedy decoding (default).
    Greedy,
    /// Beam search with `beamWidth` candidates.
    BeamSearch,
}

/// Recognition options forwarded to the engine. Unknown keys arriving over
/// the wire are dropped during deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizeOptions {
    /// Result detail level: 0 = text only, 1 = boxes + text + confidence.
    pub detail: u8,
    /// Merge results into paragraphs.
    pub paragraph: bool,
    /// Minimum text box size in pixels.
    pub min_size: u32,
    /// Text confidence threshold.
    pub text_threshold: f32,
    /// Low-bound text score.
    pub low_text: f32,
    /// Link confidence threshold.
    pub link_threshold: f32,
    /// Maximum canvas size.
    pub canvas_size: u32,
    /// Image magnification ratio.
    pub mag_ratio: f32,
    /// Decoding strategy.
    pub decoder: Decoder,
    /// Beam width, used by [`Decoder::BeamSearch`].
    #[serde(rename = "beamWidth")]
    pub beam_width: u32,
    /// Recognition batch size.
    pub batch_size: u32,
    /// Restrict recognition to these characters.
    pub allowlist: Option<String>,
    /// Exclude these characters from recognition.
    pub blocklist: Option<String>,
}

impl Default for RecognizeOptions {
    fn default() -> Self {
        Self {
            detail: 1,
            paragraph: false,
            min_size: 10,
            text_threshold: 0.7,
            low_text: 0.4,
            link_threshold: 0.4,
            canvas_size: 2560,
            mag_ratio: 1.0,
            decoder: Decoder::Greedy,
            beam_width: 5,
            batch_size: 1,
            allowlist: None,
            blocklist: None,
        }
    }
}

/// One raw recognition tuple: a 4-point polygon, the text and a confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRegion {
    /// Polygon corners, `[[x,y]; 4]`, in image pixel coordinates.
    pub bbox: [[f32; 2]; 4],
    /// Recognized text.
    pub text: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
}

impl RawRegion {
    /// Build a region from an axis-aligned rectangle.
    pub fn from_rect(text: impl Into<String>, confidence: f64, x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            bbox: [[x1, y1], [x2, y1], [x2, y2], [x1, y2]],
            text: text.into(),
            confidence,
        }
    }
}

/// Resource footprint reported by an engine binding, when it knows it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    /// Resident memory attributable to this recognizer, in MiB.
    pub memory_mb: f64,
    /// Recent CPU usage attributable to this recognizer, in percent.
    pub cpu_percent: f64,
}

/// Recognizer failures, split by whether the handle survives.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecognizerError {
    /// The call failed but the handle remains usable. Retried.
    #[error("recognition failed: {0}")]
    Transient(String),
    /// The handle is unusable (missing model, deserialization failure,
    /// out-of-memory). The owning instance moves to ERROR.
    #[error("recognizer unusable: {0}")]
    Fatal(String),
}

impl RecognizerError {
    /// Whether the handle must be discarded.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// A blocking text-recognition engine handle.
///
/// Handles are never shared across threads: exactly one worker drives a
/// handle at a time, so implementations need `&mut self` and no internal
/// locking.
pub trait Recognizer: Send {
    /// Run recognition over `image`, returning raw region tuples.
    fn read_text(
        &mut self,
        image: &DynamicImage,
        options: &RecognizeOptions,
    ) -> Result<Vec<RawRegion>, RecognizerError>;

    /// Resource usage of this handle, when known.
    fn usage(&self) -> ResourceUsage {
        ResourceUsage::default()
    }
}

/// Creates recognizer handles from model configuration.
pub trait RecognizerFactory: Send + Sync {
    /// Create a fresh handle. Fails when model files are absent or the
    /// engine cannot initialize.
    fn create(&self, model: &ModelConfig) -> Result<Box<dyn Recognizer>, RecognizerError>;
}

/// Synthetic image used for the warmup self-test after model load.
pub(crate) fn warmup_image() -> DynamicImage {
    DynamicImage::ImageRgb8(image::RgbImage::from_pixel(64, 32, image::Rgb([255, 255, 255])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_to_easyocr_shape() {
        let opts = RecognizeOptions::default();
        assert_eq!(opts.detail, 1);
        assert_eq!(opts.decoder, Decoder::Greedy);
        assert_eq!(opts.beam_width, 5);
        assert!(opts.allowlist.is_none());
    }

    #[test]
    fn unknown_option_keys_are_dropped() {
        let opts: RecognizeOptions = serde_json::from_str(
            r#"{"detail": 0, "beamWidth": 9, "rotation_info": [90, 180]}"#,
        )
        .unwrap();
        assert_eq!(opts.detail, 0);
        assert_eq!(opts.beam_width, 9);
    }

    #[test]
    fn from_rect_builds_a_rectangle_polygon() {
        let r = RawRegion::from_rect("x", 0.9, 1.0, 2.0, 11.0, 12.0);
        assert_eq!(r.bbox[0], [1.0, 2.0]);
        assert_eq!(r.bbox[2], [11.0, 12.0]);
    }
}
