//! Optional region-history capability.
//!
//! The pipeline records where keywords were found and asks for hint regions
//! on later lookups. Everything here is best-effort: the pool never blocks
//! on it and persistence failures are swallowed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// A predicted (or recorded) screen region for a target text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Left edge, pixels.
    pub x: i32,
    /// Top edge, pixels.
    pub y: i32,
    /// Width, pixels.
    pub w: i32,
    /// Height, pixels.
    pub h: i32,
    /// Success ratio of this region for its target, `[0, 1]`.
    pub confidence: f64,
    /// Where the hint came from, e.g. `history`.
    pub source: String,
    /// Kind of prediction, e.g. `exact_match`.
    pub region_type: String,
}

/// The prediction interface consumed by the pipeline. Implementations must
/// be cheap to call; anything slow belongs behind their own buffering.
pub trait RegionPredictor: Send + Sync {
    /// Hint regions for an image of `image_size`, optionally narrowed to a
    /// target text. Ordered most-confident first.
    fn predict(&self, image_size: (u32, u32), target: Option<&str>) -> Vec<Region>;

    /// Record that `target` was found at `region`.
    fn record_success(&self, region: &Region, target: &str);

    /// Record that `target` was looked for and not found.
    fn record_failure(&self, target: &str);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistoryEntry {
    target_text: String,
    x: i32,
    y: i32,
    width: i32,
    height: i32,
    success_count: u64,
    total_attempts: u64,
    last_success_unix: i64,
}

/// File-backed region history: one JSON list under the project data
/// directory, written atomically via tmp+rename.
pub struct FileRegionHistory {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, HistoryEntry>>,
}

impl FileRegionHistory {
    /// Load the history at `path`. A missing or unreadable file yields an
    /// empty history; the file is a hint, never a dependency.
    pub fn load(path: PathBuf) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<HistoryEntry>>(&raw) {
                Ok(list) => list
                    .into_iter()
                    .map(|entry| (entry.target_text.clone(), entry))
                    .collect(),
                Err(err) => {
                    tracing::warn!("ignoring malformed region history {}: {err}", path.display());
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, HistoryEntry>> {
        self.entries.lock().expect("region history lock poisoned")
    }

    fn persist(&self, entries: &BTreeMap<String, HistoryEntry>) {
        if let Err(err) = persist_file(&self.path, entries) {
            tracing::warn!("failed to persist region history: {err:#}");
        }
    }
}

fn persist_file(path: &Path, entries: &BTreeMap<String, HistoryEntry>) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid history path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let list: Vec<&HistoryEntry> = entries.values().collect();
    let json = serde_json::to_string_pretty(&list)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

impl RegionPredictor for FileRegionHistory {
    fn predict(&self, image_size: (u32, u32), target: Option<&str>) -> Vec<Region> {
        let entries = self.lock();
        let mut out: Vec<Region> = entries
            .values()
            .filter(|entry| target.is_none_or(|t| entry.target_text == t))
            .filter(|entry| entry.success_count > 0)
            .filter(|entry| {
                entry.x < image_size.0 as i32 && entry.y < image_size.1 as i32
            })
            .map(|entry| Region {
                x: entry.x,
                y: entry.y,
                w: entry.width,
                h: entry.height,
                confidence: entry.success_count as f64 / entry.total_attempts.max(1) as f64,
                source: "history".to_string(),
                region_type: "exact_match".to_string(),
            })
            .collect();
        out.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    fn record_success(&self, region: &Region, target: &str) {
        let mut entries = self.lock();
        let entry = entries
            .entry(target.to_string())
            .or_insert_with(|| HistoryEntry {
                target_text: target.to_string(),
                x: region.x,
                y: region.y,
                width: region.w,
                height: region.h,
                success_count: 0,
                total_attempts: 0,
                last_success_unix: 0,
            });
        entry.x = region.x;
        entry.y = region.y;
        entry.width = region.w;
        entry.height = region.h;
        entry.success_count += 1;
        entry.total_attempts += 1;
        entry.last_success_unix = chrono::Utc::now().timestamp();
        self.persist(&entries);
    }

    fn record_failure(&self, target: &str) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(target) {
            entry.total_attempts += 1;
            self.persist(&entries);
        }
    }
}
