//! Result-side half of the pipeline: tuple normalization and keyword
//! enrichment. Pure; knows nothing about instances.

use crate::api::{KeywordMatch, MatchConfig, TextRegion};
use crate::matching;
use crate::recognizer::RawRegion;

/// Collapse raw polygons into axis-aligned rectangles and mark keyword
/// matches. Keyword order is preserved; unmatched keywords produce no entry.
pub(crate) fn run(
    raw: &[RawRegion],
    keywords: &[String],
    matching_cfg: &MatchConfig,
) -> (Vec<TextRegion>, Vec<KeywordMatch>) {
    let processed = normalize(raw);

    let mut matches = Vec::new();
    for keyword in keywords {
        if let Some(found) = matching::best_match(keyword, &processed, matching_cfg) {
            matches.push(found);
        }
    }

    (processed, matches)
}

/// Normalize raw tuples: a 4-point polygon collapses to its bounding
/// rectangle, text is trimmed.
pub(crate) fn normalize(raw: &[RawRegion]) -> Vec<TextRegion> {
    raw.iter()
        .map(|region| {
            let xs = region.bbox.iter().map(|p| p[0]);
            let ys = region.bbox.iter().map(|p| p[1]);
            let x1 = xs.clone().fold(f32::INFINITY, f32::min);
            let x2 = xs.fold(f32::NEG_INFINITY, f32::max);
            let y1 = ys.clone().fold(f32::INFINITY, f32::min);
            let y2 = ys.fold(f32::NEG_INFINITY, f32::max);
            TextRegion {
                bbox: [
                    x1.round() as i32,
                    y1.round() as i32,
                    x2.round() as i32,
                    y2.round() as i32,
                ],
                text: region.text.trim().to_string(),
                confidence: region.confidence,
            }
        })
        .collect()
}
