use crate::api::{KeywordMatch, MatchConfig, MatchStrategy, TextRegion};

/// Find the best region for one keyword: candidates must clear the
/// confidence floor and the strategy; ties go to the highest confidence.
pub(crate) fn best_match(
    keyword: &str,
    regions: &[TextRegion],
    cfg: &MatchConfig,
) -> Option<KeywordMatch> {
    let mut best: Option<&TextRegion> = None;
    for region in regions {
        if region.confidence < cfg.min_confidence {
            continue;
        }
        if !is_match(cfg.strategy, keyword, &region.text, cfg.fuzzy_threshold) {
            continue;
        }
        match best {
            Some(prev) if prev.confidence >= region.confidence => {}
            _ => best = Some(region),
        }
    }

    best.map(|region| KeywordMatch {
        keyword: keyword.to_string(),
        matched_text: region.text.clone(),
        confidence: region.confidence,
        bbox: region.bbox,
    })
}

pub(crate) fn is_match(
    strategy: MatchStrategy,
    keyword: &str,
    text: &str,
    fuzzy_threshold: f64,
) -> bool {
    match strategy {
        MatchStrategy::Exact => text == keyword,
        MatchStrategy::Contains => {
            let text = text.trim().to_lowercase();
            let keyword = keyword.trim().to_lowercase();
            !keyword.is_empty() && text.contains(&keyword)
        }
        MatchStrategy::Fuzzy => {
            let text = text.trim().to_lowercase();
            let keyword = keyword.trim().to_lowercase();
            normalized_similarity(&keyword, &text) >= fuzzy_threshold
        }
    }
}

/// `1 - edit_distance / max_len`, over characters.
pub(crate) fn normalized_similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
