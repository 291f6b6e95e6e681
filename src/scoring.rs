//! Recency- and similarity-weighted scores. No I/O.

use crate::config::ScoringConfig;
use crate::types::Consolidation;

/// Cosine similarity; 0 for mismatched, empty or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Sign-insensitive similarity
pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
    cosine_similarity(a, b).abs()
}

/// Similarity of `item` to every target, combined with the harmonic mean.
///
/// No targets means every item is equally relevant (1.0); an item without
/// an embedding scores 0.
pub fn combined_similarity(item: Option<&[f32]>, targets: &[&[f32]]) -> f32 {
    let Some(item) = item else {
        return 0.0;
    };
    match targets {
        [] => 1.0,
        [only] => similarity(item, only),
        many => {
            let sims: Vec<f32> = many.iter().map(|t| similarity(item, t)).collect();
            if sims.iter().any(|s| *s <= 0.0) {
                return 0.0;
            }
            sims.len() as f32 / sims.iter().map(|s| 1.0 / s).sum::<f32>()
        }
    }
}

/// `tpf * ln(scale * elapsed_ms + 1)`
pub fn time_penalty(config: &ScoringConfig, elapsed_ms: f64) -> f32 {
    let scaled = (config.time_penalty_ms_scale as f64 * elapsed_ms.max(0.0) + 1.0).ln();
    config.time_penalty_factor * scaled as f32
}

/// Short-term score of the item `position` steps from the newest
pub fn short_term_score(config: &ScoringConfig, position: usize, elapsed_ms: f64, similarity: f32) -> f32 {
    if position < config.always_include {
        return config.recent_base - position as f32 * config.recent_step;
    }
    let base = position as f32 + config.offset + time_penalty(config, elapsed_ms);
    config.factor * base.powf(-config.exponent) * similarity
}

/// Rank decay for the `rank`-th newest item of a long-term stream
pub fn long_term_rank_weight(config: &ScoringConfig, rank: usize) -> f32 {
    (rank as f32 + config.long_term_offset).powf(-config.long_term_exponent)
}

/// Position of `item` within its own stream of the scan, newest first
pub fn rank_in_stream(scan: &[Consolidation], item: &Consolidation) -> usize {
    scan.iter()
        .filter(|c| c.stream == item.stream && c.index > item.index)
        .count()
}

/// Long-term score: similarity decayed by rank within the item's stream
pub fn long_term_score(config: &ScoringConfig, scan: &[Consolidation], item: &Consolidation, targets: &[&[f32]]) -> f32 {
    let sim = combined_similarity(item.consolidation.embedding(), targets);
    sim * long_term_rank_weight(config, rank_in_stream(scan, item))
}

/// `exp(r * ln(similarity))`: `r = 0` is uniform, `r = 1` is similarity-proportional
pub fn imagination_weight(similarity: f32, r: f32) -> f32 {
    let sim = similarity.abs().max(f32::MIN_POSITIVE);
    (r * sim.ln()).exp()
}

/// Map `r` in `[0, 1]` to a delay uniform in log-space between `min` and `max`
pub fn log_uniform_delay(min_secs: i64, max_secs: i64, r: f64) -> i64 {
    let lo = (min_secs.max(1) as f64).ln();
    let hi = (max_secs.max(min_secs).max(1) as f64).ln();
    (lo + r.clamp(0.0, 1.0) * (hi - lo)).exp().round() as i64
}
