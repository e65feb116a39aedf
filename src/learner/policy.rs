//! Uncertainty policy: per-atom variances in, query decision and atom selection out.

/// Outcome of one policy evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// `sqrt(|variance|) / sigma` per atom.
    pub scores: Vec<f64>,
    pub max_score: f64,
    pub should_query: bool,
    /// Atoms with `score > add_threshold`, ascending.
    pub atoms_to_add: Vec<usize>,
}

/// Normalizes variances into scores. A NaN variance (or a degenerate sigma) maps to an
/// infinite score so that it always triggers a query.
pub fn normalize(variances: &[f64], sigma: f64) -> Vec<f64> {
    variances
        .iter()
        .map(|v| {
            let score = v.abs().sqrt() / sigma;
            if score.is_nan() {
                f64::INFINITY
            } else {
                score
            }
        })
        .collect()
}

pub fn evaluate(variances: &[f64], sigma: f64, call_threshold: f64, add_threshold: f64) -> Decision {
    let scores = normalize(variances, sigma);
    let max_score = scores.iter().copied().fold(0.0, f64::max);
    let atoms_to_add = scores
        .iter()
        .enumerate()
        .filter(|(_, s)| **s > add_threshold)
        .map(|(i, _)| i)
        .collect();

    Decision {
        should_query: max_score > call_threshold,
        max_score,
        scores,
        atoms_to_add,
    }
}

/// Counts scores into `bins` equal-width bins over `[0, upper]`; larger scores land in
/// the last bin.
pub fn histogram(scores: &[f64], bins: usize, upper: f64) -> Vec<usize> {
    let mut counts = vec![0; bins];
    if bins == 0 || !(upper > 0.0) {
        return counts;
    }
    for &s in scores {
        let idx = ((s / upper) * bins as f64).floor();
        let idx = if idx.is_finite() { (idx.max(0.0) as usize).min(bins - 1) } else { bins - 1 };
        counts[idx] += 1;
    }
    counts
}
