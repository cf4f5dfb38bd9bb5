//! Word-set similarity used for debate consensus.

use std::collections::HashSet;

/// Lowercased alphanumeric words of a text.
fn word_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard index of the two texts' word sets, in [0, 1].
///
/// Two texts with no words at all are identical (1.0).
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let left = word_set(a);
    let right = word_set(b);
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    let shared = left.intersection(&right).count();
    let union = left.union(&right).count();
    shared as f64 / union as f64
}

/// Whether at least two texts were given and every pair reaches `threshold`.
///
/// The threshold is inclusive: a pair scoring exactly `threshold` counts as similar.
pub fn all_pairs_similar(texts: &[&str], threshold: f64) -> bool {
    if texts.len() < 2 {
        return false;
    }
    texts.iter().enumerate().all(|(i, a)| {
        texts[i + 1..].iter().all(|b| jaccard_similarity(a, b) >= threshold)
    })
}
