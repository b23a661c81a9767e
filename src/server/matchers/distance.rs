//! Normalized distance functions used by the pattern family. All functions
//! return values in `[0.0, 1.0]` where `0.0` means "identical".

use stringmetrics::levenshtein;

/// Scale constant for the log-based numeric distance. It approximates the
/// practical dynamic range of an `f64` (`ln(f64::MAX)` is roughly 709) and
/// is a tunable, not a semantically meaningful number: any value that keeps
/// the quotient within `[0, 1]` for realistic operands works.
pub const NUMERIC_DISTANCE_SCALE: f64 = 643.775;

/// Levenshtein distance between the two strings, normalized by the longer
/// input. Empty vs. empty is an exact match.
pub fn normalized_levenshtein(expected: &str, actual: &str) -> f64 {
    let max_len = expected.chars().count().max(actual.chars().count());
    if max_len == 0 {
        return 0.0;
    }

    let distance = levenshtein(expected, actual) as f64 / max_len as f64;
    distance.clamp(0.0, 1.0)
}

/// Log-scale normalized distance between two numbers, used by the relational
/// patterns when the comparison fails. Both operands are shifted by the same
/// amount when either is not positive so the logarithms stay defined; the
/// result is rounded to two decimal places for reproducible diagnostics.
pub fn log_scale_distance(expected: f64, actual: f64) -> f64 {
    if expected == actual {
        return 0.0;
    }

    let min = expected.min(actual);
    let (expected, actual) = if min <= 0.0 {
        let shift = 1.0 - min;
        (expected + shift, actual + shift)
    } else {
        (expected, actual)
    };

    let raw = ((expected.ln() - actual.ln()).abs() / NUMERIC_DISTANCE_SCALE).clamp(0.0, 1.0);
    (raw * 100.0).round() / 100.0
}

/// Distance expressed as the share of mismatched nodes in a structural
/// comparison (JSON properties, XML events).
pub fn node_fraction(mismatched: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }

    (mismatched as f64 / total as f64).clamp(0.0, 1.0)
}
