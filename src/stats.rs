// src/stats.rs
//
// Quantile / IQR helpers for reference statistics and ranking.
// Intentionally simple + deterministic: every function is a pure
// computation over its inputs with a fixed evaluation order.

/// Quartile summary of a sample set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quartiles {
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
}

impl Quartiles {
    pub fn iqr(&self) -> f64 {
        self.q3 - self.q1
    }
}

/// Linear-interpolated percentile of a sorted slice, `p` in [0, 100].
///
/// Callers must pass a non-empty, ascending slice.
fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] + (sorted[hi] - sorted[lo]) * frac
    }
}

/// Compute quartiles of an arbitrary sample set. Returns None when empty.
/// Non-finite samples are ignored.
pub fn quartiles(values: &[f64]) -> Option<Quartiles> {
    let mut buf: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if buf.is_empty() {
        return None;
    }
    buf.sort_by(|a, b| a.partial_cmp(b).expect("finite values compare"));
    Some(Quartiles {
        q1: percentile_sorted(&buf, 25.0),
        median: percentile_sorted(&buf, 50.0),
        q3: percentile_sorted(&buf, 75.0),
    })
}

/// Drop samples outside `fence` IQRs beyond the quartiles (Tukey fence).
///
/// Sample sets below 4 entries are returned unchanged; the fence is not
/// meaningful there.
pub fn iqr_filtered(values: &[f64], fence: f64) -> Vec<f64> {
    if values.len() < 4 {
        return values.to_vec();
    }
    let Some(q) = quartiles(values) else {
        return values.to_vec();
    };
    let lower = q.q1 - fence * q.iqr();
    let upper = q.q3 + fence * q.iqr();
    values
        .iter()
        .copied()
        .filter(|v| v.is_finite() && *v >= lower && *v <= upper)
        .collect()
}

/// Signed IQR-normalized delta of `value` against a reference.
/// Positive = above the reference median. Returns 0 on a degenerate IQR.
pub fn normalized_delta(value: f64, reference_median: f64, reference_iqr: f64) -> f64 {
    if reference_iqr <= f64::EPSILON || !reference_iqr.is_finite() {
        return 0.0;
    }
    (value - reference_median) / reference_iqr
}

/// Driver spread relative to the reference IQR. Lower = more consistent.
pub fn consistency_ratio(values: &[f64], reference_iqr: f64) -> f64 {
    if values.len() < 2 || reference_iqr <= f64::EPSILON {
        return 0.0;
    }
    match quartiles(values) {
        Some(q) => q.iqr() / reference_iqr,
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quartiles_of_a_known_set() {
        let q = quartiles(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(q.median, 3.0);
        assert_eq!(q.q1, 2.0);
        assert_eq!(q.q3, 4.0);
        assert_eq!(q.iqr(), 2.0);
    }

    #[test]
    fn quartiles_ignores_non_finite() {
        let q = quartiles(&[1.0, f64::NAN, 3.0]).unwrap();
        assert_eq!(q.median, 2.0);
    }

    #[test]
    fn empty_input_yields_none() {
        assert!(quartiles(&[]).is_none());
        assert!(quartiles(&[f64::NAN]).is_none());
    }

    #[test]
    fn fence_drops_the_outlier_only() {
        let values = [10.0, 11.0, 10.5, 10.2, 11.1, 10.8, 45.0];
        let kept = iqr_filtered(&values, 1.5);
        assert_eq!(kept.len(), 6);
        assert!(!kept.contains(&45.0));
    }

    #[test]
    fn small_sets_pass_the_fence_untouched() {
        let values = [1.0, 100.0];
        assert_eq!(iqr_filtered(&values, 1.5), values.to_vec());
    }

    #[test]
    fn normalized_delta_signs() {
        assert!(normalized_delta(12.0, 10.0, 2.0) > 0.0);
        assert!(normalized_delta(8.0, 10.0, 2.0) < 0.0);
        assert_eq!(normalized_delta(12.0, 10.0, 0.0), 0.0);
    }

    #[test]
    fn consistency_ratio_scales_with_spread() {
        let tight = [10.0, 10.1, 10.05, 9.95, 10.0];
        let wide = [8.0, 12.0, 9.0, 11.0, 10.0];
        assert!(consistency_ratio(&tight, 1.0) < consistency_ratio(&wide, 1.0));
    }
}
