// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleStats {
    pub mean: f64,
    pub median: f64,
    /// Population standard deviation.
    pub stddev: f64,
}

impl SampleStats {
    /// Coefficient of variation. Infinite when the mean is zero.
    pub fn cv(&self) -> f64 {
        self.stddev / self.mean
    }
}

pub fn stats_for_samples(samples: &[f64]) -> SampleStats {
    let count = samples.len();
    if count == 0 {
        return SampleStats{mean: 0.0, median: 0.0, stddev: 0.0};
    }
    let mut first_moment = 0.0;
    for &s in samples {
        first_moment += s;
    }
    let mean = first_moment / count as f64;
    let mut second_moment: f64 = 0.0;
    for &s in samples {
        second_moment += (s - mean) * (s - mean);
    }
    let stddev = (second_moment / count as f64).sqrt();
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let median = if count % 2 == 1 {
        sorted[count / 2]
    } else {
        (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
    };
    SampleStats{mean, median, stddev}
}

/// Median of `values`, averaging the two middle entries for even counts.
/// Reorders `values`. Returns NaN for an empty slice.
pub fn median_of(values: &mut [f32]) -> f32 {
    let n = values.len();
    if n == 0 {
        return f32::NAN;
    }
    let (_, upper, _) = values.select_nth_unstable_by(n / 2, |a, b| a.total_cmp(b));
    let upper = *upper;
    if n % 2 == 1 {
        return upper;
    }
    // The lower middle is the largest entry left of n/2.
    let lower = values[..n / 2].iter().copied().fold(f32::NEG_INFINITY, f32::max);
    (lower + upper) / 2.0
}

/// Median of the non-NaN entries of `values`; NaN if there are none.
pub fn nan_median(values: &[f32]) -> f32 {
    let mut kept: Vec<f32> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    median_of(&mut kept)
}

/// Counts `values` into `bins` equal-width bins spanning `range`. The last bin
/// is closed on the right; values outside the range are not counted.
pub fn bin_values(values: &[f64], bins: usize, range: (f64, f64)) -> Vec<u32> {
    assert!(bins > 0);
    assert!(range.1 > range.0);
    let mut histogram = vec![0_u32; bins];
    let width = (range.1 - range.0) / bins as f64;
    for &v in values {
        if v < range.0 || v > range.1 || v.is_nan() {
            continue;
        }
        let mut bin = ((v - range.0) / width) as usize;
        if bin >= bins {
            bin = bins - 1;
        }
        histogram[bin] += 1;
    }
    histogram
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use crate::histogram_funcs::{bin_values, median_of, nan_median, stats_for_samples};

    #[test]
    fn test_stats_for_samples() {
        let stats = stats_for_samples(&[10.0, 10.0, 20.0, 20.0]);
        assert_eq!(stats.mean, 15.0);
        assert_eq!(stats.median, 15.0);
        assert_eq!(stats.stddev, 5.0);
        assert_abs_diff_eq!(stats.cv(), 1.0 / 3.0, epsilon = 1e-12);

        let odd = stats_for_samples(&[3.0, 1.0, 2.0]);
        assert_eq!(odd.median, 2.0);
    }

    #[test]
    fn test_median_of() {
        assert_eq!(median_of(&mut [5.0, 1.0, 3.0]), 3.0);
        assert_eq!(median_of(&mut [4.0, 1.0, 3.0, 2.0]), 2.5);
        assert!(median_of(&mut []).is_nan());
    }

    #[test]
    fn test_nan_median() {
        assert_eq!(nan_median(&[f32::NAN, 1.0, 2.0, f32::NAN, 6.0]), 2.0);
        assert!(nan_median(&[f32::NAN]).is_nan());
    }

    #[test]
    fn test_bin_values() {
        let histogram = bin_values(&[0.0, 0.5, 4.9, 5.0, 10.0, 11.0, -1.0],
                                   /*bins=*/2, (0.0, 10.0));
        assert_eq!(histogram, vec![3, 2]);
    }
}  // mod tests.
