//! Particle validation. A real particle brightens and darkens in a sinusoidal
//! way as the focal plane sweeps through it, and sits on a locally uniform
//! background; dust, scratches and the spot edge do neither.

use imageproc::rect::Rect;
use log::debug;

use crate::config::{FitConfig, ValidatorConfig};
use crate::error::{Result, VirionError};
use crate::histogram_funcs::{stats_for_samples, SampleStats};
use crate::image_funcs::{EnumeratePixels, Plane, Stack};
use crate::shape::{Blob, Coord};

/// The point-spread model a·sin(b·x + c).
pub fn psf_sine(x: f64, params: &[f64; 3]) -> f64 {
    let [a, b, c] = *params;
    a * (b * x + c).sin()
}

fn psf_sine_jacobian(x: f64, params: &[f64; 3]) -> [f64; 3] {
    let [a, b, c] = *params;
    let phase = b * x + c;
    [phase.sin(), a * x * phase.cos(), a * phase.cos()]
}

#[derive(Debug, Clone, Copy)]
pub struct FitResult {
    pub params: [f64; 3],
    /// Weighted sum of squared residuals.
    pub chi2: f64,
    pub iterations: usize,
}

fn weighted_chi2(x: &[f64], y: &[f64], sigma: &[f64], params: &[f64; 3]) -> f64 {
    x.iter().zip(y.iter()).zip(sigma.iter())
        .map(|((&xi, &yi), &si)| {
            let r = (yi - psf_sine(xi, params)) / si;
            r * r
        })
        .sum()
}

// Gaussian elimination with partial pivoting. None when singular.
#[allow(clippy::needless_range_loop)]
fn solve_3x3(a: &[[f64; 3]; 3], b: &[f64; 3]) -> Option<[f64; 3]> {
    let mut matrix = *a;
    let mut rhs = *b;
    for col in 0..3 {
        let mut max_row = col;
        let mut max_val = matrix[col][col].abs();
        for row in (col + 1)..3 {
            if matrix[row][col].abs() > max_val {
                max_val = matrix[row][col].abs();
                max_row = row;
            }
        }
        if max_val < 1e-15 {
            return None;
        }
        if max_row != col {
            matrix.swap(col, max_row);
            rhs.swap(col, max_row);
        }
        for row in (col + 1)..3 {
            let factor = matrix[row][col] / matrix[col][col];
            let pivot_row = matrix[col];
            for (j, m) in matrix[row].iter_mut().enumerate().skip(col) {
                *m -= factor * pivot_row[j];
            }
            rhs[row] -= factor * rhs[col];
        }
    }
    let mut x = [0.0; 3];
    for i in (0..3).rev() {
        let mut sum = rhs[i];
        for (j, &xj) in x.iter().enumerate().skip(i + 1) {
            sum -= matrix[i][j] * xj;
        }
        x[i] = sum / matrix[i][i];
    }
    Some(x)
}

/// Weighted Levenberg-Marquardt fit of [psf_sine()] to (x, y) with per-point
/// standard deviations `sigma`. Zero sigmas are replaced by the smallest
/// positive one (or 1 when all are zero). A step that can no longer reduce
/// chi² ends the fit as converged; running out of iterations or a singular
/// normal matrix is [VirionError::FitNonConvergence].
pub fn fit_sine(x: &[f64], y: &[f64], sigma: &[f64], config: &FitConfig) -> Result<FitResult> {
    if x.len() != y.len() || x.len() != sigma.len() {
        return Err(VirionError::InvalidInput(format!(
            "fit over {} x, {} y and {} sigma values", x.len(), y.len(), sigma.len())));
    }
    let min_positive = sigma.iter().copied().filter(|&s| s > 0.0).fold(f64::INFINITY, f64::min);
    let floor = if min_positive.is_finite() { min_positive } else { 1.0 };
    let sigma: Vec<f64> = sigma.iter().map(|&s| if s > 0.0 { s } else { floor }).collect();

    let mut params = config.initial_params;
    let mut lambda = config.initial_lambda;
    let mut chi2 = weighted_chi2(x, y, &sigma, &params);

    for iteration in 1..=config.max_iterations {
        let mut hessian = [[0.0_f64; 3]; 3];
        let mut gradient = [0.0_f64; 3];
        for ((&xi, &yi), &si) in x.iter().zip(y.iter()).zip(sigma.iter()) {
            let row = psf_sine_jacobian(xi, &params).map(|d| d / si);
            let r = (yi - psf_sine(xi, &params)) / si;
            for i in 0..3 {
                gradient[i] += row[i] * r;
                for j in i..3 {
                    hessian[i][j] += row[i] * row[j];
                }
            }
        }
        for i in 1..3 {
            for j in 0..i {
                hessian[i][j] = hessian[j][i];
            }
        }
        let mut damped = hessian;
        for (i, row) in damped.iter_mut().enumerate() {
            row[i] *= 1.0 + lambda;
        }
        let Some(delta) = solve_3x3(&damped, &gradient) else {
            return Err(VirionError::FitNonConvergence{iterations: iteration});
        };
        let mut candidate = params;
        for (p, d) in candidate.iter_mut().zip(delta.iter()) {
            *p += d;
        }
        let candidate_chi2 = weighted_chi2(x, y, &sigma, &candidate);
        if candidate_chi2 < chi2 {
            params = candidate;
            chi2 = candidate_chi2;
            lambda *= config.lambda_down;
            let max_delta = delta.iter().fold(0.0_f64, |m, d| m.max(d.abs()));
            if max_delta < config.convergence_threshold {
                return Ok(FitResult{params, chi2, iterations: iteration});
            }
        } else {
            lambda *= config.lambda_up;
            if lambda > 1e10 {
                // No damping finds a better point: a local minimum.
                return Ok(FitResult{params, chi2, iterations: iteration});
            }
        }
    }
    Err(VirionError::FitNonConvergence{iterations: config.max_iterations})
}

/// Unweighted coefficient of determination of `fitted` against `y`; 0 when `y`
/// is constant.
pub fn r_squared(y: &[f64], fitted: &[f64]) -> f64 {
    let n = y.len() as f64;
    let mean = y.iter().sum::<f64>() / n;
    let ss_tot: f64 = y.iter().map(|v| (v - mean) * (v - mean)).sum();
    if ss_tot == 0.0 {
        return 0.0;
    }
    let ss_res: f64 = y.iter().zip(fitted.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
    1.0 - ss_res / ss_tot
}

/// Intensity of a blob's pixels through the stack.
#[derive(Debug, Clone)]
pub struct ZProfile {
    /// Per plane mean over the member pixels.
    pub mean: Vec<f64>,
    /// Per plane population standard deviation over the member pixels.
    pub std: Vec<f64>,
    /// Brightest member pixel value on any plane.
    pub greatest_max: f64,
}

impl ZProfile {
    /// First plane where the mean profile peaks.
    pub fn peak_plane(&self) -> usize {
        first_index_of(&self.mean, |a, b| a > b)
    }

    pub fn trough_plane(&self) -> usize {
        first_index_of(&self.mean, |a, b| a < b)
    }

    /// Mean profile minus its value halfway between peak and trough.
    pub fn centered(&self) -> Vec<f64> {
        let base_index = (self.peak_plane() + self.trough_plane()) / 2;
        let base = self.mean[base_index];
        self.mean.iter().map(|v| v - base).collect()
    }

    /// Max minus min of the mean profile.
    pub fn intensity(&self) -> f64 {
        self.mean[self.peak_plane()] - self.mean[self.trough_plane()]
    }
}

fn first_index_of(values: &[f64], better: impl Fn(f64, f64) -> bool) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if better(v, values[best]) {
            best = i;
        }
    }
    best
}

pub fn z_profile(pixels: &[Coord], stack: &Stack) -> ZProfile {
    let n = pixels.len() as f64;
    let mut mean = Vec::with_capacity(stack.len());
    let mut std = Vec::with_capacity(stack.len());
    let mut greatest_max = f64::NEG_INFINITY;
    for plane in stack.planes() {
        let values: Vec<f64> = pixels.iter()
            .map(|&(row, col)| plane.get_pixel(col, row).0[0] as f64).collect();
        let m = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / n;
        greatest_max = values.iter().copied().fold(greatest_max, f64::max);
        mean.push(m);
        std.push(var.sqrt());
    }
    ZProfile{mean, std, greatest_max}
}

/// R² of the point-spread fit to a blob's centered mean profile, weighted by
/// the per-plane spread. A fit that does not converge scores 0.
pub fn psf_correlation(profile: &ZProfile, config: &FitConfig) -> f64 {
    let y = profile.centered();
    let x: Vec<f64> = (0..y.len()).map(|i| i as f64).collect();
    match fit_sine(&x, &y, &profile.std, config) {
        Ok(fit) => {
            let fitted: Vec<f64> = x.iter().map(|&xi| psf_sine(xi, &fit.params)).collect();
            r_squared(&y, &fitted)
        },
        Err(e) => {
            debug!("{}; scoring 0", e);
            0.0
        },
    }
}

/// `bbox` grown by `margin` on every side, clipped to a (width, height) image.
pub fn expand_bbox(bbox: &Rect, margin: u32, dims: (u32, u32)) -> Rect {
    let m = margin as i32;
    let left = (bbox.left() - m).max(0);
    let top = (bbox.top() - m).max(0);
    let right = (bbox.right() + m).min(dims.0 as i32 - 1);
    let bottom = (bbox.bottom() + m).min(dims.1 as i32 - 1);
    Rect::at(left, top).of_size((right - left + 1) as u32, (bottom - top + 1) as u32)
}

/// Statistics of the pixels on the perimeter of `roi` in `plane`.
pub fn background_ring(plane: &Plane, roi: &Rect) -> SampleStats {
    let samples: Vec<f64> = EnumeratePixels::new(plane, roi, /*include_interior=*/false)
        .map(|(_x, _y, v)| v as f64).collect();
    stats_for_samples(&samples)
}

/// A blob with its validation measurements.
#[derive(Debug, Clone)]
pub struct ValidatedBlob {
    pub blob: Blob,
    pub z_profile: ZProfile,
    pub r_squared: f64,
    pub peak_plane: usize,
    pub background_median: f64,
    pub background_cv: f64,
    /// Peak-to-trough swing of the mean profile.
    pub intensity: f64,
    /// (greatest_max - background_median) * 100 / background_median.
    pub perc_contrast: f64,
    pub accepted: bool,
}

/// Measures `blob` against the normalized `stack` and decides whether it is a
/// particle: background CV below the cutoff and fit R² at or above it.
pub fn validate_blob(blob: Blob, stack: &Stack, config: &ValidatorConfig) -> ValidatedBlob {
    let profile = z_profile(&blob.pixels, stack);
    let r_squared = psf_correlation(&profile, &config.fit);
    let peak_plane = profile.peak_plane();
    let intensity = profile.intensity();
    let ring = expand_bbox(&blob.bbox, config.bbox_margin, stack.dimensions());
    let background = background_ring(stack.plane(peak_plane), &ring);
    let background_cv = background.cv();
    let perc_contrast =
        (profile.greatest_max - background.median) * 100.0 / background.median;
    let accepted = background_cv < config.cv_cutoff && r_squared >= config.r2_cutoff;
    debug!("Blob {} area {}: R² {:.4}, intensity {:.4}, background {:.4} (cv {:.4}), \
            contrast {:.3}%, {}",
           blob.label, blob.area, r_squared, intensity, background.median, background_cv,
           perc_contrast, if accepted { "accepted" } else { "rejected" });
    ValidatedBlob{blob, z_profile: profile, r_squared, peak_plane,
                  background_median: background.median, background_cv, intensity,
                  perc_contrast, accepted}
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use image::Luma;
    use crate::shape::{extract_blobs, CandidateSet};
    use crate::config::ClassifierConfig;

    fn sine_profile(n: usize, params: &[f64; 3]) -> (Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let y = x.iter().map(|&xi| psf_sine(xi, params)).collect();
        (x, y)
    }

    #[test]
    fn test_solve_3x3() {
        let a = [[2.0, 1.0, 0.0], [1.0, 3.0, 1.0], [0.0, 1.0, 4.0]];
        let x = solve_3x3(&a, &[3.0, 5.0, 5.0]).unwrap();
        assert_abs_diff_eq!(x[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[2], 1.0, epsilon = 1e-12);
        assert!(solve_3x3(&[[0.0; 3]; 3], &[1.0, 1.0, 1.0]).is_none());
    }

    #[test]
    fn test_fit_sine_recovers_params() {
        let truth = [0.12, 0.12, 1.1];
        let (x, y) = sine_profile(20, &truth);
        let sigma = vec![0.01; 20];
        let fit = fit_sine(&x, &y, &sigma, &FitConfig::default()).unwrap();
        let fitted: Vec<f64> = x.iter().map(|&xi| psf_sine(xi, &fit.params)).collect();
        assert!(r_squared(&y, &fitted) > 0.999);
    }

    #[test]
    fn test_fit_sine_zero_sigma() {
        let (x, y) = sine_profile(15, &[0.1, 0.12, 1.05]);
        // All-zero spreads fall back to unit weights.
        let fit = fit_sine(&x, &y, &vec![0.0; 15], &FitConfig::default()).unwrap();
        assert!(fit.chi2 < 1e-6);
    }

    #[test]
    fn test_fit_sine_iteration_limit() {
        let (x, y) = sine_profile(15, &[0.5, 0.6, 0.2]);
        let config = FitConfig{max_iterations: 1, ..FitConfig::default()};
        match fit_sine(&x, &y, &vec![1.0; 15], &config) {
            Err(VirionError::FitNonConvergence{iterations}) => assert_eq!(iterations, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fit_sine_length_mismatch() {
        let (x, y) = sine_profile(5, &[0.1, 0.1, 1.0]);
        assert!(matches!(fit_sine(&x, &y, &[1.0; 4], &FitConfig::default()),
                         Err(VirionError::InvalidInput(_))));
        assert!(matches!(fit_sine(&x, &y[1..], &[1.0; 5], &FitConfig::default()),
                         Err(VirionError::InvalidInput(_))));
    }

    #[test]
    fn test_r_squared() {
        assert_eq!(r_squared(&[1.0, 1.0, 1.0], &[0.0, 1.0, 2.0]), 0.0);
        assert_abs_diff_eq!(r_squared(&[0.0, 1.0, 2.0], &[0.0, 1.0, 2.0]), 1.0);
        assert_abs_diff_eq!(r_squared(&[0.0, 1.0, 2.0], &[1.0, 1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_z_profile_and_centering() {
        let planes: Vec<Plane> = [0.5_f32, 0.7, 0.4, 0.6].iter()
            .map(|&v| Plane::from_pixel(4, 4, Luma([v]))).collect();
        let mut planes = planes;
        planes[1].put_pixel(2, 1, Luma([0.9]));
        let stack = Stack::new(planes).unwrap();
        let profile = z_profile(&[(1, 1), (1, 2)], &stack);
        assert_abs_diff_eq!(profile.mean[1], 0.8, epsilon = 1e-6);
        assert_abs_diff_eq!(profile.std[1], 0.1, epsilon = 1e-6);
        assert_abs_diff_eq!(profile.std[0], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(profile.greatest_max, 0.9, epsilon = 1e-6);
        assert_eq!(profile.peak_plane(), 1);
        assert_eq!(profile.trough_plane(), 2);
        // Base index (1 + 2) / 2 = 1.
        let centered = profile.centered();
        assert_abs_diff_eq!(centered[1], 0.0);
        assert_abs_diff_eq!(centered[2], -0.4, epsilon = 1e-6);
        assert_abs_diff_eq!(profile.intensity(), 0.4, epsilon = 1e-6);
    }

    #[test]
    fn test_expand_bbox_clamps() {
        let bbox = Rect::at(1, 5).of_size(3, 2);
        let grown = expand_bbox(&bbox, 2, (8, 8));
        assert_eq!(grown, Rect::at(0, 3).of_size(6, 5));
    }

    #[test]
    fn test_background_ring() {
        let mut plane = Plane::from_pixel(5, 5, Luma([0.5]));
        plane.put_pixel(2, 2, Luma([1.0]));  // Interior, ignored.
        plane.put_pixel(0, 0, Luma([0.7]));
        let stats = background_ring(&plane, &Rect::at(0, 0).of_size(5, 5));
        assert_abs_diff_eq!(stats.median, 0.5, epsilon = 1e-6);
        assert!(stats.cv() > 0.0 && stats.cv() < 0.1);
    }

    // A blob whose pixels follow a sine through focus on a flat background:
    // peak at plane 1, trough at plane 11, crossing the background at plane 6.
    fn particle_stack(background: f32, ripple: f32) -> (Stack, Blob) {
        let planes: Vec<Plane> = (0..12).map(|z| {
            let mut plane = Plane::from_fn(20, 20, |x, y| {
                let wobble = if (x + y) % 2 == 0 { ripple } else { -ripple };
                Luma([background + wobble])
            });
            let phase = std::f32::consts::PI * (z as f32 / 10.0 + 0.4);
            let v = background + 0.1 * phase.sin();
            for row in 8..11 {
                for col in 8..11 {
                    plane.put_pixel(col, row, Luma([v]));
                }
            }
            plane
        }).collect();
        let ridge: Vec<Coord> = (8..11).flat_map(|r| (8..11).map(move |c| (r, c))).collect();
        let candidates = CandidateSet{ridge, ..CandidateSet::default()};
        let mut blobs = extract_blobs(&candidates, (20, 20), &ClassifierConfig::default());
        (Stack::new(planes).unwrap(), blobs.remove(0))
    }

    #[test]
    fn test_validate_blob_accepts_particle() {
        let (stack, blob) = particle_stack(0.5, 0.0);
        let validated = validate_blob(blob, &stack, &ValidatorConfig::default());
        assert!(validated.r_squared > 0.99);
        assert_abs_diff_eq!(validated.background_median, 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(validated.background_cv, 0.0, epsilon = 1e-6);
        // sin(0.5π) - sin(1.5π) = 2, times the 0.1 amplitude.
        assert_abs_diff_eq!(validated.intensity, 0.2, epsilon = 1e-6);
        let peak = validated.z_profile.greatest_max;
        assert_abs_diff_eq!(validated.perc_contrast, (peak - 0.5) * 100.0 / 0.5, epsilon = 1e-4);
        assert!(validated.accepted);
    }

    #[test]
    fn test_validate_blob_rejects_noisy_background() {
        let (stack, blob) = particle_stack(0.5, 0.1);
        let validated = validate_blob(blob, &stack, &ValidatorConfig::default());
        assert!(validated.background_cv >= 0.1);
        assert!(!validated.accepted);
    }
}  // mod tests.
