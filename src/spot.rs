//! Locating the antibody spot, the circular region within which particles are
//! counted.

use std::time::Instant;

use image::{GrayImage, Luma};
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::SpotConfig;
use crate::error::{Result, VirionError};
use crate::image_funcs::{to_gray_u8, Plane, MASK_ON};
use crate::registration::ShiftVector;

/// Circle in image coordinates. The center is fractional so that sub-pixel
/// pass shifts accumulate without rounding drift.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpotGeometry {
    pub center_x: f64,
    pub center_y: f64,
    pub radius: u32,
}

impl SpotGeometry {
    pub fn shifted(&self, shift: &ShiftVector) -> SpotGeometry {
        SpotGeometry{center_x: self.center_x + shift.cols,
                     center_y: self.center_y + shift.rows,
                     radius: self.radius}
    }
}

/// When a tracked spot is detected afresh.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum RedetectPolicy {
    /// Detect on the first pass only and follow the pass shifts thereafter.
    #[default]
    Never,
    /// Detect again once the shifts accumulated since the last detection
    /// move the center by more than this many pixels.
    DriftAbove(f64),
}

// Canny's own smoothing in imageproc.
const CANNY_BUILTIN_SIGMA: f32 = 1.4;

/// Canny edge map of a [0, 1] projection image with Gaussian smoothing of
/// `sigma` (values below the detector's built-in 1.4 get 1.4). Hysteresis
/// thresholds are 0.1 and 0.2 of full scale gradient.
pub fn spot_edges(projection: &Plane, sigma: f32) -> GrayImage {
    let mut gray = to_gray_u8(projection);
    if sigma > CANNY_BUILTIN_SIGMA {
        let extra = (sigma * sigma - CANNY_BUILTIN_SIGMA * CANNY_BUILTIN_SIGMA).sqrt();
        gray = gaussian_blur_f32(&gray, extra);
    }
    canny(&gray, 0.1 * 255.0, 0.2 * 255.0)
}

/// Offsets of the discrete circle of `radius` (midpoint algorithm), each once.
fn circle_offsets(radius: i32) -> Vec<(i32, i32)> {
    let mut offsets = Vec::with_capacity(8 * radius.max(1) as usize);
    let mut x = radius;
    let mut y = 0;
    let mut err = 1 - radius;
    while x >= y {
        for &(dx, dy) in &[(x, y), (y, x), (-y, x), (-x, y),
                           (-x, -y), (-y, -x), (y, -x), (x, -y)] {
            offsets.push((dx, dy));
        }
        y += 1;
        if err < 0 {
            err += 2 * y + 1;
        } else {
            x -= 1;
            err += 2 * (y - x) + 1;
        }
    }
    offsets.sort_unstable();
    offsets.dedup();
    offsets
}

// Best (score, center_x, center_y) for one radius. The score is the fraction
// of the circle's pixels that are edges.
fn hough_best_for_radius(edge_points: &[(i32, i32)], width: u32, height: u32,
                         radius: u32) -> (f64, i32, i32) {
    let offsets = circle_offsets(radius as i32);
    let (w, h) = (width as i32, height as i32);
    let mut accumulator = vec![0_u32; (width * height) as usize];
    for &(ex, ey) in edge_points {
        for &(dx, dy) in &offsets {
            let (cx, cy) = (ex + dx, ey + dy);
            if cx >= 0 && cx < w && cy >= 0 && cy < h {
                accumulator[(cy * w + cx) as usize] += 1;
            }
        }
    }
    let mut best_index = 0;
    for (i, &votes) in accumulator.iter().enumerate() {
        if votes > accumulator[best_index] {
            best_index = i;
        }
    }
    let score = accumulator[best_index] as f64 / offsets.len() as f64;
    (score, best_index as i32 % w, best_index as i32 / w)
}

/// Finds the spot as the single best circle in `edges`. Radii from
/// `radius_min` up to but excluding `radius_max` in steps of `radius_step` are
/// tried. When the chip has no antibody spot the image-centered disk of
/// `default_radius` is returned without searching.
pub fn find_spot(edges: &GrayImage, config: &SpotConfig, spot: u32, pass: u32)
                 -> Result<SpotGeometry> {
    let (width, height) = edges.dimensions();
    if !config.antibody_spot {
        return Ok(SpotGeometry{center_x: width as f64 / 2.0,
                               center_y: height as f64 / 2.0,
                               radius: config.default_radius});
    }
    let hough_start = Instant::now();
    let edge_points: Vec<(i32, i32)> = edges.enumerate_pixels()
        .filter(|(_x, _y, p)| p.0[0] != 0)
        .map(|(x, y, _p)| (x as i32, y as i32))
        .collect();
    if edge_points.is_empty() || config.radius_step == 0 {
        return Err(VirionError::GeometryNotFound{spot, pass});
    }
    let radii: Vec<u32> = (config.radius_min..config.radius_max)
        .step_by(config.radius_step as usize).collect();
    let per_radius: Vec<(f64, i32, i32)> = radii.par_iter()
        .map(|&r| hough_best_for_radius(&edge_points, width, height, r))
        .collect();
    // First radius wins ties.
    let mut best: Option<(usize, (f64, i32, i32))> = None;
    for (i, &candidate) in per_radius.iter().enumerate() {
        if candidate.0 > 0.0 && best.map_or(true, |(_, b)| candidate.0 > b.0) {
            best = Some((i, candidate));
        }
    }
    let Some((radius_index, (score, cx, cy))) = best else {
        return Err(VirionError::GeometryNotFound{spot, pass});
    };
    let geometry = SpotGeometry{center_x: cx as f64, center_y: cy as f64,
                                radius: radii[radius_index]};
    info!("Spot {} pass {}: circle {:?} (score {:.3}) from {} edge pixels in {:?}",
          spot, pass, geometry, score, edge_points.len(), hough_start.elapsed());
    Ok(geometry)
}

/// Mask set outside the disk of radius `geometry.radius - margin`.
pub fn disk_exclusion(dims: (u32, u32), geometry: &SpotGeometry, margin: u32) -> GrayImage {
    let rad = geometry.radius.saturating_sub(margin) as f64;
    let rad_sq = rad * rad;
    GrayImage::from_fn(dims.0, dims.1, |x, y| {
        let dx = x as f64 - geometry.center_x;
        let dy = y as f64 - geometry.center_y;
        if dx * dx + dy * dy > rad_sq { Luma([MASK_ON]) } else { Luma([0]) }
    })
}

/// Spot geometry over a spot's passes: detected on the first processed pass,
/// then moved by each pass's shift.
#[derive(Debug, Clone, Default)]
pub enum SpotLocator {
    #[default]
    Uninitialized,
    Tracking {
        geometry: SpotGeometry,
        drift_since_detection: ShiftVector,
    },
}

impl SpotLocator {
    pub fn new() -> SpotLocator {
        SpotLocator::Uninitialized
    }

    pub fn geometry(&self) -> Option<SpotGeometry> {
        match self {
            SpotLocator::Uninitialized => None,
            SpotLocator::Tracking{geometry, ..} => Some(*geometry),
        }
    }

    fn detect(projection: &Plane, config: &SpotConfig, spot: u32, pass: u32)
              -> Result<SpotGeometry> {
        if !config.antibody_spot {
            return find_spot(&GrayImage::new(projection.width(), projection.height()),
                             config, spot, pass);
        }
        let edges = spot_edges(projection, config.canny_sigma);
        find_spot(&edges, config, spot, pass)
    }

    /// Geometry for this pass. `shift` is the pass's registration shift
    /// relative to the previously processed pass (ignored on the first).
    pub fn locate(&mut self, projection: &Plane, shift: &ShiftVector, config: &SpotConfig,
                  spot: u32, pass: u32) -> Result<SpotGeometry> {
        let (geometry, drift) = match self {
            SpotLocator::Uninitialized => {
                let geometry = Self::detect(projection, config, spot, pass)?;
                (geometry, ShiftVector::ZERO)
            },
            SpotLocator::Tracking{geometry, drift_since_detection} => {
                let moved = geometry.shifted(shift);
                let drift = drift_since_detection.plus(shift);
                match config.redetect {
                    RedetectPolicy::DriftAbove(limit) if drift.magnitude() > limit => {
                        debug!("Spot {} drifted {:.1} px, re-detecting", spot, drift.magnitude());
                        match Self::detect(projection, config, spot, pass) {
                            Ok(found) => (found, ShiftVector::ZERO),
                            Err(e) => {
                                warn!("Re-detection failed ({}); keeping tracked spot", e);
                                (moved, drift)
                            },
                        }
                    },
                    _ => (moved, drift),
                }
            },
        };
        *self = SpotLocator::Tracking{geometry, drift_since_detection: drift};
        Ok(geometry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_circle_mut};

    fn small_band() -> SpotConfig {
        SpotConfig{radius_min: 40, radius_max: 81, radius_step: 10, ..SpotConfig::default()}
    }

    fn disk_projection(cx: i32, cy: i32, radius: i32) -> Plane {
        let mut gray = GrayImage::new(200, 180);
        draw_filled_circle_mut(&mut gray, (cx, cy), radius, Luma([200]));
        Plane::from_fn(200, 180, |x, y| Luma([gray.get_pixel(x, y).0[0] as f32 / 255.0]))
    }

    #[test]
    fn test_circle_offsets() {
        assert_eq!(circle_offsets(0), vec![(0, 0)]);
        let offsets = circle_offsets(5);
        for p in [(5, 0), (0, 5), (-5, 0), (0, -5)] {
            assert!(offsets.contains(&p));
        }
        for (dx, dy) in offsets {
            let d = ((dx * dx + dy * dy) as f64).sqrt();
            assert!((d - 5.0).abs() < 1.0);
        }
    }

    #[test]
    fn test_find_spot_hollow_circle() {
        let mut edges = GrayImage::new(200, 180);
        draw_hollow_circle_mut(&mut edges, (100, 90), 60, Luma([255]));
        let geometry = find_spot(&edges, &small_band(), 1, 1).unwrap();
        assert_eq!(geometry.radius, 60);
        assert_abs_diff_eq!(geometry.center_x, 100.0, epsilon = 1.0);
        assert_abs_diff_eq!(geometry.center_y, 90.0, epsilon = 1.0);
    }

    #[test]
    fn test_find_spot_without_antibody_spot() {
        let config = SpotConfig{antibody_spot: false, ..SpotConfig::default()};
        let geometry = find_spot(&GrayImage::new(1000, 800), &config, 1, 1).unwrap();
        assert_eq!(geometry, SpotGeometry{center_x: 500.0, center_y: 400.0, radius: 600});
    }

    #[test]
    fn test_find_spot_no_edges() {
        match find_spot(&GrayImage::new(50, 50), &small_band(), 3, 2) {
            Err(VirionError::GeometryNotFound{spot, pass}) => assert_eq!((spot, pass), (3, 2)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_spot_edges_then_find_spot() {
        let projection = disk_projection(95, 85, 60);
        let config = SpotConfig{canny_sigma: 2.5, ..small_band()};
        let edges = spot_edges(&projection, config.canny_sigma);
        assert!(edges.pixels().any(|p| p.0[0] != 0));
        let geometry = find_spot(&edges, &config, 1, 1).unwrap();
        assert_eq!(geometry.radius, 60);
        assert_abs_diff_eq!(geometry.center_x, 95.0, epsilon = 2.0);
        assert_abs_diff_eq!(geometry.center_y, 85.0, epsilon = 2.0);
    }

    #[test]
    fn test_disk_exclusion() {
        let geometry = SpotGeometry{center_x: 10.0, center_y: 10.0, radius: 8};
        let mask = disk_exclusion((30, 30), &geometry, 3);
        assert_eq!(mask.get_pixel(15, 10).0[0], 0);
        assert_eq!(mask.get_pixel(16, 10).0[0], MASK_ON);
        assert_eq!(mask.get_pixel(10, 10).0[0], 0);
        assert_eq!(mask.get_pixel(0, 0).0[0], MASK_ON);
    }

    #[test]
    fn test_spot_locator_tracks_shift() {
        let config = SpotConfig{antibody_spot: false, default_radius: 50, ..SpotConfig::default()};
        let projection = Plane::new(200, 100);
        let mut locator = SpotLocator::new();
        assert_eq!(locator.geometry(), None);
        let first = locator.locate(&projection, &ShiftVector::new(9.0, 9.0), &config, 1, 1)
            .unwrap();
        // The first pass ignores the shift.
        assert_eq!(first, SpotGeometry{center_x: 100.0, center_y: 50.0, radius: 50});
        let second = locator.locate(&projection, &ShiftVector::new(2.5, -3.0), &config, 1, 2)
            .unwrap();
        assert_eq!(second, SpotGeometry{center_x: 97.0, center_y: 52.5, radius: 50});
        let third = locator.locate(&projection, &ShiftVector::new(0.5, 0.0), &config, 1, 3)
            .unwrap();
        assert_abs_diff_eq!(third.center_y, 53.0);
    }

    #[test]
    fn test_spot_locator_redetects_after_drift() {
        let projection = disk_projection(95, 85, 60);
        let mut config = SpotConfig{redetect: RedetectPolicy::DriftAbove(20.0), ..small_band()};
        let mut locator = SpotLocator::new();
        let detected = locator.locate(&projection, &ShiftVector::ZERO, &config, 1, 1).unwrap();
        let small = locator.locate(&projection, &ShiftVector::new(0.0, 10.0), &config, 1, 2)
            .unwrap();
        assert_abs_diff_eq!(small.center_x, detected.center_x + 10.0);
        // Cumulative drift is now 25 px: detection runs again.
        let redetected = locator.locate(&projection, &ShiftVector::new(0.0, 15.0), &config, 1, 3)
            .unwrap();
        assert_eq!(redetected, detected);

        config.redetect = RedetectPolicy::Never;
        let tracked = locator.locate(&projection, &ShiftVector::new(0.0, 30.0), &config, 1, 4)
            .unwrap();
        assert_abs_diff_eq!(tracked.center_x, detected.center_x + 30.0);
    }
}  // mod tests.
