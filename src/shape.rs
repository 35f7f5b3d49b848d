//! Morphological classification of particle candidates.
//!
//! Each pixel's shape index describes the local intensity surface: about 0.5
//! along a bright ridge (a filament) and about 1 on a bright cap (a round
//! particle). Pixels whose shape index falls in a class band and whose
//! projection intensity clears that class's threshold become candidates;
//! connected groups of candidates become blobs.

use std::f64::consts::{FRAC_2_PI, SQRT_2};
use std::time::Instant;

use image::{GrayImage, Luma};
use imageproc::rect::Rect;
use imageproc::region_labelling::{connected_components, Connectivity};
use log::{debug, info};

use crate::config::{ClassifierConfig, ShapeClass};
use crate::image_funcs::{gaussian_filter, mask_from_coords, mask_is_set, Plane, MASK_ON};

/// Pixel coordinate as (row, col).
pub type Coord = (u32, u32);

#[derive(Clone, Copy)]
enum Axis {
    Row,
    Col,
}

// Central differences in the interior, one-sided at the edges.
fn gradient(plane: &Plane, axis: Axis) -> Plane {
    let (width, height) = plane.dimensions();
    let v = |x: u32, y: u32| plane.get_pixel(x, y).0[0];
    Plane::from_fn(width, height, |x, y| {
        let (pos, len) = match axis {
            Axis::Row => (y, height),
            Axis::Col => (x, width),
        };
        if len < 2 {
            return Luma([0.0]);
        }
        let at = |p: u32| match axis {
            Axis::Row => v(x, p),
            Axis::Col => v(p, y),
        };
        let d = if pos == 0 {
            at(1) - at(0)
        } else if pos == len - 1 {
            at(len - 1) - at(len - 2)
        } else {
            (at(pos + 1) - at(pos - 1)) / 2.0
        };
        Luma([d])
    })
}

/// Shape index of `plane` after Gaussian smoothing with `sigma`: with l1 >= l2
/// the Hessian eigenvalues, s = (2/π)·atan((l2 + l1) / (l2 - l1)). Values are
/// in [-1, 1]; NaN where the surface is flat.
pub fn shape_index(plane: &Plane, sigma: f32) -> Plane {
    let smoothed = gaussian_filter(plane, sigma);
    let d_row = gradient(&smoothed, Axis::Row);
    let d_col = gradient(&smoothed, Axis::Col);
    let h_rr = gradient(&d_row, Axis::Row);
    let h_rc = gradient(&d_row, Axis::Col);
    let h_cc = gradient(&d_col, Axis::Col);
    let (width, height) = plane.dimensions();
    Plane::from_fn(width, height, |x, y| {
        let a = h_rr.get_pixel(x, y).0[0] as f64;
        let b = h_rc.get_pixel(x, y).0[0] as f64;
        let c = h_cc.get_pixel(x, y).0[0] as f64;
        // l2 + l1 = a + c; l2 - l1 = -2 * half_gap.
        let trace = a + c;
        let half_gap = (((a - c) / 2.0).powi(2) + b * b).sqrt();
        let s = if half_gap == 0.0 {
            if trace == 0.0 { f64::NAN } else { -trace.signum() }
        } else {
            FRAC_2_PI * (trace / (-2.0 * half_gap)).atan()
        };
        Luma([s as f32])
    })
}

/// Pixels with |shape_index - target| <= delta whose projection intensity is
/// at least `threshold`. NaN shape index values never qualify.
pub fn classify(shape_index: &Plane, projection: &Plane, target: f32, delta: f32,
                threshold: f32) -> Vec<Coord> {
    let mut coords = Vec::new();
    for (x, y, s) in shape_index.enumerate_pixels() {
        let s = s.0[0];
        if s.is_nan() || (s - target).abs() > delta {
            continue;
        }
        if projection.get_pixel(x, y).0[0] >= threshold {
            coords.push((y, x));
        }
    }
    coords
}

fn classify_as(shape_index: &Plane, projection: &Plane, class: &ShapeClass,
               background: f32) -> Vec<Coord> {
    classify(shape_index, projection, class.target, class.delta,
             class.intensity_factor * background)
}

/// Candidate pixels by class. The three lists are disjoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateSet {
    pub ridge: Vec<Coord>,
    pub sphere: Vec<Coord>,
    pub smoothed_ridge: Vec<Coord>,
}

impl CandidateSet {
    pub fn len(&self) -> usize {
        self.ridge.len() + self.sphere.len() + self.smoothed_ridge.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> impl Iterator<Item = &Coord> {
        self.ridge.iter().chain(self.sphere.iter()).chain(self.smoothed_ridge.iter())
    }
}

/// Ridge, sphere and smoothed-ridge candidates. Thresholds scale with
/// `background`, the median projection intensity of the spot. Smoothed-ridge
/// pixels already classified as ridge or sphere are dropped.
pub fn classify_candidates(shape_index: &Plane, projection: &Plane, background: f32,
                           config: &ClassifierConfig) -> CandidateSet {
    let ridge = classify_as(shape_index, projection, &config.ridge, background);
    let sphere = classify_as(shape_index, projection, &config.sphere, background);
    let smoothed = gaussian_filter(shape_index, config.smoothing_sigma);
    let (width, height) = shape_index.dimensions();
    let mut taken = mask_from_coords(width, height, &ridge);
    for &(row, col) in &sphere {
        taken.put_pixel(col, row, Luma([MASK_ON]));
    }
    let smoothed_ridge = classify_as(&smoothed, projection, &config.smoothed_ridge, background)
        .into_iter().filter(|&(row, col)| !mask_is_set(&taken, col, row)).collect();
    let candidates = CandidateSet{ridge, sphere, smoothed_ridge};
    debug!("Candidates: {} ridge, {} sphere, {} smoothed ridge",
           candidates.ridge.len(), candidates.sphere.len(), candidates.smoothed_ridge.len());
    candidates
}

/// Sets every unset pixel that cannot reach the image border through unset
/// pixels (4-connected).
pub fn fill_holes(mask: &GrayImage) -> GrayImage {
    let (width, height) = mask.dimensions();
    let inverted = GrayImage::from_fn(width, height, |x, y| {
        if mask_is_set(mask, x, y) { Luma([0]) } else { Luma([MASK_ON]) }
    });
    let labels = connected_components(&inverted, Connectivity::Four, Luma([0_u8]));
    let max_label = labels.pixels().map(|p| p.0[0]).max().unwrap_or(0);
    let mut touches_border = vec![false; max_label as usize + 1];
    for (x, y, label) in labels.enumerate_pixels() {
        if x == 0 || y == 0 || x == width - 1 || y == height - 1 {
            touches_border[label.0[0] as usize] = true;
        }
    }
    GrayImage::from_fn(width, height, |x, y| {
        let label = labels.get_pixel(x, y).0[0];
        if label != 0 && touches_border[label as usize] { Luma([0]) } else { Luma([MASK_ON]) }
    })
}

/// A connected group of candidate pixels with its region properties.
#[derive(Debug, Clone)]
pub struct Blob {
    pub label: u32,
    pub pixels: Vec<Coord>,
    /// (row, col).
    pub centroid: (f64, f64),
    pub bbox: Rect,
    pub area: usize,
    pub perimeter: f64,
    pub major_axis: f64,
    pub minor_axis: f64,
    /// Ridge pixels plus the weighted smoothed-ridge pixels.
    pub ridge_points: f64,
    pub sphere_points: usize,
    /// (ridge_points - sphere_points) / area.
    pub filo_score: f64,
}

impl Blob {
    /// perimeter² / (4π·area); 1 for a disk, larger for ragged shapes.
    pub fn perim_area_ratio(&self) -> f64 {
        self.perimeter * self.perimeter / (4.0 * std::f64::consts::PI * self.area as f64)
    }

    /// Major over minor axis; infinite for a one pixel wide line.
    pub fn elongation(&self) -> f64 {
        self.major_axis / self.minor_axis
    }

    pub fn is_filament(&self, config: &ClassifierConfig) -> bool {
        is_filament(self.filo_score, self.area, config)
    }

    /// Length in microns of a filament, approximated by its major axis.
    pub fn filament_length_um(&self, pixels_per_um: f64, config: &ClassifierConfig)
                              -> Option<f64> {
        if self.is_filament(config) {
            Some(self.major_axis / pixels_per_um)
        } else {
            None
        }
    }
}

pub fn is_filament(filo_score: f64, area: usize, config: &ClassifierConfig) -> bool {
    filo_score >= config.filament_score && area > config.filament_min_area
}

// Perimeter of a pixel set, weighting each border pixel by the configuration
// of its border neighbors (straight runs count 1, diagonal steps √2).
fn region_perimeter(pixels: &[Coord], bbox: &Rect) -> f64 {
    // Local grid with a one pixel empty margin.
    let w = bbox.width() as usize + 2;
    let h = bbox.height() as usize + 2;
    let mut inside = vec![false; w * h];
    for &(row, col) in pixels {
        let lx = (col as i32 - bbox.left()) as usize + 1;
        let ly = (row as i32 - bbox.top()) as usize + 1;
        inside[ly * w + lx] = true;
    }
    let mut border = vec![false; w * h];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let i = y * w + x;
            border[i] = inside[i] &&
                !(inside[i - 1] && inside[i + 1] && inside[i - w] && inside[i + w]);
        }
    }
    let mut perimeter = 0.0;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let i = y * w + x;
            if !border[i] {
                continue;
            }
            let edge_neighbors = [i - 1, i + 1, i - w, i + w].iter()
                .filter(|&&n| border[n]).count();
            let corner_neighbors = [i - w - 1, i - w + 1, i + w - 1, i + w + 1].iter()
                .filter(|&&n| border[n]).count();
            perimeter += match 1 + 2 * edge_neighbors + 10 * corner_neighbors {
                5 | 7 | 15 | 17 | 25 | 27 => 1.0,
                21 | 33 => SQRT_2,
                13 | 23 => (1.0 + SQRT_2) / 2.0,
                _ => 0.0,
            };
        }
    }
    perimeter
}

// (major, minor) axis lengths of the ellipse with the same second moments.
fn axis_lengths(pixels: &[Coord], centroid: (f64, f64)) -> (f64, f64) {
    let n = pixels.len() as f64;
    let (mut rr, mut cc, mut rc) = (0.0, 0.0, 0.0);
    for &(row, col) in pixels {
        let dr = row as f64 - centroid.0;
        let dc = col as f64 - centroid.1;
        rr += dr * dr;
        cc += dc * dc;
        rc += dr * dc;
    }
    let (rr, cc, rc) = (rr / n, cc / n, rc / n);
    let mean = (rr + cc) / 2.0;
    let half_gap = (((rr - cc) / 2.0).powi(2) + rc * rc).sqrt();
    let l1 = (mean + half_gap).max(0.0);
    let l2 = (mean - half_gap).max(0.0);
    (4.0 * l1.sqrt(), 4.0 * l2.sqrt())
}

fn region_blob(label: u32, pixels: Vec<Coord>) -> Blob {
    let area = pixels.len();
    let (mut min_row, mut min_col) = (u32::MAX, u32::MAX);
    let (mut max_row, mut max_col) = (0, 0);
    let (mut sum_row, mut sum_col) = (0.0, 0.0);
    for &(row, col) in &pixels {
        min_row = min_row.min(row);
        min_col = min_col.min(col);
        max_row = max_row.max(row);
        max_col = max_col.max(col);
        sum_row += row as f64;
        sum_col += col as f64;
    }
    let centroid = (sum_row / area as f64, sum_col / area as f64);
    let bbox = Rect::at(min_col as i32, min_row as i32)
        .of_size(max_col - min_col + 1, max_row - min_row + 1);
    let perimeter = region_perimeter(&pixels, &bbox);
    let (major_axis, minor_axis) = axis_lengths(&pixels, centroid);
    Blob{label, pixels, centroid, bbox, area, perimeter, major_axis, minor_axis,
         ridge_points: 0.0, sphere_points: 0, filo_score: 0.0}
}

/// Groups candidates into blobs: the union of all classes is hole-filled and
/// labelled 8-connected. Blobs with min_area < area <= max_area and at least
/// one ridge-or-sphere point are returned, ordered by label.
pub fn extract_blobs(candidates: &CandidateSet, dims: (u32, u32), config: &ClassifierConfig)
                     -> Vec<Blob> {
    let extract_start = Instant::now();
    let (width, height) = dims;
    let all: Vec<Coord> = candidates.all().copied().collect();
    let binary = fill_holes(&mask_from_coords(width, height, &all));
    let labels = connected_components(&binary, Connectivity::Eight, Luma([0_u8]));

    let max_label = labels.pixels().map(|p| p.0[0]).max().unwrap_or(0);
    let mut members: Vec<Vec<Coord>> = vec![Vec::new(); max_label as usize + 1];
    for (x, y, label) in labels.enumerate_pixels() {
        if label.0[0] != 0 {
            members[label.0[0] as usize].push((y, x));
        }
    }

    let ridge = mask_from_coords(width, height, &candidates.ridge);
    let sphere = mask_from_coords(width, height, &candidates.sphere);
    let smoothed = mask_from_coords(width, height, &candidates.smoothed_ridge);

    let mut blobs = Vec::<Blob>::new();
    for (label, pixels) in members.into_iter().enumerate().skip(1) {
        let area = pixels.len();
        if area <= config.min_area || area > config.max_area {
            continue;
        }
        let count = |mask: &GrayImage| {
            pixels.iter().filter(|&&(row, col)| mask_is_set(mask, col, row)).count()
        };
        let ridge_points = count(&ridge) as f64
            + config.smoothed_ridge_weight * count(&smoothed) as f64;
        let sphere_points = count(&sphere);
        if ridge_points + (sphere_points as f64) < 1.0 {
            debug!("Dropping blob {} with no shape points", label);
            continue;
        }
        let mut blob = region_blob(label as u32, pixels);
        blob.ridge_points = ridge_points;
        blob.sphere_points = sphere_points;
        blob.filo_score = (ridge_points - sphere_points as f64) / area as f64;
        blobs.push(blob);
    }
    info!("Extracted {} blobs from {} candidate pixels in {:?}",
          blobs.len(), all.len(), extract_start.elapsed());
    blobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use imageproc::gray_image;

    fn bump(width: u32, height: u32, cx: f32, cy: f32, sx: f32, sy: f32) -> Plane {
        Plane::from_fn(width, height, |x, y| {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            let mut v = 0.0;
            if sx > 0.0 {
                v += dx * dx / (2.0 * sx * sx);
            }
            if sy > 0.0 {
                v += dy * dy / (2.0 * sy * sy);
            }
            Luma([(-v).exp()])
        })
    }

    #[test]
    fn test_shape_index_cap_ridge_flat() {
        let cap = shape_index(&bump(21, 21, 10.0, 10.0, 2.0, 2.0), 1.0);
        assert_abs_diff_eq!(cap.get_pixel(10, 10).0[0], 1.0, epsilon = 1e-4);

        // Bright horizontal line: varies across rows only.
        let ridge = shape_index(&bump(21, 21, 10.0, 10.0, 0.0, 2.0), 1.0);
        assert_abs_diff_eq!(ridge.get_pixel(10, 10).0[0], 0.5, epsilon = 1e-3);

        let flat = shape_index(&Plane::from_pixel(9, 9, Luma([0.4])), 1.0);
        assert!(flat.get_pixel(4, 4).0[0].is_nan());
    }

    #[test]
    fn test_classify_inclusive_band() {
        let si = Plane::from_raw(5, 1, vec![0.25, 0.75, 0.2499, f32::NAN, 0.5]).unwrap();
        let projection = Plane::from_raw(5, 1, vec![1.0, 1.0, 1.0, 1.0, 0.99]).unwrap();
        let coords = classify(&si, &projection, 0.5, 0.25, 1.0);
        assert_eq!(coords, vec![(0, 0), (0, 1)]);
    }

    #[test]
    fn test_classify_candidates_disjoint() {
        let si = Plane::from_pixel(5, 5, Luma([0.5]));
        let mut projection = Plane::from_pixel(5, 5, Luma([0.1]));
        projection.put_pixel(1, 1, Luma([1.0]));
        projection.put_pixel(3, 3, Luma([0.7]));
        let config = ClassifierConfig::default();
        let candidates = classify_candidates(&si, &projection, 0.2, &config);
        assert_eq!(candidates.ridge, vec![(1, 1)]);
        assert!(candidates.sphere.is_empty());
        assert_eq!(candidates.smoothed_ridge, vec![(3, 3)]);
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn test_fill_holes() {
        let ring = gray_image!(
            0,   0,   0,   0, 0;
            0, 255, 255, 255, 0;
            0, 255,   0, 255, 0;
            0, 255, 255, 255, 0;
            0,   0,   0,   0, 0);
        let filled = fill_holes(&ring);
        assert_eq!(filled.get_pixel(2, 2).0[0], MASK_ON);
        assert_eq!(filled.get_pixel(0, 0).0[0], 0);

        // Open to the border: nothing to fill.
        let cup = gray_image!(
            255,   0, 255;
            255,   0, 255;
            255, 255, 255);
        assert_eq!(fill_holes(&cup), cup);
    }

    #[test]
    fn test_region_properties() {
        let square: Vec<Coord> = (0..3).flat_map(|r| (0..3).map(move |c| (r + 5, c + 7)))
            .collect();
        let blob = region_blob(1, square);
        assert_eq!(blob.area, 9);
        assert_eq!(blob.centroid, (6.0, 8.0));
        assert_eq!(blob.bbox, Rect::at(7, 5).of_size(3, 3));
        assert_abs_diff_eq!(blob.perimeter, 8.0);
        assert_abs_diff_eq!(blob.perim_area_ratio(), 16.0 / (9.0 * std::f64::consts::PI),
                            epsilon = 1e-12);

        let line: Vec<Coord> = (0..5).map(|c| (2, c)).collect();
        let blob = region_blob(2, line);
        assert_abs_diff_eq!(blob.major_axis, 4.0 * 2.0_f64.sqrt(), epsilon = 1e-9);
        assert_eq!(blob.minor_axis, 0.0);
        assert!(blob.elongation().is_infinite());
        // The two end pixels have a single border neighbor and add nothing.
        assert_abs_diff_eq!(blob.perimeter, 3.0);

        let single = region_blob(3, vec![(4, 4)]);
        assert_eq!(single.perimeter, 0.0);
    }

    #[test]
    fn test_extract_blobs_area_filter() {
        let mut ridge = Vec::<Coord>::new();
        ridge.extend((0..3).map(|c| (2, c)));             // area 3
        ridge.extend((10..14).map(|c| (2, c)));           // area 4
        for r in 10..20 {
            ridge.extend((0..30).map(|c| (r, c)));        // area 300
            ridge.extend((50..80).map(|c| (r, c)));       // area 301 with the extra pixel
        }
        ridge.push((20, 50));
        let candidates = CandidateSet{ridge, ..CandidateSet::default()};
        let blobs = extract_blobs(&candidates, (100, 100), &ClassifierConfig::default());
        let mut areas: Vec<usize> = blobs.iter().map(|b| b.area).collect();
        areas.sort();
        assert_eq!(areas, vec![4, 300]);
    }

    #[test]
    fn test_extract_blobs_points_and_score() {
        let candidates = CandidateSet{
            ridge: vec![(5, 5), (5, 6)],
            sphere: vec![(5, 7)],
            smoothed_ridge: vec![(5, 8), (5, 9), (5, 10), (5, 11), (5, 12)],
        };
        let config = ClassifierConfig::default();
        let blobs = extract_blobs(&candidates, (20, 20), &config);
        assert_eq!(blobs.len(), 1);
        let blob = &blobs[0];
        assert_eq!(blob.area, 8);
        assert_abs_diff_eq!(blob.ridge_points, 2.75, epsilon = 1e-12);
        assert_eq!(blob.sphere_points, 1);
        assert_abs_diff_eq!(blob.filo_score, 1.75 / 8.0, epsilon = 1e-12);

        // Only weighted smoothed-ridge points: under one point, dropped.
        let faint = CandidateSet{
            smoothed_ridge: vec![(2, 2), (2, 3), (2, 4), (2, 5)],
            ..CandidateSet::default()
        };
        assert!(extract_blobs(&faint, (20, 20), &config).is_empty());
    }

    #[test]
    fn test_is_filament_boundary() {
        let config = ClassifierConfig::default();
        assert!(!is_filament(0.25, 10, &config));
        assert!(is_filament(0.25, 11, &config));
        assert!(!is_filament(0.2499, 11, &config));
    }

    #[test]
    fn test_filament_length() {
        let config = ClassifierConfig::default();
        let line: Vec<Coord> = (0..12).map(|c| (3, c)).collect();
        let mut blob = region_blob(1, line);
        blob.filo_score = 1.0;
        // Variance of 0..12 is (12² - 1) / 12.
        let major = 4.0 * (143.0_f64 / 12.0).sqrt();
        assert_abs_diff_eq!(blob.major_axis, major, epsilon = 1e-9);
        assert_abs_diff_eq!(blob.filament_length_um(6.4, &config).unwrap(), major / 6.4,
                            epsilon = 1e-9);
        blob.filo_score = 0.1;
        assert_eq!(blob.filament_length_um(6.4, &config), None);
    }
}  // mod tests.
