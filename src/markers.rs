//! Fiduciary marker search. Every chip carries etched markers at known
//! positions around each spot; finding them in each pass is what lets one pass
//! be registered against another.
//!
//! The search is a zero-normalized cross-correlation (ZNCC) of the image
//! against a marker template, followed by a peak picker that keeps the
//! strongest well-separated maxima. On large images the correlation first runs
//! on a 2x2-binned pyramid level and each surviving peak is then refined at
//! full resolution in a small neighborhood.

use std::time::Instant;

use image::{imageops, GrayImage, Luma};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::{FocusConfig, MarkerConfig};
use crate::error::{Result, VirionError};
use crate::image_funcs::{bin_2x2, tenengrad, Plane, Stack, MASK_ON};

/// Marker positions as (row, col), ordered by column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MarkerSet {
    locs: Vec<(i32, i32)>,
}

impl MarkerSet {
    pub fn new(mut locs: Vec<(i32, i32)>) -> MarkerSet {
        locs.sort_by_key(|&(_row, col)| col);
        MarkerSet{locs}
    }

    pub fn locs(&self) -> &[(i32, i32)] {
        &self.locs
    }

    pub fn len(&self) -> usize {
        self.locs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locs.is_empty()
    }
}

/// What to correlate against. A chip-specific template holding all the
/// markers around a spot is used on the first pass; afterwards the crops of
/// the markers actually found are searched for one at a time.
#[derive(Debug, Clone)]
pub enum MarkerTemplate {
    Single(Plane),
    Stack(Vec<Plane>),
}

impl MarkerTemplate {
    /// (width, height) of the template, or of the first crop of a stack.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match self {
            MarkerTemplate::Single(t) => Some(t.dimensions()),
            MarkerTemplate::Stack(crops) => crops.first().map(|c| c.dimensions()),
        }
    }
}

// Zero-mean copy of a template together with its L2 norm.
struct PreparedTemplate {
    width: usize,
    height: usize,
    values: Vec<f64>,
    norm: f64,
}

impl PreparedTemplate {
    fn new(template: &Plane) -> PreparedTemplate {
        let (width, height) = template.dimensions();
        let raw = template.as_raw();
        let mean = raw.iter().map(|&v| v as f64).sum::<f64>() / raw.len().max(1) as f64;
        let values: Vec<f64> = raw.iter().map(|&v| v as f64 - mean).collect();
        let norm = values.iter().map(|v| v * v).sum::<f64>().sqrt();
        PreparedTemplate{width: width as usize, height: height as usize, values, norm}
    }
}

// Summed-area tables of pixel values and squared pixel values, with a leading
// row and column of zeros.
struct IntegralImage {
    width: usize,
    height: usize,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
}

impl IntegralImage {
    fn new(plane: &Plane) -> IntegralImage {
        let (width, height) = plane.dimensions();
        let (width, height) = (width as usize, height as usize);
        let stride = width + 1;
        let mut sum = vec![0.0; stride * (height + 1)];
        let mut sum_sq = vec![0.0; stride * (height + 1)];
        let raw = plane.as_raw();
        for y in 0..height {
            let mut row_sum = 0.0;
            let mut row_sum_sq = 0.0;
            for x in 0..width {
                let v = raw[y * width + x] as f64;
                row_sum += v;
                row_sum_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sum_sq[(y + 1) * stride + x + 1] = sum_sq[y * stride + x + 1] + row_sum_sq;
            }
        }
        IntegralImage{width, height, sum, sum_sq}
    }

    // Sum and sum of squares over rows [top, top+h) and columns [left,
    // left+w), with pixels outside the image counting as zero.
    fn window_sums(&self, top: i64, left: i64, h: usize, w: usize) -> (f64, f64) {
        let y0 = top.clamp(0, self.height as i64) as usize;
        let y1 = (top + h as i64).clamp(0, self.height as i64) as usize;
        let x0 = left.clamp(0, self.width as i64) as usize;
        let x1 = (left + w as i64).clamp(0, self.width as i64) as usize;
        if y0 >= y1 || x0 >= x1 {
            return (0.0, 0.0);
        }
        let stride = self.width + 1;
        let rect = |table: &[f64]| {
            table[y1 * stride + x1] - table[y0 * stride + x1]
                - table[y1 * stride + x0] + table[y0 * stride + x0]
        };
        (rect(&self.sum), rect(&self.sum_sq))
    }
}

// ZNCC of the template centered on (row, col). The image is zero-padded.
fn zncc_at(plane: &Plane, integral: &IntegralImage, template: &PreparedTemplate,
           row: i64, col: i64) -> f32 {
    let top = row - (template.height / 2) as i64;
    let left = col - (template.width / 2) as i64;
    let (sum, sum_sq) = integral.window_sums(top, left, template.height, template.width);
    let n = (template.width * template.height) as f64;
    let variance_n = sum_sq - sum * sum / n;
    if variance_n <= 1e-12 || template.norm <= 1e-12 {
        return 0.0;
    }
    // The template is zero mean, so the window mean drops out of the cross
    // term and out-of-image (zero) pixels contribute nothing.
    let width = integral.width as i64;
    let height = integral.height as i64;
    let x_lo = (-left).max(0) as usize;
    let x_hi = (width - left).clamp(0, template.width as i64) as usize;
    if x_lo >= x_hi {
        return 0.0;
    }
    let raw = plane.as_raw();
    let mut cross = 0.0;
    for ty in 0..template.height {
        let y = top + ty as i64;
        if y < 0 || y >= height {
            continue;
        }
        let image_row = &raw[(y * width + left + x_lo as i64) as usize..];
        let template_row = &template.values[ty * template.width..];
        for tx in 0..(x_hi - x_lo) {
            cross += image_row[tx] as f64 * template_row[x_lo + tx];
        }
    }
    (cross / (variance_n.sqrt() * template.norm)) as f32
}

/// Correlation score of `template` centered on every pixel of `plane`. Scores
/// lie in [-1, 1]; flat windows score 0.
pub fn correlation_map(plane: &Plane, template: &Plane) -> Plane {
    let (width, height) = plane.dimensions();
    let integral = IntegralImage::new(plane);
    let prepared = PreparedTemplate::new(template);
    let rows: Vec<Vec<f32>> = (0..height as i64).into_par_iter().map(|row| {
        (0..width as i64).map(|col| zncc_at(plane, &integral, &prepared, row, col))
            .collect()
    }).collect();
    Plane::from_raw(width, height, rows.concat()).expect("buffer sized from plane dimensions")
}

/// Local maxima of `scores` above `threshold_rel` times the highest score,
/// strongest first. A peak is dropped when a stronger accepted peak lies
/// within `min_distance` pixels (Chebyshev distance). At most `num_peaks` are
/// returned, as (row, col, score).
pub fn find_peaks(scores: &Plane, threshold_rel: f32, min_distance: u32, num_peaks: usize)
                  -> Vec<(i32, i32, f32)> {
    let (width, height) = scores.dimensions();
    let max_score = scores.as_raw().iter().copied()
        .filter(|v| v.is_finite()).fold(f32::NEG_INFINITY, f32::max);
    if !(max_score > 0.0) {
        return Vec::new();
    }
    let threshold = threshold_rel * max_score;
    let value = |x: i64, y: i64| scores.get_pixel(x as u32, y as u32).0[0];

    let mut candidates = Vec::<(i32, i32, f32)>::new();
    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let v = value(x, y);
            if !(v > threshold) {
                continue;
            }
            let mut is_max = true;
            'neighbors: for ny in (y - 1).max(0)..=(y + 1).min(height as i64 - 1) {
                for nx in (x - 1).max(0)..=(x + 1).min(width as i64 - 1) {
                    if value(nx, ny) > v {
                        is_max = false;
                        break 'neighbors;
                    }
                }
            }
            if is_max {
                candidates.push((y as i32, x as i32, v));
            }
        }
    }
    candidates.sort_by(|a, b| b.2.total_cmp(&a.2).then((a.0, a.1).cmp(&(b.0, b.1))));

    let mut peaks = Vec::<(i32, i32, f32)>::new();
    for cand in candidates {
        if peaks.len() >= num_peaks {
            break;
        }
        let crowded = peaks.iter().any(|p| {
            i32::max((p.0 - cand.0).abs(), (p.1 - cand.1).abs()) <= min_distance as i32
        });
        if !crowded {
            peaks.push(cand);
        }
    }
    peaks
}

// Correlation search for one template, coarse-to-fine.
fn search_template(plane: &Plane, template: &Plane, threshold_rel: f32,
                   min_distance: u32, num_peaks: usize, binning_levels: u32)
                   -> Vec<(i32, i32, f32)> {
    let mut small_plane = plane.clone();
    let mut small_template = template.clone();
    let mut factor = 1_u32;
    for _ in 0..binning_levels {
        let (tw, th) = small_template.dimensions();
        if tw < 8 || th < 8 {
            break;
        }
        small_plane = bin_2x2(&small_plane);
        small_template = bin_2x2(&small_template);
        factor *= 2;
    }
    let scores = correlation_map(&small_plane, &small_template);
    let coarse = find_peaks(&scores, threshold_rel, min_distance / factor, num_peaks);
    if factor == 1 {
        return coarse;
    }

    let integral = IntegralImage::new(plane);
    let prepared = PreparedTemplate::new(template);
    let (small_tw, small_th) = small_template.dimensions();
    let (width, height) = plane.dimensions();
    let reach = factor as i64 + 1;
    coarse.into_iter().map(|(row, col, coarse_score)| {
        let est_row = (row as i64 - (small_th / 2) as i64) * factor as i64
            + (prepared.height / 2) as i64;
        let est_col = (col as i64 - (small_tw / 2) as i64) * factor as i64
            + (prepared.width / 2) as i64;
        let mut best = (est_row as i32, est_col as i32, f32::NEG_INFINITY);
        for r in (est_row - reach).max(0)..=(est_row + reach).min(height as i64 - 1) {
            for c in (est_col - reach).max(0)..=(est_col + reach).min(width as i64 - 1) {
                let score = zncc_at(plane, &integral, &prepared, r, c);
                if score > best.2 {
                    best = (r as i32, c as i32, score);
                }
            }
        }
        debug!("Refined coarse peak {:?} (score {}) to {:?}",
               (row, col), coarse_score, best);
        best
    }).collect()
}

fn locate_with_threshold(plane: &Plane, template: &MarkerTemplate,
                         config: &MarkerConfig, threshold_rel: f32) -> MarkerSet {
    let locs: Vec<(i32, i32)> = match template {
        MarkerTemplate::Single(t) => {
            search_template(plane, t, threshold_rel, config.min_distance,
                            config.max_markers, config.search_binning_levels)
                .into_iter().map(|(r, c, _)| (r, c)).collect()
        },
        MarkerTemplate::Stack(crops) => {
            let stack_threshold = threshold_rel - config.stack_threshold_drop;
            crops.iter().filter_map(|crop| {
                search_template(plane, crop, stack_threshold, config.min_distance,
                                1, config.search_binning_levels)
                    .first().map(|&(r, c, _)| (r, c))
            }).collect()
        },
    };
    MarkerSet::new(locs)
}

/// Finds the markers in `plane`. An empty result is not an error.
pub fn locate_markers(plane: &Plane, template: &MarkerTemplate, config: &MarkerConfig)
                      -> MarkerSet {
    let locate_start = Instant::now();
    let markers = locate_with_threshold(plane, template, config, config.threshold_rel);
    info!("Found {} markers in {:?}", markers.len(), locate_start.elapsed());
    markers
}

/// Like [locate_markers()], but when fewer than `config.min_markers` are found
/// the relative threshold is lowered by `config.relax_step` and the search
/// repeated, at most `config.max_relaxations` times. With zero relaxations
/// this is just [locate_markers()].
pub fn locate_markers_relaxing(plane: &Plane, template: &MarkerTemplate,
                               config: &MarkerConfig) -> Result<MarkerSet> {
    let mut markers = locate_markers(plane, template, config);
    if config.max_relaxations == 0 || markers.len() >= config.min_markers {
        return Ok(markers);
    }
    for attempt in 1..=config.max_relaxations {
        let threshold = config.threshold_rel - attempt as f32 * config.relax_step;
        if threshold <= 0.0 {
            break;
        }
        markers = locate_with_threshold(plane, template, config, threshold);
        debug!("Relaxation {} at threshold {} found {} markers",
               attempt, threshold, markers.len());
        if markers.len() >= config.min_markers {
            return Ok(markers);
        }
    }
    warn!("Only {} markers after relaxing the threshold", markers.len());
    Err(VirionError::MarkerSearchExhausted{iterations: config.max_relaxations})
}

fn footprint_rect(loc: (i32, i32), template_dims: (u32, u32)) -> Rect {
    let (tw, th) = template_dims;
    Rect::at(loc.1 - (tw / 2) as i32, loc.0 - (th / 2) as i32).of_size(tw, th)
}

/// Mask of (width, height) with the template-sized box around each marker set.
pub fn marker_footprint_mask(dims: (u32, u32), markers: &MarkerSet,
                             template_dims: (u32, u32)) -> GrayImage {
    let mut mask = GrayImage::new(dims.0, dims.1);
    for &loc in markers.locs() {
        draw_filled_rect_mut(&mut mask, footprint_rect(loc, template_dims), Luma([MASK_ON]));
    }
    mask
}

// Footprint rects lying wholly inside the image.
fn interior_footprints(dims: (u32, u32), markers: &MarkerSet, template_dims: (u32, u32))
                       -> Vec<Rect> {
    markers.locs().iter().map(|&loc| footprint_rect(loc, template_dims))
        .filter(|r| r.left() >= 0 && r.top() >= 0 &&
                r.right() < dims.0 as i32 && r.bottom() < dims.1 as i32)
        .collect()
}

/// Image crops under each marker, for use as the next pass's stacked
/// template. Markers too close to the border to crop are skipped.
pub fn extract_found_markers(plane: &Plane, markers: &MarkerSet,
                             template_dims: (u32, u32)) -> Vec<Plane> {
    interior_footprints(plane.dimensions(), markers, template_dims).iter().map(|r| {
        imageops::crop_imm(plane, r.left() as u32, r.top() as u32,
                           r.width(), r.height()).to_image()
    }).collect()
}

/// Image rotation in degrees implied by a pair of markers that sit on a
/// common row or column. None unless there are exactly two markers whose
/// smaller axis separation is under 15 pixels.
pub fn measure_rotation(markers: &MarkerSet) -> Option<f64> {
    if markers.len() != 2 {
        return None;
    }
    let (r1, c1) = markers.locs()[0];
    let (r2, c2) = markers.locs()[1];
    let row_diff = (r1 - r2).abs() as f64;
    let col_diff = (c1 - c2).abs() as f64;
    let (small, large) = if col_diff < row_diff {
        (col_diff, row_diff)
    } else if row_diff < col_diff {
        (row_diff, col_diff)
    } else {
        return None;
    };
    if small >= 15.0 {
        return None;
    }
    Some((small / large).atan().to_degrees())
}

/// Picks the plane to treat as in focus. For each marker crop, the Tenengrad
/// sharpness curve through the stack has a minimum where the marker edges wash
/// out; the sharpest plane before that minimum is that crop's candidate, and
/// the latest candidate wins. Falls back to `config.fallback_plane` (clamped
/// to the stack) when no crop yields a candidate.
pub fn select_focus_plane(stack: &Stack, markers: &MarkerSet, template_dims: (u32, u32),
                          config: &FocusConfig) -> usize {
    let fallback = config.fallback_plane.min(stack.len() - 1);
    if !config.use_markers {
        return fallback;
    }
    let mut candidates = Vec::<usize>::new();
    for r in interior_footprints(stack.dimensions(), markers, template_dims) {
        let sharpness: Vec<f64> = stack.planes().iter().map(|plane| {
            let crop = imageops::crop_imm(plane, r.left() as u32, r.top() as u32,
                                          r.width(), r.height()).to_image();
            tenengrad(&crop)
        }).collect();
        let min_plane = argmin(&sharpness);
        if min_plane > 0 {
            candidates.push(argmax(&sharpness[..min_plane]));
        }
    }
    match candidates.iter().max() {
        Some(&plane) => {
            debug!("Focus plane candidates {:?}", candidates);
            plane
        },
        None => fallback,
    }
}

// First index of the smallest value.
fn argmin(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v < values[best] {
            best = i;
        }
    }
    best
}

// First index of the largest value.
fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

// mod tests.
