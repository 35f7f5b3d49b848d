// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::rect::Rect;

use crate::error::{Result, VirionError};
use crate::histogram_funcs::median_of;

/// One focal plane (or time point) of normalized intensities.
pub type Plane = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Binary masks are GrayImages holding 0 or 255, which is what the imageproc
/// morphology and labelling functions expect.
pub const MASK_ON: u8 = 255;

/// The planes of one pass of one spot, all of the same size.
#[derive(Debug, Clone)]
pub struct Stack {
    planes: Vec<Plane>,
}

// Never empty, so no is_empty().
#[allow(clippy::len_without_is_empty)]
impl Stack {
    pub fn new(planes: Vec<Plane>) -> Result<Stack> {
        if planes.is_empty() {
            return Err(VirionError::InvalidInput("empty image stack".to_string()));
        }
        let dims = planes[0].dimensions();
        if let Some(bad) = planes.iter().position(|p| p.dimensions() != dims) {
            return Err(VirionError::InvalidInput(format!(
                "plane {} is {:?}, expected {:?}", bad, planes[bad].dimensions(), dims)));
        }
        Ok(Stack{planes})
    }

    /// (width, height) of every plane.
    pub fn dimensions(&self) -> (u32, u32) {
        self.planes[0].dimensions()
    }

    pub fn len(&self) -> usize {
        self.planes.len()
    }

    pub fn plane(&self, index: usize) -> &Plane {
        &self.planes[index]
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }
}

/// Divides every plane by twice the median of the whole stack and clips the
/// result to 1, so that typical background sits near 0.5.
pub fn normalize_by_median(planes: Vec<Plane>) -> Result<Stack> {
    let mut all: Vec<f32> = Vec::new();
    for plane in &planes {
        all.extend_from_slice(plane.as_raw());
    }
    let median = median_of(&mut all);
    if !(median > 0.0) {
        return Err(VirionError::InvalidInput(format!(
            "stack median {} cannot be normalized", median)));
    }
    let scale = 1.0 / (2.0 * median);
    let normalized = planes.into_iter().map(|mut plane| {
        for value in plane.iter_mut() {
            *value = f32::min(*value * scale, 1.0);
        }
        plane
    }).collect();
    Stack::new(normalized)
}

/// 2x2 box filter. An odd trailing row or column is dropped.
pub fn bin_2x2(plane: &Plane) -> Plane {
    let (width, height) = plane.dimensions();
    let new_width = width / 2;
    let new_height = height / 2;
    let mut binned = Vec::with_capacity((new_width * new_height) as usize);
    let source_pixels = plane.as_raw();

    for y in (0..height & !1).step_by(2) {  // Ensure even height bound
        for x in (0..width & !1).step_by(2) {   // Ensure even width bound
            // Get 2x2 block.
            let p1 = source_pixels[(y * width + x) as usize];
            let p2 = source_pixels[(y * width + x + 1) as usize];
            let p3 = source_pixels[((y + 1) * width + x) as usize];
            let p4 = source_pixels[((y + 1) * width + x + 1) as usize];
            binned.push((p1 + p2 + p3 + p4) / 4.0);
        }
    }
    Plane::from_raw(new_width, new_height, binned).expect("buffer sized from binned dimensions")
}

/// Per-pixel max minus min through the stack. Particles blink in and out of
/// focus, so this lights them up while flat background stays dark.
pub fn maxmin_projection(stack: &Stack) -> Plane {
    let (width, height) = stack.dimensions();
    let mut max_vals = stack.plane(0).as_raw().clone();
    let mut min_vals = max_vals.clone();
    for plane in &stack.planes()[1..] {
        for (i, &v) in plane.as_raw().iter().enumerate() {
            max_vals[i] = f32::max(max_vals[i], v);
            min_vals[i] = f32::min(min_vals[i], v);
        }
    }
    let diff: Vec<f32> = max_vals.iter().zip(min_vals.iter()).map(|(a, b)| a - b).collect();
    Plane::from_raw(width, height, diff).expect("buffer sized from plane dimensions")
}

/// Separable Gaussian blur with reflected borders; the kernel is truncated
/// at four sigma. NaN inputs spread to every output they touch.
pub fn gaussian_filter(plane: &Plane, sigma: f32) -> Plane {
    if sigma <= 0.0 {
        return plane.clone();
    }
    let radius = (4.0 * sigma + 0.5) as i64;
    let mut kernel: Vec<f32> = (-radius..=radius)
        .map(|i| (-0.5 * (i * i) as f32 / (sigma * sigma)).exp())
        .collect();
    let total: f32 = kernel.iter().sum();
    for k in kernel.iter_mut() {
        *k /= total;
    }
    let (width, height) = plane.dimensions();
    let src = plane.as_raw();
    let mut tmp = vec![0.0_f32; src.len()];
    // Rows.
    for y in 0..height as i64 {
        let row = (y * width as i64) as usize;
        for x in 0..width as i64 {
            let mut acc = 0.0;
            for (ki, k) in kernel.iter().enumerate() {
                let sx = reflect(x + ki as i64 - radius, width as i64);
                acc += k * src[row + sx as usize];
            }
            tmp[row + x as usize] = acc;
        }
    }
    // Columns.
    let mut out = vec![0.0_f32; src.len()];
    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let mut acc = 0.0;
            for (ki, k) in kernel.iter().enumerate() {
                let sy = reflect(y + ki as i64 - radius, height as i64);
                acc += k * tmp[(sy * width as i64 + x) as usize];
            }
            out[(y * width as i64 + x) as usize] = acc;
        }
    }
    Plane::from_raw(width, height, out).expect("buffer sized from plane dimensions")
}

// Mirror an out of range index back into 0..len, repeating the edge sample
// (d c b a | a b c d | d c b a).
fn reflect(i: i64, len: i64) -> i64 {
    if len == 1 {
        return 0;
    }
    let period = 2 * len;
    let mut m = i.rem_euclid(period);
    if m >= len {
        m = period - 1 - m;
    }
    m
}

/// Tenengrad focus measure: mean squared Sobel gradient magnitude. Border
/// pixels contribute zero.
pub fn tenengrad(plane: &Plane) -> f64 {
    let (width, height) = plane.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }
    let p = |x: u32, y: u32| plane.get_pixel(x, y).0[0] as f64;
    let mut sum = 0.0;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let gx = (p(x + 1, y - 1) + 2.0 * p(x + 1, y) + p(x + 1, y + 1)
                      - p(x - 1, y - 1) - 2.0 * p(x - 1, y) - p(x - 1, y + 1)) / 4.0;
            let gy = (p(x - 1, y + 1) + 2.0 * p(x, y + 1) + p(x + 1, y + 1)
                      - p(x - 1, y - 1) - 2.0 * p(x, y - 1) - p(x + 1, y - 1)) / 4.0;
            sum += gx * gx + gy * gy;
        }
    }
    sum / (width * height) as f64
}

/// Scales [0, 1] intensities to u8 for the imageproc functions that only take
/// GrayImage. Values outside [0, 1] (and NaN) are clamped.
pub fn to_gray_u8(plane: &Plane) -> GrayImage {
    let (width, height) = plane.dimensions();
    let pixels = plane.as_raw().iter().map(|&v| {
        if v.is_nan() { 0 } else { (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8 }
    }).collect();
    GrayImage::from_raw(width, height, pixels).expect("buffer sized from plane dimensions")
}

/// Mask with the given (row, col) pixels set.
pub fn mask_from_coords(width: u32, height: u32, coords: &[(u32, u32)]) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    for &(row, col) in coords {
        mask.put_pixel(col, row, Luma([MASK_ON]));
    }
    mask
}

pub fn mask_is_set(mask: &GrayImage, x: u32, y: u32) -> bool {
    mask.get_pixel(x, y).0[0] != 0
}

/// Pixelwise OR of two masks of equal size.
pub fn mask_union(a: &GrayImage, b: &GrayImage) -> GrayImage {
    assert_eq!(a.dimensions(), b.dimensions());
    let (width, height) = a.dimensions();
    let pixels = a.as_raw().iter().zip(b.as_raw().iter())
        .map(|(&p, &q)| if p != 0 || q != 0 { MASK_ON } else { 0 })
        .collect();
    GrayImage::from_raw(width, height, pixels).expect("buffer sized from mask dimensions")
}

pub fn mask_count(mask: &GrayImage) -> usize {
    mask.as_raw().iter().filter(|&&p| p != 0).count()
}

// An iterator over the pixels of a region of interest of a Plane. Yields
// pixels in raster scan order.
pub struct EnumeratePixels<'a> {
    plane: &'a Plane,
    roi: &'a Rect,
    include_interior: bool,

    // Identifies the next pixel to be yielded. If cur_y is beyond the ROI's
    // bottom, the iteration is finished.
    cur_x: i32,
    cur_y: i32,
}

impl<'a> EnumeratePixels<'a> {
    // If include_interior is false, only the perimeter is enumerated.
    pub fn new(plane: &'a Plane, roi: &'a Rect, include_interior: bool)
               -> EnumeratePixels<'a> {
        let (width, height) = plane.dimensions();
        assert!(roi.left() >= 0);
        assert!(roi.top() >= 0);
        assert!(roi.right() < width as i32);
        assert!(roi.bottom() < height as i32);
        EnumeratePixels{plane, roi, include_interior,
                        cur_x: roi.left(), cur_y: roi.top()}
    }
}

impl<'a> Iterator for EnumeratePixels<'a> {
    type Item = (i32, i32, f32);  // x, y, pixel value.

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur_y > self.roi.bottom() {
            return None;
        }
        let item: Self::Item = (self.cur_x, self.cur_y,
                                self.plane.get_pixel(
                                    self.cur_x as u32, self.cur_y as u32).0[0]);
        if self.cur_x == self.roi.right() {
            self.cur_x = self.roi.left();
            self.cur_y += 1;
        } else {
            let do_all_in_row = self.include_interior ||
                self.cur_y == self.roi.top() || self.cur_y == self.roi.bottom();
            if do_all_in_row {
                self.cur_x += 1;
            } else {
                // Exclude interior.
                assert!(self.cur_x == self.roi.left());
                self.cur_x = self.roi.right();
            }
        }
        Some(item)
    }
}
