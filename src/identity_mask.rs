//! The "already counted" mask of a spot. Particles stay put between passes,
//! so anything counted once must be masked off in every later pass, after
//! following the stage drift.

use image::GrayImage;
use imageproc::distance_transform::Norm;
use imageproc::morphology::dilate;
use log::debug;

use crate::config::MaskConfig;
use crate::image_funcs::{mask_count, mask_union};
use crate::registration::ShiftVector;

/// Translates `mask` by (ceil(shift.rows), ceil(shift.cols)). Pixels moved in
/// from outside the image are unset.
pub fn shift_mask(mask: &GrayImage, shift: &ShiftVector) -> GrayImage {
    let d_row = shift.rows.ceil() as i64;
    let d_col = shift.cols.ceil() as i64;
    if d_row == 0 && d_col == 0 {
        return mask.clone();
    }
    let (width, height) = mask.dimensions();
    let mut shifted = GrayImage::new(width, height);
    for y in 0..height as i64 {
        let src_y = y - d_row;
        if src_y < 0 || src_y >= height as i64 {
            continue;
        }
        for x in 0..width as i64 {
            let src_x = x - d_col;
            if src_x < 0 || src_x >= width as i64 {
                continue;
            }
            let p = *mask.get_pixel(src_x as u32, src_y as u32);
            shifted.put_pixel(x as u32, y as u32, p);
        }
    }
    shifted
}

/// 4-connected binary dilation repeated `iterations` times.
pub fn dilate_mask(mask: &GrayImage, iterations: u8) -> GrayImage {
    if iterations == 0 {
        return mask.clone();
    }
    dilate(mask, Norm::L1, iterations)
}

/// `mask` OR the dilation of `new_blobs`.
pub fn accumulate(mask: &GrayImage, new_blobs: &GrayImage, iterations: u8) -> GrayImage {
    mask_union(mask, &dilate_mask(new_blobs, iterations))
}

#[derive(Debug, Clone, Default)]
pub enum IdentityMaskTracker {
    #[default]
    Uninitialized,
    Tracking(GrayImage),
}

impl IdentityMaskTracker {
    pub fn new() -> IdentityMaskTracker {
        IdentityMaskTracker::Uninitialized
    }

    /// The cumulative mask, in the frame of the latest aligned pass.
    pub fn mask(&self) -> Option<&GrayImage> {
        match self {
            IdentityMaskTracker::Uninitialized => None,
            IdentityMaskTracker::Tracking(mask) => Some(mask),
        }
    }

    /// Moves the mask into the frame of a new pass.
    pub fn align(&mut self, shift: &ShiftVector) {
        if let IdentityMaskTracker::Tracking(mask) = self {
            *mask = shift_mask(mask, shift);
        }
    }

    /// Adds a pass's counted particles. The first call seeds the mask with a
    /// wider dilation.
    pub fn grow(&mut self, detections: &GrayImage, config: &MaskConfig) {
        let grown = match self {
            IdentityMaskTracker::Uninitialized =>
                dilate_mask(detections, config.seed_dilation),
            IdentityMaskTracker::Tracking(mask) =>
                accumulate(mask, detections, config.tracking_dilation),
        };
        debug!("Identity mask now covers {} pixels", mask_count(&grown));
        *self = IdentityMaskTracker::Tracking(grown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use imageproc::gray_image;
    use crate::image_funcs::{mask_from_coords, mask_is_set, MASK_ON};

    #[test]
    fn test_shift_mask() {
        let mask = gray_image!(
            0, 255, 0;
            0,   0, 0;
            0,   0, 255);
        // ceil(0.2) = 1 row down, ceil(-0.7) = 0 columns.
        let shifted = shift_mask(&mask, &ShiftVector::new(0.2, -0.7));
        assert_eq!(shifted, gray_image!(
            0,   0, 0;
            0, 255, 0;
            0,   0, 0));
        let left = shift_mask(&mask, &ShiftVector::new(0.0, -1.0));
        assert_eq!(left, gray_image!(
            255, 0, 0;
              0, 0, 0;
              0, 255, 0));
    }

    #[test]
    fn test_shift_then_unshift() {
        let coords: Vec<(u32, u32)> = vec![(3, 3), (4, 7), (8, 2), (0, 9), (9, 0)];
        let mask = mask_from_coords(10, 10, &coords);
        let shift = ShiftVector::new(2.0, -3.0);
        let back = shift_mask(&shift_mask(&mask, &shift),
                              &ShiftVector::new(-shift.rows, -shift.cols));
        // Rows 8.. and columns ..3 were vacated on the way.
        for y in 0..8 {
            for x in 3..10 {
                assert_eq!(back.get_pixel(x, y), mask.get_pixel(x, y), "({}, {})", x, y);
            }
        }
    }

    #[test]
    fn test_dilate_mask() {
        let mask = mask_from_coords(5, 5, &[(2, 2)]);
        let once = dilate_mask(&mask, 1);
        assert_eq!(mask_count(&once), 5);
        let twice = dilate_mask(&mask, 2);
        assert_eq!(mask_count(&twice), 13);
        assert_eq!(dilate_mask(&mask, 0), mask);
    }

    #[test]
    fn test_tracker_seed_and_growth() {
        let config = MaskConfig::default();
        let mut tracker = IdentityMaskTracker::new();
        assert!(tracker.mask().is_none());
        // Aligning before the first pass is a no-op.
        tracker.align(&ShiftVector::new(5.0, 5.0));
        assert!(tracker.mask().is_none());

        let first = mask_from_coords(40, 40, &[(10, 10)]);
        tracker.grow(&first, &config);
        // Seed dilation of 3: a diamond of 25 pixels.
        assert_eq!(mask_count(tracker.mask().unwrap()), 25);

        let previous = tracker.mask().unwrap().clone();
        let shift = ShiftVector::new(1.0, 2.0);
        tracker.align(&shift);
        tracker.grow(&mask_from_coords(40, 40, &[(30, 30)]), &config);
        let current = tracker.mask().unwrap();
        assert!(mask_is_set(current, 12, 11));
        assert!(mask_is_set(current, 30, 30));
        assert!(mask_is_set(current, 32, 30));
        assert!(!mask_is_set(current, 33, 30));

        // Nothing counted before is lost once the shift is undone.
        let undone = shift_mask(current, &ShiftVector::new(-1.0, -2.0));
        for (x, y, p) in previous.enumerate_pixels() {
            if p.0[0] == MASK_ON {
                assert_eq!(*undone.get_pixel(x, y), Luma([MASK_ON]));
            }
        }
    }
}  // mod tests.
