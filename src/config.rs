//! Analysis parameters. Everything that varies by imaging hardware or that was
//! tuned empirically lives here so that a host can load it from a file and
//! share it read-only between spot workers.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, VirionError};
use crate::registration::ReferencePolicy;
use crate::spot::RedetectPolicy;

/// The two supported imaging setups. They differ in optics and in how noisy
/// the background is, which moves the acceptance cutoffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ImagingMode {
    /// Dry chips imaged on the scanning reader.
    #[default]
    Exoviewer,
    /// Chips imaged through liquid in a flow cell.
    InLiquid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    /// Peaks must reach this fraction of the strongest correlation score.
    pub threshold_rel: f32,
    /// Minimum separation between two reported markers, in pixels.
    pub min_distance: u32,
    /// Cap on markers reported for a single multi-corner template.
    pub max_markers: usize,
    /// When searching with a stack of single-marker templates, each template
    /// uses `threshold_rel - stack_threshold_drop`.
    pub stack_threshold_drop: f32,
    /// Threshold relaxation used when too few markers are found. Zero
    /// relaxations disables the retry.
    pub relax_step: f32,
    pub max_relaxations: usize,
    pub min_markers: usize,
    /// The correlation search runs on the image 2x2-binned this many times;
    /// peaks are then refined at full resolution. Zero searches at full
    /// resolution.
    pub search_binning_levels: u32,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            threshold_rel: 0.65,
            min_distance: 775,
            max_markers: 4,
            stack_threshold_drop: 0.2,
            relax_step: 0.05,
            max_relaxations: 0,
            min_markers: 2,
            search_binning_levels: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotConfig {
    /// False for chips without an antibody microarray; the spot is then a
    /// fixed centered disk.
    pub antibody_spot: bool,
    /// Hough radius band [radius_min, radius_max), searched every
    /// `radius_step` pixels.
    pub radius_min: u32,
    pub radius_max: u32,
    pub radius_step: u32,
    /// Radius of the centered disk used when there is no antibody spot.
    pub default_radius: u32,
    /// The counting disk is the spot disk shrunk by this many pixels.
    pub roi_margin: u32,
    /// Gaussian sigma of the edge detector feeding the Hough transform.
    pub canny_sigma: f32,
    pub redetect: RedetectPolicy,
}

impl Default for SpotConfig {
    fn default() -> Self {
        Self {
            antibody_spot: true,
            radius_min: 325,
            radius_max: 601,
            radius_step: 25,
            default_radius: 600,
            roi_margin: 25,
            canny_sigma: 2.5,
            redetect: RedetectPolicy::Never,
        }
    }
}

/// One shape class: pixels whose shape index is within `delta` of `target`
/// and whose projection intensity is at least `intensity_factor` times the
/// spot background median.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ShapeClass {
    pub target: f32,
    pub delta: f32,
    pub intensity_factor: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub ridge: ShapeClass,
    pub sphere: ShapeClass,
    /// Ridge class evaluated on a blurred shape index map to recover faint
    /// filaments.
    pub smoothed_ridge: ShapeClass,
    /// Sigma of the Gaussian used when computing the Hessian.
    pub shape_index_sigma: f32,
    /// Sigma of the blur applied to the shape index map for `smoothed_ridge`.
    pub smoothing_sigma: f32,
    /// Each smoothed-ridge pixel counts this much toward a blob's ridge points.
    pub smoothed_ridge_weight: f64,
    /// Blobs are kept when min_area < area <= max_area.
    pub min_area: usize,
    pub max_area: usize,
    /// Filament when filo_score >= filament_score and area > filament_min_area.
    pub filament_score: f64,
    pub filament_min_area: usize,
    /// Background median assumed when the chip has no antibody spot.
    pub no_spot_background: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            ridge: ShapeClass{target: 0.5, delta: 0.25, intensity_factor: 4.0},
            sphere: ShapeClass{target: 1.0, delta: 0.2, intensity_factor: 2.0},
            smoothed_ridge: ShapeClass{target: 0.5, delta: 0.3, intensity_factor: 3.0},
            shape_index_sigma: 1.0,
            smoothing_sigma: 1.0,
            smoothed_ridge_weight: 0.15,
            min_area: 3,
            max_area: 300,
            filament_score: 0.25,
            filament_min_area: 10,
            no_spot_background: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskConfig {
    /// Dilation iterations for the first pass's detections.
    pub seed_dilation: u8,
    /// Dilation iterations for each later pass's detections.
    pub tracking_dilation: u8,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self{seed_dilation: 3, tracking_dilation: 2}
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub initial_params: [f64; 3],
    pub max_iterations: usize,
    pub convergence_threshold: f64,
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            initial_params: [0.1, 0.1, 1.0],
            max_iterations: 800,
            convergence_threshold: 1e-8,
            initial_lambda: 0.001,
            lambda_up: 10.0,
            lambda_down: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Blob accepted only when its background coefficient of variation is
    /// below this.
    pub cv_cutoff: f64,
    /// Blob accepted only when the point-spread fit R² is at least this.
    pub r2_cutoff: f64,
    /// The background is sampled on the blob bounding box grown by this many
    /// pixels per side.
    pub bbox_margin: u32,
    pub fit: FitConfig,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self{cv_cutoff: 0.1, r2_cutoff: 0.85, bbox_margin: 2, fit: FitConfig::default()}
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Physical pixel pitch of the camera.
    pub camera_um_per_pixel: f64,
    pub magnification: f64,
}

impl CalibrationConfig {
    /// Area of one image pixel on the chip, in square microns.
    pub fn pixel_area_um2(&self) -> f64 {
        let um = self.camera_um_per_pixel / self.magnification;
        um * um
    }

    pub fn pixels_per_um(&self) -> f64 {
        self.magnification / self.camera_um_per_pixel
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self{camera_um_per_pixel: 3.45 * 2.0, magnification: 44.0}
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusConfig {
    /// Pick the focus plane from the sharpness of the marker crops. When
    /// false (or when no usable marker crop exists) `fallback_plane` is used.
    pub use_markers: bool,
    pub fallback_plane: usize,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self{use_markers: true, fallback_plane: 6}
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub mode: ImagingMode,
    pub markers: MarkerConfig,
    pub spot: SpotConfig,
    pub classifier: ClassifierConfig,
    pub mask: MaskConfig,
    pub validator: ValidatorConfig,
    pub calibration: CalibrationConfig,
    pub focus: FocusConfig,
    pub reference: ReferencePolicy,
    /// When set, only contrasts in (min, max] count toward the aggregated
    /// per-pass totals.
    pub contrast_window: Option<(f64, f64)>,
}

impl AnalysisConfig {
    /// Parameter set for the given imaging mode; other settings take their
    /// defaults.
    pub fn for_mode(mode: ImagingMode) -> Self {
        let mut config = AnalysisConfig{
            mode,
            markers: MarkerConfig::default(),
            spot: SpotConfig::default(),
            classifier: ClassifierConfig::default(),
            mask: MaskConfig::default(),
            validator: ValidatorConfig::default(),
            calibration: CalibrationConfig::default(),
            focus: FocusConfig::default(),
            reference: ReferencePolicy::default(),
            contrast_window: None,
        };
        match mode {
            ImagingMode::Exoviewer => (),
            ImagingMode::InLiquid => {
                config.validator.cv_cutoff = 0.01;
                config.validator.r2_cutoff = 0.9;
                config.spot.canny_sigma = 1.5;
                config.calibration.camera_um_per_pixel = 5.86;
                config.calibration.magnification = 40.0;
                config.focus.use_markers = false;
            },
        }
        config
    }

    /// Reads JSON parameters laid over the preset of their imaging mode. The
    /// file's `mode` wins; a file without one uses `default_mode`. Fields the
    /// file leaves out keep the preset's values.
    pub fn from_json_file(path: &Path, default_mode: ImagingMode) -> Result<Self> {
        Self::from_json_str(&fs::read_to_string(path)?, default_mode)
    }

    pub fn from_json_str(text: &str, default_mode: ImagingMode) -> Result<Self> {
        let overrides: Value = serde_json::from_str(text)?;
        let mode = match overrides.get("mode") {
            Some(mode) => serde_json::from_value(mode.clone())?,
            None => default_mode,
        };
        let mut merged = serde_json::to_value(AnalysisConfig::for_mode(mode))?;
        merge_json(&mut merged, overrides);
        let config: AnalysisConfig = serde_json::from_value(merged)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects parameter combinations the algorithms cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.spot.radius_step == 0 || self.spot.radius_min >= self.spot.radius_max {
            return Err(VirionError::Config(format!(
                "bad Hough radius band {}..{} step {}",
                self.spot.radius_min, self.spot.radius_max, self.spot.radius_step)));
        }
        if self.classifier.min_area >= self.classifier.max_area {
            return Err(VirionError::Config(format!(
                "bad blob area range ({}, {}]",
                self.classifier.min_area, self.classifier.max_area)));
        }
        if self.calibration.magnification <= 0.0 ||
            self.calibration.camera_um_per_pixel <= 0.0
        {
            return Err(VirionError::Config("calibration must be positive".to_string()));
        }
        if let Some((lo, hi)) = self.contrast_window {
            if lo >= hi {
                return Err(VirionError::Config(format!(
                    "empty contrast window ({}, {}]", lo, hi)));
            }
        }
        Ok(())
    }
}

// Objects merge key by key; anything else in `overrides` replaces `base`.
fn merge_json(base: &mut Value, overrides: Value) {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    },
                }
            }
        },
        (slot, value) => *slot = value,
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig::for_mode(ImagingMode::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_liquid_preset() {
        let config = AnalysisConfig::for_mode(ImagingMode::InLiquid);
        assert_eq!(config.validator.cv_cutoff, 0.01);
        assert_eq!(config.validator.r2_cutoff, 0.9);
        assert!(!config.focus.use_markers);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{"validator": {"cv_cutoff": 0.05}, "spot": {"antibody_spot": false}}"#;
        let config: AnalysisConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.validator.cv_cutoff, 0.05);
        assert_eq!(config.validator.r2_cutoff, 0.85);
        assert!(!config.spot.antibody_spot);
        assert_eq!(config.spot.radius_step, 25);
        assert_eq!(config.classifier.max_area, 300);
    }

    #[test]
    fn test_json_starts_from_mode_preset() {
        // The file's mode picks the preset under its overrides.
        let json = r#"{"mode": "InLiquid", "validator": {"r2_cutoff": 0.8}}"#;
        let config = AnalysisConfig::from_json_str(json, ImagingMode::Exoviewer).unwrap();
        assert_eq!(config.mode, ImagingMode::InLiquid);
        assert_eq!(config.validator.cv_cutoff, 0.01);
        assert_eq!(config.validator.r2_cutoff, 0.8);
        assert_eq!(config.calibration.magnification, 40.0);
        assert!(!config.focus.use_markers);

        // Without a mode in the file the caller's mode applies.
        let json = r#"{"contrast_window": [1.0, 15.0]}"#;
        let config = AnalysisConfig::from_json_str(json, ImagingMode::InLiquid).unwrap();
        assert_eq!(config.mode, ImagingMode::InLiquid);
        assert_eq!(config.validator.cv_cutoff, 0.01);
        assert_eq!(config.contrast_window, Some((1.0, 15.0)));
        let config = AnalysisConfig::from_json_str("{}", ImagingMode::Exoviewer).unwrap();
        assert_eq!(config.validator.cv_cutoff, 0.1);
        assert_eq!(config.spot.canny_sigma, 2.5);

        assert!(AnalysisConfig::from_json_str(r#"{"mode": "Wet"}"#,
                                              ImagingMode::Exoviewer).is_err());
        assert!(matches!(
            AnalysisConfig::from_json_str(r#"{"contrast_window": [5.0, 1.0]}"#,
                                          ImagingMode::Exoviewer),
            Err(VirionError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_band() {
        let mut config = AnalysisConfig::default();
        config.spot.radius_step = 0;
        assert!(config.validate().is_err());
        config = AnalysisConfig::default();
        config.contrast_window = Some((5.0, 1.0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pixel_area() {
        let calibration = CalibrationConfig{camera_um_per_pixel: 5.86,
                                            magnification: 40.0};
        approx::assert_abs_diff_eq!(calibration.pixel_area_um2(),
                                    0.021462, epsilon = 1e-6);
    }
}
