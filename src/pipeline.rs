//! The pass loop. A [SpotAnalysis] owns everything that carries over from one
//! pass of a spot to the next; [analyze_chip()] runs spots in parallel.

use std::time::Instant;

use image::GrayImage;
use log::{info, warn};
use rayon::prelude::*;

use crate::aggregate::{PassAggregator, PassStatus, SpotPassRecord};
use crate::config::AnalysisConfig;
use crate::error::{Result, VirionError};
use crate::histogram_funcs::nan_median;
use crate::identity_mask::IdentityMaskTracker;
use crate::image_funcs::{mask_count, mask_from_coords, mask_is_set, mask_union,
                         maxmin_projection, Plane, Stack};
use crate::markers::{extract_found_markers, locate_markers_relaxing, marker_footprint_mask,
                     measure_rotation, select_focus_plane, MarkerSet, MarkerTemplate};
use crate::registration::{MarkerHistory, ReferencePolicy, ShiftVector};
use crate::shape::{classify_candidates, extract_blobs, shape_index, Coord};
use crate::spot::{disk_exclusion, SpotLocator};
use crate::validator::{validate_blob, ValidatedBlob};

/// Images of one pass of one spot.
#[derive(Debug, Clone)]
pub struct PassInput {
    pub pass: u32,
    /// Planes normalized to [0, 1] (see [crate::image_funcs::normalize_by_median]).
    pub stack: Stack,
    /// Contrast-enhanced copy of `stack`, used for the projection and the
    /// shape index. When absent `stack` is used.
    pub enhanced: Option<Stack>,
}

#[derive(Debug)]
pub struct PassOutcome {
    pub record: SpotPassRecord,
    pub accepted: Vec<ValidatedBlob>,
    pub rejected: Vec<ValidatedBlob>,
}

/// Supplies a spot's passes one at a time, so that a worker holds a single
/// pass in memory.
pub trait PassSource: Send {
    fn spot(&self) -> u32;

    /// Pass numbers to analyze, ascending.
    fn passes(&self) -> Vec<u32>;

    /// Loads a pass. A pass without images is reported as
    /// [VirionError::MissingPassData].
    fn load(&mut self, pass: u32) -> Result<PassInput>;

    /// Called after each analyzed pass, with the pass's images still loaded.
    fn finished(&mut self, _input: &PassInput, _outcome: &PassOutcome) {}
}

/// Per-spot state across the pass sequence.
pub struct SpotAnalysis<'a> {
    spot: u32,
    config: &'a AnalysisConfig,
    template: &'a MarkerTemplate,
    template_dims: (u32, u32),
    policy: ReferencePolicy,
    // Crops of the previous pass's markers; searched for instead of
    // `template` when present.
    found_markers: Option<MarkerTemplate>,
    history: MarkerHistory,
    spot_locator: SpotLocator,
    mask_tracker: IdentityMaskTracker,
    // Sum of the shifts applied to the spot and mask since the first pass.
    applied: ShiftVector,
    processed_any: bool,
    aggregator: PassAggregator,
}

impl<'a> SpotAnalysis<'a> {
    pub fn new(spot: u32, config: &'a AnalysisConfig, template: &'a MarkerTemplate,
               expected_passes: usize) -> Result<SpotAnalysis<'a>> {
        let Some(template_dims) = template.dimensions() else {
            return Err(VirionError::InvalidInput("empty marker template".to_string()));
        };
        let policy = config.reference.resolve(expected_passes);
        info!("Spot {}: {} passes, registering against {:?}", spot, expected_passes, policy);
        Ok(SpotAnalysis{
            spot, config, template, template_dims, policy,
            found_markers: None,
            history: MarkerHistory::new(),
            spot_locator: SpotLocator::new(),
            mask_tracker: IdentityMaskTracker::new(),
            applied: ShiftVector::ZERO,
            processed_any: false,
            aggregator: PassAggregator::new(spot, config.contrast_window),
        })
    }

    pub fn spot(&self) -> u32 {
        self.spot
    }

    pub fn aggregator(&self) -> &PassAggregator {
        &self.aggregator
    }

    pub fn into_aggregator(self) -> PassAggregator {
        self.aggregator
    }

    fn find_markers(&mut self, plane: &Plane) -> MarkerSet {
        let template = self.found_markers.as_ref().unwrap_or(self.template);
        let markers = match locate_markers_relaxing(plane, template, &self.config.markers) {
            Ok(markers) => markers,
            Err(e) => {
                warn!("Spot {}: {}", self.spot, e);
                MarkerSet::default()
            },
        };
        let crops = extract_found_markers(plane, &markers, self.template_dims);
        self.found_markers = if crops.is_empty() {
            None
        } else {
            Some(MarkerTemplate::Stack(crops))
        };
        markers
    }

    // Registration of `pass`: the status, the shift measured against the
    // reference pass, and the shift since the previously processed pass.
    fn register(&self, pass: u32, markers: &MarkerSet)
                -> Result<(PassStatus, ShiftVector, ShiftVector)> {
        if !self.processed_any {
            return Ok((PassStatus::Valid, ShiftVector::ZERO, ShiftVector::ZERO));
        }
        let registration = match self.history.register(self.spot, pass, markers, self.policy) {
            Ok(registration) => registration,
            Err(e @ VirionError::RegistrationUnavailable{..}) => {
                warn!("{}", e);
                return Ok((PassStatus::RegistrationUnavailable,
                           ShiftVector::ZERO, ShiftVector::ZERO));
            },
            Err(e) => return Err(e),
        };
        if !registration.valid {
            warn!("Spot {} pass {}: no marker pairs matched, assuming no shift",
                  self.spot, pass);
            return Ok((PassStatus::RegistrationUnavailable,
                       ShiftVector::ZERO, ShiftVector::ZERO));
        }
        let measured = registration.shift;
        let increment = match self.policy {
            // Against the baseline the measurement is a total; only the part
            // not applied yet moves the spot and mask.
            ReferencePolicy::Baseline => measured.minus(&self.applied),
            ReferencePolicy::Previous | ReferencePolicy::Auto => measured,
        };
        Ok((PassStatus::Valid, measured, increment))
    }

    /// Analyzes one pass. Passes must come in increasing order.
    pub fn process_pass(&mut self, input: &PassInput) -> Result<PassOutcome> {
        let pass_start = Instant::now();
        let (spot, pass) = (self.spot, input.pass);
        let config = self.config;
        let stack = &input.stack;
        let enhanced = input.enhanced.as_ref().unwrap_or(stack);
        if enhanced.dimensions() != stack.dimensions() || enhanced.len() != stack.len() {
            return Err(VirionError::InvalidInput(format!(
                "spot {} pass {}: enhanced stack does not match the normalized stack",
                spot, pass)));
        }
        let dims = stack.dimensions();

        let markers = self.find_markers(stack.plane(0));
        let (status, measured, increment) = self.register(pass, &markers)?;
        self.history.record(pass, markers.clone());
        let focus_plane = select_focus_plane(stack, &markers, self.template_dims,
                                             &config.focus);

        let projection = maxmin_projection(enhanced);
        let geometry = self.spot_locator.locate(&projection, &increment, &config.spot,
                                                spot, pass)?;
        let exclusion = mask_union(
            &disk_exclusion(dims, &geometry, config.spot.roi_margin),
            &marker_footprint_mask(dims, &markers, self.template_dims));
        self.mask_tracker.align(&increment);
        self.applied = self.applied.plus(&increment);

        let mut shape = shape_index(enhanced.plane(focus_plane),
                                    config.classifier.shape_index_sigma);
        let counted = self.mask_tracker.mask();
        for (x, y, s) in shape.enumerate_pixels_mut() {
            if mask_is_set(&exclusion, x, y) {
                s.0[0] = f32::NAN;
            } else if counted.is_some_and(|m| mask_is_set(m, x, y)) {
                s.0[0] = -1.0;
            }
        }
        let roi_pixels = (dims.0 * dims.1) as usize - mask_count(&exclusion);
        let area_mm2 = roi_pixels as f64 * config.calibration.pixel_area_um2() * 1e-6;
        let background = if config.spot.antibody_spot {
            roi_background(&projection, &exclusion)
        } else {
            config.classifier.no_spot_background
        };

        let candidates = classify_candidates(&shape, &projection, background,
                                             &config.classifier);
        let blobs = extract_blobs(&candidates, dims, &config.classifier);
        let (accepted, rejected): (Vec<ValidatedBlob>, Vec<ValidatedBlob>) = blobs.into_iter()
            .map(|blob| validate_blob(blob, stack, &config.validator))
            .partition(|v| v.accepted);

        let counted_pixels: Vec<Coord> =
            accepted.iter().flat_map(|v| v.blob.pixels.iter().copied()).collect();
        let detections: GrayImage = mask_from_coords(dims.0, dims.1, &counted_pixels);
        self.mask_tracker.grow(&detections, &config.mask);
        self.processed_any = true;

        let pixels_per_um = config.calibration.pixels_per_um();
        let filament_lengths_um: Vec<f64> = accepted.iter()
            .filter_map(|v| v.blob.filament_length_um(pixels_per_um, &config.classifier))
            .collect();
        let record = SpotPassRecord{
            spot, pass, status,
            validated_count: accepted.len(),
            filament_count: filament_lengths_um.len(),
            filament_lengths_um,
            area_mm2,
            geometry: Some(geometry),
            rotation_deg: measure_rotation(&markers),
            markers,
            shift: measured,
            focus_plane,
            background,
        };
        let contrasts: Vec<f64> = accepted.iter().map(|v| v.perc_contrast).collect();
        self.aggregator.record_pass(record.clone(), &contrasts)?;
        info!("Spot {} pass {}: {} particles ({} rejected) in {:.4} mm², {:?}",
              spot, pass, accepted.len(), rejected.len(), area_mm2, pass_start.elapsed());
        Ok(PassOutcome{record, accepted, rejected})
    }

    /// Records a pass that has no images. The record carries the spot's last
    /// tracked geometry.
    pub fn record_missing(&mut self, pass: u32) -> Result<SpotPassRecord> {
        let record = SpotPassRecord{
            geometry: self.spot_locator.geometry(),
            ..SpotPassRecord::placeholder(self.spot, pass, PassStatus::MissingPassData)
        };
        self.aggregator.record_pass(record.clone(), &[])?;
        Ok(record)
    }
}

// Median projection intensity over the pixels not excluded.
fn roi_background(projection: &Plane, exclusion: &GrayImage) -> f32 {
    let values: Vec<f32> = projection.enumerate_pixels()
        .filter(|(x, y, _)| !mask_is_set(exclusion, *x, *y))
        .map(|(_, _, p)| p.0[0])
        .collect();
    nan_median(&values)
}

/// Runs every pass of one spot in order.
pub fn analyze_spot(source: &mut dyn PassSource, config: &AnalysisConfig,
                    template: &MarkerTemplate) -> Result<PassAggregator> {
    let spot_start = Instant::now();
    let passes = source.passes();
    let mut analysis = SpotAnalysis::new(source.spot(), config, template, passes.len())?;
    for pass in passes {
        match source.load(pass) {
            Ok(input) => {
                let outcome = analysis.process_pass(&input)?;
                source.finished(&input, &outcome);
            },
            Err(e @ VirionError::MissingPassData{..}) => {
                warn!("{}", e);
                analysis.record_missing(pass)?;
            },
            Err(e) => return Err(e),
        }
    }
    info!("Spot {}: {} particles over all passes in {:?}",
          analysis.spot(), analysis.aggregator().cumulative_count(), spot_start.elapsed());
    Ok(analysis.into_aggregator())
}

/// Analyzes spots in parallel. Each spot's result is independent; a failed
/// spot does not stop the others.
pub fn analyze_chip(sources: Vec<Box<dyn PassSource>>, config: &AnalysisConfig,
                    template: &MarkerTemplate) -> Vec<(u32, Result<PassAggregator>)> {
    let chip_start = Instant::now();
    let mut results: Vec<(u32, Result<PassAggregator>)> = sources.into_par_iter()
        .map(|mut source| {
            let spot = source.spot();
            let result = analyze_spot(source.as_mut(), config, template);
            if let Err(e) = &result {
                warn!("Spot {} abandoned: {}", spot, e);
            }
            (spot, result)
        })
        .collect();
    results.sort_by_key(|(spot, _)| *spot);
    info!("Analyzed {} spots in {:?}", results.len(), chip_start.elapsed());
    results
}

// mod tests.
