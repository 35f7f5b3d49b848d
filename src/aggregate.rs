//! Per-spot bookkeeping across passes: what each pass contributed and the
//! running totals.

use std::collections::BTreeMap;

use log::{debug, info};
use serde::Serialize;

use crate::error::{Result, VirionError};
use crate::histogram_funcs::bin_values;
use crate::markers::MarkerSet;
use crate::registration::ShiftVector;
use crate::spot::SpotGeometry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PassStatus {
    Valid,
    /// No reference pass, or no marker pair matched it. The pass was still
    /// analyzed, with a zero shift.
    RegistrationUnavailable,
    /// The pass had no images; its record is a zero-count placeholder.
    MissingPassData,
}

/// What one pass of one spot produced.
#[derive(Debug, Clone, Serialize)]
pub struct SpotPassRecord {
    pub spot: u32,
    pub pass: u32,
    pub status: PassStatus,
    /// Particles accepted by the validator on this pass, before any contrast
    /// window.
    pub validated_count: usize,
    pub filament_count: usize,
    /// Lengths of the filaments among the validated particles, in microns.
    pub filament_lengths_um: Vec<f64>,
    /// Area of the analyzed region (spot disk minus exclusions), in mm².
    pub area_mm2: f64,
    pub geometry: Option<SpotGeometry>,
    pub markers: MarkerSet,
    pub shift: ShiftVector,
    pub rotation_deg: Option<f64>,
    pub focus_plane: usize,
    /// Median projection intensity inside the region; the base of the
    /// candidate thresholds.
    pub background: f32,
}

impl SpotPassRecord {
    pub fn placeholder(spot: u32, pass: u32, status: PassStatus) -> SpotPassRecord {
        SpotPassRecord{
            spot, pass, status,
            validated_count: 0,
            filament_count: 0,
            filament_lengths_um: Vec::new(),
            area_mm2: 0.0,
            geometry: None,
            markers: MarkerSet::default(),
            shift: ShiftVector::ZERO,
            rotation_deg: None,
            focus_plane: 0,
            background: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub record: SpotPassRecord,
    /// Percent contrasts of the pass's particles that fall under the window's
    /// upper bound (all of them without a window).
    pub contrasts: Vec<f64>,
    /// Particles counted toward the totals on this pass.
    pub new_count: usize,
    pub cumulative_count: usize,
    /// Cumulative count over `Valid` passes only; the density's numerator.
    pub registered_count: usize,
    /// `registered_count` per mm², in thousands. None unless the pass is
    /// `Valid`.
    pub density_kp_mm2: Option<f64>,
}

/// Accumulates the pass records of one spot. Passes must be recorded in
/// increasing pass order.
#[derive(Debug)]
pub struct PassAggregator {
    spot: u32,
    contrast_window: Option<(f64, f64)>,
    passes: BTreeMap<u32, PassSummary>,
}

impl PassAggregator {
    pub fn new(spot: u32, contrast_window: Option<(f64, f64)>) -> PassAggregator {
        PassAggregator{spot, contrast_window, passes: BTreeMap::new()}
    }

    pub fn spot(&self) -> u32 {
        self.spot
    }

    /// Adds a pass. `contrasts` are the percent contrasts of the pass's
    /// accepted particles.
    pub fn record_pass(&mut self, record: SpotPassRecord, contrasts: &[f64])
                       -> Result<&PassSummary> {
        if record.spot != self.spot {
            return Err(VirionError::InvalidInput(format!(
                "record for spot {} given to aggregator of spot {}", record.spot, self.spot)));
        }
        let pass = record.pass;
        if let Some((&last, _)) = self.passes.last_key_value() {
            if pass <= last {
                return Err(VirionError::InvalidInput(format!(
                    "spot {} pass {} recorded after pass {}", self.spot, pass, last)));
            }
        }
        let (contrasts, new_count) = match self.contrast_window {
            None => (contrasts.to_vec(), contrasts.len()),
            Some((min, max)) => {
                let below: Vec<f64> = contrasts.iter().copied().filter(|&c| c <= max).collect();
                let counted = below.iter().filter(|&&c| c > min).count();
                (below, counted)
            },
        };
        let cumulative_count = self.cumulative_count() + new_count;
        let valid = record.status == PassStatus::Valid;
        let registered_count = self.registered_count() + if valid { new_count } else { 0 };
        let density_kp_mm2 = match (valid, record.area_mm2 > 0.0) {
            (false, _) => None,
            (true, true) => Some(registered_count as f64 / record.area_mm2 * 0.001),
            (true, false) => Some(0.0),
        };
        debug!("Spot {} pass {}: {} new, {} total, {} registered, density {:?} kp/mm²",
               self.spot, pass, new_count, cumulative_count, registered_count, density_kp_mm2);
        let summary = PassSummary{record, contrasts, new_count, cumulative_count,
                                  registered_count, density_kp_mm2};
        let summary: &PassSummary = self.passes.entry(pass).or_insert(summary);
        Ok(summary)
    }

    pub fn summary(&self, pass: u32) -> Option<&PassSummary> {
        self.passes.get(&pass)
    }

    /// Summaries in pass order.
    pub fn summaries(&self) -> impl Iterator<Item = &PassSummary> {
        self.passes.values()
    }

    pub fn cumulative_count(&self) -> usize {
        self.passes.values().next_back().map_or(0, |s| s.cumulative_count)
    }

    /// Particles from `Valid` passes.
    pub fn registered_count(&self) -> usize {
        self.passes.values().next_back().map_or(0, |s| s.registered_count)
    }

    /// Contrast histogram of one pass over `bins` equal bins of `range`.
    pub fn histogram(&self, pass: u32, bins: usize, range: (f64, f64)) -> Option<Vec<u32>> {
        self.passes.get(&pass).map(|s| bin_values(&s.contrasts, bins, range))
    }

    pub fn log_totals(&self) {
        for s in self.passes.values() {
            match s.density_kp_mm2 {
                Some(density) => info!(
                    "Spot {} pass {}: {} particles, {} cumulative, {:.3} kp/mm²",
                    self.spot, s.record.pass, s.new_count, s.cumulative_count, density),
                None => info!(
                    "Spot {} pass {} ({:?}): {} particles, {} cumulative, no density",
                    self.spot, s.record.pass, s.record.status, s.new_count,
                    s.cumulative_count),
            }
        }
    }
}

// mod tests.
