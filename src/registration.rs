//! Pass-to-pass registration from marker positions.

use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VirionError};
use crate::markers::MarkerSet;

/// Translation of the current pass relative to a reference pass, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ShiftVector {
    pub rows: f64,
    pub cols: f64,
}

impl ShiftVector {
    pub const ZERO: ShiftVector = ShiftVector{rows: 0.0, cols: 0.0};

    pub fn new(rows: f64, cols: f64) -> ShiftVector {
        ShiftVector{rows, cols}
    }

    pub fn magnitude(&self) -> f64 {
        self.rows.hypot(self.cols)
    }

    pub fn plus(&self, other: &ShiftVector) -> ShiftVector {
        ShiftVector{rows: self.rows + other.rows, cols: self.cols + other.cols}
    }

    pub fn minus(&self, other: &ShiftVector) -> ShiftVector {
        ShiftVector{rows: self.rows - other.rows, cols: self.cols - other.cols}
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Registration {
    pub shift: ShiftVector,
    /// False when no marker pair matched; the shift is then zero.
    pub valid: bool,
}

impl Registration {
    pub const UNREGISTERED: Registration =
        Registration{shift: ShiftVector::ZERO, valid: false};
}

/// Marker pairs farther apart than this on either axis are not considered the
/// same marker. Tighter when the two sets differ in size, since one of them
/// then contains a spurious or missing marker.
fn pairing_tolerance(reference_len: usize, current_len: usize) -> f64 {
    if reference_len != current_len { 100.0 } else { 150.0 }
}

/// Mean displacement (current minus reference) over every marker pair within
/// the pairing tolerance on both axes.
pub fn measure_shift(reference: &MarkerSet, current: &MarkerSet) -> Registration {
    let tolerance = pairing_tolerance(reference.len(), current.len());
    let mut sum = ShiftVector::ZERO;
    let mut pairs = 0;
    for &(r0, c0) in reference.locs() {
        for &(r1, c1) in current.locs() {
            let d_row = (r1 - r0) as f64;
            let d_col = (c1 - c0) as f64;
            if d_row.abs() <= tolerance && d_col.abs() <= tolerance {
                sum = sum.plus(&ShiftVector::new(d_row, d_col));
                pairs += 1;
            }
        }
    }
    if pairs == 0 {
        debug!("No marker pairs within {} px", tolerance);
        return Registration::UNREGISTERED;
    }
    Registration{
        shift: ShiftVector::new(sum.rows / pairs as f64, sum.cols / pairs as f64),
        valid: true,
    }
}

/// Which earlier pass a new pass is registered against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReferencePolicy {
    /// The immediately preceding pass number.
    Previous,
    /// The spot's first processed pass.
    Baseline,
    /// `Previous` for short series (at most 10 passes), `Baseline` for longer
    /// time courses where small per-pass errors would otherwise add up.
    #[default]
    Auto,
}

impl ReferencePolicy {
    /// Replaces `Auto` with the concrete policy for a series of
    /// `expected_passes` passes.
    pub fn resolve(self, expected_passes: usize) -> ReferencePolicy {
        match self {
            ReferencePolicy::Auto if expected_passes <= 10 => ReferencePolicy::Previous,
            ReferencePolicy::Auto => ReferencePolicy::Baseline,
            other => other,
        }
    }
}

/// Marker sets of one spot, keyed by pass number.
#[derive(Debug, Default)]
pub struct MarkerHistory {
    by_pass: BTreeMap<u32, MarkerSet>,
    baseline: Option<u32>,
}

impl MarkerHistory {
    pub fn new() -> MarkerHistory {
        MarkerHistory::default()
    }

    /// The first pass recorded becomes the baseline.
    pub fn record(&mut self, pass: u32, markers: MarkerSet) {
        if self.baseline.is_none() {
            self.baseline = Some(pass);
        }
        self.by_pass.insert(pass, markers);
    }

    pub fn get(&self, pass: u32) -> Option<&MarkerSet> {
        self.by_pass.get(&pass)
    }

    pub fn baseline_pass(&self) -> Option<u32> {
        self.baseline
    }

    /// The reference pass number and its markers for registering `pass`. The
    /// policy must already be resolved.
    pub fn reference_for(&self, spot: u32, pass: u32, policy: ReferencePolicy)
                         -> Result<(u32, &MarkerSet)> {
        let reference_pass = match policy {
            ReferencePolicy::Baseline => self.baseline,
            ReferencePolicy::Previous | ReferencePolicy::Auto => pass.checked_sub(1),
        };
        let Some(reference_pass) = reference_pass else {
            return Err(VirionError::RegistrationUnavailable{
                spot, pass, reason: "no reference pass".to_string()});
        };
        match self.by_pass.get(&reference_pass) {
            Some(markers) => Ok((reference_pass, markers)),
            None => Err(VirionError::RegistrationUnavailable{
                spot, pass,
                reason: format!("no markers recorded for pass {}", reference_pass)}),
        }
    }

    /// Registers `current` (the markers of `pass`) against its reference.
    pub fn register(&self, spot: u32, pass: u32, current: &MarkerSet,
                    policy: ReferencePolicy) -> Result<Registration> {
        let (reference_pass, reference) = self.reference_for(spot, pass, policy)?;
        let registration = measure_shift(reference, current);
        debug!("Spot {} pass {} vs pass {}: {:?}", spot, pass, reference_pass, registration);
        Ok(registration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_measure_shift_averages_pairs() {
        let reference = MarkerSet::new(vec![(10, 10), (10, 500)]);
        let current = MarkerSet::new(vec![(12, 11), (13, 501)]);
        let registration = measure_shift(&reference, &current);
        assert!(registration.valid);
        assert_abs_diff_eq!(registration.shift.rows, 2.5);
        assert_abs_diff_eq!(registration.shift.cols, 1.0);
    }

    #[test]
    fn test_measure_shift_tolerance_depends_on_counts() {
        let reference = MarkerSet::new(vec![(100, 100), (100, 700)]);
        // Equal counts: a 120 px displacement is within 150.
        let current = MarkerSet::new(vec![(220, 100), (220, 700)]);
        let registration = measure_shift(&reference, &current);
        assert!(registration.valid);
        assert_abs_diff_eq!(registration.shift.rows, 120.0);

        // Unequal counts: the same displacement exceeds 100.
        let current = MarkerSet::new(vec![(220, 100)]);
        assert_eq!(measure_shift(&reference, &current), Registration::UNREGISTERED);
    }

    #[test]
    fn test_measure_shift_empty() {
        let reference = MarkerSet::new(vec![(10, 10)]);
        assert_eq!(measure_shift(&reference, &MarkerSet::default()),
                   Registration::UNREGISTERED);
        assert_eq!(measure_shift(&MarkerSet::default(), &MarkerSet::default()),
                   Registration::UNREGISTERED);
    }

    #[test]
    fn test_reference_policy_resolve() {
        assert_eq!(ReferencePolicy::Auto.resolve(10), ReferencePolicy::Previous);
        assert_eq!(ReferencePolicy::Auto.resolve(11), ReferencePolicy::Baseline);
        assert_eq!(ReferencePolicy::Baseline.resolve(3), ReferencePolicy::Baseline);
    }

    #[test]
    fn test_marker_history_reference() {
        let mut history = MarkerHistory::new();
        history.record(1, MarkerSet::new(vec![(10, 10)]));
        history.record(2, MarkerSet::new(vec![(11, 10)]));
        // Pass 3 is missing.
        let current = MarkerSet::new(vec![(14, 12)]);

        let (pass, _) = history.reference_for(7, 2, ReferencePolicy::Previous).unwrap();
        assert_eq!(pass, 1);
        match history.register(7, 4, &current, ReferencePolicy::Previous) {
            Err(VirionError::RegistrationUnavailable{spot, pass, ..}) => {
                assert_eq!((spot, pass), (7, 4));
            },
            other => panic!("unexpected {:?}", other),
        }
        let registration = history.register(7, 4, &current, ReferencePolicy::Baseline).unwrap();
        assert!(registration.valid);
        assert_abs_diff_eq!(registration.shift.rows, 4.0);
        assert_abs_diff_eq!(registration.shift.cols, 2.0);
        assert_eq!(history.baseline_pass(), Some(1));
    }
}  // mod tests.
