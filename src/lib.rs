//! Counts virions and other nanoparticles bound to the antibody spots of an
//! interferometric imaging chip.
//!
//! Each spot is imaged repeatedly (one "pass" per incubation step), and every
//! pass is a stack of planes taken while sweeping focus through the chip
//! surface. A bound particle shows up as a small spot whose intensity rises
//! and falls sinusoidally through the stack. Counting proceeds pass by pass:
//!
//! * Fiducial markers etched in the chip are found by template correlation
//!   ([markers]) and compared with an earlier pass's to measure stage drift
//!   ([registration]).
//! * The antibody spot is found once with a circular Hough transform and then
//!   carried along by the drift ([spot]).
//! * Particles counted on earlier passes are masked off, so a pass reports only
//!   newly bound particles ([identity_mask]).
//! * Candidate pixels are picked by the shape index of the focus plane and
//!   grouped into blobs ([shape]); each blob must show a point-spread-like
//!   focus response on a quiet background to be accepted ([validator]).
//! * Per-pass and cumulative counts and densities are kept per spot
//!   ([aggregate]).
//!
//! [pipeline] ties these together: [pipeline::SpotAnalysis] holds one spot's
//! state across passes and [pipeline::analyze_chip()] runs the spots of a chip
//! in parallel. Parameters live in [config::AnalysisConfig].

pub mod aggregate;
pub mod config;
pub mod error;
pub mod histogram_funcs;
pub mod identity_mask;
pub mod image_funcs;
pub mod markers;
pub mod pipeline;
pub mod registration;
pub mod shape;
pub mod spot;
pub mod validator;
