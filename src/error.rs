use thiserror::Error;

/// Conditions raised while analyzing a spot's pass sequence. Most of these are
/// recovered by the pass loop and surface only as a [crate::aggregate::PassStatus];
/// `GeometryNotFound` and the input/glue variants end the spot's analysis.
#[derive(Error, Debug)]
pub enum VirionError {
    #[error("no registration reference for spot {spot} pass {pass}: {reason}")]
    RegistrationUnavailable { spot: u32, pass: u32, reason: String },

    #[error("no spot circle found for spot {spot} pass {pass}")]
    GeometryNotFound { spot: u32, pass: u32 },

    #[error("point-spread fit did not converge after {iterations} iterations")]
    FitNonConvergence { iterations: usize },

    #[error("no images for spot {spot} pass {pass}")]
    MissingPassData { spot: u32, pass: u32 },

    #[error("marker search gave up after {iterations} threshold relaxations")]
    MarkerSearchExhausted { iterations: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VirionError>;
