//! Error types for tiled sampling

use thiserror::Error;

use crate::geometry::Axis;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, TilingError>;

/// Errors raised while planning or running a tiled diffusion job
///
/// Every variant is deterministic for a given input: the same configuration
/// always fails the same way, so none of them is worth retrying.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TilingError {
    // Input validation
    #[error("failed to load config: {0}")]
    Config(String),

    #[error("{name} grid has no rows or no columns")]
    EmptyGrid { name: &'static str },

    #[error("{name} grid is not rectangular: row {row} has {found} columns, expected {expected}")]
    RaggedGrid {
        name: &'static str,
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("{name} grid is {found:?} (rows, cols), expected {expected:?} to match the prompt grid")]
    GridShapeMismatch {
        name: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("invalid tile geometry: {0}")]
    InvalidGeometry(String),

    #[error("invalid reroll region #{index}: {reason}")]
    InvalidRerollRegion { index: usize, reason: String },

    #[error("unknown seed tiles mode {0:?}, expected one of [\"full\", \"exclusive\"]")]
    UnknownSeedMode(String),

    #[error("number of inference steps must be at least 1")]
    InvalidStepCount,

    #[error("batch size must be at least 1")]
    InvalidBatchSize,

    #[error("tile ({row}, {col}) is guided but has no unconditional embedding")]
    MissingUnconditional { row: usize, col: usize },

    // Geometry
    #[error("exclusive region of tile ({row}, {col}) splits into disjoint {axis} intervals")]
    FragmentedExclusiveRegion { row: usize, col: usize, axis: Axis },

    #[error("tile ({row}, {col}) has no exclusive {axis} extent, neighbours cover all of it")]
    EmptyExclusiveRegion { row: usize, col: usize, axis: Axis },

    #[error("latent position ({row}, {col}) is not covered by any tile")]
    UncoveredCanvas { row: usize, col: usize },

    // Numerical
    #[error("{name}: {nan} NaN and {inf} Inf values")]
    NonFinite { name: String, nan: usize, inf: usize },

    #[error("sampling cancelled before step {step}")]
    Cancelled { step: usize },

    #[error("tensor data conversion failed: {0}")]
    TensorData(String),
}

impl TilingError {
    /// True for errors caused by the caller's parameters
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::EmptyGrid { .. }
                | Self::RaggedGrid { .. }
                | Self::GridShapeMismatch { .. }
                | Self::InvalidGeometry(_)
                | Self::InvalidRerollRegion { .. }
                | Self::UnknownSeedMode(_)
                | Self::InvalidStepCount
                | Self::InvalidBatchSize
                | Self::MissingUnconditional { .. }
        )
    }

    /// True for errors caused by a tile layout the algorithm cannot express
    pub fn is_geometry(&self) -> bool {
        matches!(
            self,
            Self::FragmentedExclusiveRegion { .. }
                | Self::EmptyExclusiveRegion { .. }
                | Self::UncoveredCanvas { .. }
        )
    }
}
