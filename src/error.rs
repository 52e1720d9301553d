//! Error taxonomy shared by every stage of crown reconstruction.
//!
//! Errors are raised where they are detected and propagate unchanged. Nothing
//! in this crate substitutes a default radius, elevation or normal for an
//! invalid one.

use thiserror::Error;

/// Failures of crown geometry, sampling, hull extraction and meshing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CrownError {
    /// Malformed input parameters, rejected at construction.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Geometry that passed construction but cannot be evaluated
    /// (zero height, zero crown length, all radii zero, ...).
    #[error("degenerate tree: {0}")]
    DegenerateTree(String),

    #[error("{axis} resolution {requested} is below the minimum of {minimum}")]
    InsufficientResolution {
        axis: &'static str,
        requested: usize,
        minimum: usize,
    },

    #[error("point set is empty")]
    EmptyPointSet,

    #[error("{points} points is too few for neighborhood analysis (need at least {required})")]
    InsufficientNeighbors { points: usize, required: usize },

    #[error("{inconsistent} of {total} normals are not consistently oriented")]
    InconsistentNormals { inconsistent: usize, total: usize },

    #[error("point cloud carries no normals")]
    MissingNormals,

    #[error("reconstruction depth {depth} is outside {min}..={max}")]
    InvalidDepth { depth: u32, min: u32, max: u32 },

    #[error("solver did not converge after {iterations} iterations (relative residual {residual:.3e})")]
    NotConverged { iterations: usize, residual: f64 },

    /// The implicit function never crossed its iso-value inside the grid.
    #[error("reconstruction produced no surface")]
    EmptySurface,

    /// The mesh encloses a volume too far from that of the sampled crown,
    /// usually because the grid is too coarse for its thinnest parts.
    #[error("reconstructed volume {reconstructed:.3} differs from the crown volume {expected:.3}")]
    VolumeMismatch { expected: f64, reconstructed: f64 },

    #[error("location ({x:.3}, {y:.3}) lies outside the raster extent [{xmin:.3}, {xmax:.3}] x [{ymin:.3}, {ymax:.3}]")]
    OutOfBounds {
        x: f64,
        y: f64,
        xmin: f64,
        xmax: f64,
        ymin: f64,
        ymax: f64,
    },

    #[error("statistics: {0}")]
    Statistics(String),
}

pub type Result<T> = std::result::Result<T, CrownError>;

impl CrownError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        CrownError::InvalidGeometry(msg.into())
    }

    pub(crate) fn degenerate(msg: impl Into<String>) -> Self {
        CrownError::DegenerateTree(msg.into())
    }
}
