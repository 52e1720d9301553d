//! Asymmetric tree-crown geometry and reconstruction.
//!
//! A [`tree::Tree`] holds one tree's field measurements and evaluates its
//! quadrant-wise crown surface. [`sampling`] turns that surface into point
//! clouds, [`boundary`] extracts plot and footprint polygons, and
//! [`pipeline`] reconstructs watertight crown meshes via [`normals`] and
//! [`poisson`].

pub mod bins;
pub mod boundary;
pub mod config;
pub mod error;
pub mod geom;
pub mod mesh;
pub mod normals;
pub mod pipeline;
pub mod poisson;
pub mod raster;
pub mod sampling;
pub mod settings;
pub mod tree;

pub use error::{CrownError, Result};
pub use pipeline::{PipelineError, PoissonPipeline, Stage};
pub use tree::{Tree, TreeParams};
