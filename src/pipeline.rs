//! Reconstruction of crown meshes from raw tree parameters.
//!
//! A run walks a fixed chain of stages:
//!
//! Geometry -> Sampling -> Normals -> Reconstruction -> Trimming
//!
//! Each stage returns a `Result`; the first failure is tagged with its
//! [`Stage`] so callers can tell bad input apart from a reconstruction that
//! did not converge. Independent trees can be run in parallel with
//! [`PoissonPipeline::run_batch`].
//!
//! A full-crown mesh whose volume strays too far from the volume of the
//! crown it was sampled from is rejected at the reconstruction stage, so a
//! grid too coarse for a thin crown never passes as a result.

use std::fmt;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{CrownError, Result};
use crate::mesh::Mesh;
use crate::normals::{check_orientation, estimate_normals, NormalSource};
use crate::poisson::poisson_mesh;
use crate::raster::RasterQuery;
use crate::sampling::{sample_crown, CrownPart, PointCloud};
use crate::settings::{PoissonSettings, Settings};
use crate::tree::{Tree, TreeParams};


/// One step of the reconstruction chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Geometry,
    Sampling,
    Normals,
    Reconstruction,
    Trimming,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Geometry => "geometry",
            Stage::Sampling => "sampling",
            Stage::Normals => "normals",
            Stage::Reconstruction => "reconstruction",
            Stage::Trimming => "trimming",
        };
        write!(f, "{}", name)
    }
}

/// A [`CrownError`] tagged with the stage that raised it.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{stage} stage failed: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: CrownError,
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

trait AtStage<T> {
    fn at(self, stage: Stage) -> PipelineResult<T>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: Stage) -> PipelineResult<T> {
        self.map_err(|source| PipelineError { stage, source })
    }
}

/// Sampling, normal estimation, Poisson reconstruction and trimming with
/// one fixed configuration.
#[derive(Debug, Clone, Default)]
pub struct PoissonPipeline {
    settings: Settings,
}

impl PoissonPipeline {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Default settings with the given sampling grid and reconstruction depth.
    pub fn with_resolution(
        angular_resolution: usize,
        vertical_resolution: usize,
        depth: u32,
    ) -> Self {
        let mut settings = Settings::default();
        settings.sampling.angular_resolution = angular_resolution;
        settings.sampling.vertical_resolution = vertical_resolution;
        settings.poisson = PoissonSettings::with_depth(depth);
        Self { settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Builds the tree from `params` and reconstructs its crown.
    pub fn run(&self, params: &TreeParams) -> PipelineResult<Mesh> {
        let tree = check_params(params)
            .and_then(|_| Tree::new(params.clone()))
            .at(Stage::Geometry)?;
        self.run_tree(&tree)
    }

    /// As [`PoissonPipeline::run`], taking the ground elevation from `raster`
    /// when `params` carries none.
    pub fn run_on<R: RasterQuery + ?Sized>(
        &self,
        params: &TreeParams,
        raster: &R,
    ) -> PipelineResult<Mesh> {
        let tree = check_params(params)
            .and_then(|_| Tree::from_raster(params.clone(), raster))
            .at(Stage::Geometry)?;
        self.run_tree(&tree)
    }

    /// Reconstructs the crown of an existing tree.
    pub fn run_tree(&self, tree: &Tree) -> PipelineResult<Mesh> {
        let start = Instant::now();
        check_params(tree.params()).at(Stage::Geometry)?;

        let sampling = &self.settings.sampling;
        let cloud = sample_crown(
            tree,
            sampling.angular_resolution,
            sampling.vertical_resolution,
            &sampling.scheme,
            sampling.part,
        )
        .at(Stage::Sampling)?;

        let cloud = self.oriented(cloud).at(Stage::Normals)?;

        let mut mesh = poisson_mesh(&cloud, &self.settings.poisson).at(Stage::Reconstruction)?;
        if sampling.part == CrownPart::Full {
            if let Some(tolerance) = self.settings.poisson.max_volume_error {
                check_volume(&mesh, tree, tolerance).at(Stage::Reconstruction)?;
            }
        }

        if let Some(quantile) = self.settings.poisson.trim_quantile {
            mesh = mesh.trim(quantile).at(Stage::Trimming)?;
        }

        log::info!(
            "{} crown at ({:.2}, {:.2}): {} faces, volume {:.3} in {:.2?}",
            tree.species(),
            tree.stem_base().x,
            tree.stem_base().y,
            mesh.faces.len(),
            mesh.volume(),
            start.elapsed()
        );
        Ok(mesh)
    }

    fn oriented(&self, cloud: PointCloud) -> Result<PointCloud> {
        let normals = &self.settings.normals;
        match normals.source {
            NormalSource::Analytic => {
                check_orientation(&cloud, normals.max_inconsistent_fraction)?;
                Ok(cloud)
            }
            NormalSource::Estimated => estimate_normals(&cloud, normals),
        }
    }

    /// Runs every tree in parallel. Results are in input order.
    pub fn run_batch(&self, trees: &[TreeParams]) -> Vec<PipelineResult<Mesh>> {
        let start = Instant::now();
        let pb = ProgressBar::new(trees.len() as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] {bar:40.green/blue} {pos:>5}/{len:5} {msg} ETA: {eta_precise}",
            )
            .map(|style| style.progress_chars("█▇▆▅▄▃▂▁"))
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb.set_message("tree".to_string());

        let results: Vec<_> = trees
            .par_iter()
            .map(|params| {
                let result = self.run(params);
                pb.inc(1);
                result
            })
            .collect();
        pb.finish_and_clear();

        let failed = results.iter().filter(|r| r.is_err()).count();
        log::info!(
            "reconstructed {} of {} crowns in {:.2?}",
            trees.len() - failed,
            trees.len(),
            start.elapsed()
        );
        results
    }
}

/// The crown must have length before anything is sampled.
fn check_params(params: &TreeParams) -> Result<()> {
    let base = params.resolved_crown_base_height();
    if base >= params.height {
        return Err(CrownError::invalid(format!(
            "crown base height {} is not below the tree height {}",
            base, params.height
        )));
    }
    Ok(())
}

fn check_volume(mesh: &Mesh, tree: &Tree, tolerance: f64) -> Result<()> {
    let expected = tree.crown_volume();
    let reconstructed = mesh.volume();
    if !((reconstructed - expected).abs() <= tolerance * expected) {
        log::debug!(
            "mesh volume {:.3} against crown volume {:.3}",
            reconstructed,
            expected
        );
        return Err(CrownError::VolumeMismatch {
            expected,
            reconstructed,
        });
    }
    Ok(())
}

/// Reconstructs one tree with the given sampling grid and depth.
pub fn poisson_pipeline(
    tree: &Tree,
    angular_resolution: usize,
    vertical_resolution: usize,
    depth: u32,
) -> PipelineResult<Mesh> {
    PoissonPipeline::with_resolution(angular_resolution, vertical_resolution, depth).run_tree(tree)
}
