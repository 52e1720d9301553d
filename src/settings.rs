use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::PathBuf;

use crate::config::{
    DEFAULT_MAX_VOLUME_ERROR, DEFAULT_NEIGHBORS, MAX_DEPTH, MAX_INCONSISTENT_FRACTION, MIN_DEPTH,
    MIN_NEIGHBORHOOD_POINTS, MIN_RESOLUTION,
};
use crate::normals::NormalSource;
use crate::sampling::{CrownPart, SamplingScheme};


/// Grid and scheme used to sample the crown surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingSettings {
    pub angular_resolution: usize,
    pub vertical_resolution: usize,
    pub scheme: SamplingScheme,
    pub part: CrownPart,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            angular_resolution: 32,
            vertical_resolution: 40,
            scheme: SamplingScheme::Structured,
            part: CrownPart::Full,
        }
    }
}

/// Neighborhood and tolerance used to estimate and check normals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalSettings {
    pub source: NormalSource,
    pub neighbors: usize,
    /// Largest fraction of inward or non-finite normals that is tolerated.
    pub max_inconsistent_fraction: f64,
}

impl Default for NormalSettings {
    fn default() -> Self {
        Self {
            source: NormalSource::Analytic,
            neighbors: DEFAULT_NEIGHBORS,
            max_inconsistent_fraction: MAX_INCONSISTENT_FRACTION,
        }
    }
}

/// Implicit-surface reconstruction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoissonSettings {
    /// The grid has `2^depth` cells per axis.
    pub depth: u32,
    /// Ratio between the grid cube and the bounding cube of the samples.
    pub scale: f64,
    /// Relative residual at which the conjugate-gradient solve stops.
    pub solver_tolerance: f64,
    pub max_iterations: usize,
    /// Drop faces whose vertices fall below this sample-density quantile.
    pub trim_quantile: Option<f64>,
    /// Largest relative difference between the mesh volume and the crown
    /// volume before a full-crown reconstruction is rejected.
    pub max_volume_error: Option<f64>,
}

impl Default for PoissonSettings {
    fn default() -> Self {
        Self {
            depth: 6,
            scale: 1.25,
            solver_tolerance: 1e-7,
            max_iterations: 2000,
            trim_quantile: None,
            max_volume_error: Some(DEFAULT_MAX_VOLUME_ERROR),
        }
    }
}

impl PoissonSettings {
    pub fn with_depth(depth: u32) -> Self {
        Self {
            depth,
            ..Self::default()
        }
    }
}

/// Runtime configuration for crown reconstruction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub sampling: SamplingSettings,
    pub normals: NormalSettings,
    pub poisson: PoissonSettings,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.sampling.angular_resolution < MIN_RESOLUTION
            || self.sampling.vertical_resolution < MIN_RESOLUTION
        {
            bail!(
                "sampling resolutions must be at least {}, got {} x {}",
                MIN_RESOLUTION,
                self.sampling.angular_resolution,
                self.sampling.vertical_resolution
            );
        }
        if self.normals.neighbors < MIN_NEIGHBORHOOD_POINTS - 1 {
            bail!(
                "normal estimation needs at least {} neighbors, got {}",
                MIN_NEIGHBORHOOD_POINTS - 1,
                self.normals.neighbors
            );
        }
        if !(0.0..=1.0).contains(&self.normals.max_inconsistent_fraction) {
            bail!(
                "max_inconsistent_fraction must lie in [0, 1], got {}",
                self.normals.max_inconsistent_fraction
            );
        }
        if !(MIN_DEPTH..=MAX_DEPTH).contains(&self.poisson.depth) {
            bail!(
                "poisson depth must lie in {}..={}, got {}",
                MIN_DEPTH,
                MAX_DEPTH,
                self.poisson.depth
            );
        }
        if !(self.poisson.scale >= 1.0) {
            bail!("poisson scale must be at least 1, got {}", self.poisson.scale);
        }
        if !(self.poisson.solver_tolerance > 0.0) || self.poisson.max_iterations == 0 {
            bail!("solver tolerance and iteration cap must be positive");
        }
        if let Some(q) = self.poisson.trim_quantile {
            if !(0.0..=1.0).contains(&q) {
                bail!("trim quantile must lie in [0, 1], got {}", q);
            }
        }
        if let Some(e) = self.poisson.max_volume_error {
            if !(e > 0.0) {
                bail!("max volume error must be positive, got {}", e);
            }
        }
        Ok(())
    }
}

/// Loads `config/default.toml` only.
pub fn load_default_config() -> Result<Settings> {
    let root = retrieve_project_root()?;
    let default_config_file = root.join("config/default.toml");

    let settings: Settings = Config::builder()
        .add_source(File::from(default_config_file).required(true))
        .build()
        .context("loading default configuration")?
        .try_deserialize()
        .context("deserializing default configuration")?;

    settings.validate()?;
    Ok(settings)
}

/// Loads `config/default.toml`, then `config/local.toml` if present, then
/// `TREECROWN_*` environment overrides (nested keys separated by `__`, e.g.
/// `TREECROWN_POISSON__DEPTH=7`).
pub fn load_config() -> Result<Settings> {
    let root = retrieve_project_root()?;
    let default_config_file = root.join("config/default.toml");
    let local_config = root.join("config/local.toml");

    if local_config.exists() {
        log::info!("using local configuration: {:?}", local_config);
    }

    let settings: Settings = Config::builder()
        .add_source(File::from(default_config_file).required(true))
        .add_source(File::from(local_config).required(false))
        .add_source(
            Environment::with_prefix("TREECROWN")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("loading configuration")?
        .try_deserialize()
        .context("deserializing configuration")?;

    settings.validate()?;
    log::debug!("{}", settings);
    Ok(settings)
}

/// Retrieve the project root directory.
/// This function tries to find the project root directory in different ways:
/// 1. If the CARGO_MANIFEST_DIR environment variable is set, use it.
/// 2. If the TREECROWN_ROOT_DIR environment variable is set, use it.
/// 3. If the "config" subdirectory is found in the executable directory or any of its parents, use it.
fn retrieve_project_root() -> Result<PathBuf> {
    if let Ok(manifest_dir) = env::var("CARGO_MANIFEST_DIR") {
        return Ok(PathBuf::from(manifest_dir));
    }
    if let Ok(path) = env::var("TREECROWN_ROOT_DIR") {
        return Ok(PathBuf::from(path));
    }
    let exe_path = env::current_exe().context("locating the current executable")?;
    exe_path
        .ancestors()
        .skip(1)
        .find(|dir| dir.join("config").is_dir())
        .map(|dir| dir.to_path_buf())
        .context("could not find a project root containing config/")
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Settings:
  - Sampling: {} x {} ({:?}, {:?})
  - Normals: {:?}, k = {}, max inconsistent = {:.3}
  - Poisson: depth {}, scale {:.3}, tolerance {:.1e}, max iterations {}
  - Trim quantile: {:?}, max volume error: {:?}
  ",
            self.sampling.angular_resolution,
            self.sampling.vertical_resolution,
            self.sampling.scheme,
            self.sampling.part,
            self.normals.source,
            self.normals.neighbors,
            self.normals.max_inconsistent_fraction,
            self.poisson.depth,
            self.poisson.scale,
            self.poisson.solver_tolerance,
            self.poisson.max_iterations,
            self.poisson.trim_quantile,
            self.poisson.max_volume_error,
        )
    }
}
