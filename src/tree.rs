//! The crown geometry model of a single standing tree.
//!
//! A [`Tree`] is built once from validated [`TreeParams`] and never mutated.
//! Derived geometry (apex, base, peripheral points, default hull) is
//! computed on first access and cached; to change a parameter, build a new
//! tree.

use std::f64::consts::FRAC_2_PI;
use std::sync::OnceLock;

use nalgebra::{Point2, Point3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::config::{self, CROWN_VOLUME_ANGLES, CROWN_VOLUME_LEVELS, DEFAULT_CROWN_RATIO};
use crate::error::{CrownError, Result};
use crate::geom::{blend_directional, CrownProfile, Direction, Quadrant};
use crate::raster::RasterQuery;
use crate::sampling::{self, CrownPart, PointCloud, SamplingScheme};


fn default_crown_ratio() -> f64 {
    DEFAULT_CROWN_RATIO
}

fn default_crown_shapes() -> [[f64; 2]; 4] {
    [[1.0, 1.0]; 4]
}

/// Field-measured attributes of one tree, as produced by tree-list ingestion.
///
/// Per-direction arrays are ordered E, N, W, S. Heights are measured above
/// the stem base; `stem_z` is the absolute ground elevation at the stem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeParams {
    pub species: String,
    /// Stem diameter at reference height, in the same units as the radii.
    pub dbh: f64,
    pub height: f64,
    pub stem_x: f64,
    pub stem_y: f64,
    #[serde(default)]
    pub stem_z: Option<f64>,
    #[serde(default = "default_crown_ratio")]
    pub crown_ratio: f64,
    /// Overrides `crown_ratio` when present.
    #[serde(default)]
    pub crown_base_height: Option<f64>,
    pub crown_radii: [f64; 4],
    /// Height of maximum crown width per direction. Defaults to mid-crown,
    /// halfway between crown base and top rather than half the tree height.
    #[serde(default)]
    pub crown_edge_heights: Option<[f64; 4]>,
    /// `[top, bottom]` shape exponents per direction.
    #[serde(default = "default_crown_shapes")]
    pub crown_shapes: [[f64; 2]; 4],
    /// Degrees counter-clockwise from east.
    #[serde(default)]
    pub lean_direction: f64,
    /// Degrees from vertical, in [0, 90).
    #[serde(default)]
    pub lean_severity: f64,
    /// Koop eccentricity index in [-1, 1]. Derived from the radii when absent.
    #[serde(default)]
    pub eccentricity: Option<f64>,
}

impl TreeParams {
    /// Creates parameters with crown radii of a quarter of the height, no
    /// lean, conic shapes and the default crown ratio.
    pub fn new(species: &str, dbh: f64, height: f64, stem_x: f64, stem_y: f64) -> Self {
        Self {
            species: species.to_string(),
            dbh,
            height,
            stem_x,
            stem_y,
            stem_z: None,
            crown_ratio: DEFAULT_CROWN_RATIO,
            crown_base_height: None,
            crown_radii: [0.25 * height; 4],
            crown_edge_heights: None,
            crown_shapes: default_crown_shapes(),
            lean_direction: 0.0,
            lean_severity: 0.0,
            eccentricity: None,
        }
    }

    pub fn with_ground_elevation(mut self, stem_z: f64) -> Self {
        self.stem_z = Some(stem_z);
        self
    }

    pub fn with_crown_ratio(mut self, crown_ratio: f64) -> Self {
        self.crown_ratio = crown_ratio;
        self
    }

    pub fn with_crown_base_height(mut self, height: f64) -> Self {
        self.crown_base_height = Some(height);
        self
    }

    pub fn with_crown_radii(mut self, radii: [f64; 4]) -> Self {
        self.crown_radii = radii;
        self
    }

    pub fn with_crown_edge_heights(mut self, heights: [f64; 4]) -> Self {
        self.crown_edge_heights = Some(heights);
        self
    }

    pub fn with_crown_shapes(mut self, shapes: [[f64; 2]; 4]) -> Self {
        self.crown_shapes = shapes;
        self
    }

    pub fn with_lean(mut self, direction: f64, severity: f64) -> Self {
        self.lean_direction = direction;
        self.lean_severity = severity;
        self
    }

    pub fn with_eccentricity(mut self, index: f64) -> Self {
        self.eccentricity = Some(index);
        self
    }

    /// Crown-base height above the stem base implied by these parameters.
    pub fn resolved_crown_base_height(&self) -> f64 {
        self.crown_base_height
            .unwrap_or(self.height * (1.0 - self.crown_ratio))
    }

    fn validate(&self) -> Result<()> {
        let scalars = [
            ("dbh", self.dbh),
            ("height", self.height),
            ("stem_x", self.stem_x),
            ("stem_y", self.stem_y),
            ("crown_ratio", self.crown_ratio),
            ("lean_direction", self.lean_direction),
            ("lean_severity", self.lean_severity),
        ];
        for (name, value) in scalars {
            if !value.is_finite() {
                return Err(CrownError::invalid(format!("{} is not finite", name)));
            }
        }
        if self.height < 0.0 {
            return Err(CrownError::invalid(format!(
                "height must be >= 0, got {}",
                self.height
            )));
        }
        if self.dbh < 0.0 {
            return Err(CrownError::invalid(format!(
                "dbh must be >= 0, got {}",
                self.dbh
            )));
        }
        if !(0.0..=1.0).contains(&self.crown_ratio) {
            return Err(CrownError::invalid(format!(
                "crown_ratio must lie in [0, 1], got {}",
                self.crown_ratio
            )));
        }
        let base = self.resolved_crown_base_height();
        if !base.is_finite() || base < 0.0 || base > self.height {
            return Err(CrownError::invalid(format!(
                "crown base height {} must lie between 0 and the tree height {}",
                base, self.height
            )));
        }
        if !(0.0..90.0).contains(&self.lean_severity) {
            return Err(CrownError::invalid(format!(
                "lean_severity must be in [0, 90) degrees from vertical, got {}",
                self.lean_severity
            )));
        }
        if let Some(k) = self.eccentricity {
            if !(-1.0..=1.0).contains(&k) {
                return Err(CrownError::invalid(format!(
                    "eccentricity index must lie in [-1, 1], got {}",
                    k
                )));
            }
        }
        for direction in Direction::ALL {
            let i = direction.index();
            let radius = self.crown_radii[i];
            if !radius.is_finite() || radius < 0.0 {
                return Err(CrownError::invalid(format!(
                    "{} crown radius must be a non-negative number, got {}",
                    direction, radius
                )));
            }
            let [top, bottom] = self.crown_shapes[i];
            if !(top.is_finite() && top > 0.0 && bottom.is_finite() && bottom > 0.0) {
                return Err(CrownError::invalid(format!(
                    "{} shape exponents must be positive, got top {} bottom {}",
                    direction, top, bottom
                )));
            }
        }
        if let Some(heights) = self.crown_edge_heights {
            // only meaningful when the crown has length
            if self.height > base {
                for direction in Direction::ALL {
                    let h = heights[direction.index()];
                    if !(h > base && h < self.height) {
                        return Err(CrownError::invalid(format!(
                            "{} edge height {} must lie strictly between crown base {} and top {}",
                            direction, h, base, self.height
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// One standing tree with its asymmetric crown.
#[derive(Debug, Clone)]
pub struct Tree {
    params: TreeParams,
    ground: f64,
    crown_base_height: f64,
    profiles: [CrownProfile; 4],
    apex_and_base: OnceLock<(Point3<f64>, Point3<f64>)>,
    eccentricity: OnceLock<f64>,
    peripheral: OnceLock<[Point3<f64>; 4]>,
    hull: OnceLock<Result<PointCloud>>,
    volume: OnceLock<f64>,
}

impl Tree {
    /// Validates `params` and builds the tree. The ground elevation must be
    /// supplied in `params.stem_z`; see [`Tree::from_raster`] otherwise.
    pub fn new(params: TreeParams) -> Result<Self> {
        params.validate()?;
        let ground = match params.stem_z {
            Some(z) if z.is_finite() => z,
            Some(z) => {
                return Err(CrownError::invalid(format!(
                    "ground elevation is not finite: {}",
                    z
                )))
            }
            None => return Err(CrownError::invalid("no ground elevation supplied")),
        };

        let crown_base_height = params.resolved_crown_base_height();
        let mid_crown = crown_base_height + (params.height - crown_base_height) / 2.0;
        let edge_heights = params.crown_edge_heights.unwrap_or([mid_crown; 4]);

        let profiles = Direction::ALL.map(|direction| {
            let i = direction.index();
            CrownProfile {
                radius: params.crown_radii[i],
                edge_height: ground + edge_heights[i],
                top_shape: params.crown_shapes[i][0],
                bottom_shape: params.crown_shapes[i][1],
            }
        });

        Ok(Self {
            params,
            ground,
            crown_base_height,
            profiles,
            apex_and_base: OnceLock::new(),
            eccentricity: OnceLock::new(),
            peripheral: OnceLock::new(),
            hull: OnceLock::new(),
            volume: OnceLock::new(),
        })
    }

    /// Builds a tree, looking up the ground elevation from `raster` when the
    /// parameters do not carry one.
    pub fn from_raster<R: RasterQuery + ?Sized>(mut params: TreeParams, raster: &R) -> Result<Self> {
        if params.stem_z.is_none() {
            params.stem_z = Some(raster.elevation_at(params.stem_x, params.stem_y)?);
        }
        Self::new(params)
    }

    pub fn params(&self) -> &TreeParams {
        &self.params
    }

    pub fn species(&self) -> &str {
        &self.params.species
    }

    pub fn dbh(&self) -> f64 {
        self.params.dbh
    }

    pub fn height(&self) -> f64 {
        self.params.height
    }

    pub fn stem_base(&self) -> Point3<f64> {
        Point3::new(self.params.stem_x, self.params.stem_y, self.ground)
    }

    /// Crown-base height above the stem base.
    pub fn crown_base_height(&self) -> f64 {
        self.crown_base_height
    }

    /// Fraction of the total height occupied by the crown.
    pub fn crown_ratio(&self) -> f64 {
        if self.params.height > 0.0 {
            (self.params.height - self.crown_base_height) / self.params.height
        } else {
            self.params.crown_ratio
        }
    }

    /// Absolute elevation of the crown apex.
    pub fn apex_z(&self) -> f64 {
        self.ground + self.params.height
    }

    /// Absolute elevation of the crown base.
    pub fn base_z(&self) -> f64 {
        self.ground + self.crown_base_height
    }

    pub fn profile(&self, direction: Direction) -> &CrownProfile {
        &self.profiles[direction.index()]
    }

    pub fn profiles(&self) -> &[CrownProfile; 4] {
        &self.profiles
    }

    /// Horizontal displacement of the apex caused by lean alone.
    pub fn lean_offset(&self) -> Vector2<f64> {
        let reach = self.params.height * self.params.lean_severity.to_radians().tan();
        let direction = self.params.lean_direction.to_radians();
        Vector2::new(reach * direction.cos(), reach * direction.sin())
    }

    /// Half-differences of opposing radii, pointing toward the wider side.
    fn asymmetry(&self) -> Vector2<f64> {
        let r = &self.params.crown_radii;
        Vector2::new((r[0] - r[2]) / 2.0, (r[1] - r[3]) / 2.0)
    }

    fn mean_radius(&self) -> f64 {
        self.params.crown_radii.iter().sum::<f64>() / 4.0
    }

    /// Koop eccentricity index: distance between the stem and the crown apex
    /// as a fraction of the mean crown radius.
    pub fn eccentricity_index(&self) -> f64 {
        if let Some(k) = self.params.eccentricity {
            return k;
        }
        let mean = self.mean_radius();
        if mean == 0.0 {
            return 0.0;
        }
        FRAC_2_PI * (self.asymmetry().norm() / mean).atan() * self.crown_ratio()
    }

    /// Horizontal displacement of the apex caused by crown asymmetry.
    pub fn eccentricity_offset(&self) -> Vector2<f64> {
        let asymmetry = self.asymmetry();
        let norm = asymmetry.norm();
        if norm == 0.0 {
            return Vector2::zeros();
        }
        asymmetry / norm * (self.eccentricity_index() * self.mean_radius())
    }

    /// Crown apex and crown base positions.
    ///
    /// The base sits on the stem axis at crown-base height. The apex sits at
    /// the top of the tree, displaced by lean and by crown eccentricity.
    pub fn crown_apex_and_base(&self) -> (Point3<f64>, Point3<f64>) {
        *self.apex_and_base.get_or_init(|| {
            let offset = self.lean_offset() + self.eccentricity_offset();
            let apex = Point3::new(
                self.params.stem_x + offset.x,
                self.params.stem_y + offset.y,
                self.apex_z(),
            );
            let base = Point3::new(self.params.stem_x, self.params.stem_y, self.base_z());
            (apex, base)
        })
    }

    /// Horizontal centre of the crown cross-section at elevation `z`,
    /// interpolated linearly between crown base and apex.
    pub fn crown_center_at(&self, z: f64) -> Point2<f64> {
        let (apex, base) = self.crown_apex_and_base();
        let span = apex.z - base.z;
        let t = if span > 0.0 {
            ((z - base.z) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Point2::new(base.x + t * (apex.x - base.x), base.y + t * (apex.y - base.y))
    }

    /// Unblended profile radius along one cardinal direction.
    pub fn directional_radius_at(&self, direction: Direction, z: f64) -> f64 {
        self.profile(direction)
            .radius_at(z, self.base_z(), self.apex_z())
    }

    /// Crown radius at compass `angle` (degrees, counter-clockwise from east)
    /// and absolute elevation `z`, measured from [`Tree::crown_center_at`].
    pub fn crown_radius_at(&self, angle: f64, z: f64) -> f64 {
        let (quadrant, local) = Quadrant::locate(angle);
        let (start, end) = quadrant.bounds();
        blend_directional(
            self.directional_radius_at(start, z),
            self.directional_radius_at(end, z),
            local,
        )
    }

    /// Unit outward normal of the crown surface at compass `angle` and
    /// elevation `z`.
    ///
    /// The surface is parameterised as `c(z) + r(angle, z) * u(angle)`, with
    /// `c` the crown centre and `u` the horizontal unit vector at `angle`;
    /// the normal is the cross product of its angular and vertical
    /// tangents, so lean, eccentricity and concave profiles are all
    /// accounted for. Points at or beyond the apex face up, at or below the
    /// base face down.
    pub fn crown_normal_at(&self, angle: f64, z: f64) -> Vector3<f64> {
        let (apex, base) = self.crown_apex_and_base();
        if z >= apex.z {
            return Vector3::z();
        }
        if z <= base.z {
            return -Vector3::z();
        }
        let (quadrant, local) = Quadrant::locate(angle);
        let (start, end) = quadrant.bounds();
        let (base_z, apex_z) = (base.z, apex.z);
        let [ra, rb] = [start, end].map(|d| self.profile(d).radius_at(z, base_z, apex_z));
        let [sa, sb] = [start, end].map(|d| self.profile(d).slope_at(z, base_z, apex_z));

        let r = blend_directional(ra, rb, local);
        let dr_dz = blend_directional(sa, sb, local);
        // derivative of the squared-cosine blend, per radian
        let dr_dtheta = (rb - ra) * (2.0 * local.to_radians()).sin();

        let theta = angle.to_radians();
        let radial = Vector3::new(theta.cos(), theta.sin(), 0.0);
        let tangential = Vector3::new(-theta.sin(), theta.cos(), 0.0);
        // horizontal drift of the crown centre per unit height, with unit z
        let drift = (apex - base) / (apex.z - base.z);

        let around = radial * dr_dtheta + tangential * r;
        let up = drift + radial * dr_dz;
        around
            .cross(&up)
            .try_normalize(f64::EPSILON)
            .unwrap_or(radial)
    }

    /// Volume enclosed by the crown surface, integrated numerically over
    /// horizontal slices and cached. Lean shears the slices without
    /// changing their area, so it does not affect the result.
    pub fn crown_volume(&self) -> f64 {
        *self.volume.get_or_init(|| {
            let (base_z, apex_z) = (self.base_z(), self.apex_z());
            let dz = (apex_z - base_z) / CROWN_VOLUME_LEVELS as f64;
            let dtheta = 360.0 / CROWN_VOLUME_ANGLES as f64;
            if !(dz > 0.0) {
                return 0.0;
            }
            (0..CROWN_VOLUME_LEVELS)
                .map(|i| {
                    let z = base_z + (i as f64 + 0.5) * dz;
                    let slice: f64 = (0..CROWN_VOLUME_ANGLES)
                        .map(|j| self.crown_radius_at((j as f64 + 0.5) * dtheta, z).powi(2))
                        .sum();
                    0.5 * slice * dtheta.to_radians() * dz
                })
                .sum()
        })
    }

    /// Elevation of maximum width at compass `angle`, blended like the radii.
    pub fn edge_height_at(&self, angle: f64) -> f64 {
        let (quadrant, local) = Quadrant::locate(angle);
        let (start, end) = quadrant.bounds();
        blend_directional(
            self.profile(start).edge_height,
            self.profile(end).edge_height,
            local,
        )
    }

    /// Asymmetry of the crown outline, `sqrt(1 - (min/max)^2)` over the four
    /// directional radii: 0 for a circular crown, 1 when one radius is zero.
    pub fn crown_eccentricity(&self) -> f64 {
        *self.eccentricity.get_or_init(|| {
            let radii = &self.params.crown_radii;
            let max = radii.iter().cloned().fold(0.0, f64::max);
            let min = radii.iter().cloned().fold(f64::INFINITY, f64::min);
            if max == 0.0 {
                0.0
            } else {
                (1.0 - (min / max).powi(2)).sqrt()
            }
        })
    }

    /// Points of maximum crown width, ordered E, N, W, S.
    pub fn peripheral_points(&self) -> &[Point3<f64>; 4] {
        self.peripheral.get_or_init(|| {
            Direction::ALL.map(|direction| {
                let profile = self.profile(direction);
                let centre = self.crown_center_at(profile.edge_height);
                let (ux, uy) = direction.unit();
                Point3::new(
                    centre.x + ux * profile.radius,
                    centre.y + uy * profile.radius,
                    profile.edge_height,
                )
            })
        })
    }

    /// Cycle of `n` crown boundary points at elevation `z`, starting east and
    /// proceeding counter-clockwise.
    pub fn hull_at(&self, z: f64, n: usize) -> Result<Vec<Point3<f64>>> {
        if n < config::MIN_RESOLUTION {
            return Err(CrownError::InsufficientResolution {
                axis: "angular",
                requested: n,
                minimum: config::MIN_RESOLUTION,
            });
        }
        if !(z >= self.base_z() && z <= self.apex_z()) {
            return Err(CrownError::invalid(format!(
                "elevation {} lies outside the crown [{}, {}]",
                z,
                self.base_z(),
                self.apex_z()
            )));
        }
        let centre = self.crown_center_at(z);
        Ok((0..n)
            .map(|i| {
                let angle = 360.0 * i as f64 / n as f64;
                let r = self.crown_radius_at(angle, z);
                let theta = angle.to_radians();
                Point3::new(centre.x + r * theta.cos(), centre.y + r * theta.sin(), z)
            })
            .collect())
    }

    /// Default crown hull, sampled once and cached.
    pub fn hull(&self) -> Result<&PointCloud> {
        self.hull
            .get_or_init(|| {
                sampling::sample_crown(
                    self,
                    config::HULL_ANGULAR_RESOLUTION,
                    config::HULL_VERTICAL_RESOLUTION,
                    &SamplingScheme::Structured,
                    CrownPart::Full,
                )
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    /// Checks the preconditions for evaluating the crown surface.
    pub fn check_crown(&self) -> Result<()> {
        if self.params.height <= 0.0 {
            return Err(CrownError::degenerate(format!(
                "tree height is {}",
                self.params.height
            )));
        }
        if self.apex_z() - self.base_z() <= 0.0 {
            return Err(CrownError::degenerate("crown has zero length"));
        }
        if self.params.crown_radii.iter().all(|&r| r == 0.0) {
            return Err(CrownError::degenerate("all crown radii are zero"));
        }
        Ok(())
    }

    /// Checks the preconditions for evaluating the stem surface.
    pub fn check_stem(&self) -> Result<()> {
        if self.params.height <= 0.0 {
            return Err(CrownError::degenerate(format!(
                "tree height is {}",
                self.params.height
            )));
        }
        if self.params.dbh <= 0.0 {
            return Err(CrownError::degenerate(format!(
                "stem diameter is {}",
                self.params.dbh
            )));
        }
        if self.crown_base_height <= 0.0 {
            return Err(CrownError::degenerate("crown starts at the ground"));
        }
        Ok(())
    }
}
