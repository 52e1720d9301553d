//! Point clouds sampled from the crown and stem surfaces of a [`Tree`].
//!
//! Structured sampling walks a regular (theta, z) grid; scattered sampling
//! draws seeded random angles and heights and perturbs the radius to imitate
//! a lidar return cloud. Both include the crown apex and base as explicit
//! points, so the sampled surface is closed at its poles.
//!
//! Crown and stem clouds carry the exact outward normal of the surface they
//! were drawn from, and the [`CrownAxis`] they were drawn around.

use nalgebra::{Point3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::bins::{angle_grid, generate_theta_z_combinations, height_levels};
use crate::config::{AXIS_RADIAL_EPSILON, MIN_RESOLUTION};
use crate::error::{CrownError, Result};
use crate::tree::Tree;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Direction;
    use crate::tree::TreeParams;

    fn tree() -> Tree {
        Tree::new(
            TreeParams::new("PSME", 0.6, 20.0, 10.0, -4.0)
                .with_ground_elevation(100.0)
                .with_crown_base_height(6.0)
                .with_crown_radii([3.0, 3.5, 2.5, 3.2])
                .with_crown_edge_heights([11.0, 11.0, 11.0, 11.0])
                .with_crown_shapes([[2.0, 1.5], [1.0, 2.0], [0.6, 1.2], [3.0, 0.8]])
                .with_lean(30.0, 5.0),
        )
        .unwrap()
    }

    #[test]
    fn structured_grid_size_and_poles() {
        let tree = tree();
        let cloud = sample_crown_surface(&tree, 16, 10).unwrap();
        // 10 levels plus the edge level, minus the two poles, each a full ring
        assert_eq!(cloud.len(), 16 * 9 + 2);
        let (apex, base) = tree.crown_apex_and_base();
        assert!(cloud.points.contains(&apex));
        assert!(cloud.points.contains(&base));
        assert_eq!(cloud.surface, Surface::Crown);
        let normals = cloud.normals.as_ref().unwrap();
        assert_eq!(normals.len(), cloud.len());
        assert_eq!(normals[0], Vector3::z());
        assert_eq!(normals[1], -Vector3::z());
        assert_eq!(cloud.axis, Some(CrownAxis { base, apex }));
    }

    #[test]
    fn sampled_normals_face_away_from_the_axis() {
        let tree = tree();
        let cloud = sample_crown_surface(&tree, 24, 16).unwrap();
        let axis = cloud.axis.unwrap();
        for (p, n) in cloud.points.iter().zip(cloud.normals.as_ref().unwrap()) {
            assert!((n.norm() - 1.0).abs() < 1e-12);
            assert!(n.dot(&axis.outward(p)) > 0.0);
        }
    }

    #[test]
    fn upright_frame_removes_lean() {
        let tree = tree();
        let (apex, base) = tree.crown_apex_and_base();
        let axis = CrownAxis { base, apex };
        let upright = axis.to_upright(&apex);
        assert!((upright.x - base.x).abs() < 1e-9 && (upright.y - base.y).abs() < 1e-9);

        let p = Point3::new(12.0, -3.0, 115.0);
        let back = axis.from_upright(&axis.to_upright(&p));
        assert!((back - p).norm() < 1e-12);

        // a normal stays perpendicular to a tangent carried into the frame
        let normal = Vector3::new(0.3, -0.2, 0.9).normalize();
        let tangent = Vector3::new(0.9, 0.3, 0.0).cross(&normal);
        let moved = axis.to_upright(&(p + tangent)) - axis.to_upright(&p);
        assert!(axis.normal_to_upright(&normal).dot(&moved).abs() < 1e-12);
    }

    #[test]
    fn samples_lie_on_the_surface() {
        let tree = tree();
        let cloud = sample_crown_surface(&tree, 12, 7).unwrap();
        for p in &cloud.points {
            let centre = tree.crown_center_at(p.z);
            let dx = p.x - centre.x;
            let dy = p.y - centre.y;
            let r = dx.hypot(dy);
            if r == 0.0 {
                continue;
            }
            let angle = dy.atan2(dx).to_degrees();
            assert!((r - tree.crown_radius_at(angle, p.z)).abs() < 1e-9);
        }
    }

    #[test]
    fn coarse_resolution_is_rejected() {
        let tree = tree();
        assert_eq!(
            sample_crown_surface(&tree, 2, 10).unwrap_err(),
            CrownError::InsufficientResolution {
                axis: "angular",
                requested: 2,
                minimum: MIN_RESOLUTION
            }
        );
        assert!(matches!(
            sample_crown_surface(&tree, 8, 1),
            Err(CrownError::InsufficientResolution { axis: "vertical", .. })
        ));
        assert!(sample_stem_surface(&tree, 2).is_err());
    }

    #[test]
    fn degenerate_trees_fail_before_sampling() {
        let flat = Tree::new(
            TreeParams::new("PSME", 0.6, 0.0, 0.0, 0.0)
                .with_ground_elevation(0.0)
                .with_crown_radii([1.0; 4]),
        )
        .unwrap();
        assert!(matches!(
            sample_crown_surface(&flat, 8, 8),
            Err(CrownError::DegenerateTree(_))
        ));
        assert!(matches!(
            sample_stem_surface(&flat, 8),
            Err(CrownError::DegenerateTree(_))
        ));

        let bare = Tree::new(
            TreeParams::new("PSME", 0.6, 10.0, 0.0, 0.0)
                .with_ground_elevation(0.0)
                .with_crown_radii([0.0; 4]),
        )
        .unwrap();
        assert!(matches!(
            sample_crown_surface(&bare, 8, 8),
            Err(CrownError::DegenerateTree(_))
        ));
    }

    #[test]
    fn top_only_stays_above_the_edge_line() {
        let tree = tree();
        let cloud = sample_crown(&tree, 16, 20, &SamplingScheme::Structured, CrownPart::TopOnly)
            .unwrap();
        assert!(!cloud.is_empty());
        let edge = tree.profile(Direction::East).edge_height;
        assert!(cloud.points.iter().all(|p| p.z >= edge));
        assert!(cloud.points.contains(&tree.crown_apex_and_base().0));
    }

    #[test]
    fn scattered_sampling_is_seeded() {
        let tree = tree();
        let scheme = SamplingScheme::Scattered {
            count: 500,
            noise_sigma: 0.05,
            seed: 7,
        };
        let a = sample_crown(&tree, 16, 16, &scheme, CrownPart::Full).unwrap();
        let b = sample_crown(&tree, 16, 16, &scheme, CrownPart::Full).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 502);
        let bounds = a.bounds().unwrap();
        assert!(bounds.min.z >= tree.base_z() && bounds.max.z <= tree.apex_z());
    }

    #[test]
    fn scattered_noise_must_be_finite() {
        let scheme = SamplingScheme::Scattered {
            count: 10,
            noise_sigma: -1.0,
            seed: 1,
        };
        assert!(matches!(
            sample_crown(&tree(), 8, 8, &scheme, CrownPart::Full),
            Err(CrownError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn stem_frustum_tapers() {
        let tree = tree();
        let cloud = sample_stem(&tree, 8, StemShape::Tapered).unwrap();
        assert_eq!(cloud.len(), 64);
        assert_eq!(cloud.surface, Surface::Stem);
        assert!(cloud.normals.as_ref().unwrap().iter().all(|n| n.z > 0.0));
        let stem = tree.stem_base();
        let radius = |p: &Point3<f64>| (p.x - stem.x).hypot(p.y - stem.y);
        let bottom = &cloud.points[0];
        let top = cloud.points.last().unwrap();
        assert!((radius(bottom) - 0.3).abs() < 1e-12);
        assert!((top.z - tree.base_z()).abs() < 1e-9);
        assert!((radius(top) - 0.3 * (1.0 - 6.0 / 20.0)).abs() < 1e-9);

        let cylinder = sample_stem(&tree, 8, StemShape::Cylinder).unwrap();
        assert!(cylinder
            .points
            .iter()
            .all(|p| (radius(p) - 0.3).abs() < 1e-12));
        assert!(cylinder
            .normals
            .as_ref()
            .unwrap()
            .iter()
            .all(|n| n.z.abs() < 1e-12));
    }

    #[test]
    fn normals_must_match_points() {
        let cloud = PointCloud::from_points(vec![Point3::origin(); 3]);
        assert!(cloud.clone().with_normals(vec![Vector3::z(); 2]).is_err());
        assert!(cloud.with_normals(vec![Vector3::z(); 3]).is_ok());
    }
}

/// Which surface a point cloud was sampled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Surface {
    Crown,
    Stem,
    Unspecified,
}

/// Axis-aligned bounding box of a point set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl Aabb {
    pub fn from_points(points: &[Point3<f64>]) -> Option<Self> {
        let first = points.first()?;
        Some(points.iter().fold(
            Aabb {
                min: *first,
                max: *first,
            },
            |acc, p| Aabb {
                min: acc.min.inf(p),
                max: acc.max.sup(p),
            },
        ))
    }

    pub fn extent(&self) -> Vector3<f64> {
        self.max - self.min
    }

    pub fn centre(&self) -> Point3<f64> {
        nalgebra::center(&self.min, &self.max)
    }
}

/// Straight axis a surface was sampled around, from its base to its top.
///
/// A leaning crown is a sheared upright one: every horizontal slice is the
/// same as without lean, displaced along the axis. The upright frame undoes
/// that shear.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CrownAxis {
    pub base: Point3<f64>,
    pub apex: Point3<f64>,
}

impl CrownAxis {
    /// Vertical axis through the centroid of `points`, spanning their height.
    pub fn vertical_through(points: &[Point3<f64>]) -> Option<Self> {
        let bounds = Aabb::from_points(points)?;
        let n = points.len() as f64;
        let centre = points.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n;
        Some(Self {
            base: Point3::new(centre.x, centre.y, bounds.min.z),
            apex: Point3::new(centre.x, centre.y, bounds.max.z),
        })
    }

    /// Horizontal drift of the axis per unit height, with a unit z component.
    fn drift(&self) -> Vector3<f64> {
        let span = self.apex.z - self.base.z;
        if span > 0.0 {
            (self.apex - self.base) / span
        } else {
            Vector3::z()
        }
    }

    /// Point on the axis at elevation `z`, clamped to the axis ends.
    pub fn point_at(&self, z: f64) -> Point3<f64> {
        let span = self.apex.z - self.base.z;
        let t = if span > 0.0 {
            ((z - self.base.z) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.base + (self.apex - self.base) * t
    }

    /// Direction a surface normal at `p` is expected to share: horizontally
    /// away from the axis, or away from the axis midpoint for points on it.
    /// Zero only at the midpoint itself.
    pub fn outward(&self, p: &Point3<f64>) -> Vector3<f64> {
        let q = self.point_at(p.z);
        let radial = Vector3::new(p.x - q.x, p.y - q.y, 0.0);
        let length = (self.apex - self.base).norm().max(1.0);
        if radial.norm() > AXIS_RADIAL_EPSILON * length {
            radial
        } else {
            p - nalgebra::center(&self.base, &self.apex)
        }
    }

    /// Maps `p` into the frame where the axis is vertical above its base.
    pub fn to_upright(&self, p: &Point3<f64>) -> Point3<f64> {
        let drift = self.drift();
        let h = p.z - self.base.z;
        Point3::new(p.x - drift.x * h, p.y - drift.y * h, p.z)
    }

    /// Inverse of [`CrownAxis::to_upright`].
    pub fn from_upright(&self, p: &Point3<f64>) -> Point3<f64> {
        let drift = self.drift();
        let h = p.z - self.base.z;
        Point3::new(p.x + drift.x * h, p.y + drift.y * h, p.z)
    }

    /// Carries a unit normal into the upright frame (inverse transpose of
    /// the shear), renormalized.
    pub fn normal_to_upright(&self, n: &Vector3<f64>) -> Vector3<f64> {
        let drift = self.drift();
        let moved = Vector3::new(n.x, n.y, n.z + drift.x * n.x + drift.y * n.y);
        moved.try_normalize(0.0).unwrap_or(moved)
    }
}

/// 3-D samples of one tree surface, optionally with per-point normals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointCloud {
    pub points: Vec<Point3<f64>>,
    pub normals: Option<Vec<Vector3<f64>>>,
    pub surface: Surface,
    /// Axis the points were sampled around, if known.
    #[serde(default)]
    pub axis: Option<CrownAxis>,
}

impl PointCloud {
    pub fn new(points: Vec<Point3<f64>>, surface: Surface) -> Self {
        Self {
            points,
            normals: None,
            surface,
            axis: None,
        }
    }

    pub fn with_axis(mut self, axis: CrownAxis) -> Self {
        self.axis = Some(axis);
        self
    }

    /// The sampling axis, or a vertical axis through the centroid.
    pub fn reference_axis(&self) -> Option<CrownAxis> {
        self.axis.or_else(|| CrownAxis::vertical_through(&self.points))
    }

    pub fn from_points(points: Vec<Point3<f64>>) -> Self {
        Self::new(points, Surface::Unspecified)
    }

    /// Attaches one normal per point.
    pub fn with_normals(mut self, normals: Vec<Vector3<f64>>) -> Result<Self> {
        if normals.len() != self.points.len() {
            return Err(CrownError::invalid(format!(
                "{} normals supplied for {} points",
                normals.len(),
                self.points.len()
            )));
        }
        self.normals = Some(normals);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn bounds(&self) -> Option<Aabb> {
        Aabb::from_points(&self.points)
    }

    pub fn centroid(&self) -> Option<Point3<f64>> {
        if self.points.is_empty() {
            return None;
        }
        let sum = self
            .points
            .iter()
            .fold(Vector3::zeros(), |acc, p| acc + p.coords);
        Some(Point3::from(sum / self.points.len() as f64))
    }
}

/// How sample positions are chosen on the crown surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SamplingScheme {
    /// Regular grid of angular x vertical resolution.
    Structured,
    /// `count` random samples with Gaussian radial noise, reproducible from `seed`.
    Scattered {
        count: usize,
        noise_sigma: f64,
        seed: u64,
    },
}

/// Portion of the crown to sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrownPart {
    Full,
    /// Only the part at or above the line of maximum width.
    TopOnly,
}

/// Stem model used by the stem sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StemShape {
    Cylinder,
    /// Radius shrinks linearly from `dbh / 2` at the ground toward zero at the tree top.
    Tapered,
}

fn check_resolution(axis: &'static str, requested: usize) -> Result<()> {
    if requested < MIN_RESOLUTION {
        return Err(CrownError::InsufficientResolution {
            axis,
            requested,
            minimum: MIN_RESOLUTION,
        });
    }
    Ok(())
}

/// Samples the full crown on a regular grid of `angular_resolution` angles
/// by `vertical_resolution` heights.
pub fn sample_crown_surface(
    tree: &Tree,
    angular_resolution: usize,
    vertical_resolution: usize,
) -> Result<PointCloud> {
    sample_crown(
        tree,
        angular_resolution,
        vertical_resolution,
        &SamplingScheme::Structured,
        CrownPart::Full,
    )
}

/// Samples the crown surface.
///
/// For the structured scheme the height grid always contains each edge
/// height, so the ring of maximum width is sampled exactly.
pub fn sample_crown(
    tree: &Tree,
    angular_resolution: usize,
    vertical_resolution: usize,
    scheme: &SamplingScheme,
    part: CrownPart,
) -> Result<PointCloud> {
    check_resolution("angular", angular_resolution)?;
    check_resolution("vertical", vertical_resolution)?;
    tree.check_crown()?;

    let (apex, base) = tree.crown_apex_and_base();
    let keep = |theta: f64, z: f64| match part {
        CrownPart::Full => true,
        CrownPart::TopOnly => z >= tree.edge_height_at(theta),
    };
    let surface_point = |theta: f64, z: f64, radius: f64| {
        let centre = tree.crown_center_at(z);
        let t = theta.to_radians();
        Point3::new(centre.x + radius * t.cos(), centre.y + radius * t.sin(), z)
    };

    let mut points = vec![apex];
    let mut normals = vec![Vector3::z()];
    if part == CrownPart::Full {
        points.push(base);
        normals.push(-Vector3::z());
    }

    match scheme {
        SamplingScheme::Structured => {
            let edges: Vec<f64> = tree.profiles().iter().map(|p| p.edge_height).collect();
            let levels = height_levels(base.z, apex.z, vertical_resolution, &edges);
            // the poles are already in as single points
            let rings = &levels[1..levels.len() - 1];
            let thetas = angle_grid(angular_resolution);
            for (theta, z) in generate_theta_z_combinations(&thetas, rings) {
                if keep(theta, z) {
                    points.push(surface_point(theta, z, tree.crown_radius_at(theta, z)));
                    normals.push(tree.crown_normal_at(theta, z));
                }
            }
        }
        SamplingScheme::Scattered {
            count,
            noise_sigma,
            seed,
        } => {
            check_resolution("scattered", *count)?;
            let noise = Normal::new(0.0, *noise_sigma).map_err(|e| {
                CrownError::invalid(format!("noise sigma {}: {}", noise_sigma, e))
            })?;
            let mut rng = StdRng::seed_from_u64(*seed);
            let mut drawn = 0;
            while drawn < *count {
                let theta = rng.random_range(0.0..360.0);
                let z = rng.random_range(base.z..apex.z);
                if !keep(theta, z) {
                    continue;
                }
                let radius = (tree.crown_radius_at(theta, z) + noise.sample(&mut rng)).max(0.0);
                points.push(surface_point(theta, z, radius));
                normals.push(tree.crown_normal_at(theta, z));
                drawn += 1;
            }
        }
    }

    log::debug!(
        "sampled {} crown points for {} ({:?}, {:?})",
        points.len(),
        tree.species(),
        scheme,
        part
    );
    PointCloud::new(points, Surface::Crown)
        .with_axis(CrownAxis { base, apex })
        .with_normals(normals)
}

/// Samples the stem from the ground to the crown base as a tapered frustum.
pub fn sample_stem_surface(tree: &Tree, resolution: usize) -> Result<PointCloud> {
    sample_stem(tree, resolution, StemShape::Tapered)
}

/// Samples the stem lateral surface with `resolution` rings of `resolution`
/// points each, from the ground up to the crown base.
pub fn sample_stem(tree: &Tree, resolution: usize, shape: StemShape) -> Result<PointCloud> {
    check_resolution("stem", resolution)?;
    tree.check_stem()?;

    let stem = tree.stem_base();
    let base_radius = tree.dbh() / 2.0;
    // outward normals tilt up by the taper rate
    let taper = match shape {
        StemShape::Cylinder => 0.0,
        StemShape::Tapered => base_radius / tree.height(),
    };
    let levels = height_levels(0.0, tree.crown_base_height(), resolution, &[]);
    let thetas = angle_grid(resolution);

    let (points, normals): (Vec<_>, Vec<_>) = generate_theta_z_combinations(&thetas, &levels)
        .into_iter()
        .map(|(theta, h)| {
            let radius = match shape {
                StemShape::Cylinder => base_radius,
                StemShape::Tapered => base_radius * (1.0 - h / tree.height()),
            };
            let t = theta.to_radians();
            let point = Point3::new(
                stem.x + radius * t.cos(),
                stem.y + radius * t.sin(),
                stem.z + h,
            );
            (point, Vector3::new(t.cos(), t.sin(), taper).normalize())
        })
        .unzip();

    log::debug!("sampled {} stem points for {}", points.len(), tree.species());
    let axis = CrownAxis {
        base: stem,
        apex: Point3::new(stem.x, stem.y, tree.base_z()),
    };
    PointCloud::new(points, Surface::Stem)
        .with_axis(axis)
        .with_normals(normals)
}

/// Reference cloud of `count` nearly uniform points on a sphere, laid out
/// along a Fibonacci spiral. Used to calibrate reconstruction against a
/// surface of known volume.
pub fn sample_sphere(centre: Point3<f64>, radius: f64, count: usize) -> Result<PointCloud> {
    check_resolution("sphere", count)?;
    if !(radius.is_finite() && radius > 0.0) {
        return Err(CrownError::invalid(format!(
            "sphere radius must be positive, got {}",
            radius
        )));
    }
    let golden = std::f64::consts::PI * (3.0 - 5.0f64.sqrt());
    let points = (0..count)
        .map(|i| {
            let z = 1.0 - 2.0 * (i as f64 + 0.5) / count as f64;
            let r = (1.0 - z * z).sqrt();
            let phi = golden * i as f64;
            centre + Vector3::new(r * phi.cos(), r * phi.sin(), z) * radius
        })
        .collect();
    Ok(PointCloud::new(points, Surface::Unspecified))
}
