//! Outward normals for sampled surfaces.
//!
//! Sampled crowns already carry exact normals; this module checks them, or
//! estimates them for clouds that have none. An estimated normal is the
//! least-variance direction of its k-nearest neighborhood. Its sign is
//! taken from the crown axis where the normal clearly faces toward or away
//! from it, and elsewhere by walking the neighbor graph, always stepping to
//! the most parallel unvisited neighbor next.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use nalgebra::{Matrix3, Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::config::{
    COLLINEAR_VARIANCE_RATIO, INWARD_COSINE, MIN_NEIGHBORHOOD_POINTS, ORIENTATION_CONFIDENCE,
};
use crate::error::{CrownError, Result};
use crate::sampling::{CrownAxis, PointCloud};
use crate::settings::NormalSettings;


/// Uniform-grid hash over a point set for nearest-neighbor queries.
pub struct SpatialIndex<'a> {
    points: &'a [Point3<f64>],
    cells: HashMap<(i64, i64, i64), Vec<usize>>,
    origin: Point3<f64>,
    cell_size: f64,
    max_ring: i64,
}

impl<'a> SpatialIndex<'a> {
    /// Sizes cells so that an average cell holds a handful of points.
    pub fn build(points: &'a [Point3<f64>]) -> Self {
        let (min, max) = points.iter().fold(
            (
                Point3::from([f64::INFINITY; 3]),
                Point3::from([f64::NEG_INFINITY; 3]),
            ),
            |(lo, hi), p| (lo.inf(p), hi.sup(p)),
        );
        let extent = (max - min).max();
        let cell_size = if extent > 0.0 && extent.is_finite() {
            // surfaces fill space like n^(2/3)
            extent / (points.len() as f64).sqrt().max(1.0)
        } else {
            1.0
        };
        let origin = if points.is_empty() { Point3::origin() } else { min };

        let mut cells: HashMap<(i64, i64, i64), Vec<usize>> = HashMap::new();
        for (i, p) in points.iter().enumerate() {
            cells.entry(Self::key(origin, cell_size, p)).or_default().push(i);
        }
        let max_ring = if extent.is_finite() {
            (extent / cell_size).ceil() as i64 + 1
        } else {
            0
        };

        Self {
            points,
            cells,
            origin,
            cell_size,
            max_ring,
        }
    }

    fn key(origin: Point3<f64>, cell_size: f64, p: &Point3<f64>) -> (i64, i64, i64) {
        let d = (p - origin) / cell_size;
        (d.x.floor() as i64, d.y.floor() as i64, d.z.floor() as i64)
    }

    /// Indices of the `k` points closest to `query`, nearest first.
    pub fn k_nearest(&self, query: &Point3<f64>, k: usize) -> Vec<usize> {
        let k = k.min(self.points.len());
        if k == 0 {
            return Vec::new();
        }
        let centre = Self::key(self.origin, self.cell_size, query);
        let mut found: Vec<(f64, usize)> = Vec::new();

        for ring in 0..=self.max_ring {
            for dx in -ring..=ring {
                for dy in -ring..=ring {
                    for dz in -ring..=ring {
                        if dx.abs().max(dy.abs()).max(dz.abs()) != ring {
                            continue;
                        }
                        let cell = (centre.0 + dx, centre.1 + dy, centre.2 + dz);
                        if let Some(members) = self.cells.get(&cell) {
                            found.extend(
                                members
                                    .iter()
                                    .map(|&i| ((self.points[i] - query).norm_squared(), i)),
                            );
                        }
                    }
                }
            }
            if found.len() >= k {
                found.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
                // everything within `ring` cells of the query has been seen
                let reach = ring as f64 * self.cell_size;
                if found[k - 1].0 <= reach * reach {
                    break;
                }
            }
        }
        found.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        found.into_iter().take(k).map(|(_, i)| i).collect()
    }
}

/// Heap entry for orientation propagation, ordered by alignment.
struct Step {
    alignment: f64,
    from: usize,
    to: usize,
}

impl PartialEq for Step {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Step {}

impl PartialOrd for Step {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Step {
    fn cmp(&self, other: &Self) -> Ordering {
        self.alignment
            .total_cmp(&other.alignment)
            .then_with(|| other.to.cmp(&self.to))
    }
}

/// Where estimated normals come from in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalSource {
    /// Keep the exact normals the sampler attached, after checking them.
    Analytic,
    /// Discard them and estimate from neighborhoods.
    Estimated,
}

/// Least-variance direction of a neighborhood. A neighborhood that is
/// nearly a line has no such direction, so `reference` is taken
/// perpendicular to the line instead.
fn pca_normal(
    points: &[Point3<f64>],
    neighborhood: &[usize],
    reference: &Vector3<f64>,
) -> Vector3<f64> {
    let n = neighborhood.len() as f64;
    let mean = neighborhood
        .iter()
        .fold(Vector3::zeros(), |acc, &i| acc + points[i].coords)
        / n;
    let covariance = neighborhood.iter().fold(Matrix3::zeros(), |acc, &i| {
        let d = points[i].coords - mean;
        acc + d * d.transpose()
    }) / n;
    let eigen = covariance.symmetric_eigen();
    let mut order = [0, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));
    let [_, middle, most] = order.map(|i| eigen.eigenvalues[i]);
    let smallest = eigen.eigenvectors.column(order[0]).into_owned();

    if middle < COLLINEAR_VARIANCE_RATIO * most {
        let line = eigen.eigenvectors.column(order[2]).into_owned();
        if let Some(across) = (reference - line * line.dot(reference)).try_normalize(1e-12) {
            return across;
        }
    }
    smallest
}

/// Returns a copy of `cloud` with unit outward normals attached.
pub fn estimate_normals(cloud: &PointCloud, settings: &NormalSettings) -> Result<PointCloud> {
    let points = &cloud.points;
    if points.len() < MIN_NEIGHBORHOOD_POINTS {
        return Err(CrownError::InsufficientNeighbors {
            points: points.len(),
            required: MIN_NEIGHBORHOOD_POINTS,
        });
    }
    let axis = cloud.reference_axis().ok_or(CrownError::EmptyPointSet)?;
    let k = (settings.neighbors + 1)
        .max(MIN_NEIGHBORHOOD_POINTS)
        .min(points.len());

    let index = SpatialIndex::build(points);
    let neighborhoods: Vec<Vec<usize>> = points.iter().map(|p| index.k_nearest(p, k)).collect();
    let mut normals: Vec<Vector3<f64>> = neighborhoods
        .iter()
        .zip(points)
        .map(|(neighborhood, p)| pca_normal(points, neighborhood, &axis.outward(p)))
        .collect();

    orient(points, &axis, &neighborhoods, &mut normals);

    let oriented = cloud.clone().with_normals(normals)?;
    check_orientation(&oriented, settings.max_inconsistent_fraction)?;
    log::debug!("estimated {} normals with k = {}", oriented.len(), k);
    Ok(oriented)
}

/// Cosine between `n` and the outward direction of the axis at `p`, or
/// `None` where that direction vanishes.
fn axis_cosine(axis: &CrownAxis, p: &Point3<f64>, n: &Vector3<f64>) -> Option<f64> {
    let outward = axis.outward(p);
    let scale = outward.norm() * n.norm();
    (scale > 0.0).then(|| n.dot(&outward) / scale)
}

/// Flips normals to face away from the axis, propagating through the
/// neighbor graph where the axis alone cannot decide.
fn orient(
    points: &[Point3<f64>],
    axis: &CrownAxis,
    neighborhoods: &[Vec<usize>],
    normals: &mut [Vector3<f64>],
) {
    let n = points.len();
    let mut adjacency: Vec<Vec<usize>> = neighborhoods.to_vec();
    for (i, neighborhood) in neighborhoods.iter().enumerate() {
        for &j in neighborhood {
            if j != i {
                adjacency[j].push(i);
            }
        }
    }

    let mut visited = vec![false; n];
    for i in 0..n {
        if let Some(cosine) = axis_cosine(axis, &points[i], &normals[i]) {
            if cosine.abs() >= ORIENTATION_CONFIDENCE {
                if cosine < 0.0 {
                    normals[i] = -normals[i];
                }
                visited[i] = true;
            }
        }
    }
    let decided = visited.iter().filter(|v| **v).count();

    let mut heap = BinaryHeap::new();
    for i in (0..n).filter(|&i| visited[i]) {
        push_steps(i, &adjacency, normals, &visited, &mut heap);
    }
    while let Some(Step { from, to, .. }) = heap.pop() {
        if visited[to] {
            continue;
        }
        if normals[to].dot(&normals[from]) < 0.0 {
            normals[to] = -normals[to];
        }
        visited[to] = true;
        push_steps(to, &adjacency, normals, &visited, &mut heap);
    }

    // pieces with no confident point
    for i in (0..n).filter(|&i| !visited[i]) {
        if axis_cosine(axis, &points[i], &normals[i]).is_some_and(|c| c < 0.0) {
            normals[i] = -normals[i];
        }
    }
    log::trace!("{} of {} normals oriented from the axis", decided, n);
}

fn push_steps(
    from: usize,
    adjacency: &[Vec<usize>],
    normals: &[Vector3<f64>],
    visited: &[bool],
    heap: &mut BinaryHeap<Step>,
) {
    for &to in &adjacency[from] {
        if !visited[to] {
            heap.push(Step {
                alignment: normals[from].dot(&normals[to]).abs(),
                from,
                to,
            });
        }
    }
}

/// Checks that the normals of `cloud` face away from its axis: the axis the
/// cloud was sampled around, or a vertical one through its centroid.
///
/// A normal is inconsistent when it is not finite or its cosine with the
/// horizontal direction away from the axis falls below a small negative
/// tolerance. Points on the axis are measured against the direction from
/// the axis midpoint.
pub fn check_orientation(cloud: &PointCloud, max_inconsistent_fraction: f64) -> Result<()> {
    let normals = cloud.normals.as_ref().ok_or(CrownError::MissingNormals)?;
    let axis = cloud.reference_axis().ok_or(CrownError::EmptyPointSet)?;
    let total = cloud.len();
    let inconsistent = cloud
        .points
        .iter()
        .zip(normals)
        .filter(|(p, n)| {
            if !(n.x.is_finite() && n.y.is_finite() && n.z.is_finite()) {
                return true;
            }
            axis_cosine(&axis, p, n).is_some_and(|c| c < INWARD_COSINE)
        })
        .count();
    if inconsistent as f64 > max_inconsistent_fraction * total as f64 {
        return Err(CrownError::InconsistentNormals {
            inconsistent,
            total,
        });
    }
    Ok(())
}
