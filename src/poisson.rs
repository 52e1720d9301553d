//! Poisson surface reconstruction on a dense regular grid.
//!
//! Oriented samples are splatted into a vector field `V`, and the implicit
//! function `chi` solving `lap(chi) = div(V)` is found by conjugate
//! gradients with `chi = 0` on the grid boundary. With outward normals
//! `chi` is negative inside the sampled surface. The surface is the level
//! set of `chi` at its mean value over the samples, extracted by marching
//! tetrahedra.
//!
//! Clouds sampled around a leaning axis are reconstructed in the frame where
//! that axis is upright, so the grid only has to cover the crown itself and
//! not the volume swept by the lean. Vertices are sheared back afterwards.
//!
//! Fidelity is limited by the samples as much as by the grid: once cells are
//! finer than the spacing between samples, more depth adds holes in the
//! splatted field rather than detail.

use std::collections::HashMap;

use nalgebra::{Point3, Vector3};
use ndarray::{Array3, Axis, Zip};

use crate::config::{DEFAULT_NEIGHBORS, MAX_DEPTH, MAX_INCONSISTENT_FRACTION, MIN_DEPTH};
use crate::error::{CrownError, Result};
use crate::mesh::Mesh;
use crate::normals::{check_orientation, SpatialIndex};
use crate::sampling::PointCloud;
use crate::settings::PoissonSettings;


/// Cube corners as (dx, dy, dz) offsets, indexed by `dx | dy << 1 | dz << 2`.
const CORNERS: [[usize; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [0, 1, 0],
    [1, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [0, 1, 1],
    [1, 1, 1],
];

/// Kuhn split of a cube into six tetrahedra along the 0-7 diagonal. Every
/// cube is split the same way, so shared faces are triangulated identically.
const KUHN_TETRAHEDRA: [[usize; 4]; 6] = [
    [0, 1, 3, 7],
    [0, 1, 5, 7],
    [0, 2, 3, 7],
    [0, 2, 6, 7],
    [0, 4, 5, 7],
    [0, 4, 6, 7],
];

/// Regular grid of `cells` cells per axis, `cells + 1` nodes.
struct Grid {
    origin: Point3<f64>,
    spacing: f64,
    cells: usize,
}

impl Grid {
    fn covering(cloud: &PointCloud, depth: u32, scale: f64) -> Result<Self> {
        let bounds = cloud.bounds().ok_or(CrownError::EmptyPointSet)?;
        let side = bounds.extent().max() * scale;
        if !(side.is_finite() && side > 0.0) {
            return Err(CrownError::invalid(format!(
                "point cloud extent {} cannot be gridded",
                side
            )));
        }
        let cells = 1usize << depth;
        Ok(Self {
            origin: bounds.centre() - Vector3::repeat(side / 2.0),
            spacing: side / cells as f64,
            cells,
        })
    }

    fn shape(&self) -> (usize, usize, usize) {
        let n = self.cells + 1;
        (n, n, n)
    }

    fn node(&self, index: [usize; 3]) -> Point3<f64> {
        self.origin + Vector3::new(index[0] as f64, index[1] as f64, index[2] as f64) * self.spacing
    }

    /// The eight nodes around `p` with their trilinear weights.
    fn trilinear(&self, p: &Point3<f64>) -> [([usize; 3], f64); 8] {
        let u = (p - self.origin) / self.spacing;
        let mut base = [0usize; 3];
        let mut frac = [0.0; 3];
        for axis in 0..3 {
            let cell = u[axis].floor().clamp(0.0, (self.cells - 1) as f64);
            base[axis] = cell as usize;
            frac[axis] = (u[axis] - cell).clamp(0.0, 1.0);
        }
        CORNERS.map(|offset| {
            let mut weight = 1.0;
            for axis in 0..3 {
                weight *= if offset[axis] == 1 {
                    frac[axis]
                } else {
                    1.0 - frac[axis]
                };
            }
            (
                [
                    base[0] + offset[0],
                    base[1] + offset[1],
                    base[2] + offset[2],
                ],
                weight,
            )
        })
    }

    fn interpolate(&self, field: &Array3<f64>, p: &Point3<f64>) -> f64 {
        self.trilinear(p)
            .iter()
            .map(|(node, w)| w * field[*node])
            .sum()
    }
}

/// Reconstructs a closed mesh from an oriented point cloud.
pub fn poisson_mesh(cloud: &PointCloud, settings: &PoissonSettings) -> Result<Mesh> {
    if !(MIN_DEPTH..=MAX_DEPTH).contains(&settings.depth) {
        return Err(CrownError::InvalidDepth {
            depth: settings.depth,
            min: MIN_DEPTH,
            max: MAX_DEPTH,
        });
    }
    if cloud.is_empty() {
        return Err(CrownError::EmptyPointSet);
    }
    let normals = cloud.normals.as_ref().ok_or(CrownError::MissingNormals)?;
    check_orientation(cloud, MAX_INCONSISTENT_FRACTION)?;
    if !(settings.scale >= 1.0) {
        return Err(CrownError::invalid(format!(
            "grid scale must be at least 1, got {}",
            settings.scale
        )));
    }

    let local = match cloud.axis {
        Some(axis) => PointCloud {
            points: cloud.points.iter().map(|p| axis.to_upright(p)).collect(),
            normals: Some(normals.iter().map(|n| axis.normal_to_upright(n)).collect()),
            surface: cloud.surface,
            axis: None,
        },
        None => cloud.clone(),
    };
    let normals = local.normals.as_deref().unwrap_or_default();

    let grid = Grid::covering(&local, settings.depth, settings.scale)?;
    let weights = sample_weights(&local.points);
    let (field, density) = splat(&grid, &local.points, normals, &weights);
    let field = field.map(|component| smooth(&component));
    let density = smooth(&density);

    let rhs = divergence(&grid, &field);
    let (chi, iterations) = solve(&rhs, settings)?;
    log::debug!(
        "poisson solve on {} nodes converged in {} iterations",
        chi.len(),
        iterations
    );

    let iso = local
        .points
        .iter()
        .map(|p| grid.interpolate(&chi, p))
        .sum::<f64>()
        / local.len() as f64;
    if !(iso < 0.0) {
        // the level set would leak through the grid boundary
        log::debug!("iso-value {} is not inside the solved field", iso);
        return Err(CrownError::EmptySurface);
    }

    let (vertices, faces) = extract_surface(&grid, &chi, iso);
    if faces.is_empty() {
        return Err(CrownError::EmptySurface);
    }
    let vertex_density = vertices
        .iter()
        .map(|v| grid.interpolate(&density, v))
        .collect();
    let vertices = match cloud.axis {
        Some(axis) => vertices.iter().map(|v| axis.from_upright(v)).collect(),
        None => vertices,
    };

    log::debug!(
        "extracted {} vertices and {} faces at depth {}",
        vertices.len(),
        faces.len(),
        settings.depth
    );
    Ok(Mesh::new(
        vertices,
        faces,
        vertex_density,
        cloud.clone(),
        settings.clone(),
    ))
}

/// Per-sample area estimate from the mean squared distance to its neighbors.
fn sample_weights(points: &[Point3<f64>]) -> Vec<f64> {
    if points.len() < 2 {
        return vec![1.0; points.len()];
    }
    let index = SpatialIndex::build(points);
    let k = DEFAULT_NEIGHBORS.min(points.len() - 1) + 1;
    points
        .iter()
        .map(|p| {
            let neighbors = index.k_nearest(p, k);
            let mean_sq = neighbors
                .iter()
                .map(|&j| (points[j] - p).norm_squared())
                .sum::<f64>()
                / (neighbors.len() - 1).max(1) as f64;
            std::f64::consts::PI * mean_sq
        })
        .collect()
}

/// Splats weighted normals and sample counts onto the grid nodes.
fn splat(
    grid: &Grid,
    points: &[Point3<f64>],
    normals: &[Vector3<f64>],
    weights: &[f64],
) -> ([Array3<f64>; 3], Array3<f64>) {
    let mut field = [
        Array3::zeros(grid.shape()),
        Array3::zeros(grid.shape()),
        Array3::zeros(grid.shape()),
    ];
    let mut density = Array3::zeros(grid.shape());
    for ((p, n), &area) in points.iter().zip(normals).zip(weights) {
        let Some(n) = n.try_normalize(0.0) else {
            continue;
        };
        for (node, w) in grid.trilinear(p) {
            for axis in 0..3 {
                field[axis][node] += w * area * n[axis];
            }
            density[node] += w;
        }
    }
    (field, density)
}

/// One separable [1, 2, 1] / 4 pass along each axis, zero beyond the edges.
fn smooth(field: &Array3<f64>) -> Array3<f64> {
    let mut out = field.clone();
    for axis in 0..3 {
        let src = out.clone();
        Zip::from(out.lanes_mut(Axis(axis)))
            .and(src.lanes(Axis(axis)))
            .for_each(|mut dst, src| {
                let n = src.len();
                for i in 0..n {
                    let before = if i > 0 { src[i - 1] } else { 0.0 };
                    let after = if i + 1 < n { src[i + 1] } else { 0.0 };
                    dst[i] = (before + 2.0 * src[i] + after) / 4.0;
                }
            });
    }
    out
}

/// Central-difference divergence, scaled by `h^2` and negated so the
/// system matrix is the positive-definite `-lap`. Zero on the boundary.
fn divergence(grid: &Grid, field: &[Array3<f64>; 3]) -> Array3<f64> {
    let (nx, ny, nz) = grid.shape();
    let half_h = grid.spacing / 2.0;
    let [vx, vy, vz] = field;
    let mut rhs = Array3::zeros((nx, ny, nz));
    for i in 1..nx - 1 {
        for j in 1..ny - 1 {
            for k in 1..nz - 1 {
                let div = (vx[[i + 1, j, k]] - vx[[i - 1, j, k]])
                    + (vy[[i, j + 1, k]] - vy[[i, j - 1, k]])
                    + (vz[[i, j, k + 1]] - vz[[i, j, k - 1]]);
                rhs[[i, j, k]] = -div * half_h;
            }
        }
    }
    rhs
}

/// `h^2 * (-lap x)` on interior nodes, zero on the boundary.
fn apply_operator(x: &Array3<f64>, out: &mut Array3<f64>) {
    let (nx, ny, nz) = x.dim();
    out.fill(0.0);
    for i in 1..nx - 1 {
        for j in 1..ny - 1 {
            for k in 1..nz - 1 {
                let neighbors = x[[i - 1, j, k]]
                    + x[[i + 1, j, k]]
                    + x[[i, j - 1, k]]
                    + x[[i, j + 1, k]]
                    + x[[i, j, k - 1]]
                    + x[[i, j, k + 1]];
                out[[i, j, k]] = 6.0 * x[[i, j, k]] - neighbors;
            }
        }
    }
}

fn dot(a: &Array3<f64>, b: &Array3<f64>) -> f64 {
    Zip::from(a).and(b).fold(0.0, |acc, x, y| acc + x * y)
}

/// Conjugate gradients from a zero start. Returns the solution and the
/// iteration count.
fn solve(rhs: &Array3<f64>, settings: &PoissonSettings) -> Result<(Array3<f64>, usize)> {
    let mut x = Array3::zeros(rhs.raw_dim());
    let rhs_norm = dot(rhs, rhs).sqrt();
    if rhs_norm == 0.0 {
        return Err(CrownError::EmptySurface);
    }
    let mut r = rhs.clone();
    let mut p = r.clone();
    let mut ap = Array3::zeros(rhs.raw_dim());
    let mut rs = dot(&r, &r);

    for iteration in 1..=settings.max_iterations {
        apply_operator(&p, &mut ap);
        let alpha = rs / dot(&p, &ap);
        Zip::from(&mut x).and(&p).for_each(|x, &p| *x += alpha * p);
        Zip::from(&mut r).and(&ap).for_each(|r, &ap| *r -= alpha * ap);
        let rs_next = dot(&r, &r);
        if rs_next.sqrt() <= settings.solver_tolerance * rhs_norm {
            return Ok((x, iteration));
        }
        let beta = rs_next / rs;
        Zip::from(&mut p).and(&r).for_each(|p, &r| *p = r + beta * *p);
        rs = rs_next;
    }

    let residual = rs.sqrt() / rhs_norm;
    log::warn!(
        "conjugate gradients stopped at the cap of {} iterations, residual {:.3e}",
        settings.max_iterations,
        residual
    );
    Err(CrownError::NotConverged {
        iterations: settings.max_iterations,
        residual,
    })
}

fn corner_offset(c: usize) -> Vector3<i64> {
    let [x, y, z] = CORNERS[c];
    Vector3::new(x as i64, y as i64, z as i64)
}

/// Sign of the volume of tetrahedron (a, b, c, d) over cube corners, exact.
fn orientation(a: usize, b: usize, c: usize, d: usize) -> i64 {
    let o = corner_offset(a);
    (corner_offset(b) - o).dot(&(corner_offset(c) - o).cross(&(corner_offset(d) - o)))
}

/// Whether the quad cut from tetrahedron edges (i1 o1, i1 o2, i2 o2, i2 o1)
/// faces from the inside pair toward the outside pair, judged at the
/// edge midpoints.
fn quad_faces_outward(i1: usize, i2: usize, o1: usize, o2: usize) -> bool {
    let [i1, i2, o1, o2] = [i1, i2, o1, o2].map(corner_offset);
    let u = o2 - o1;
    let v = (i2 + o2) - (i1 + o1);
    let w = (o1 + o2) - (i1 + i2);
    u.cross(&v).dot(&w) > 0
}

fn wind(triangle: [usize; 3], outward: bool) -> [usize; 3] {
    let [a, b, c] = triangle;
    if outward {
        [a, b, c]
    } else {
        [a, c, b]
    }
}

/// Surface vertices keyed by the grid edge they lie on.
struct EdgeVertices<'a> {
    grid: &'a Grid,
    keys: HashMap<(usize, usize), usize>,
    vertices: Vec<Point3<f64>>,
}

impl EdgeVertices<'_> {
    /// Vertex where the level set crosses the edge between nodes `a` and `b`,
    /// with `fa` and `fb` their values relative to the iso-value.
    fn on_edge(&mut self, a: ([usize; 3], usize, f64), b: ([usize; 3], usize, f64)) -> usize {
        let key = (a.1.min(b.1), a.1.max(b.1));
        let grid = self.grid;
        let vertices = &mut self.vertices;
        *self.keys.entry(key).or_insert_with(|| {
            let (pa, pb) = (grid.node(a.0), grid.node(b.0));
            let t = a.2 / (a.2 - b.2);
            vertices.push(pa + (pb - pa) * t);
            vertices.len() - 1
        })
    }
}

/// Marching tetrahedra over every grid cell. Vertices are shared through
/// the grid edge they lie on, so the output is closed wherever the level
/// set stays inside the grid.
fn extract_surface(grid: &Grid, chi: &Array3<f64>, iso: f64) -> (Vec<Point3<f64>>, Vec<[usize; 3]>) {
    let (nx, ny, nz) = chi.dim();
    let mut surface = EdgeVertices {
        grid,
        keys: HashMap::new(),
        vertices: Vec::new(),
    };
    let mut faces: Vec<[usize; 3]> = Vec::new();

    for i in 0..nx - 1 {
        for j in 0..ny - 1 {
            for k in 0..nz - 1 {
                let nodes = CORNERS.map(|[dx, dy, dz]| [i + dx, j + dy, k + dz]);
                let values = nodes.map(|n| chi[n] - iso);
                let inside = values.map(|v| v < 0.0);
                if inside.iter().all(|&b| b) || inside.iter().all(|&b| !b) {
                    continue;
                }
                let corner = |c: usize| {
                    let n = nodes[c];
                    (n, (n[0] * ny + n[1]) * nz + n[2], values[c])
                };
                for tet in KUHN_TETRAHEDRA {
                    let (ins, outs): (Vec<usize>, Vec<usize>) =
                        tet.iter().copied().partition(|&c| inside[c]);
                    let mut edge = |a: usize, b: usize| surface.on_edge(corner(a), corner(b));
                    match (ins.as_slice(), outs.as_slice()) {
                        (&[a], &[o1, o2, o3]) => {
                            let triangle = [edge(a, o1), edge(a, o2), edge(a, o3)];
                            faces.push(wind(triangle, orientation(a, o1, o2, o3) > 0));
                        }
                        (&[i1, i2, i3], &[o]) => {
                            let triangle = [edge(i1, o), edge(i2, o), edge(i3, o)];
                            faces.push(wind(triangle, orientation(i1, i2, i3, o) > 0));
                        }
                        (&[i1, i2], &[o1, o2]) => {
                            let quad = [edge(i1, o1), edge(i1, o2), edge(i2, o2), edge(i2, o1)];
                            let outward = quad_faces_outward(i1, i2, o1, o2);
                            faces.push(wind([quad[0], quad[1], quad[2]], outward));
                            faces.push(wind([quad[0], quad[2], quad[3]], outward));
                        }
                        _ => {}
                    }
                }
            }
        }
    }
    (surface.vertices, faces)
}
