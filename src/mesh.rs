//! Triangle meshes produced by surface reconstruction.

use std::collections::HashMap;

use nalgebra::{Point3, Vector3};
use ndarray::Array1;
use ndarray_stats::{interpolate::Linear, Quantile1dExt};
use noisy_float::types::{n64, N64};
use serde::{Deserialize, Serialize};

use crate::error::{CrownError, Result};
use crate::sampling::PointCloud;
use crate::settings::PoissonSettings;

#[cfg(test)]
mod tests {
    use super::*;

    /// Unit tetrahedron with outward-facing triangles.
    fn tetrahedron() -> Mesh {
        let vertices = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
        ];
        let faces = vec![[0, 2, 1], [0, 1, 3], [0, 3, 2], [1, 2, 3]];
        Mesh::new(
            vertices,
            faces,
            vec![1.0, 2.0, 3.0, 4.0],
            PointCloud::from_points(vec![]),
            PoissonSettings::default(),
        )
    }

    #[test]
    fn tetrahedron_measures() {
        let mesh = tetrahedron();
        assert!((mesh.volume() - 1.0 / 6.0).abs() < 1e-12);
        let expected_area = 1.5 + 3.0f64.sqrt() / 2.0;
        assert!((mesh.surface_area() - expected_area).abs() < 1e-12);
        assert!(mesh.is_watertight());
    }

    #[test]
    fn vertex_normals_point_away_from_the_solid() {
        let mesh = tetrahedron();
        let n = mesh.vertex_normals[0];
        assert!(n.x < 0.0 && n.y < 0.0 && n.z < 0.0);
        assert!((n.norm() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn open_mesh_is_not_watertight() {
        let mut mesh = tetrahedron();
        mesh.faces.pop();
        assert!(!mesh.is_watertight());

        let mut flipped = tetrahedron();
        flipped.faces[3] = [1, 3, 2];
        assert!(!flipped.is_watertight());
    }

    #[test]
    fn trim_drops_sparse_faces_and_compacts() {
        let mesh = tetrahedron();
        // threshold at the median density 2.5 leaves only vertices 2 and 3
        let trimmed = mesh.trim(0.5);
        assert_eq!(trimmed.unwrap_err(), CrownError::EmptySurface);

        let trimmed = mesh.trim(0.2).unwrap();
        // threshold 1.6 removes vertex 0 and the three faces touching it
        assert_eq!(trimmed.faces.len(), 1);
        assert_eq!(trimmed.vertices.len(), 3);
        assert_eq!(trimmed.vertex_density, vec![2.0, 3.0, 4.0]);
        assert_eq!(trimmed.faces[0], [0, 1, 2]);

        assert!(mesh.trim(1.5).is_err());
        assert_eq!(mesh.trim(0.0).unwrap().faces.len(), 4);
    }
}

/// Triangulated surface with the point cloud and settings that produced it.
///
/// Faces are counter-clockwise seen from outside, so the signed volume of a
/// closed mesh is positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    pub vertices: Vec<Point3<f64>>,
    pub faces: Vec<[usize; 3]>,
    pub vertex_normals: Vec<Vector3<f64>>,
    /// Sample density around each vertex, used for trimming.
    pub vertex_density: Vec<f64>,
    pub source: PointCloud,
    pub config: PoissonSettings,
}

impl Mesh {
    pub fn new(
        vertices: Vec<Point3<f64>>,
        faces: Vec<[usize; 3]>,
        vertex_density: Vec<f64>,
        source: PointCloud,
        config: PoissonSettings,
    ) -> Self {
        let vertex_normals = area_weighted_normals(&vertices, &faces);
        Self {
            vertices,
            faces,
            vertex_normals,
            vertex_density,
            source,
            config,
        }
    }

    fn corners(&self, face: &[usize; 3]) -> [Point3<f64>; 3] {
        face.map(|i| self.vertices[i])
    }

    /// Enclosed volume by the divergence theorem.
    pub fn volume(&self) -> f64 {
        let Some(origin) = self.vertices.first() else {
            return 0.0;
        };
        self.faces
            .iter()
            .map(|face| {
                let [a, b, c] = self.corners(face).map(|p| p - origin);
                a.dot(&b.cross(&c))
            })
            .sum::<f64>()
            / 6.0
    }

    pub fn surface_area(&self) -> f64 {
        self.faces
            .iter()
            .map(|face| {
                let [a, b, c] = self.corners(face);
                (b - a).cross(&(c - a)).norm() / 2.0
            })
            .sum()
    }

    /// True when every directed edge is matched by exactly one opposite edge,
    /// i.e. the mesh is closed and consistently oriented.
    pub fn is_watertight(&self) -> bool {
        if self.faces.is_empty() {
            return false;
        }
        let mut edges: HashMap<(usize, usize), usize> = HashMap::new();
        for &[a, b, c] in &self.faces {
            for edge in [(a, b), (b, c), (c, a)] {
                *edges.entry(edge).or_default() += 1;
            }
        }
        edges
            .iter()
            .all(|(&(a, b), &count)| count == 1 && edges.get(&(b, a)) == Some(&1))
    }

    /// Drops faces touching a vertex whose density falls below the
    /// `quantile` of all vertex densities, then compacts the vertices.
    pub fn trim(&self, quantile: f64) -> Result<Mesh> {
        if !(0.0..=1.0).contains(&quantile) {
            return Err(CrownError::invalid(format!(
                "trim quantile must lie in [0, 1], got {}",
                quantile
            )));
        }
        if self.vertex_density.len() != self.vertices.len()
            || self.vertex_density.iter().any(|d| !d.is_finite())
        {
            return Err(CrownError::Statistics(
                "vertex densities are missing or not finite".to_string(),
            ));
        }
        let mut densities: Array1<N64> = self.vertex_density.iter().map(|&d| n64(d)).collect();
        let threshold = densities
            .quantile_mut(n64(quantile), &Linear)
            .map_err(|e| CrownError::Statistics(e.to_string()))?
            .raw();

        let kept: Vec<[usize; 3]> = self
            .faces
            .iter()
            .filter(|face| face.iter().all(|&i| self.vertex_density[i] >= threshold))
            .copied()
            .collect();
        if kept.is_empty() {
            return Err(CrownError::EmptySurface);
        }
        if kept.len() < self.faces.len() {
            log::warn!(
                "trimmed {} of {} faces below density {:.4}",
                self.faces.len() - kept.len(),
                self.faces.len(),
                threshold
            );
        }

        let mut remap: HashMap<usize, usize> = HashMap::new();
        let mut vertices = Vec::new();
        let mut vertex_density = Vec::new();
        let faces = kept
            .iter()
            .map(|face| {
                face.map(|i| {
                    *remap.entry(i).or_insert_with(|| {
                        vertices.push(self.vertices[i]);
                        vertex_density.push(self.vertex_density[i]);
                        vertices.len() - 1
                    })
                })
            })
            .collect();

        Ok(Mesh::new(
            vertices,
            faces,
            vertex_density,
            self.source.clone(),
            self.config.clone(),
        ))
    }
}

fn area_weighted_normals(vertices: &[Point3<f64>], faces: &[[usize; 3]]) -> Vec<Vector3<f64>> {
    let mut normals = vec![Vector3::zeros(); vertices.len()];
    for &[a, b, c] in faces {
        // cross product length is twice the face area
        let n = (vertices[b] - vertices[a]).cross(&(vertices[c] - vertices[a]));
        for i in [a, b, c] {
            normals[i] += n;
        }
    }
    normals
        .into_iter()
        .map(|n| n.try_normalize(0.0).unwrap_or(n))
        .collect()
}
