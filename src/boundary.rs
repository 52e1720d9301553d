//! Plot boundaries and crown footprints as counter-clockwise rings.

use geo::orient::{Direction as Winding, Orient};
use geo::{Area, Centroid, Contains};
use geo_clipper::Clipper;
use geo_types::{Coord, LineString, Point, Polygon};
use itertools::Itertools;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use crate::config::{CLIP_SCALE, MIN_RESOLUTION};
use crate::error::{CrownError, Result};
use crate::raster::{BoundingBox, RasterQuery};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::ElevationGrid;
    use ndarray::Array2;

    fn c(x: f64, y: f64) -> Coord<f64> {
        Coord { x, y }
    }

    #[test]
    fn square_hull_is_ccw_from_lower_left() {
        let corners = [c(1.0, 1.0), c(0.0, 0.0), c(0.0, 1.0), c(1.0, 0.0)];
        let orders = [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1]];
        for order in orders {
            let input: Vec<_> = order.iter().map(|&i| corners[i]).collect();
            let hull = peripheral_points_2d(&input).unwrap();
            assert_eq!(
                hull.ring,
                vec![c(0.0, 0.0), c(1.0, 0.0), c(1.0, 1.0), c(0.0, 1.0)]
            );
        }
    }

    #[test]
    fn interior_collinear_and_duplicate_points_are_dropped() {
        let input = [
            c(0.0, 0.0),
            c(2.0, 0.0),
            c(1.0, 0.0),
            c(1.0, 1.0),
            c(2.0, 2.0),
            c(0.0, 2.0),
            c(2.0, 2.0),
        ];
        let hull = peripheral_points_2d(&input).unwrap();
        assert_eq!(
            hull.ring,
            vec![c(0.0, 0.0), c(2.0, 0.0), c(2.0, 2.0), c(0.0, 2.0)]
        );
        assert!((hull.area() - 4.0).abs() < 1e-12);
        assert!((hull.perimeter() - 8.0).abs() < 1e-12);
    }

    #[test]
    fn hull_carries_elevations() {
        let points = [
            Point3::new(0.0, 0.0, 5.0),
            Point3::new(1.0, 0.0, 6.0),
            Point3::new(0.5, 0.2, 9.0),
            Point3::new(0.0, 1.0, 7.0),
        ];
        let hull = peripheral_points(&points).unwrap();
        assert_eq!(hull.ring.len(), 3);
        assert_eq!(hull.elevations, Some(vec![5.0, 6.0, 7.0]));
    }

    #[test]
    fn small_sets_pass_through() {
        assert_eq!(
            peripheral_points(&[]).unwrap_err(),
            CrownError::EmptyPointSet
        );
        let pair = [Point3::new(3.0, 1.0, 2.0), Point3::new(-1.0, 0.0, 4.0)];
        let boundary = peripheral_points(&pair).unwrap();
        assert_eq!(boundary.ring, vec![c(3.0, 1.0), c(-1.0, 0.0)]);
        assert_eq!(boundary.elevations, Some(vec![2.0, 4.0]));
        assert_eq!(boundary.area(), 0.0);
    }

    #[test]
    fn circle_starts_north() {
        let ring = circular_plot_boundary(Coord { x: 5.0, y: -2.0 }, 10.0, 36).unwrap();
        assert_eq!(ring.len(), 36);
        assert!((ring.ring[0].x - 5.0).abs() < 1e-12);
        assert!((ring.ring[0].y - 8.0).abs() < 1e-12);
        // second vertex turns toward the west
        assert!(ring.ring[1].x < 5.0);
        assert!(ring.signed_area() > 0.0);
        assert!(circular_plot_boundary(Coord::zero(), 10.0, 2).is_err());
        assert!(circular_plot_boundary(Coord::zero(), 0.0, 8).is_err());
    }

    #[test]
    fn bbox_polygon_and_overlay() {
        let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0).unwrap();
        let square = raster_bbox_as_polygon(&bbox).unwrap();
        assert_eq!(
            square.ring,
            vec![c(0.0, 0.0), c(10.0, 0.0), c(10.0, 10.0), c(0.0, 10.0)]
        );
        assert!(square.contains(c(5.0, 5.0)));
        assert!(!square.contains(c(11.0, 5.0)));

        let plot = circular_plot_boundary(c(10.0, 10.0), 4.0, 64).unwrap();
        let clipped = plot.intersection(&square);
        assert_eq!(clipped.len(), 1);
        // a quarter of the disc
        let expected = plot.area() / 4.0;
        assert!((clipped[0].area() - expected).abs() < 1e-3);
        assert!(clipped[0].signed_area() > 0.0);

        let inverted = BoundingBox {
            xmin: 1.0,
            ymin: 0.0,
            xmax: 0.0,
            ymax: 1.0,
        };
        assert!(raster_bbox_as_polygon(&inverted).is_err());
    }

    #[test]
    fn plot_on_raster_takes_elevations() {
        let grid = ElevationGrid::new(
            Array2::from_elem((4, 4), 12.5),
            BoundingBox::new(0.0, 0.0, 40.0, 40.0).unwrap(),
        )
        .unwrap();
        let plot = circular_plot_boundary_on(&grid, c(20.0, 20.0), 5.0, 8).unwrap();
        assert_eq!(plot.elevations, Some(vec![12.5; 8]));
        let err = circular_plot_boundary_on(&grid, c(38.0, 20.0), 5.0, 8).unwrap_err();
        assert!(matches!(err, CrownError::OutOfBounds { .. }));
    }
}

/// An open, counter-clockwise ring of boundary vertices.
///
/// The first vertex is not repeated at the end. `elevations`, when present,
/// holds one z value per ring vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryPolygon {
    pub ring: Vec<Coord<f64>>,
    pub elevations: Option<Vec<f64>>,
}

impl BoundaryPolygon {
    pub fn new(ring: Vec<Coord<f64>>) -> Self {
        Self {
            ring,
            elevations: None,
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Closed geo polygon over the same vertices.
    pub fn to_polygon(&self) -> Polygon<f64> {
        Polygon::new(LineString::from(self.ring.clone()), vec![])
    }

    /// Shoelace area, positive for counter-clockwise rings.
    pub fn signed_area(&self) -> f64 {
        self.to_polygon().signed_area()
    }

    pub fn area(&self) -> f64 {
        self.to_polygon().unsigned_area()
    }

    pub fn perimeter(&self) -> f64 {
        if self.ring.len() < 2 {
            return 0.0;
        }
        self.ring
            .iter()
            .circular_tuple_windows()
            .map(|(a, b)| (b.x - a.x).hypot(b.y - a.y))
            .sum()
    }

    pub fn centroid(&self) -> Option<Coord<f64>> {
        self.to_polygon().centroid().map(|p| p.0)
    }

    /// Strict interior test; points on the ring are not contained.
    pub fn contains(&self, point: Coord<f64>) -> bool {
        self.to_polygon().contains(&Point(point))
    }

    /// Overlap of two boundaries, e.g. a sample plot against a raster extent.
    /// Holes of the overlay are dropped. Elevations are not carried.
    pub fn intersection(&self, other: &BoundaryPolygon) -> Vec<BoundaryPolygon> {
        self.to_polygon()
            .intersection(&other.to_polygon(), CLIP_SCALE)
            .0
            .into_iter()
            .map(|polygon| {
                let oriented = polygon.orient(Winding::Default);
                let mut ring = oriented.exterior().0.clone();
                if ring.len() > 1 && ring.first() == ring.last() {
                    ring.pop();
                }
                BoundaryPolygon::new(ring)
            })
            .filter(|boundary| !boundary.is_empty())
            .collect()
    }
}

/// Regular `n_points`-gon inscribed in a disc, counter-clockwise from north.
pub fn circular_plot_boundary(
    center: Coord<f64>,
    radius: f64,
    n_points: usize,
) -> Result<BoundaryPolygon> {
    if n_points < MIN_RESOLUTION {
        return Err(CrownError::invalid(format!(
            "a plot boundary needs at least {} points, got {}",
            MIN_RESOLUTION, n_points
        )));
    }
    if !(radius.is_finite() && radius > 0.0) {
        return Err(CrownError::invalid(format!(
            "plot radius must be positive, got {}",
            radius
        )));
    }
    let ring = (0..n_points)
        .map(|k| {
            let angle = (90.0 + 360.0 * k as f64 / n_points as f64).to_radians();
            Coord {
                x: center.x + radius * angle.cos(),
                y: center.y + radius * angle.sin(),
            }
        })
        .collect();
    Ok(BoundaryPolygon::new(ring))
}

/// As [`circular_plot_boundary`], with ground elevations looked up per vertex.
pub fn circular_plot_boundary_on<R: RasterQuery + ?Sized>(
    raster: &R,
    center: Coord<f64>,
    radius: f64,
    n_points: usize,
) -> Result<BoundaryPolygon> {
    let mut boundary = circular_plot_boundary(center, radius, n_points)?;
    let elevations = boundary
        .ring
        .iter()
        .map(|c| raster.elevation_at(c.x, c.y))
        .collect::<Result<Vec<_>>>()?;
    boundary.elevations = Some(elevations);
    Ok(boundary)
}

/// Convex footprint of a 3-D point set, projected onto the xy-plane.
///
/// Elevations of the hull vertices are carried along. Fewer than three
/// points are returned unchanged.
pub fn peripheral_points(points: &[Point3<f64>]) -> Result<BoundaryPolygon> {
    let coords: Vec<_> = points.iter().map(|p| Coord { x: p.x, y: p.y }).collect();
    let indices = hull_indices(&coords)?;
    Ok(BoundaryPolygon {
        ring: indices.iter().map(|&i| coords[i]).collect(),
        elevations: Some(indices.iter().map(|&i| points[i].z).collect()),
    })
}

/// Convex footprint of a 2-D point set.
pub fn peripheral_points_2d(points: &[Coord<f64>]) -> Result<BoundaryPolygon> {
    let indices = hull_indices(points)?;
    Ok(BoundaryPolygon::new(
        indices.iter().map(|&i| points[i]).collect(),
    ))
}

/// Axis-aligned box as a ring, counter-clockwise from the lower-left corner.
pub fn raster_bbox_as_polygon(bbox: &BoundingBox) -> Result<BoundaryPolygon> {
    bbox.validate()?;
    Ok(BoundaryPolygon::new(vec![
        Coord {
            x: bbox.xmin,
            y: bbox.ymin,
        },
        Coord {
            x: bbox.xmax,
            y: bbox.ymin,
        },
        Coord {
            x: bbox.xmax,
            y: bbox.ymax,
        },
        Coord {
            x: bbox.xmin,
            y: bbox.ymax,
        },
    ]))
}

fn cross(o: Coord<f64>, a: Coord<f64>, b: Coord<f64>) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

/// Andrew's monotone chain. Returns indices into `points`, counter-clockwise
/// from the lowest (x, y) vertex, without collinear vertices.
fn hull_indices(points: &[Coord<f64>]) -> Result<Vec<usize>> {
    if points.is_empty() {
        return Err(CrownError::EmptyPointSet);
    }
    if points.len() < 3 {
        return Ok((0..points.len()).collect());
    }
    if points.iter().any(|p| !(p.x.is_finite() && p.y.is_finite())) {
        return Err(CrownError::invalid("point set contains non-finite coordinates"));
    }

    let mut order: Vec<usize> = (0..points.len()).collect();
    // stable, so duplicates keep input order and the first one survives dedup
    order.sort_by(|&a, &b| {
        points[a]
            .x
            .total_cmp(&points[b].x)
            .then(points[a].y.total_cmp(&points[b].y))
    });
    order.dedup_by(|b, a| points[*a] == points[*b]);
    if order.len() < 3 {
        return Ok(order);
    }

    let mut hull: Vec<usize> = Vec::with_capacity(2 * order.len());
    let half_chain = |hull: &mut Vec<usize>, i: usize, floor: usize| {
        while hull.len() >= floor + 2
            && cross(
                points[hull[hull.len() - 2]],
                points[hull[hull.len() - 1]],
                points[i],
            ) <= 0.0
        {
            hull.pop();
        }
        hull.push(i);
    };
    for &i in &order {
        half_chain(&mut hull, i, 0);
    }
    let lower = hull.len() - 1;
    for &i in order.iter().rev().skip(1) {
        half_chain(&mut hull, i, lower);
    }
    // the last point closes back onto the first
    hull.pop();
    Ok(hull)
}
