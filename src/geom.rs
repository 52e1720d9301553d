//! Quadrant-wise crown primitives.
//!
//! A crown is described by one [`CrownProfile`] per cardinal [`Direction`].
//! Between two cardinal directions the surface is blended inside a
//! [`Quadrant`], so the seams at 0°, 90°, 180° and 270° are shared by the
//! quadrants on either side and the radius cannot jump there.

use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_2;
use std::fmt;

use crate::config::MAX_PROFILE_SLOPE;

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(radius: f64, top: f64, bottom: f64) -> CrownProfile {
        CrownProfile {
            radius,
            edge_height: 10.0,
            top_shape: top,
            bottom_shape: bottom,
        }
    }

    #[test]
    fn wrap_angles() {
        assert_eq!(wrap_degrees(-90.0), 270.0);
        assert_eq!(wrap_degrees(360.0), 0.0);
        assert_eq!(wrap_degrees(725.0), 5.0);
    }

    #[test]
    fn locate_cardinals_start_quadrants() {
        assert_eq!(Quadrant::locate(0.0), (Quadrant::NorthEast, 0.0));
        assert_eq!(Quadrant::locate(90.0), (Quadrant::NorthWest, 0.0));
        assert_eq!(Quadrant::locate(180.0), (Quadrant::SouthWest, 0.0));
        assert_eq!(Quadrant::locate(270.0), (Quadrant::SouthEast, 0.0));
        let (quadrant, local) = Quadrant::locate(300.0);
        assert_eq!(quadrant, Quadrant::SouthEast);
        assert!((local - 30.0).abs() < 1e-12);
    }

    #[test]
    fn quadrants_share_seams() {
        for quadrant in Quadrant::ALL {
            let next = Quadrant::ALL[(quadrant.index() + 1) % 4];
            assert_eq!(quadrant.bounds().1, next.bounds().0);
        }
    }

    #[test]
    fn blend_hits_bounding_radii() {
        assert_eq!(blend_directional(2.0, 5.0, 0.0), 2.0);
        assert!((blend_directional(2.0, 5.0, 90.0) - 5.0).abs() < 1e-12);
        assert!((blend_directional(2.0, 5.0, 45.0) - 3.5).abs() < 1e-12);
        assert_eq!(blend_directional(0.0, 0.0, 30.0), 0.0);
    }

    #[test]
    fn profile_is_zero_at_ends_and_max_at_edge() {
        let p = profile(3.0, 2.0, 1.5);
        assert_eq!(p.radius_at(10.0, 4.0, 20.0), 3.0);
        assert_eq!(p.radius_at(20.0, 4.0, 20.0), 0.0);
        assert_eq!(p.radius_at(4.0, 4.0, 20.0), 0.0);
        assert_eq!(p.radius_at(25.0, 4.0, 20.0), 0.0);
        let mid = p.radius_at(15.0, 4.0, 20.0);
        assert!(mid > 0.0 && mid < 3.0);
    }

    #[test]
    fn cone_profile_is_linear() {
        let p = profile(4.0, 1.0, 1.0);
        assert!((p.radius_at(15.0, 0.0, 20.0) - 2.0).abs() < 1e-12);
        assert!((p.radius_at(5.0, 0.0, 20.0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn ellipse_profile() {
        let p = profile(4.0, 2.0, 2.0);
        // quarter ellipse: r = R * sqrt(1 - t^2)
        let r = p.radius_at(15.0, 0.0, 20.0);
        assert!((r - 4.0 * (1.0f64 - 0.25).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn slope_matches_finite_differences() {
        let d = 1e-6;
        for (top, bottom) in [(0.3, 0.7), (1.0, 1.0), (2.0, 3.0)] {
            let p = profile(3.0, top, bottom);
            for z in [5.0, 8.5, 11.0, 14.0, 18.0] {
                let numeric = (p.radius_at(z + d, 4.0, 20.0) - p.radius_at(z - d, 4.0, 20.0)) / (2.0 * d);
                let slope = p.slope_at(z, 4.0, 20.0);
                assert!(
                    (slope - numeric).abs() < 1e-5 * (1.0 + slope.abs()),
                    "shapes {}/{} at {}: {} vs {}",
                    top,
                    bottom,
                    z,
                    slope,
                    numeric
                );
            }
        }
    }

    #[test]
    fn slope_is_limited_where_profile_turns_horizontal() {
        // an ellipse meets its apex horizontally
        let p = profile(3.0, 2.0, 2.0);
        let near_apex = p.slope_at(20.0 - 1e-14, 4.0, 20.0);
        assert!(near_apex < -1e3 && near_apex >= -MAX_PROFILE_SLOPE);
        assert_eq!(p.slope_at(10.0, 4.0, 20.0), 0.0);
        assert_eq!(p.slope_at(25.0, 4.0, 20.0), 0.0);
    }
}

/// Wraps an angle in degrees into [0, 360).
pub fn wrap_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Cardinal directions, counter-clockwise from east.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    East,
    North,
    West,
    South,
}

impl Direction {
    /// Order used by every per-direction array in this crate.
    pub const ALL: [Direction; 4] = [
        Direction::East,
        Direction::North,
        Direction::West,
        Direction::South,
    ];

    pub fn index(self) -> usize {
        match self {
            Direction::East => 0,
            Direction::North => 1,
            Direction::West => 2,
            Direction::South => 3,
        }
    }

    /// Angle in degrees, counter-clockwise from east.
    pub fn angle(self) -> f64 {
        90.0 * self.index() as f64
    }

    /// Unit vector in the horizontal plane.
    pub fn unit(self) -> (f64, f64) {
        match self {
            Direction::East => (1.0, 0.0),
            Direction::North => (0.0, 1.0),
            Direction::West => (-1.0, 0.0),
            Direction::South => (0.0, -1.0),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Direction::East => "east",
            Direction::North => "north",
            Direction::West => "west",
            Direction::South => "south",
        };
        write!(f, "{}", name)
    }
}

/// The four angular sectors between cardinal directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quadrant {
    NorthEast,
    NorthWest,
    SouthWest,
    SouthEast,
}

impl Quadrant {
    pub const ALL: [Quadrant; 4] = [
        Quadrant::NorthEast,
        Quadrant::NorthWest,
        Quadrant::SouthWest,
        Quadrant::SouthEast,
    ];

    pub fn index(self) -> usize {
        match self {
            Quadrant::NorthEast => 0,
            Quadrant::NorthWest => 1,
            Quadrant::SouthWest => 2,
            Quadrant::SouthEast => 3,
        }
    }

    /// Directions at the start and end of the sector, counter-clockwise.
    pub fn bounds(self) -> (Direction, Direction) {
        match self {
            Quadrant::NorthEast => (Direction::East, Direction::North),
            Quadrant::NorthWest => (Direction::North, Direction::West),
            Quadrant::SouthWest => (Direction::West, Direction::South),
            Quadrant::SouthEast => (Direction::South, Direction::East),
        }
    }

    /// Finds the quadrant holding `angle` (degrees) and the angle measured
    /// from the quadrant's starting direction, in [0, 90).
    pub fn locate(angle: f64) -> (Quadrant, f64) {
        let angle = wrap_degrees(angle);
        let index = ((angle / 90.0).floor() as usize).min(3);
        let local = (angle - 90.0 * index as f64).clamp(0.0, 90.0);
        (Quadrant::ALL[index], local)
    }
}

/// Blends a per-direction quantity between the two directions bounding a quadrant.
///
/// Uses squared-cosine weights, `r_a cos²φ + r_b sin²φ`, which equals `r_a`
/// at φ = 0 and `r_b` at φ = 90° with zero slope at both ends, so adjoining
/// quadrants meet smoothly. Zero radii are allowed.
pub fn blend_directional(start: f64, end: f64, local_angle: f64) -> f64 {
    if local_angle == 0.0 {
        return start;
    }
    let phi = local_angle.to_radians().min(FRAC_PI_2);
    let cos2 = phi.cos().powi(2);
    start * cos2 + end * (1.0 - cos2)
}

/// Vertical profile of the crown along one cardinal direction.
///
/// Above `edge_height` the profile follows a superquadric segment with
/// exponent `top_shape` that closes at the apex; below it a segment with
/// exponent `bottom_shape` that closes at the crown base. An exponent of 1
/// gives a cone, 2 an ellipse, values below 1 are concave and above 1 convex.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CrownProfile {
    pub radius: f64,      // horizontal distance from the crown axis at maximum width
    pub edge_height: f64, // absolute elevation of maximum width
    pub top_shape: f64,
    pub bottom_shape: f64,
}

impl CrownProfile {
    /// Radius of the profile at elevation `z` for a crown spanning
    /// `base_z..=apex_z`. Zero outside that range.
    pub fn radius_at(&self, z: f64, base_z: f64, apex_z: f64) -> f64 {
        if z <= base_z || z >= apex_z || self.radius == 0.0 {
            return 0.0;
        }
        if z == self.edge_height {
            return self.radius;
        }
        let (t, shape) = if z > self.edge_height {
            (
                (z - self.edge_height) / (apex_z - self.edge_height),
                self.top_shape,
            )
        } else {
            (
                (self.edge_height - z) / (self.edge_height - base_z),
                self.bottom_shape,
            )
        };
        let t = t.clamp(0.0, 1.0);
        self.radius * (1.0 - t.powf(shape)).max(0.0).powf(1.0 / shape)
    }

    /// Derivative of [`CrownProfile::radius_at`] with respect to `z`.
    ///
    /// Zero at the edge height and outside the crown. Where the profile
    /// turns horizontal the magnitude is capped at `MAX_PROFILE_SLOPE`.
    pub fn slope_at(&self, z: f64, base_z: f64, apex_z: f64) -> f64 {
        if z <= base_z || z >= apex_z || self.radius == 0.0 || z == self.edge_height {
            return 0.0;
        }
        let (t, shape, span, sign) = if z > self.edge_height {
            (
                (z - self.edge_height) / (apex_z - self.edge_height),
                self.top_shape,
                apex_z - self.edge_height,
                -1.0,
            )
        } else {
            (
                (self.edge_height - z) / (self.edge_height - base_z),
                self.bottom_shape,
                self.edge_height - base_z,
                1.0,
            )
        };
        let t = t.clamp(0.0, 1.0);
        let rest = 1.0 - t.powf(shape);
        let slope = if rest > 0.0 {
            self.radius * t.powf(shape - 1.0) * rest.powf(1.0 / shape - 1.0) / span
        } else {
            MAX_PROFILE_SLOPE
        };
        (sign * slope).clamp(-MAX_PROFILE_SLOPE, MAX_PROFILE_SLOPE)
    }
}
