/// Smallest angular or vertical sample count that still describes a surface.
pub const MIN_RESOLUTION: usize = 3;
/// Angular samples used by the memoized default crown hull.
pub const HULL_ANGULAR_RESOLUTION: usize = 32;
/// Height levels used by the memoized default crown hull.
pub const HULL_VERTICAL_RESOLUTION: usize = 50;
/// Reconstruction depth bounds. The Poisson grid is dense, so memory grows as 8^depth.
pub const MIN_DEPTH: u32 = 1;
pub const MAX_DEPTH: u32 = 8;
/// Fewest points a neighborhood analysis will accept.
pub const MIN_NEIGHBORHOOD_POINTS: usize = 4;
/// A normal counts as inward when its cosine with the outward direction is below this.
pub const INWARD_COSINE: f64 = -0.2;
/// Default crown ratio when neither a ratio nor a crown-base height is given.
pub const DEFAULT_CROWN_RATIO: f64 = 0.65;
/// Integer scaling applied by the polygon clipper.
pub const CLIP_SCALE: f64 = 1e6;
/// Default neighborhood size for normal estimation.
pub const DEFAULT_NEIGHBORS: usize = 12;
/// Default largest fraction of inconsistent normals tolerated before reconstruction.
pub const MAX_INCONSISTENT_FRACTION: f64 = 0.1;
/// Largest profile slope |dr/dz| used for surface normals; steeper profiles are horizontal there.
pub const MAX_PROFILE_SLOPE: f64 = 1e6;
/// A neighborhood whose second variance is below this fraction of the first is treated as a line.
pub const COLLINEAR_VARIANCE_RATIO: f64 = 0.05;
/// Smallest |cosine| with the axis reference at which an estimated normal is oriented directly.
pub const ORIENTATION_CONFIDENCE: f64 = 0.3;
/// Horizontal distance from the axis, relative to the axis length, below which a point counts as on it.
pub const AXIS_RADIAL_EPSILON: f64 = 1e-9;
/// Default largest relative difference between mesh volume and crown volume.
pub const DEFAULT_MAX_VOLUME_ERROR: f64 = 0.25;
/// Integration grid for crown volumes: height levels by angles.
pub const CROWN_VOLUME_LEVELS: usize = 512;
pub const CROWN_VOLUME_ANGLES: usize = 360;
