//! Elevation lookups consumed while placing trees and plot boundaries.
//!
//! Raster loading belongs to the caller. This module only defines the
//! query contract and an in-memory grid that satisfies it.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{CrownError, Result};


/// Axis-aligned extent of a raster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl BoundingBox {
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Result<Self> {
        let bbox = Self {
            xmin,
            ymin,
            xmax,
            ymax,
        };
        bbox.validate()?;
        Ok(bbox)
    }

    pub fn validate(&self) -> Result<()> {
        let finite = [self.xmin, self.ymin, self.xmax, self.ymax]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.xmin >= self.xmax || self.ymin >= self.ymax {
            return Err(CrownError::invalid(format!(
                "bounding box [{}, {}] x [{}, {}] is empty or inverted",
                self.xmin, self.xmax, self.ymin, self.ymax
            )));
        }
        Ok(())
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.xmin && x <= self.xmax && y >= self.ymin && y <= self.ymax
    }
}

/// Elevation and extent queries against a raster.
///
/// Implementations must return [`CrownError::OutOfBounds`] for locations
/// outside the raster rather than inventing an elevation.
pub trait RasterQuery {
    fn elevation_at(&self, x: f64, y: f64) -> Result<f64>;

    fn bounding_box(&self) -> BoundingBox;

    fn out_of_bounds(&self, x: f64, y: f64) -> CrownError {
        let bbox = self.bounding_box();
        CrownError::OutOfBounds {
            x,
            y,
            xmin: bbox.xmin,
            xmax: bbox.xmax,
            ymin: bbox.ymin,
            ymax: bbox.ymax,
        }
    }
}

/// In-memory elevation model, row-major with the origin at the top-left.
///
/// Cell (r, c) is centred on
///   x = xmin + (c + 0.5) * res_x
///   y = ymax - (r + 0.5) * res_y
#[derive(Debug, Clone)]
pub struct ElevationGrid {
    data: Array2<f64>,
    extent: BoundingBox,
}

impl ElevationGrid {
    pub fn new(data: Array2<f64>, extent: BoundingBox) -> Result<Self> {
        extent.validate()?;
        if data.is_empty() {
            return Err(CrownError::invalid("elevation grid has no cells"));
        }
        Ok(Self { data, extent })
    }

    /// Cell width and height in map units.
    pub fn resolution(&self) -> (f64, f64) {
        let (nrow, ncol) = self.data.dim();
        (
            (self.extent.xmax - self.extent.xmin) / ncol as f64,
            (self.extent.ymax - self.extent.ymin) / nrow as f64,
        )
    }

    pub fn cell_centre(&self, row: usize, col: usize) -> (f64, f64) {
        let (res_x, res_y) = self.resolution();
        (
            self.extent.xmin + (col as f64 + 0.5) * res_x,
            self.extent.ymax - (row as f64 + 0.5) * res_y,
        )
    }

    fn cell_of(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        if !self.extent.contains(x, y) {
            return None;
        }
        let (nrow, ncol) = self.data.dim();
        let (res_x, res_y) = self.resolution();
        let col = ((x - self.extent.xmin) / res_x).floor() as usize;
        let row = ((self.extent.ymax - y) / res_y).floor() as usize;
        Some((row.min(nrow - 1), col.min(ncol - 1)))
    }
}

impl RasterQuery for ElevationGrid {
    fn elevation_at(&self, x: f64, y: f64) -> Result<f64> {
        let (row, col) = self
            .cell_of(x, y)
            .ok_or_else(|| self.out_of_bounds(x, y))?;
        let z = self.data[[row, col]];
        if z.is_nan() {
            // nodata cells are outside the modelled extent
            return Err(self.out_of_bounds(x, y));
        }
        Ok(z)
    }

    fn bounding_box(&self) -> BoundingBox {
        self.extent
    }
}
