//! Source and destination grid geometry
//!
//! Two kinds of grid take part in every emission calculation:
//!
//! - [`SourceGrid`]: the regular latitude/longitude grid an inventory is
//!   published on. Row index increases northward, column index eastward.
//! - [`DestinationGrid`]: the model's Lambert-projected computational grid.
//!   Arrays on this grid have shape `(ycells, xcells)` with row 0 at the
//!   southern edge.
//!
//! Geographic cell centres are returned from [`DestinationGrid::cell_centers`]
//! as values rather than stored in shared state.

use crate::errors::{EmissionError, EmissionResult};
use crate::lambert::LambertConformal;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Earth radius used for source cell areas (km)
pub const EARTH_RADIUS_KM: f64 = 6371.392;

/// Square metres per square kilometre
pub const M2_PER_KM2: f64 = 1_000_000.0;

/// Resolution tag of a regional inventory source grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceResolution {
    /// 0.25° grid (inventory version 1)
    #[serde(rename = "1", alias = "v1")]
    QuarterDegree,
    /// 0.1° grid (inventory version 2)
    #[serde(rename = "2", alias = "v2")]
    TenthDegree,
}

impl SourceResolution {
    /// Grid spacing in degrees
    pub fn step(&self) -> f64 {
        match self {
            SourceResolution::QuarterDegree => 0.25,
            SourceResolution::TenthDegree => 0.1,
        }
    }
}

impl std::fmt::Display for SourceResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceResolution::QuarterDegree => write!(f, "0.25deg"),
            SourceResolution::TenthDegree => write!(f, "0.1deg"),
        }
    }
}

/// A regular latitude/longitude grid
///
/// `lat0`/`lon0` are the coordinates associated with row 0 and column 0;
/// a point falls in row `floor((lat - lat0) / step)`.
///
/// # Examples
///
/// ```rust
/// use emis2ctm_core::grid::{SourceGrid, SourceResolution};
///
/// let grid = SourceGrid::for_resolution(SourceResolution::QuarterDegree);
/// assert_eq!(grid.shape(), (441, 560));
/// assert_eq!(grid.locate(40.1, -20.2), (0, 0));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceGrid {
    pub resolution: SourceResolution,
    pub lat0: f64,
    pub lon0: f64,
    pub step: f64,
    pub rows: usize,
    pub cols: usize,
}

impl SourceGrid {
    pub fn new(
        resolution: SourceResolution,
        lat0: f64,
        lon0: f64,
        step: f64,
        rows: usize,
        cols: usize,
    ) -> Self {
        Self {
            resolution,
            lat0,
            lon0,
            step,
            rows,
            cols,
        }
    }

    /// The published extent of each inventory version
    pub fn for_resolution(resolution: SourceResolution) -> Self {
        match resolution {
            SourceResolution::QuarterDegree => Self::new(resolution, -20.25, 40.0, 0.25, 441, 560),
            SourceResolution::TenthDegree => Self::new(resolution, -14.95, 60.05, 0.1, 750, 940),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Latitude associated with each row
    pub fn latitudes(&self) -> Array1<f64> {
        Array1::from_iter((0..self.rows).map(|row| self.lat0 + row as f64 * self.step))
    }

    /// Longitude associated with each column
    pub fn longitudes(&self) -> Array1<f64> {
        Array1::from_iter((0..self.cols).map(|col| self.lon0 + col as f64 * self.step))
    }

    /// Unclamped `(row, col)` index of the cell containing a point.
    ///
    /// Indices may be negative or beyond the grid; see
    /// [`BoundaryPolicy`](crate::mapping::BoundaryPolicy) for how the mapper
    /// treats them.
    pub fn locate(&self, lon: f64, lat: f64) -> (i64, i64) {
        (
            ((lat - self.lat0) / self.step).floor() as i64,
            ((lon - self.lon0) / self.step).floor() as i64,
        )
    }

    /// Area of a cell in the given row (km²)
    ///
    /// Spherical approximation `Re·cos(lat)·Δλ × Re·Δφ`.
    pub fn cell_area_km2(&self, row: usize) -> f64 {
        let lat = self.lat0 + row as f64 * self.step;
        let step = self.step.to_radians();
        let x = EARTH_RADIUS_KM * lat.to_radians().cos() * step;
        let y = EARTH_RADIUS_KM * step;
        x * y
    }

    /// Cell area for every row (km²)
    pub fn row_areas(&self) -> Array1<f64> {
        Array1::from_iter((0..self.rows).map(|row| self.cell_area_km2(row)))
    }
}

/// Geographic coordinates of destination cell centres
///
/// Both arrays have the destination grid shape `(ycells, xcells)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CellCenters {
    pub lon: Array2<f64>,
    pub lat: Array2<f64>,
}

/// The model's projected computational grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationGrid {
    projection: LambertConformal,
    /// Projected x of the western edge (m)
    pub xorig: f64,
    /// Projected y of the southern edge (m)
    pub yorig: f64,
    /// Cell width (m)
    pub dx: f64,
    /// Cell height (m)
    pub dy: f64,
    pub xcells: usize,
    pub ycells: usize,
}

impl DestinationGrid {
    pub fn new(
        projection: LambertConformal,
        xorig: f64,
        yorig: f64,
        dx: f64,
        dy: f64,
        xcells: usize,
        ycells: usize,
    ) -> EmissionResult<Self> {
        if xcells == 0 || ycells == 0 {
            return Err(EmissionError::MissingConfiguration(format!(
                "destination grid needs at least one cell, got {}x{}",
                xcells, ycells
            )));
        }
        if !(dx > 0.0 && dy > 0.0) {
            return Err(EmissionError::MissingConfiguration(format!(
                "destination cell size must be positive, got dx={} dy={}",
                dx, dy
            )));
        }
        Ok(Self {
            projection,
            xorig,
            yorig,
            dx,
            dy,
            xcells,
            ycells,
        })
    }

    pub fn projection(&self) -> &LambertConformal {
        &self.projection
    }

    /// Array shape `(rows, cols)` = `(ycells, xcells)`
    pub fn shape(&self) -> (usize, usize) {
        (self.ycells, self.xcells)
    }

    /// Cell area in km², the factor turning a per-km² flux into a per-cell rate
    pub fn cell_area_km2(&self) -> f64 {
        self.dx * self.dy / M2_PER_KM2
    }

    /// Projected coordinates of a cell centre
    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.xorig + col as f64 * self.dx + self.dx / 2.0,
            self.yorig + row as f64 * self.dy + self.dy / 2.0,
        )
    }

    /// Geographic coordinates of every cell centre
    pub fn cell_centers(&self) -> CellCenters {
        let shape = self.shape();
        let mut lon = Array2::zeros(shape);
        let mut lat = Array2::zeros(shape);
        for ((row, col), value) in lon.indexed_iter_mut() {
            let (x, y) = self.cell_center(row, col);
            let (cell_lon, cell_lat) = self.projection.inverse(x, y);
            *value = cell_lon;
            lat[[row, col]] = cell_lat;
        }
        CellCenters { lon, lat }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn projection() -> LambertConformal {
        LambertConformal::from_proj_str(
            "+proj=lcc +lat_1=25 +lat_2=40 +lat_0=34 +lon_0=110 +a=6370000 +b=6370000",
        )
        .unwrap()
    }

    #[test]
    fn test_preset_extents() {
        let v1 = SourceGrid::for_resolution(SourceResolution::QuarterDegree);
        assert_eq!(v1.shape(), (441, 560));
        assert_abs_diff_eq!(v1.latitudes()[440], 89.75, epsilon = 1e-9);
        assert_abs_diff_eq!(v1.longitudes()[559], 179.75, epsilon = 1e-9);

        let v2 = SourceGrid::for_resolution(SourceResolution::TenthDegree);
        assert_eq!(v2.shape(), (750, 940));
        assert_abs_diff_eq!(v2.latitudes()[749], 59.95, epsilon = 1e-9);
    }

    #[test]
    fn test_locate_outside_is_unclamped() {
        let grid = SourceGrid::for_resolution(SourceResolution::QuarterDegree);
        assert_eq!(grid.locate(39.9, -20.3), (-1, -1));
        assert_eq!(grid.locate(180.1, 90.1), (441, 560));
    }

    #[test]
    fn test_cell_area_shrinks_toward_pole() {
        let grid = SourceGrid::for_resolution(SourceResolution::QuarterDegree);
        // Row 81 sits on the equator: -20.25 + 81 * 0.25 = 0
        let equator = grid.cell_area_km2(81);
        let expected = (EARTH_RADIUS_KM * 0.25_f64.to_radians()).powi(2);
        assert_abs_diff_eq!(equator, expected, epsilon = 1e-9);
        assert!(grid.cell_area_km2(300) < equator);
        assert_eq!(grid.row_areas().len(), 441);
    }

    #[test]
    fn test_destination_shape_and_area() {
        let grid = DestinationGrid::new(projection(), -1500.0, -1500.0, 3000.0, 3000.0, 4, 2).unwrap();
        assert_eq!(grid.shape(), (2, 4));
        assert_abs_diff_eq!(grid.cell_area_km2(), 9.0);
        assert_eq!(grid.cell_center(1, 3), (9000.0, 3000.0));
    }

    #[test]
    fn test_cell_centers_increase_north_and_east() {
        let grid =
            DestinationGrid::new(projection(), -30000.0, -30000.0, 20000.0, 20000.0, 3, 3).unwrap();
        let centers = grid.cell_centers();
        assert_eq!(centers.lon.dim(), (3, 3));
        assert_abs_diff_eq!(centers.lon[[1, 1]], 110.0, epsilon = 1e-9);
        assert_abs_diff_eq!(centers.lat[[1, 1]], 34.0, epsilon = 1e-9);
        assert!(centers.lat[[2, 1]] > centers.lat[[0, 1]]);
        assert!(centers.lon[[1, 2]] > centers.lon[[1, 0]]);
    }

    #[test]
    fn test_rejects_empty_grid() {
        assert!(DestinationGrid::new(projection(), 0.0, 0.0, 1.0, 1.0, 0, 3).is_err());
        assert!(DestinationGrid::new(projection(), 0.0, 0.0, -1.0, 1.0, 3, 3).is_err());
    }
}
