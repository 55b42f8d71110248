//! Administrative region lookup
//!
//! The point-in-polygon query itself is a black box behind the
//! [`RegionLookup`] trait. [`PolygonRegions`] is a straightforward
//! implementation over `geo` multipolygons, and [`RegionRaster`] evaluates a
//! lookup once per destination cell so that later control-factor builds are a
//! plain array scan.

use crate::errors::{EmissionError, EmissionResult};
use crate::grid::CellCenters;
use geo::{BoundingRect, Contains, MultiPolygon, Point, Rect};
use ndarray::Array2;
use tracing::debug;

/// Answers "which province contains this point"
pub trait RegionLookup: Send + Sync {
    /// Two-digit provincial code of the region containing `(lon, lat)`
    fn region_code(&self, lon: f64, lat: f64) -> Option<u32>;
}

impl<F> RegionLookup for F
where
    F: Fn(f64, f64) -> Option<u32> + Send + Sync,
{
    fn region_code(&self, lon: f64, lat: f64) -> Option<u32> {
        self(lon, lat)
    }
}

/// Extract the provincial code from an administrative code such as `"110000"`
pub fn provincial_code(admin_code: &str) -> EmissionResult<u32> {
    let prefix = admin_code.trim().get(..2).unwrap_or("");
    prefix.parse::<u32>().map_err(|_| {
        EmissionError::parse(
            "region boundaries",
            format!("invalid administrative code '{}'", admin_code),
        )
    })
}

#[derive(Debug, Clone)]
struct Region {
    code: u32,
    shape: MultiPolygon<f64>,
    bounds: Option<Rect<f64>>,
}

/// A set of polygons tagged with provincial codes
///
/// Regions are tested in insertion order and the first containing region
/// wins.
#[derive(Debug, Clone, Default)]
pub struct PolygonRegions {
    regions: Vec<Region>,
}

impl PolygonRegions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a region from its full administrative code
    pub fn push(
        &mut self,
        admin_code: &str,
        shape: impl Into<MultiPolygon<f64>>,
    ) -> EmissionResult<()> {
        let code = provincial_code(admin_code)?;
        self.push_code(code, shape);
        Ok(())
    }

    /// Add a region with an already-extracted provincial code
    pub fn push_code(&mut self, code: u32, shape: impl Into<MultiPolygon<f64>>) {
        let shape = shape.into();
        let bounds = shape.bounding_rect();
        self.regions.push(Region {
            code,
            shape,
            bounds,
        });
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl RegionLookup for PolygonRegions {
    fn region_code(&self, lon: f64, lat: f64) -> Option<u32> {
        let point = Point::new(lon, lat);
        self.regions
            .iter()
            .filter(|region| match region.bounds {
                Some(rect) => {
                    let (min, max) = (rect.min(), rect.max());
                    lon >= min.x && lon <= max.x && lat >= min.y && lat <= max.y
                }
                None => false,
            })
            .find(|region| region.shape.contains(&point))
            .map(|region| region.code)
    }
}

/// Region codes for every destination cell
#[derive(Debug, Clone, PartialEq)]
pub struct RegionRaster {
    codes: Array2<Option<u32>>,
}

impl RegionRaster {
    /// Evaluate `lookup` at every cell centre
    pub fn build(centers: &CellCenters, lookup: &dyn RegionLookup) -> Self {
        let codes = ndarray::Zip::from(&centers.lon)
            .and(&centers.lat)
            .map_collect(|&lon, &lat| lookup.region_code(lon, lat));
        let raster = Self { codes };
        debug!(
            cells = raster.codes.len(),
            assigned = raster.assigned_cells(),
            "built region raster"
        );
        raster
    }

    pub fn from_codes(codes: Array2<Option<u32>>) -> Self {
        Self { codes }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.codes.dim()
    }

    pub fn code(&self, row: usize, col: usize) -> Option<u32> {
        self.codes.get((row, col)).copied().flatten()
    }

    pub fn codes(&self) -> &Array2<Option<u32>> {
        &self.codes
    }

    /// Number of cells that fall inside some region
    pub fn assigned_cells(&self) -> usize {
        self.codes.iter().filter(|code| code.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, Polygon};
    use ndarray::array;

    fn square(x0: f64, y0: f64, size: f64) -> Polygon<f64> {
        polygon![
            (x: x0, y: y0),
            (x: x0 + size, y: y0),
            (x: x0 + size, y: y0 + size),
            (x: x0, y: y0 + size),
            (x: x0, y: y0),
        ]
    }

    #[test]
    fn test_provincial_code() {
        assert_eq!(provincial_code("110000").unwrap(), 11);
        assert_eq!(provincial_code(" 320100").unwrap(), 32);
        assert!(provincial_code("1").is_err());
        assert!(provincial_code("ab0000").is_err());
    }

    #[test]
    fn test_polygon_lookup() {
        let mut regions = PolygonRegions::new();
        regions.push("110000", square(116.0, 39.0, 1.0)).unwrap();
        regions.push("120000", square(117.0, 38.0, 1.0)).unwrap();

        assert_eq!(regions.len(), 2);
        assert_eq!(regions.region_code(116.5, 39.5), Some(11));
        assert_eq!(regions.region_code(117.5, 38.5), Some(12));
        assert_eq!(regions.region_code(100.0, 30.0), None);
    }

    #[test]
    fn test_closure_lookup() {
        let lookup = |lon: f64, _lat: f64| if lon > 0.0 { Some(44_u32) } else { None };
        assert_eq!(lookup.region_code(1.0, 0.0), Some(44));
        assert_eq!(lookup.region_code(-1.0, 0.0), None);
    }

    #[test]
    fn test_raster_from_centers() {
        let centers = CellCenters {
            lon: array![[116.5, 117.5], [116.5, 120.0]],
            lat: array![[39.5, 38.5], [38.5, 30.0]],
        };
        let mut regions = PolygonRegions::new();
        regions.push_code(11, square(116.0, 39.0, 1.0));
        regions.push_code(12, square(117.0, 38.0, 1.0));

        let raster = RegionRaster::build(&centers, &regions);
        assert_eq!(raster.shape(), (2, 2));
        assert_eq!(raster.code(0, 0), Some(11));
        assert_eq!(raster.code(0, 1), Some(12));
        assert_eq!(raster.code(1, 0), None);
        assert_eq!(raster.code(5, 5), None);
        assert_eq!(raster.assigned_cells(), 2);
    }
}
