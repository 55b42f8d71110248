//! Nearest-cell mapping from a latitude/longitude source grid to the destination grid
//!
//! For every destination cell the geographic centre is located in the source
//! grid by floor division, giving a pair of index arrays of destination shape.
//! Reprojecting a source field is then a gather followed by a multiplication
//! with the destination cell area (km²), which turns a per-km² flux density
//! into a per-cell amount.
//!
//! Destination cells whose centre lies outside the source grid are handled by
//! an explicit [`BoundaryPolicy`]; no index ever reads outside the source
//! array.
//!
//! # Examples
//!
//! ```rust
//! use emis2ctm_core::grid::{DestinationGrid, SourceGrid, SourceResolution};
//! use emis2ctm_core::lambert::LambertConformal;
//! use emis2ctm_core::mapping::{apply_mapping, build_mapping, BoundaryPolicy};
//! use ndarray::Array2;
//!
//! let projection = LambertConformal::from_proj_str(
//!     "+proj=lcc +lat_1=25 +lat_2=40 +lat_0=30.1 +lon_0=110.1 +R=6370000",
//! )
//! .unwrap();
//! let destination =
//!     DestinationGrid::new(projection, -1500.0, -1500.0, 3000.0, 3000.0, 1, 1).unwrap();
//! let source = SourceGrid::for_resolution(SourceResolution::QuarterDegree);
//!
//! let mapping = build_mapping(&destination, &source, BoundaryPolicy::ClampToEdge);
//! let field = Array2::from_elem(source.shape(), 5.0);
//! let projected = apply_mapping(&field, &mapping).unwrap();
//! assert!((projected[[0, 0]] - 5.0 * 9.0).abs() < 1e-9);
//! ```

use crate::cache::{CachePolicy, KeyedCache};
use crate::errors::{EmissionError, EmissionResult};
use crate::grid::{CellCenters, DestinationGrid, SourceGrid, SourceResolution};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// What to do with destination cells outside the source grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryPolicy {
    /// Use the nearest edge cell of the source grid
    #[default]
    ClampToEdge,
    /// Treat the cell as uncovered and give it zero emissions
    Exclude,
}

/// Precomputed source indices for every destination cell
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionMapping {
    resolution: SourceResolution,
    source_shape: (usize, usize),
    destination_shape: (usize, usize),
    rows: Array2<usize>,
    cols: Array2<usize>,
    /// False for cells outside the source grid
    covered: Array2<bool>,
    policy: BoundaryPolicy,
    area_factor: f64,
}

impl ProjectionMapping {
    pub fn resolution(&self) -> SourceResolution {
        self.resolution
    }

    pub fn source_shape(&self) -> (usize, usize) {
        self.source_shape
    }

    pub fn destination_shape(&self) -> (usize, usize) {
        self.destination_shape
    }

    /// Source row index for each destination cell
    pub fn row_index(&self) -> &Array2<usize> {
        &self.rows
    }

    /// Source column index for each destination cell
    pub fn col_index(&self) -> &Array2<usize> {
        &self.cols
    }

    /// Destination cell area in km² (`dx * dy / 1e6`)
    pub fn area_factor(&self) -> f64 {
        self.area_factor
    }

    pub fn policy(&self) -> BoundaryPolicy {
        self.policy
    }

    /// Number of destination cells whose centre is outside the source grid
    pub fn uncovered_cells(&self) -> usize {
        self.covered.iter().filter(|covered| !**covered).count()
    }

    /// Reproject a source field, see [`apply_mapping`]
    pub fn apply(&self, source: &Array2<f64>) -> EmissionResult<Array2<f64>> {
        apply_mapping(source, self)
    }
}

/// Build the mapping for one source grid.
///
/// Cell centres are converted to geographic coordinates through the
/// destination projection and located in `source`.
pub fn build_mapping(
    destination: &DestinationGrid,
    source: &SourceGrid,
    policy: BoundaryPolicy,
) -> ProjectionMapping {
    build_mapping_from_centers(&destination.cell_centers(), destination, source, policy)
}

/// Build a mapping from already-computed cell centres
pub fn build_mapping_from_centers(
    centers: &CellCenters,
    destination: &DestinationGrid,
    source: &SourceGrid,
    policy: BoundaryPolicy,
) -> ProjectionMapping {
    let shape = destination.shape();
    let max_row = source.rows.saturating_sub(1) as i64;
    let max_col = source.cols.saturating_sub(1) as i64;

    let mut rows = Array2::zeros(shape);
    let mut cols = Array2::zeros(shape);
    let mut covered = Array2::from_elem(shape, true);

    for ((r, c), lon) in centers.lon.indexed_iter() {
        let lat = centers.lat[[r, c]];
        let (row, col) = if lon.is_finite() && lat.is_finite() {
            source.locate(*lon, lat)
        } else {
            (-1, -1)
        };
        if row < 0 || row > max_row || col < 0 || col > max_col {
            covered[[r, c]] = false;
        }
        rows[[r, c]] = row.clamp(0, max_row) as usize;
        cols[[r, c]] = col.clamp(0, max_col) as usize;
    }

    let mapping = ProjectionMapping {
        resolution: source.resolution,
        source_shape: source.shape(),
        destination_shape: shape,
        rows,
        cols,
        covered,
        policy,
        area_factor: destination.cell_area_km2(),
    };

    let uncovered = mapping.uncovered_cells();
    if uncovered > 0 {
        warn!(
            resolution = %source.resolution,
            uncovered,
            ?policy,
            "destination cells fall outside the source grid"
        );
    }
    debug!(
        resolution = %source.resolution,
        rows = shape.0,
        cols = shape.1,
        "built projection mapping"
    );
    mapping
}

/// Gather a source field onto the destination grid.
///
/// The result has the destination shape and is scaled by the mapping's area
/// factor. Fails with [`EmissionError::IncompatibleGrid`] when `source` does
/// not have the shape the mapping was built for.
pub fn apply_mapping(
    source: &Array2<f64>,
    mapping: &ProjectionMapping,
) -> EmissionResult<Array2<f64>> {
    if source.dim() != mapping.source_shape {
        return Err(EmissionError::IncompatibleGrid {
            context: format!("{} source field", mapping.resolution),
            expected: mapping.source_shape,
            actual: source.dim(),
        });
    }

    let exclude = mapping.policy == BoundaryPolicy::Exclude;
    let mut out = Array2::zeros(mapping.destination_shape);
    for ((r, c), value) in out.indexed_iter_mut() {
        if exclude && !mapping.covered[[r, c]] {
            continue;
        }
        let source_value = source[[mapping.rows[[r, c]], mapping.cols[[r, c]]]];
        *value = source_value * mapping.area_factor;
    }
    Ok(out)
}

/// Builds and caches one [`ProjectionMapping`] per source resolution
#[derive(Debug)]
pub struct ProjectionMapper {
    destination: Arc<DestinationGrid>,
    policy: BoundaryPolicy,
    centers: OnceLock<Arc<CellCenters>>,
    mappings: KeyedCache<SourceResolution, ProjectionMapping>,
}

impl ProjectionMapper {
    pub fn new(destination: Arc<DestinationGrid>, policy: BoundaryPolicy) -> Self {
        Self {
            destination,
            policy,
            centers: OnceLock::new(),
            mappings: KeyedCache::new("projection mappings", CachePolicy::Unbounded),
        }
    }

    pub fn destination(&self) -> &DestinationGrid {
        &self.destination
    }

    /// Geographic cell centres of the destination grid, computed once
    pub fn cell_centers(&self) -> Arc<CellCenters> {
        Arc::clone(
            self.centers
                .get_or_init(|| Arc::new(self.destination.cell_centers())),
        )
    }

    /// The mapping for `source`, built on first use
    pub fn mapping(&self, source: &SourceGrid) -> EmissionResult<Arc<ProjectionMapping>> {
        let mapping = self.mappings.get_or_try_insert_with(source.resolution, || {
            Ok(build_mapping_from_centers(
                &self.cell_centers(),
                &self.destination,
                source,
                self.policy,
            ))
        })?;
        if mapping.source_shape() != source.shape() {
            return Err(EmissionError::IncompatibleGrid {
                context: format!("{} projection mapping", source.resolution),
                expected: mapping.source_shape(),
                actual: source.shape(),
            });
        }
        Ok(mapping)
    }

    /// Reproject a field defined on `source` onto the destination grid
    pub fn reproject(&self, source: &SourceGrid, field: &Array2<f64>) -> EmissionResult<Array2<f64>> {
        self.mapping(source)?.apply(field)
    }

    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.mappings.stats()
    }
}
