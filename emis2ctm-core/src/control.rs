//! Regional policy control factors
//!
//! A control table scales emissions per province, sector, period and species.
//! Rows are indexed by `(sector, year, month, species)` and then by provincial
//! code, so building a destination-shaped factor grid is a single pass over a
//! precomputed [`RegionRaster`].
//!
//! A key with no rows means "no adjustment" and yields `None`.

use crate::cache::{CachePolicy, KeyedCache};
use crate::errors::{EmissionError, EmissionResult};
use crate::grid::{CellCenters, DestinationGrid};
use crate::region::{RegionLookup, RegionRaster};
use crate::table::Table;
use ndarray::Array2;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Identifies one set of control rows
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControlKey {
    pub sector: String,
    pub year: i32,
    pub month: u32,
    pub species: String,
}

impl ControlKey {
    pub fn new(sector: &str, year: i32, month: u32, species: &str) -> Self {
        Self {
            sector: sector.to_string(),
            year,
            month,
            species: species.to_string(),
        }
    }
}

impl fmt::Display for ControlKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}-{:02}/{}",
            self.sector, self.year, self.month, self.species
        )
    }
}

/// Control rows indexed by key and provincial code
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ControlTable {
    rows: HashMap<ControlKey, HashMap<u32, f64>>,
}

impl ControlTable {
    /// Read an `adcode,sector,year,month,species,factor` table.
    ///
    /// When a region appears twice for the same key the later row wins.
    pub fn from_table(table: &Table) -> EmissionResult<Self> {
        let adcode = table.column_index("adcode")?;
        let sector = table.column_index("sector")?;
        let year = table.column_index("year")?;
        let month = table.column_index("month")?;
        let species = table.column_index("species")?;
        let factor = table.column_index("factor")?;

        let mut control = ControlTable::default();
        for row in table.rows() {
            let key = ControlKey::new(
                row.get(sector),
                row.parse(year)?,
                row.parse(month)?,
                row.get(species),
            );
            control.insert(key, row.parse(adcode)?, row.parse(factor)?);
        }
        Ok(control)
    }

    pub fn from_path(path: &Path) -> EmissionResult<Self> {
        let control = Self::from_table(&Table::from_path(path)?)?;
        info!(path = %path.display(), keys = control.len(), "loaded control table");
        Ok(control)
    }

    pub fn insert(&mut self, key: ControlKey, region: u32, factor: f64) {
        self.rows.entry(key).or_default().insert(region, factor);
    }

    /// Factor per provincial code for a key, `None` when the key has no rows
    pub fn factors(&self, key: &ControlKey) -> Option<&HashMap<u32, f64>> {
        self.rows.get(key)
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Build the factor grid for `key`.
///
/// Cells in a region with a control row take that row's factor; every other
/// cell is 1.0. Returns `None` when the table has no rows for the key.
pub fn control_factor(
    table: &ControlTable,
    key: &ControlKey,
    raster: &RegionRaster,
) -> Option<Array2<f64>> {
    let by_region = table.factors(key)?;
    let grid = raster.codes().map(|code| {
        code.and_then(|region| by_region.get(&region).copied())
            .unwrap_or(1.0)
    });
    debug!(
        %key,
        matched = grid.iter().filter(|value| **value != 1.0).count(),
        "built control factor grid"
    );
    Some(grid)
}

/// Control factors for a destination grid, cached per key
#[derive(Debug)]
pub struct ControlFactors {
    table: ControlTable,
    raster: RegionRaster,
    grids: KeyedCache<ControlKey, Array2<f64>>,
}

impl ControlFactors {
    pub fn new(table: ControlTable, raster: RegionRaster) -> Self {
        Self {
            table,
            raster,
            grids: KeyedCache::new("control factors", CachePolicy::Unbounded),
        }
    }

    /// Rasterise `lookup` onto the destination grid and wrap `table`
    pub fn build(table: ControlTable, grid: &DestinationGrid, lookup: &dyn RegionLookup) -> Self {
        Self::from_centers(table, &grid.cell_centers(), lookup)
    }

    pub fn from_centers(table: ControlTable, centers: &CellCenters, lookup: &dyn RegionLookup) -> Self {
        Self::new(table, RegionRaster::build(centers, lookup))
    }

    pub fn table(&self) -> &ControlTable {
        &self.table
    }

    pub fn raster(&self) -> &RegionRaster {
        &self.raster
    }

    /// The factor grid for `key`, or `None` when no adjustment applies
    pub fn factor(&self, key: &ControlKey) -> EmissionResult<Option<Arc<Array2<f64>>>> {
        if self.table.factors(key).is_none() {
            return Ok(None);
        }
        self.grids
            .get_or_try_insert_with(key.clone(), || {
                control_factor(&self.table, key, &self.raster).ok_or_else(|| {
                    EmissionError::MissingConfiguration(format!("control rows for {}", key))
                })
            })
            .map(Some)
    }

    /// Multiply `field` by the factor grid for `key`.
    ///
    /// Returns whether an adjustment was applied.
    pub fn apply(&self, key: &ControlKey, field: &mut Array2<f64>) -> EmissionResult<bool> {
        let Some(factor) = self.factor(key)? else {
            return Ok(false);
        };
        if factor.dim() != field.dim() {
            return Err(EmissionError::IncompatibleGrid {
                context: format!("control factors for {}", key),
                expected: factor.dim(),
                actual: field.dim(),
            });
        }
        *field *= &*factor;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn table() -> ControlTable {
        ControlTable::from_table(
            &Table::parse(
                "adcode,sector,year,month,species,factor\n\
                 11,power,2020,1,NOx,0.5\n\
                 13,power,2020,1,SO2,0.8\n\
                 12,industry,2020,1,VOC,0.9\n\
                 12,industry,2020,1,VOC,0.7\n",
                "control.csv",
            )
            .unwrap(),
        )
        .unwrap()
    }

    fn raster() -> RegionRaster {
        RegionRaster::from_codes(array![[Some(11), Some(12)], [None, Some(13)]])
    }

    #[test]
    fn test_no_matching_rows_is_none() {
        let key = ControlKey::new("power", 2020, 2, "NOx");
        assert!(control_factor(&table(), &key, &raster()).is_none());
    }

    #[test]
    fn test_factor_grid_by_region() {
        let key = ControlKey::new("power", 2020, 1, "NOx");
        let grid = control_factor(&table(), &key, &raster()).unwrap();
        assert_eq!(grid, array![[0.5, 1.0], [1.0, 1.0]]);
    }

    #[test]
    fn test_later_rows_win() {
        let key = ControlKey::new("industry", 2020, 1, "VOC");
        let grid = control_factor(&table(), &key, &raster()).unwrap();
        assert_eq!(grid[[0, 1]], 0.7);
    }

    #[test]
    fn test_all_ones_is_no_adjustment() {
        let mut ones = ControlTable::default();
        let key = ControlKey::new("power", 2020, 1, "CO");
        for region in [11, 12, 13] {
            ones.insert(key.clone(), region, 1.0);
        }
        let control = ControlFactors::new(ones, raster());

        let original = array![[1.5, -2.0], [3.25, 0.0]];
        let mut field = original.clone();
        assert!(control.apply(&key, &mut field).unwrap());
        assert_eq!(field, original);
    }

    #[test]
    fn test_apply_scales_matching_cells() {
        let control = ControlFactors::new(table(), raster());
        let mut field = array![[10.0, 10.0], [10.0, 10.0]];

        assert!(!control
            .apply(&ControlKey::new("power", 2021, 1, "NOx"), &mut field)
            .unwrap());
        assert!(control
            .apply(&ControlKey::new("power", 2020, 1, "SO2"), &mut field)
            .unwrap());
        assert_eq!(field, array![[10.0, 10.0], [10.0, 8.0]]);
    }

    #[test]
    fn test_apply_rejects_shape_mismatch() {
        let control = ControlFactors::new(table(), raster());
        let mut field = Array2::zeros((3, 3));
        let err = control
            .apply(&ControlKey::new("power", 2020, 1, "NOx"), &mut field)
            .unwrap_err();
        assert!(matches!(err, EmissionError::IncompatibleGrid { .. }));
    }

    #[test]
    fn test_grids_are_cached() {
        let control = ControlFactors::new(table(), raster());
        let key = ControlKey::new("power", 2020, 1, "NOx");
        let first = control.factor(&key).unwrap().unwrap();
        let second = control.factor(&key).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
