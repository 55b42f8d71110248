//! Coarse inventory loader
//!
//! The coarse inventory is published as one ESRI ASCII grid per
//! (year, month, sector, species), already on the destination grid:
//!
//! ```text
//! {root}/{year}/{year}_{MM}_{sector}_{species}.asc
//! ```
//!
//! Files are written north-first and are flipped on read so that row 0 is the
//! southern edge, matching every other destination-grid array. Control factors
//! are applied after the flip.

use emis2ctm_core::cache::{CachePolicy, KeyedCache};
use emis2ctm_core::control::{ControlFactors, ControlKey};
use emis2ctm_core::errors::{EmissionError, EmissionResult};
use emis2ctm_core::species::{pm_substitution_factor, InventorySpecies, PmSubstitution, PM25};
use emis2ctm_core::table::read_grid;
use ndarray::{s, Array2};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default number of header lines in an ASCII grid
pub const DEFAULT_HEADER_ROWS: usize = 6;

type CoarseKey = (i32, u32, String, String);

/// Path of one coarse inventory grid
pub fn coarse_path(root: &Path, year: i32, month: u32, sector: &str, species: &str) -> PathBuf {
    root.join(year.to_string())
        .join(format!("{}_{:02}_{}_{}.asc", year, month, sector, species))
}

/// Loads coarse inventory grids with PM-coarse and PM2.5 substitution handling
#[derive(Debug)]
pub struct CoarseInventory {
    root: PathBuf,
    shape: (usize, usize),
    header_rows: usize,
    control: Option<Arc<ControlFactors>>,
    pm_substitution: Option<Arc<PmSubstitution>>,
    cache: KeyedCache<CoarseKey, Array2<f64>>,
}

impl CoarseInventory {
    /// A loader for grids under `root` with the destination `shape`
    pub fn new(root: impl Into<PathBuf>, shape: (usize, usize)) -> Self {
        Self {
            root: root.into(),
            shape,
            header_rows: DEFAULT_HEADER_ROWS,
            control: None,
            pm_substitution: None,
            cache: KeyedCache::new("coarse inventory", CachePolicy::Unbounded),
        }
    }

    pub fn with_header_rows(mut self, header_rows: usize) -> Self {
        self.header_rows = header_rows;
        self
    }

    pub fn with_control(mut self, control: Arc<ControlFactors>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn with_pm_substitution(mut self, pm_substitution: Arc<PmSubstitution>) -> Self {
        self.pm_substitution = Some(pm_substitution);
        self
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache = KeyedCache::new("coarse inventory", policy);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Monthly field for one sector and species, on the destination grid.
    ///
    /// - PM-coarse species are PM10 minus PM2.5, each control-adjusted first.
    /// - A species without a file is PM2.5 (control-adjusted with the PM2.5
    ///   key) scaled by the sector's substitution fraction.
    /// - Anything else is read directly and control-adjusted with the
    ///   species' control key.
    pub fn load(
        &self,
        year: i32,
        month: u32,
        sector: &str,
        species: &InventorySpecies,
    ) -> EmissionResult<Arc<Array2<f64>>> {
        let key = (year, month, sector.to_string(), species.name().to_string());
        self.cache
            .get_or_try_insert_with(key, || self.compute(year, month, sector, species))
    }

    fn compute(
        &self,
        year: i32,
        month: u32,
        sector: &str,
        species: &InventorySpecies,
    ) -> EmissionResult<Array2<f64>> {
        if let Some((pm10, pm25)) = species.coarse_operands() {
            let coarse = self.read_controlled(year, month, sector, &pm10)?
                - self.read_controlled(year, month, sector, &pm25)?;
            return Ok(coarse);
        }

        let path = coarse_path(&self.root, year, month, sector, species.name());
        if path.exists() {
            return self.read_controlled(year, month, sector, species);
        }

        let factor = pm_substitution_factor(self.pm_substitution.as_deref(), sector, species.name())?;
        warn!(
            path = %path.display(),
            sector,
            species = species.name(),
            factor,
            "coarse inventory file missing, substituting PM2.5"
        );
        let pm25 = self.read_controlled(year, month, sector, &InventorySpecies::new(PM25))?;
        Ok(pm25 * factor)
    }

    fn read_controlled(
        &self,
        year: i32,
        month: u32,
        sector: &str,
        species: &InventorySpecies,
    ) -> EmissionResult<Array2<f64>> {
        let mut field = self.read(&coarse_path(&self.root, year, month, sector, species.name()))?;
        if let Some(control) = &self.control {
            let key = ControlKey::new(sector, year, month, species.control_key());
            if control.apply(&key, &mut field)? {
                debug!(%key, "applied control factors to coarse inventory");
            }
        }
        Ok(field)
    }

    fn read(&self, path: &Path) -> EmissionResult<Array2<f64>> {
        let grid = read_grid(path, self.header_rows, None)?;
        if grid.dim() != self.shape {
            return Err(EmissionError::IncompatibleGrid {
                context: path.display().to_string(),
                expected: self.shape,
                actual: grid.dim(),
            });
        }
        Ok(grid.slice(s![..;-1, ..]).to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emis2ctm_core::control::ControlTable;
    use emis2ctm_core::region::RegionRaster;
    use ndarray::array;
    use std::fs;

    const HEADER: &str = "ncols 2\nnrows 2\nxllcorner 0\nyllcorner 0\ncellsize 1\nNODATA_value -9999\n";

    fn write_grid(root: &Path, sector: &str, species: &str, body: &str) {
        let path = coarse_path(root, 2020, 1, sector, species);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, format!("{}{}", HEADER, body)).unwrap();
    }

    #[test]
    fn test_path_layout() {
        let path = coarse_path(Path::new("input/MEIC"), 2020, 3, "power", "NOx");
        assert_eq!(path, PathBuf::from("input/MEIC/2020/2020_03_power_NOx.asc"));
    }

    #[test]
    fn test_grid_is_flipped_north_up() {
        let dir = tempfile::tempdir().unwrap();
        write_grid(dir.path(), "power", "SO2", "1 2\n3 4\n");

        let loader = CoarseInventory::new(dir.path(), (2, 2));
        let field = loader
            .load(2020, 1, "power", &InventorySpecies::new("SO2"))
            .unwrap();
        assert_eq!(*field, array![[3.0, 4.0], [1.0, 2.0]]);
    }

    #[test]
    fn test_wrong_shape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_grid(dir.path(), "power", "SO2", "1 2\n3 4\n");

        let loader = CoarseInventory::new(dir.path(), (3, 2));
        let err = loader
            .load(2020, 1, "power", &InventorySpecies::new("SO2"))
            .unwrap_err();
        assert!(matches!(err, EmissionError::IncompatibleGrid { .. }));
    }

    #[test]
    fn test_voc_subspecies_uses_voc_control() {
        let dir = tempfile::tempdir().unwrap();
        write_grid(dir.path(), "industry", "OLE_1", "2 2\n2 2\n");

        let mut table = ControlTable::default();
        table.insert(ControlKey::new("industry", 2020, 1, "VOC"), 11, 0.5);
        let raster = RegionRaster::from_codes(array![[Some(11), None], [None, None]]);
        let loader = CoarseInventory::new(dir.path(), (2, 2))
            .with_control(Arc::new(ControlFactors::new(table, raster)));

        let field = loader
            .load(2020, 1, "industry", &InventorySpecies::new("OLE_1"))
            .unwrap();
        assert_eq!(*field, array![[1.0, 2.0], [2.0, 2.0]]);
    }

    #[test]
    fn test_pm_coarse_operands_use_their_own_control() {
        let dir = tempfile::tempdir().unwrap();
        write_grid(dir.path(), "power", "PM10", "6 6\n6 6\n");
        write_grid(dir.path(), "power", "PM25", "2 2\n2 2\n");

        let mut table = ControlTable::default();
        table.insert(ControlKey::new("power", 2020, 1, "PM10"), 11, 0.5);
        table.insert(ControlKey::new("power", 2020, 1, "PM25"), 12, 0.25);
        // Never looked up: the operands carry their own keys
        table.insert(ControlKey::new("power", 2020, 1, "PMcoarse"), 11, 0.0);
        let raster = RegionRaster::from_codes(array![[Some(11), Some(12)], [None, None]]);
        let loader = CoarseInventory::new(dir.path(), (2, 2))
            .with_control(Arc::new(ControlFactors::new(table, raster)));

        let field = loader
            .load(2020, 1, "power", &InventorySpecies::new("PMcoarse"))
            .unwrap();
        // 6 × 0.5 - 2 and 6 - 2 × 0.25 in the south row, untouched 6 - 2 in the north
        assert_eq!(*field, array![[1.0, 5.5], [4.0, 4.0]]);
    }

    #[test]
    fn test_substitution_controls_pm25_before_scaling() {
        let dir = tempfile::tempdir().unwrap();
        write_grid(dir.path(), "power", "PM25", "4 4\n4 4\n");

        let mut table = ControlTable::default();
        table.insert(ControlKey::new("power", 2020, 1, "PM25"), 11, 0.5);
        table.insert(ControlKey::new("power", 2020, 1, "BC"), 11, 0.0);
        let raster = RegionRaster::from_codes(array![[Some(11), None], [None, None]]);
        let mut pm = PmSubstitution::default();
        pm.insert("power", "BC", 0.25);
        let loader = CoarseInventory::new(dir.path(), (2, 2))
            .with_control(Arc::new(ControlFactors::new(table, raster)))
            .with_pm_substitution(Arc::new(pm));

        let field = loader
            .load(2020, 1, "power", &InventorySpecies::new("BC"))
            .unwrap();
        assert_eq!(*field, array![[0.5, 1.0], [1.0, 1.0]]);
    }

    #[test]
    fn test_double_miss_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm = PmSubstitution::default();
        pm.insert("power", "BC", 0.4);
        let loader =
            CoarseInventory::new(dir.path(), (2, 2)).with_pm_substitution(Arc::new(pm));

        let err = loader
            .load(2020, 1, "power", &InventorySpecies::new("BC"))
            .unwrap_err();
        assert!(matches!(err, EmissionError::MissingSourceFile { .. }));
    }
}
