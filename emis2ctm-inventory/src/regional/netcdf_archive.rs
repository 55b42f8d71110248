//! NetCDF-backed regional archive

use super::{regional_path, MonthlyDataset, RegionalArchive};
use emis2ctm_core::errors::{EmissionError, EmissionResult};
use emis2ctm_core::grid::SourceResolution;
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Regional datasets stored as NetCDF files below `root`
#[derive(Debug, Clone)]
pub struct NetcdfArchive {
    root: PathBuf,
    version: SourceResolution,
}

impl NetcdfArchive {
    pub fn new(root: impl Into<PathBuf>, version: SourceResolution) -> Self {
        Self {
            root: root.into(),
            version,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl RegionalArchive for NetcdfArchive {
    fn open(&self, year: i32, species: &str) -> EmissionResult<Option<Arc<dyn MonthlyDataset>>> {
        let path = self.locate(year, species);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Arc::new(NetcdfDataset { path })))
    }

    fn locate(&self, year: i32, species: &str) -> PathBuf {
        regional_path(&self.root, self.version, year, species)
    }
}

/// A single NetCDF file, opened for each read
#[derive(Debug, Clone)]
pub struct NetcdfDataset {
    path: PathBuf,
}

impl NetcdfDataset {
    fn error(&self, details: impl std::fmt::Display) -> EmissionError {
        EmissionError::parse(self.path.display().to_string(), details.to_string())
    }
}

impl MonthlyDataset for NetcdfDataset {
    fn read_month(&self, variable: &str, month: u32) -> EmissionResult<Option<Array2<f64>>> {
        let file = netcdf::open(&self.path).map_err(|e| self.error(e))?;
        let Some(var) = file.variable(variable) else {
            return Ok(None);
        };

        let dims: Vec<usize> = var.dimensions().iter().map(|d| d.len()).collect();
        let [months, rows, cols] = dims[..] else {
            return Err(self.error(format!(
                "variable {} has {} dimensions, expected 3",
                variable,
                dims.len()
            )));
        };
        let index = month as usize;
        if index == 0 || index > months {
            return Err(self.error(format!("variable {} has no month {}", variable, month)));
        }

        let extents = [index - 1..index, 0..rows, 0..cols];
        let values: Vec<f64> = var
            .values::<f64, _>(extents.as_slice())
            .map_err(|e| self.error(e))?;
        Array2::from_shape_vec((rows, cols), values)
            .map(Some)
            .map_err(|e| self.error(e))
    }
}
