//! Regional inventory loader
//!
//! The regional inventory is distributed as one dataset per (species, year)
//! with a variable per sector, each indexed `[month - 1, row, col]` on a
//! regular latitude/longitude grid whose row 0 is the southernmost row.
//!
//! Datasets are reached through the [`RegionalArchive`] trait. With the
//! `netcdf` feature enabled, [`NetcdfArchive`] reads the published NetCDF
//! files; [`InMemoryArchive`] serves fields held in memory.

use emis2ctm_core::cache::{CachePolicy, KeyedCache};
use emis2ctm_core::errors::{EmissionError, EmissionResult};
use emis2ctm_core::grid::{SourceGrid, SourceResolution};
use emis2ctm_core::species::{pm_substitution_factor, InventorySpecies, PmSubstitution, PM25};
use emis2ctm_core::table::read_grid;
use ndarray::{Array2, Array3, Axis};
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(feature = "netcdf")]
mod netcdf_archive;
#[cfg(feature = "netcdf")]
pub use netcdf_archive::{NetcdfArchive, NetcdfDataset};

/// One species' monthly fields for every sector
pub trait MonthlyDataset: Debug + Send + Sync {
    /// The `[month - 1]` slice of `variable`, or `None` if the variable is absent
    fn read_month(&self, variable: &str, month: u32) -> EmissionResult<Option<Array2<f64>>>;
}

/// A collection of regional datasets addressed by year and species
pub trait RegionalArchive: Debug + Send + Sync {
    /// Open the dataset of `species`, or `None` when it is not published
    fn open(&self, year: i32, species: &str) -> EmissionResult<Option<Arc<dyn MonthlyDataset>>>;

    /// Where the dataset of `species` would be found
    fn locate(&self, year: i32, species: &str) -> PathBuf;
}

/// Path of one regional dataset below the archive root
pub fn regional_path(root: &Path, version: SourceResolution, year: i32, species: &str) -> PathBuf {
    match version {
        SourceResolution::QuarterDegree => root
            .join("MIX_V1")
            .join(format!("MIX_{}", year))
            .join(format!("MICS_Asia_{}_{}_0.25x0.25.nc", species, year)),
        SourceResolution::TenthDegree => root
            .join("MIX_V2")
            .join(year.to_string())
            .join(format!("MIXv2.3_{}_{}_monthly_0.1deg.nc", species, year)),
    }
}

/// Name of the variable holding `species` emissions from `sector`
///
/// Version 1 files use upper-case sector tags and spell PM2.5 with a dot;
/// version 2 files use title-cased sector names.
pub fn variable_name(
    version: SourceResolution,
    species: &str,
    sector: &str,
) -> EmissionResult<String> {
    match version {
        SourceResolution::QuarterDegree => {
            let tag = match sector {
                "power" => "POWER",
                "transportation" => "TRANSPORT",
                "residential" => "RESIDENTIAL",
                "industry" => "INDUSTRY",
                "agriculture" => "AGRICULTURE",
                _ => {
                    return Err(EmissionError::UnknownSector {
                        sector: sector.to_string(),
                        table: "regional inventory version 1 sectors".to_string(),
                    })
                }
            };
            let species = if species == PM25 { "PM2.5" } else { species };
            Ok(format!("{}_{}", species, tag))
        }
        SourceResolution::TenthDegree => Ok(format!("{}_{}", species, title_case(sector))),
    }
}

/// Upper-case the first letter of every alphabetic run, lower-case the rest
fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut at_word_start = true;
    for c in text.chars() {
        if c.is_alphabetic() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }
    out
}

/// Datasets held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    variables: HashMap<String, Array3<f64>>,
}

impl InMemoryDataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `(month, row, col)` variable
    pub fn with_variable(mut self, name: &str, values: Array3<f64>) -> Self {
        self.variables.insert(name.to_string(), values);
        self
    }
}

impl MonthlyDataset for InMemoryDataset {
    fn read_month(&self, variable: &str, month: u32) -> EmissionResult<Option<Array2<f64>>> {
        let Some(values) = self.variables.get(variable) else {
            return Ok(None);
        };
        let index = month as usize;
        if index == 0 || index > values.len_of(Axis(0)) {
            return Err(EmissionError::parse(
                variable,
                format!("no data for month {}", month),
            ));
        }
        Ok(Some(values.index_axis(Axis(0), index - 1).to_owned()))
    }
}

/// An archive of in-memory datasets
#[derive(Debug, Clone)]
pub struct InMemoryArchive {
    version: SourceResolution,
    datasets: HashMap<(i32, String), Arc<InMemoryDataset>>,
}

impl InMemoryArchive {
    pub fn new(version: SourceResolution) -> Self {
        Self {
            version,
            datasets: HashMap::new(),
        }
    }

    pub fn insert(&mut self, year: i32, species: &str, dataset: InMemoryDataset) -> &mut Self {
        self.datasets
            .insert((year, species.to_string()), Arc::new(dataset));
        self
    }
}

impl RegionalArchive for InMemoryArchive {
    fn open(&self, year: i32, species: &str) -> EmissionResult<Option<Arc<dyn MonthlyDataset>>> {
        Ok(self
            .datasets
            .get(&(year, species.to_string()))
            .map(|dataset| Arc::clone(dataset) as Arc<dyn MonthlyDataset>))
    }

    fn locate(&self, year: i32, species: &str) -> PathBuf {
        regional_path(Path::new("memory"), self.version, year, species)
    }
}

type RegionalKey = (i32, u32, String, String);

/// Loads regional inventory fields with the PM-coarse and substitution rules
///
/// Fields are returned on the source grid as monthly totals per cell. Use
/// [`RegionalInventory::flux_density`] to divide by cell area before
/// reprojection.
#[derive(Debug)]
pub struct RegionalInventory {
    archive: Arc<dyn RegionalArchive>,
    grid: SourceGrid,
    mask: Option<Array2<f64>>,
    pm_substitution: Option<Arc<PmSubstitution>>,
    cache: KeyedCache<RegionalKey, Array2<f64>>,
}

impl RegionalInventory {
    pub fn new(archive: Arc<dyn RegionalArchive>, resolution: SourceResolution) -> Self {
        Self::with_grid(archive, SourceGrid::for_resolution(resolution))
    }

    /// A loader for a non-standard source grid
    pub fn with_grid(archive: Arc<dyn RegionalArchive>, grid: SourceGrid) -> Self {
        Self {
            archive,
            grid,
            mask: None,
            pm_substitution: None,
            cache: KeyedCache::new("regional inventory", CachePolicy::Unbounded),
        }
    }

    /// Multiply every field by `mask`, which must have the source grid shape
    pub fn with_mask(mut self, mask: Array2<f64>) -> EmissionResult<Self> {
        if mask.dim() != self.grid.shape() {
            return Err(EmissionError::IncompatibleGrid {
                context: "regional inventory mask".to_string(),
                expected: self.grid.shape(),
                actual: mask.dim(),
            });
        }
        self.mask = Some(mask);
        Ok(self)
    }

    /// Read a comma-separated mask file, see [`RegionalInventory::with_mask`]
    pub fn with_mask_file(self, path: &Path) -> EmissionResult<Self> {
        let mask = read_grid(path, 0, Some(','))?;
        self.with_mask(mask)
    }

    pub fn with_pm_substitution(mut self, pm_substitution: Arc<PmSubstitution>) -> Self {
        self.pm_substitution = Some(pm_substitution);
        self
    }

    pub fn grid(&self) -> &SourceGrid {
        &self.grid
    }

    /// Monthly totals per source cell
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

    /// Monthly totals divided by the area of each source cell (per km²)
    pub fn flux_density(
        &self,
        year: i32,
        month: u32,
        sector: &str,
        species: &InventorySpecies,
    ) -> EmissionResult<Array2<f64>> {
        let mut field = self.load(year, month, sector, species)?.as_ref().clone();
        let areas = self.grid.row_areas();
        for (mut row, area) in field.axis_iter_mut(Axis(0)).zip(areas.iter()) {
            row /= *area;
        }
        Ok(field)
    }

    fn compute(
        &self,
        year: i32,
        month: u32,
        sector: &str,
        species: &InventorySpecies,
    ) -> EmissionResult<Array2<f64>> {
        let field = if let Some((pm10, pm25)) = species.coarse_operands() {
            // Without a PM10 variable there is no coarse fraction to derive
            match self.read_variable(year, month, sector, &pm10)? {
                Some(pm10) => pm10 - self.read(year, month, sector, &pm25)?,
                None => Array2::zeros(self.grid.shape()),
            }
        } else if self.archive.open(year, species.name())?.is_some() {
            self.read(year, month, sector, species)?
        } else {
            let factor =
                pm_substitution_factor(self.pm_substitution.as_deref(), sector, species.name())?;
            warn!(
                path = %self.archive.locate(year, species.name()).display(),
                sector,
                species = species.name(),
                factor,
                "regional inventory dataset missing, substituting PM2.5"
            );
            self.read(year, month, sector, &InventorySpecies::new(PM25))? * factor
        };

        Ok(match &self.mask {
            Some(mask) => field * mask,
            None => field,
        })
    }

    /// One variable slice, or zeros when the dataset lacks the variable
    fn read(
        &self,
        year: i32,
        month: u32,
        sector: &str,
        species: &InventorySpecies,
    ) -> EmissionResult<Array2<f64>> {
        Ok(self
            .read_variable(year, month, sector, species)?
            .unwrap_or_else(|| Array2::zeros(self.grid.shape())))
    }

    /// One variable slice, `None` when the dataset lacks the variable.
    ///
    /// A missing dataset is an error.
    fn read_variable(
        &self,
        year: i32,
        month: u32,
        sector: &str,
        species: &InventorySpecies,
    ) -> EmissionResult<Option<Array2<f64>>> {
        let dataset = self
            .archive
            .open(year, species.name())?
            .ok_or_else(|| EmissionError::MissingSourceFile {
                path: self.archive.locate(year, species.name()),
            })?;
        let variable = variable_name(self.grid.resolution, species.name(), sector)?;

        match dataset.read_month(&variable, month)? {
            Some(values) if values.dim() == self.grid.shape() => Ok(Some(values)),
            Some(values) => Err(EmissionError::IncompatibleGrid {
                context: format!("regional variable {}", variable),
                expected: self.grid.shape(),
                actual: values.dim(),
            }),
            None => {
                debug!(variable, year, "regional variable absent");
                Ok(None)
            }
        }
    }
}
