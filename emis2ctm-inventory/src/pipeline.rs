//! Emission aggregation pipeline
//!
//! [`EmissionPipeline`] is the entry point for output writers. For a
//! (year, month, model species) it combines both inventories sector by sector
//! into layered monthly totals on the destination grid, and from those derives
//! the emission field of any single hour.
//!
//! Per sector and contributing inventory species the monthly field is
//!
//! ```text
//! (reproject(regional / source_cell_area) + coarse) × unit_convert × weight
//! ```
//!
//! distributed over layers by the sector's layer weights and summed over
//! contributors. Negative totals are clamped to zero. The hourly field is the
//! sum over sectors of the monthly field scaled by the sector's day and hour
//! factors.

use crate::coarse::CoarseInventory;
use crate::regional::{RegionalArchive, RegionalInventory};
use chrono::{Datelike, NaiveDateTime, Timelike};
use emis2ctm_core::cache::{CachePolicy, KeyedCache};
use emis2ctm_core::config::EmissionConfig;
use emis2ctm_core::control::{ControlFactors, ControlTable};
use emis2ctm_core::errors::{EmissionError, EmissionResult, WorkUnitKey};
use emis2ctm_core::grid::{DestinationGrid, SourceGrid};
use emis2ctm_core::mapping::{BoundaryPolicy, ProjectionMapper};
use emis2ctm_core::region::RegionLookup;
use emis2ctm_core::species::{SpeciesTables, SpeciesWeight};
use emis2ctm_core::table::read_grid;
use emis2ctm_core::temporal::{TemporalFactors, HOURS_PER_DAY};
use ndarray::{Array2, Array3, Axis};
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Layered monthly totals of one model species, per sector
///
/// Each field has shape `(layers, rows, cols)` and contains no negative values.
#[derive(Debug, Clone, PartialEq)]
pub struct MonthlySectorEmission {
    pub year: i32,
    pub month: u32,
    pub species: String,
    sectors: Vec<(String, Array3<f64>)>,
}

impl MonthlySectorEmission {
    pub fn get(&self, sector: &str) -> Option<&Array3<f64>> {
        self.sectors
            .iter()
            .find(|(name, _)| name == sector)
            .map(|(_, field)| field)
    }

    /// Sector fields in configured order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Array3<f64>)> {
        self.sectors.iter().map(|(name, field)| (name.as_str(), field))
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }
}

type MonthlyKey = (i32, u32, String);

/// Combines inventories, factor tables and caches into hourly emission fields
#[derive(Debug)]
pub struct EmissionPipeline {
    sectors: Vec<String>,
    destination: Arc<DestinationGrid>,
    tables: Arc<SpeciesTables>,
    temporal: Arc<TemporalFactors>,
    mapper: ProjectionMapper,
    regional: RegionalInventory,
    regional_year: i32,
    coarse: CoarseInventory,
    monthly: KeyedCache<MonthlyKey, MonthlySectorEmission>,
}

impl EmissionPipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Build a pipeline reading regional NetCDF files below the configured input directory
    #[cfg(feature = "netcdf")]
    pub fn from_config(
        config: &EmissionConfig,
        regions: Option<Arc<dyn RegionLookup>>,
    ) -> EmissionResult<Self> {
        let archive = crate::regional::NetcdfArchive::new(
            config.regional_inventory_dir(),
            config.inventory.regional_version,
        );
        Self::from_config_with_archive(config, Arc::new(archive), regions)
    }

    /// Build a pipeline from a configuration and an explicit regional archive.
    ///
    /// `regions` is required when the configuration names a control file.
    pub fn from_config_with_archive(
        config: &EmissionConfig,
        archive: Arc<dyn RegionalArchive>,
        regions: Option<Arc<dyn RegionLookup>>,
    ) -> EmissionResult<Self> {
        config.validate()?;

        let mut builder = PipelineBuilder::new();
        builder
            .with_sectors(&config.base.sectors)
            .with_destination(config.destination_grid()?)
            .with_species_tables(SpeciesTables::load(&config.base.factor_dir, &config.base.model)?)
            .with_temporal_factors(TemporalFactors::load(&config.base.factor_dir)?)
            .with_regional_archive(
                archive,
                SourceGrid::for_resolution(config.inventory.regional_version),
                config.regional_year()?,
            )
            .with_coarse_inventory(
                config.coarse_inventory_dir(),
                config.inventory.coarse_header_rows,
            )
            .with_boundary_policy(config.inventory.boundary_policy)
            .with_monthly_cache(config.cache.monthly_policy());

        if let Some(control_file) = &config.inventory.control_file {
            let regions = regions.ok_or_else(|| {
                EmissionError::MissingConfiguration(
                    "inventory.control_file requires a region lookup".to_string(),
                )
            })?;
            builder.with_control(ControlTable::from_path(control_file)?, regions);
        }
        if let Some(mask) = config.regional_mask_path() {
            builder.with_regional_mask(read_grid(&mask, 0, Some(','))?);
        }

        builder.build()
    }

    pub fn sectors(&self) -> &[String] {
        &self.sectors
    }

    pub fn destination(&self) -> &DestinationGrid {
        &self.destination
    }

    /// Number of vertical layers in every output field
    pub fn layer_count(&self) -> usize {
        self.tables.layers.layer_count()
    }

    /// Model species in species-map order
    pub fn model_species(&self) -> &[String] {
        self.tables.species_map.model_species()
    }

    /// Output units of a model species
    pub fn units(&self, species: &str) -> EmissionResult<&str> {
        self.tables.units.units(species)
    }

    /// Layered monthly totals per sector for one model species.
    ///
    /// Results are cached per (year, month, species). Failures are wrapped in
    /// [`EmissionError::WorkUnit`] naming the failing key.
    pub fn monthly_by_sector(
        &self,
        year: i32,
        month: u32,
        species: &str,
    ) -> EmissionResult<Arc<MonthlySectorEmission>> {
        self.monthly
            .get_or_try_insert_with((year, month, species.to_string()), || {
                self.compute_monthly(year, month, species)
            })
            .map_err(|e| e.in_work_unit(WorkUnitKey::new(year, month, species)))
    }

    /// The emission field of one hour, summed over sectors
    pub fn hourly_field(
        &self,
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        species: &str,
    ) -> EmissionResult<Array3<f64>> {
        let key = WorkUnitKey::new(year, month, species);
        if hour as usize >= HOURS_PER_DAY {
            return Err(EmissionError::InvalidHour(hour).in_work_unit(key));
        }

        let monthly = self.monthly_by_sector(year, month, species)?;
        let (rows, cols) = self.destination.shape();
        let mut field = Array3::zeros((self.layer_count(), rows, cols));
        for (sector, sector_field) in monthly.iter() {
            let factor = self
                .temporal_factor(year, month, day, hour, sector)
                .map_err(|e| e.in_work_unit(key.clone().with_sector(sector)))?;
            field.scaled_add(factor, sector_field);
        }
        Ok(field)
    }

    /// The emission field for the hour starting at `time`
    pub fn hourly_field_at(&self, time: NaiveDateTime, species: &str) -> EmissionResult<Array3<f64>> {
        self.hourly_field(time.year(), time.month(), time.day(), time.hour(), species)
    }

    /// The emission field of every model species for one hour.
    ///
    /// Species are computed in parallel; results follow species-map order.
    pub fn hourly_fields(&self, time: NaiveDateTime) -> EmissionResult<Vec<(String, Array3<f64>)>> {
        self.model_species()
            .par_iter()
            .map(|species| -> EmissionResult<(String, Array3<f64>)> {
                Ok((species.clone(), self.hourly_field_at(time, species)?))
            })
            .collect()
    }

    fn temporal_factor(
        &self,
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        sector: &str,
    ) -> EmissionResult<f64> {
        let day_factor = self.temporal.day_factor(year, month, day, sector)?;
        let hour_factor = self.temporal.hour_factor(hour, sector)?;
        Ok(day_factor * hour_factor)
    }

    fn compute_monthly(
        &self,
        year: i32,
        month: u32,
        species: &str,
    ) -> EmissionResult<MonthlySectorEmission> {
        if !(1..=12).contains(&month) {
            return Err(EmissionError::InvalidDate { year, month, day: 1 });
        }
        let contributors = self.tables.species_map.contributors(species)?;
        let conversion = if contributors.is_empty() {
            0.0
        } else {
            self.tables.conversions.factor(species)?
        };

        let mut sectors = Vec::with_capacity(self.sectors.len());
        for sector in &self.sectors {
            let field = self
                .compute_sector(year, month, sector, contributors, conversion)
                .map_err(|e| e.in_work_unit(WorkUnitKey::new(year, month, species).with_sector(sector)))?;
            sectors.push((sector.clone(), field));
        }

        info!(
            year,
            month,
            species,
            contributors = contributors.len(),
            "aggregated monthly emissions"
        );
        Ok(MonthlySectorEmission {
            year,
            month,
            species: species.to_string(),
            sectors,
        })
    }

    fn compute_sector(
        &self,
        year: i32,
        month: u32,
        sector: &str,
        contributors: &[SpeciesWeight],
        conversion: f64,
    ) -> EmissionResult<Array3<f64>> {
        let layers = self.tables.layers.weights(sector)?;
        let (rows, cols) = self.destination.shape();
        let mut total = Array3::zeros((layers.len(), rows, cols));

        for contributor in contributors {
            let field = self.combined_field(year, month, sector, contributor)?;
            let scale = conversion * contributor.weight;
            for (mut layer, weight) in total.axis_iter_mut(Axis(0)).zip(layers) {
                layer.scaled_add(scale * weight, &field);
            }
        }

        total.mapv_inplace(|value| if value < 0.0 { 0.0 } else { value });
        Ok(total)
    }

    /// Regional plus coarse inventory on the destination grid
    fn combined_field(
        &self,
        year: i32,
        month: u32,
        sector: &str,
        contributor: &SpeciesWeight,
    ) -> EmissionResult<Array2<f64>> {
        let species = &contributor.species;
        let flux = self
            .regional
            .flux_density(self.regional_year, month, sector, species)?;
        let mut field = self.mapper.reproject(self.regional.grid(), &flux)?;

        let coarse = self.coarse.load(year, month, sector, species)?;
        if coarse.dim() != field.dim() {
            return Err(EmissionError::IncompatibleGrid {
                context: format!("coarse inventory {} {}", sector, species),
                expected: field.dim(),
                actual: coarse.dim(),
            });
        }
        field += &*coarse;
        debug!(sector, species = species.name(), "combined inventories");
        Ok(field)
    }
}

/// Assembles an [`EmissionPipeline`] from its parts
pub struct PipelineBuilder {
    sectors: Vec<String>,
    destination: Option<Arc<DestinationGrid>>,
    tables: Option<Arc<SpeciesTables>>,
    temporal: Option<Arc<TemporalFactors>>,
    archive: Option<Arc<dyn RegionalArchive>>,
    regional_grid: Option<SourceGrid>,
    regional_year: Option<i32>,
    regional_mask: Option<Array2<f64>>,
    coarse_root: Option<PathBuf>,
    coarse_header_rows: usize,
    control: Option<(ControlTable, Arc<dyn RegionLookup>)>,
    boundary_policy: BoundaryPolicy,
    monthly_cache: CachePolicy,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            sectors: vec![],
            destination: None,
            tables: None,
            temporal: None,
            archive: None,
            regional_grid: None,
            regional_year: None,
            regional_mask: None,
            coarse_root: None,
            coarse_header_rows: crate::coarse::DEFAULT_HEADER_ROWS,
            control: None,
            boundary_policy: BoundaryPolicy::default(),
            monthly_cache: CachePolicy::Unbounded,
        }
    }

    pub fn with_sectors<S: AsRef<str>>(&mut self, sectors: &[S]) -> &mut Self {
        self.sectors = sectors.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn with_destination(&mut self, destination: DestinationGrid) -> &mut Self {
        self.destination = Some(Arc::new(destination));
        self
    }

    pub fn with_species_tables(&mut self, tables: SpeciesTables) -> &mut Self {
        self.tables = Some(Arc::new(tables));
        self
    }

    pub fn with_temporal_factors(&mut self, temporal: TemporalFactors) -> &mut Self {
        self.temporal = Some(Arc::new(temporal));
        self
    }

    /// The regional archive, the grid its datasets are on and the inventory year to read
    pub fn with_regional_archive(
        &mut self,
        archive: Arc<dyn RegionalArchive>,
        grid: SourceGrid,
        year: i32,
    ) -> &mut Self {
        self.archive = Some(archive);
        self.regional_grid = Some(grid);
        self.regional_year = Some(year);
        self
    }

    pub fn with_regional_mask(&mut self, mask: Array2<f64>) -> &mut Self {
        self.regional_mask = Some(mask);
        self
    }

    pub fn with_coarse_inventory(&mut self, root: impl Into<PathBuf>, header_rows: usize) -> &mut Self {
        self.coarse_root = Some(root.into());
        self.coarse_header_rows = header_rows;
        self
    }

    /// Apply control factors, assigning destination cells to regions with `regions`
    pub fn with_control(&mut self, table: ControlTable, regions: Arc<dyn RegionLookup>) -> &mut Self {
        self.control = Some((table, regions));
        self
    }

    pub fn with_boundary_policy(&mut self, policy: BoundaryPolicy) -> &mut Self {
        self.boundary_policy = policy;
        self
    }

    pub fn with_monthly_cache(&mut self, policy: CachePolicy) -> &mut Self {
        self.monthly_cache = policy;
        self
    }

    pub fn build(&self) -> EmissionResult<EmissionPipeline> {
        let missing = |what: &str| EmissionError::MissingConfiguration(format!("pipeline needs {}", what));

        if self.sectors.is_empty() {
            return Err(missing("at least one sector"));
        }
        let destination = self.destination.clone().ok_or_else(|| missing("a destination grid"))?;
        let tables = self.tables.clone().ok_or_else(|| missing("species tables"))?;
        let temporal = self.temporal.clone().ok_or_else(|| missing("temporal factors"))?;
        let archive = self.archive.clone().ok_or_else(|| missing("a regional archive"))?;
        let regional_grid = self.regional_grid.clone().ok_or_else(|| missing("a regional grid"))?;
        let regional_year = self.regional_year.ok_or_else(|| missing("a regional inventory year"))?;
        let coarse_root = self.coarse_root.clone().ok_or_else(|| missing("a coarse inventory directory"))?;

        let mapper = ProjectionMapper::new(Arc::clone(&destination), self.boundary_policy);

        let mut regional = RegionalInventory::with_grid(archive, regional_grid);
        if let Some(mask) = &self.regional_mask {
            regional = regional.with_mask(mask.clone())?;
        }

        let mut coarse = CoarseInventory::new(coarse_root, destination.shape())
            .with_header_rows(self.coarse_header_rows);
        if let Some((table, regions)) = &self.control {
            let centers = mapper.cell_centers();
            let control = ControlFactors::from_centers(table.clone(), &centers, regions.as_ref());
            coarse = coarse.with_control(Arc::new(control));
        }

        if let Some(pm) = &tables.pm_substitution {
            regional = regional.with_pm_substitution(Arc::clone(pm));
            coarse = coarse.with_pm_substitution(Arc::clone(pm));
        }

        Ok(EmissionPipeline {
            sectors: self.sectors.clone(),
            destination,
            tables,
            temporal,
            mapper,
            regional,
            regional_year,
            coarse,
            monthly: KeyedCache::new("monthly emissions", self.monthly_cache),
        })
    }
}
