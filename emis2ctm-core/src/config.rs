//! Run configuration
//!
//! A run is described by a TOML document with five sections. Every section
//! and field has a default, so a configuration only lists what differs.
//!
//! ```toml
//! [base]
//! model = "wrfchem"
//! sectors = ["power", "industry", "residential", "transportation", "agriculture"]
//!
//! [projection]
//! lambert_params = "+proj=lcc +lat_1=25 +lat_2=40 +lat_0=34 +lon_0=110 +a=6370000 +b=6370000"
//! xorig = -2497500.0
//! yorig = -2047500.0
//! dx = 15000.0
//! dy = 15000.0
//! xcells = 333
//! ycells = 273
//!
//! [inventory]
//! regional_year = 2010
//! regional_version = "1"
//! control_file = "factor/control.csv"
//!
//! [time]
//! start_date = "2020-01-01"
//! end_date = "2020-01-31"
//! ```

use crate::cache::CachePolicy;
use crate::errors::{EmissionError, EmissionResult};
use crate::grid::{DestinationGrid, SourceResolution};
use crate::lambert::LambertConformal;
use crate::mapping::BoundaryPolicy;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// General settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseConfig {
    /// Name of the per-model factor sub-directory
    pub model: String,
    /// Sectors to process, in output order
    pub sectors: Vec<String>,
    /// Directory holding factor tables
    pub factor_dir: PathBuf,
    /// Directory holding inventory input files
    pub input_dir: PathBuf,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            sectors: Vec::new(),
            factor_dir: PathBuf::from("factor"),
            input_dir: PathBuf::from("input"),
        }
    }
}

/// Destination grid definition
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// PROJ-style Lambert conformal conic definition
    pub lambert_params: String,
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

impl ProjectionConfig {
    pub fn destination_grid(&self) -> EmissionResult<DestinationGrid> {
        let projection = LambertConformal::from_proj_str(&self.lambert_params)?;
        DestinationGrid::new(
            projection,
            self.xorig,
            self.yorig,
            self.dx,
            self.dy,
            self.xcells,
            self.ycells,
        )
    }
}

/// Inventory selection and loading options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// Year of the regional inventory, independent of the run year
    pub regional_year: Option<i32>,
    /// Regional inventory version, `"1"` (0.25°) or `"2"` (0.1°)
    pub regional_version: SourceResolution,
    /// Optional control table
    pub control_file: Option<PathBuf>,
    /// Mask multiplied into every regional field.
    ///
    /// Defaults to the version's mask under `base.factor_dir`, see
    /// [`EmissionConfig::regional_mask_path`].
    pub regional_mask: Option<PathBuf>,
    /// Set to `false` to sum the regional inventory unmasked
    pub use_regional_mask: bool,
    /// Header lines preceding the values of a coarse inventory grid
    pub coarse_header_rows: usize,
    pub boundary_policy: BoundaryPolicy,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            regional_year: None,
            regional_version: SourceResolution::QuarterDegree,
            control_file: None,
            regional_mask: None,
            use_regional_mask: true,
            coarse_header_rows: 6,
            boundary_policy: BoundaryPolicy::default(),
        }
    }
}

/// Default run period, overridable from the command line
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeConfig {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached monthly results; unbounded when unset
    pub monthly_entries: Option<usize>,
}

impl CacheConfig {
    pub fn monthly_policy(&self) -> CachePolicy {
        match self.monthly_entries {
            Some(entries) => CachePolicy::MaxEntries(entries),
            None => CachePolicy::Unbounded,
        }
    }
}

/// Complete run configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmissionConfig {
    pub base: BaseConfig,
    pub projection: ProjectionConfig,
    pub inventory: InventoryConfig,
    pub time: TimeConfig,
    pub cache: CacheConfig,
}

impl EmissionConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> EmissionResult<Self> {
        let config: EmissionConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// Relative directories in the file are resolved against the file's own
    /// directory.
    pub fn from_file(path: &Path) -> EmissionResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| EmissionError::io(path, e))?;
        let mut config = Self::from_toml_str(&text)?;
        if let Some(root) = path.parent() {
            config.resolve_relative_to(root);
        }
        Ok(config)
    }

    /// Make every relative path absolute with respect to `root`
    pub fn resolve_relative_to(&mut self, root: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = root.join(&*path);
            }
        };
        resolve(&mut self.base.factor_dir);
        resolve(&mut self.base.input_dir);
        if let Some(path) = self.inventory.control_file.as_mut() {
            resolve(path);
        }
        if let Some(path) = self.inventory.regional_mask.as_mut() {
            resolve(path);
        }
    }

    /// Check that every required option is present and consistent
    pub fn validate(&self) -> EmissionResult<()> {
        let missing = |what: &str| Err(EmissionError::MissingConfiguration(what.to_string()));

        if self.base.model.trim().is_empty() {
            return missing("base.model");
        }
        if self.base.sectors.is_empty() {
            return missing("base.sectors must list at least one sector");
        }
        if self.projection.lambert_params.trim().is_empty() {
            return missing("projection.lambert_params");
        }
        if self.projection.xcells == 0 || self.projection.ycells == 0 {
            return missing("projection.xcells and projection.ycells must be positive");
        }
        if !(self.projection.dx > 0.0 && self.projection.dy > 0.0) {
            return missing("projection.dx and projection.dy must be positive");
        }
        if self.inventory.regional_year.is_none() {
            return missing("inventory.regional_year");
        }
        if self.cache.monthly_entries == Some(0) {
            return missing("cache.monthly_entries must be positive when set");
        }
        if let (Some(start), Some(end)) = (self.time.start_date, self.time.end_date) {
            if end < start {
                return Err(EmissionError::MissingConfiguration(format!(
                    "time.end_date {} is before time.start_date {}",
                    end, start
                )));
            }
        }
        Ok(())
    }

    pub fn regional_year(&self) -> EmissionResult<i32> {
        self.inventory
            .regional_year
            .ok_or_else(|| EmissionError::MissingConfiguration("inventory.regional_year".to_string()))
    }

    pub fn destination_grid(&self) -> EmissionResult<DestinationGrid> {
        self.projection.destination_grid()
    }

    /// Directory holding the per-model tables
    pub fn model_factor_dir(&self) -> PathBuf {
        self.base.factor_dir.join(&self.base.model)
    }

    pub fn day_table_path(&self) -> PathBuf {
        self.base.factor_dir.join("day.csv")
    }

    pub fn hour_table_path(&self) -> PathBuf {
        self.base.factor_dir.join("hour.csv")
    }

    /// Mask applied to the regional inventory, `None` when masking is disabled.
    ///
    /// The mask keeps the regional inventory out of the area the coarse
    /// inventory already covers. Without an explicit path the mask shipped
    /// with the factor tables for the configured version is used.
    pub fn regional_mask_path(&self) -> Option<PathBuf> {
        if !self.inventory.use_regional_mask {
            return None;
        }
        let path = match &self.inventory.regional_mask {
            Some(path) => path.clone(),
            None => self
                .base
                .factor_dir
                .join(default_mask_name(self.inventory.regional_version)),
        };
        Some(path)
    }

    /// Root of the coarse inventory grids
    pub fn coarse_inventory_dir(&self) -> PathBuf {
        self.base.input_dir.join("MEIC")
    }

    /// Root of the regional inventory datasets
    pub fn regional_inventory_dir(&self) -> PathBuf {
        self.base.input_dir.join("MIX")
    }

    /// Run period, with command-line dates taking precedence over configured ones
    pub fn run_period(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> EmissionResult<RunPeriod> {
        let start = start
            .or(self.time.start_date)
            .ok_or_else(|| EmissionError::MissingConfiguration("time.start_date".to_string()))?;
        let end = end
            .or(self.time.end_date)
            .ok_or_else(|| EmissionError::MissingConfiguration("time.end_date".to_string()))?;
        RunPeriod::new(start, end)
    }
}

fn default_mask_name(resolution: SourceResolution) -> &'static str {
    match resolution {
        SourceResolution::QuarterDegree => "mask_china.csv",
        SourceResolution::TenthDegree => "mask_mix_v2_china.csv",
    }
}

/// An inclusive range of whole days
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl RunPeriod {
    pub fn new(start: NaiveDate, end: NaiveDate) -> EmissionResult<Self> {
        if end < start {
            return Err(EmissionError::MissingConfiguration(format!(
                "run period ends ({}) before it starts ({})",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    /// Every day of the period
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |day| *day <= end)
    }

    /// Every hour from 00:00 on the first day to 23:00 on the last day
    pub fn hours(&self) -> impl Iterator<Item = NaiveDateTime> {
        self.days().flat_map(|day| {
            let midnight = day.and_hms_opt(0, 0, 0).unwrap_or_default();
            (0..24).map(move |hour| midnight + Duration::hours(hour))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use std::io::Write;

    const CONFIG: &str = r#"
[base]
model = "wrfchem"
sectors = ["power", "industry"]

[projection]
lambert_params = "+proj=lcc +lat_1=25 +lat_2=40 +lat_0=34 +lon_0=110 +a=6370000 +b=6370000"
xorig = -45000.0
yorig = -45000.0
dx = 15000.0
dy = 15000.0
xcells = 6
ycells = 6

[inventory]
regional_year = 2010
regional_version = "2"
boundary_policy = "exclude"

[time]
start_date = "2020-01-31"
end_date = "2020-02-01"

[cache]
monthly_entries = 4
"#;

    #[test]
    fn test_parse_full_config() {
        let config = EmissionConfig::from_toml_str(CONFIG).unwrap();

        assert_eq!(config.base.sectors, vec!["power", "industry"]);
        assert_eq!(config.base.factor_dir, PathBuf::from("factor"));
        assert_eq!(config.inventory.regional_version, SourceResolution::TenthDegree);
        assert_eq!(config.inventory.boundary_policy, BoundaryPolicy::Exclude);
        assert_eq!(config.inventory.coarse_header_rows, 6);
        assert_eq!(config.cache.monthly_policy(), CachePolicy::MaxEntries(4));
        assert_eq!(config.model_factor_dir(), PathBuf::from("factor/wrfchem"));

        let grid = config.destination_grid().unwrap();
        assert_eq!(grid.shape(), (6, 6));
    }

    #[test]
    fn test_regional_mask_defaults_to_version_mask() {
        let config = EmissionConfig::from_toml_str(CONFIG).unwrap();
        assert!(config.inventory.use_regional_mask);
        assert_eq!(
            config.regional_mask_path(),
            Some(PathBuf::from("factor/mask_mix_v2_china.csv"))
        );

        let text = CONFIG.replace("regional_version = \"2\"", "regional_version = \"1\"");
        let config = EmissionConfig::from_toml_str(&text).unwrap();
        assert_eq!(
            config.regional_mask_path(),
            Some(PathBuf::from("factor/mask_china.csv"))
        );
    }

    #[test]
    fn test_regional_mask_override_and_opt_out() {
        let text = CONFIG.replace(
            "boundary_policy = \"exclude\"",
            "boundary_policy = \"exclude\"\nregional_mask = \"masks/custom.csv\"",
        );
        let config = EmissionConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.regional_mask_path(), Some(PathBuf::from("masks/custom.csv")));

        let text = CONFIG.replace(
            "boundary_policy = \"exclude\"",
            "boundary_policy = \"exclude\"\nuse_regional_mask = false",
        );
        let config = EmissionConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.regional_mask_path(), None);
    }

    #[test]
    fn test_missing_sections_fail_validation() {
        let err = EmissionConfig::from_toml_str("[base]\nmodel = \"wrfchem\"\n").unwrap_err();
        assert!(matches!(err, EmissionError::MissingConfiguration(_)));
    }

    #[test]
    fn test_invalid_toml() {
        let err = EmissionConfig::from_toml_str("[base\nmodel = 1").unwrap_err();
        assert!(matches!(err, EmissionError::Config(_)));
    }

    #[test]
    fn test_end_before_start_is_rejected() {
        let text = CONFIG.replace("end_date = \"2020-02-01\"", "end_date = \"2020-01-01\"");
        assert!(EmissionConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn test_run_period_hours_cross_month() {
        let config = EmissionConfig::from_toml_str(CONFIG).unwrap();
        let period = config.run_period(None, None).unwrap();
        let hours: Vec<_> = period.hours().collect();

        assert_eq!(hours.len(), 48);
        assert_eq!(hours[23].day(), 31);
        assert_eq!(hours[23].hour(), 23);
        assert_eq!(hours[24].month(), 2);
        assert_eq!(hours[24].hour(), 0);
    }

    #[test]
    fn test_command_line_dates_take_precedence() {
        let config = EmissionConfig::from_toml_str(CONFIG).unwrap();
        let day = NaiveDate::from_ymd_opt(2020, 3, 1).unwrap();
        let period = config.run_period(Some(day), Some(day)).unwrap();
        assert_eq!(period.days().count(), 1);
    }

    #[test]
    fn test_from_file_resolves_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emis2ctm.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();

        let config = EmissionConfig::from_file(&path).unwrap();
        assert_eq!(config.base.factor_dir, dir.path().join("factor"));
        assert_eq!(config.coarse_inventory_dir(), dir.path().join("input").join("MEIC"));
    }
}
