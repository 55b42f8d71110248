//! Reprojection and temporal disaggregation of monthly emission inventories
//! into hourly, layered fields for chemical transport models.
//!
//! ```no_run
//! use emis2ctm::grid::SourceResolution;
//! use emis2ctm::regional::InMemoryArchive;
//! use emis2ctm::{EmissionConfig, EmissionPipeline};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let config = EmissionConfig::from_file(Path::new("emis2ctm.toml")).unwrap();
//! let archive = Arc::new(InMemoryArchive::new(SourceResolution::TenthDegree));
//! let pipeline = EmissionPipeline::from_config_with_archive(&config, archive, None).unwrap();
//!
//! let period = config.run_period(None, None).unwrap();
//! for hour in period.hours() {
//!     for (species, field) in pipeline.hourly_fields(hour).unwrap() {
//!         println!("{} {} {:?}", hour, species, field.dim());
//!     }
//! }
//! ```

pub use emis2ctm_core::{cache, config, control, errors, grid, lambert, mapping, region, species, table, temporal};
pub use emis2ctm_inventory::{coarse, pipeline, regional};

pub use emis2ctm_core::config::{EmissionConfig, RunPeriod};
pub use emis2ctm_core::errors::{EmissionError, EmissionResult, WorkUnitKey};
pub use emis2ctm_inventory::{EmissionPipeline, MonthlySectorEmission, PipelineBuilder};
