//! Inventory loaders and the hourly emission pipeline.
//!
//! Two inventories feed the pipeline:
//!
//! - a coarse national inventory already on the destination grid
//!   ([`coarse::CoarseInventory`]), and
//! - a regional lat/lon inventory that is reprojected on the fly
//!   ([`regional::RegionalInventory`]).
//!
//! [`pipeline::EmissionPipeline`] combines them into layered monthly totals
//! and distributes those over days and hours.

pub mod coarse;
pub mod pipeline;
pub mod regional;

pub use pipeline::{EmissionPipeline, MonthlySectorEmission, PipelineBuilder};
