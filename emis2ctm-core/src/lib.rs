//! Building blocks for turning monthly gridded emission inventories into
//! hourly, layered fields on a Lambert-projected model grid.
//!
//! Inventory file formats and the aggregation pipeline live in
//! `emis2ctm-inventory`; this crate holds the geometry, factor tables and
//! caches they are built from.

pub mod cache;
pub mod config;
pub mod control;
pub mod grid;
pub mod lambert;
pub mod mapping;
pub mod region;
pub mod species;
pub mod table;
pub mod temporal;

pub mod errors;
