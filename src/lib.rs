//! SensorThings hydrology ingestion.
//!
//! Three independently scheduled operations share one SQLite store:
//! - [`catalog::sync_catalog`] discovers stations and datastreams and
//!   classifies each datastream into a [`model::Metric`]
//! - [`fetch::fetch_window`] pulls the trailing observation window for
//!   every classified datastream
//! - [`export::export_hour`] writes one CSV per metric for a local hour

pub mod catalog;
pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod fetch;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod verify;
