//! Core data types for the SensorThings hydrology pipeline.
//!
//! This module defines the shared domain model imported by all other
//! modules: catalog rows (stations, datastreams), raw observations, the
//! closed set of metric categories, and the error raised when talking to
//! an upstream source. It contains no I/O.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Metric categories
// ---------------------------------------------------------------------------

/// The fixed set of physical quantities a datastream can be classified into.
///
/// An unclassified datastream is represented as `None` in Rust and as the
/// empty string in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Metric {
    Rainfall,
    RiverWaterLevel,
    GroundwaterLevel,
    DrainageWaterLevel,
    /// Instantaneous discharge (m³/s).
    Discharge,
    /// Accumulated / totalised discharge volume.
    DischargeCumulative,
}

impl Metric {
    /// Every category, in the order used for placeholder exports.
    pub const ALL: [Metric; 6] = [
        Metric::Rainfall,
        Metric::RiverWaterLevel,
        Metric::GroundwaterLevel,
        Metric::DrainageWaterLevel,
        Metric::Discharge,
        Metric::DischargeCumulative,
    ];

    /// Stable storage / file-path name of the category.
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Rainfall => "rainfall",
            Metric::RiverWaterLevel => "river_water_level",
            Metric::GroundwaterLevel => "groundwater_level",
            Metric::DrainageWaterLevel => "drainage_water_level",
            Metric::Discharge => "discharge",
            Metric::DischargeCumulative => "discharge_cum",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s.trim())
            .ok_or_else(|| format!("unknown metric '{}'", s))
    }
}

/// Column value for an optional classification (`""` when unclassified).
pub fn metric_column(metric: Option<Metric>) -> &'static str {
    metric.map(|m| m.as_str()).unwrap_or("")
}

// ---------------------------------------------------------------------------
// Catalog rows
// ---------------------------------------------------------------------------

/// A monitoring location ("Thing" in SensorThings terms).
#[derive(Debug, Clone, PartialEq)]
pub struct Station {
    pub thing_id: i64,
    pub name: String,
    /// Free-form source metadata, e.g. `{"authority_type": "水利署"}`.
    pub properties: serde_json::Value,
}

/// One measured quantity at a station.
#[derive(Debug, Clone, PartialEq)]
pub struct Datastream {
    pub ds_id: i64,
    pub thing_id: i64,
    pub name: String,
    pub description: String,
    pub obsprop_name: String,
    /// Recomputed on every catalog sync.
    pub metric: Option<Metric>,
    pub unit: String,
}

/// The minimum needed to fetch observations for a catalogued datastream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatastreamRef {
    pub ds_id: i64,
    pub thing_id: i64,
}

// ---------------------------------------------------------------------------
// Observations
// ---------------------------------------------------------------------------

/// A single timestamped reading, normalized to UTC with second precision.
///
/// `(ds_id, obs_time_utc)` is the identity; re-inserting the same pair is
/// a no-op in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub ds_id: i64,
    pub thing_id: i64,
    pub obs_time_utc: DateTime<Utc>,
    /// `None` when the source sent a non-numeric payload.
    pub result: Option<f64>,
    /// The source record, verbatim.
    pub result_json: String,
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Terminal status of a top-level operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    /// Completed, but something was skipped along the way.
    Partial,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => write!(f, "SUCCESS"),
            RunStatus::Partial => write!(f, "PARTIAL"),
            RunStatus::Failed => write!(f, "FAILED"),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can arise when reading from an upstream SensorThings API.
#[derive(Debug, Error)]
pub enum SourceError {
    /// 404 / 410: the source does not have this collection or entity.
    #[error("resource absent at {url} (HTTP {status})")]
    Absent { url: String, status: u16 },

    /// Any other non-2xx response.
    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    /// Transport failure: DNS, connect, timeout, truncated body.
    #[error("request failed for {url}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The body was not JSON or did not have the expected shape.
    #[error("parse error for {url}: {message}")]
    Parse { url: String, message: String },
}

impl SourceError {
    pub fn is_absent(&self) -> bool {
        matches!(self, SourceError::Absent { .. })
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Request { .. } => true,
            SourceError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            SourceError::Absent { .. } | SourceError::Parse { .. } => false,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            SourceError::Absent { url, .. }
            | SourceError::HttpStatus { url, .. }
            | SourceError::Request { url, .. }
            | SourceError::Parse { url, .. } => url,
        }
    }
}

/// A single upstream record that could not be turned into a catalog row or
/// observation. These are skipped and counted, never fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("record has no '{0}' field")]
    MissingField(&'static str),

    #[error("field '{field}' has an unusable value: {value}")]
    InvalidField { field: &'static str, value: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
