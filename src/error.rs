//! Errors returned by the top-level operations.
//!
//! Per-record and per-base problems never end up here; they are logged and
//! counted in the operation's summary. A `PipelineError` means the run
//! produced nothing meaningful.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::db::DbError;
use crate::model::SourceError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("upstream error: {0}")]
    Source(#[from] SourceError),

    /// Catalog sync found no station at any configured base.
    #[error("no stations found at any configured base ({})", bases.join(", "))]
    NoStations { bases: Vec<String> },

    #[error("I/O error on '{path}'")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The requested local hour is skipped by a DST transition.
    #[error("local hour {0} does not exist in time zone {1}")]
    NonexistentLocalHour(String, String),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_stations_lists_bases() {
        let err = PipelineError::NoStations {
            bases: vec!["https://a.example/v1.0".into(), "https://b.example/v1.0".into()],
        };
        assert_eq!(
            err.to_string(),
            "no stations found at any configured base (https://a.example/v1.0, https://b.example/v1.0)"
        );
    }

    #[test]
    fn test_source_errors_convert() {
        let err: PipelineError = SourceError::Absent { url: "u".into(), status: 404 }.into();
        assert!(matches!(err, PipelineError::Source(_)));
    }
}
