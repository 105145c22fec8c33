/// Structured logging for the ingestion pipeline
///
/// Built on `tracing`: every event carries a component tag and, where it
/// applies, the base URL and station / datastream identifiers. Console
/// output goes to stderr; an optional log file receives the same events
/// for scheduled (cron) runs.

use std::fmt;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};

use crate::model::{RunStatus, SourceError};

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Http,
    Catalog,
    Fetch,
    Export,
    Database,
    System,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Http => write!(f, "HTTP"),
            Component::Catalog => write!(f, "CATALOG"),
            Component::Fetch => write!(f, "FETCH"),
            Component::Export => write!(f, "EXPORT"),
            Component::Database => write!(f, "DB"),
            Component::System => write!(f, "SYS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Expected failure - the base simply does not host this resource
    Expected,
    /// Unexpected failure - indicates an API change or configuration issue
    Unexpected,
    /// Unknown - network trouble that may or may not clear on its own
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Classify an upstream failure by its error kind.
pub fn classify_source_failure(err: &SourceError) -> FailureType {
    match err {
        SourceError::Absent { .. } => FailureType::Expected,
        SourceError::HttpStatus { status, .. } if *status >= 500 || *status == 429 => {
            FailureType::Unknown
        }
        SourceError::HttpStatus { .. } | SourceError::Parse { .. } => FailureType::Unexpected,
        SourceError::Request { .. } => FailureType::Unknown,
    }
}

/// Log an upstream failure at a level picked by its classification.
pub fn log_source_failure(component: Component, base: &str, operation: &str, err: &SourceError) {
    let failure_type = classify_source_failure(err);
    match failure_type {
        FailureType::Expected => {
            debug!(component = %component, base, failure = %failure_type, error = %err, "{} failed", operation)
        }
        FailureType::Unexpected => {
            error!(component = %component, base, failure = %failure_type, error = %err, "{} failed", operation)
        }
        FailureType::Unknown => {
            warn!(component = %component, base, failure = %failure_type, error = %err, "{} failed", operation)
        }
    }
}

// ---------------------------------------------------------------------------
// Run Summary Logging
// ---------------------------------------------------------------------------

/// Status from per-item counts: any failure makes the run partial, and a
/// run where nothing succeeded but something failed has failed.
pub fn status_from_counts(succeeded: usize, failed: usize) -> RunStatus {
    if failed == 0 {
        RunStatus::Success
    } else if succeeded == 0 {
        RunStatus::Failed
    } else {
        RunStatus::Partial
    }
}

/// Log the terminal status of a top-level operation.
pub fn log_run_summary(component: Component, operation: &str, status: RunStatus, details: &str) {
    match status {
        RunStatus::Success => info!(component = %component, status = %status, "{} complete: {}", operation, details),
        RunStatus::Partial => warn!(component = %component, status = %status, "{} complete: {}", operation, details),
        RunStatus::Failed => error!(component = %component, status = %status, "{} failed: {}", operation, details),
    }
}

// ---------------------------------------------------------------------------
// Subscriber setup
// ---------------------------------------------------------------------------

/// Install the global subscriber.
///
/// `RUST_LOG`, when set, overrides `level`. With `file` set, events are
/// appended to that file as well as written to stderr. Calling this twice
/// keeps the first subscriber.
pub fn init_logging(level: &str, file: Option<&Path>, json: bool) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (writer, ansi) = match file {
        Some(path) => {
            let log_file = OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(std::io::stderr.and(Mutex::new(log_file))), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(false);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = installed {
        eprintln!("logging already initialized: {}", e);
    }
    Ok(())
}
