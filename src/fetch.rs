//! Windowed observation fetch.
//!
//! For every classified datastream, ask the bases in priority order for
//! observations with `phenomenonTime >= now - window` and keep the first
//! answer. The window overlaps the previous run on purpose; the store's
//! `(ds_id, obs_time_utc)` key absorbs the overlap.

use chrono::{DateTime, Duration, NaiveDateTime, SubsecRound, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::db::Store;
use crate::error::PipelineError;
use crate::ingest::{Fallback, ObservationSource, SourceChain, SourceMiss};
use crate::logging::{Component, log_run_summary, status_from_counts};
use crate::model::{DatastreamRef, Observation, RecordError, RunStatus};

/// A datastream no base answered for in this run.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedDatastream {
    pub ds_id: i64,
    pub misses: Vec<SourceMiss>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchSummary {
    pub status: RunStatus,
    pub cutoff: DateTime<Utc>,
    pub datastreams: usize,
    pub answered: usize,
    pub received: usize,
    pub inserted: usize,
    /// Observation records that could not be parsed.
    pub skipped_records: usize,
    pub skipped: Vec<SkippedDatastream>,
}

impl FetchSummary {
    pub fn details(&self) -> String {
        format!(
            "{}/{} datastreams answered, {} observations received, {} new, {} records skipped, cutoff {}",
            self.answered,
            self.datastreams,
            self.received,
            self.inserted,
            self.skipped_records,
            self.cutoff.to_rfc3339()
        )
    }
}

/// Start of the trailing window, to the second.
pub fn window_cutoff(now: DateTime<Utc>, window_minutes: u32) -> DateTime<Utc> {
    (now - Duration::minutes(i64::from(window_minutes))).trunc_subsecs(0)
}

/// Fetch and store the trailing window for every classified datastream.
///
/// Only store errors abort the run. A datastream without an answering base
/// is reported in [`FetchSummary::skipped`].
pub fn fetch_window<S: ObservationSource>(
    chain: &SourceChain<S>,
    store: &mut Store,
    window_minutes: u32,
    now: DateTime<Utc>,
) -> Result<FetchSummary, PipelineError> {
    let cutoff = window_cutoff(now, window_minutes);
    let datastreams = store.classified_datastreams()?;
    if datastreams.is_empty() {
        warn!(component = %Component::Fetch, "no classified datastreams in the catalog; run a catalog sync first");
    }

    let mut summary = FetchSummary {
        status: RunStatus::Success,
        cutoff,
        datastreams: datastreams.len(),
        answered: 0,
        received: 0,
        inserted: 0,
        skipped_records: 0,
        skipped: Vec::new(),
    };

    for ds in datastreams {
        match chain.first_answer(|source| source.fetch_observations(ds.ds_id, cutoff)) {
            Fallback::Found { base, value, misses } => {
                for miss in &misses {
                    debug!(component = %Component::Fetch, ds_id = ds.ds_id, base = %miss.base, error = ?miss.error, "base did not answer");
                }

                let mut observations = Vec::with_capacity(value.len());
                for record in &value {
                    match parse_observation(ds, record) {
                        Ok(obs) => observations.push(obs),
                        Err(e) => {
                            warn!(component = %Component::Fetch, ds_id = ds.ds_id, base = %base, error = %e, "skipping observation record");
                            summary.skipped_records += 1;
                        }
                    }
                }

                let inserted = store.insert_observations(&observations)?;
                debug!(
                    component = %Component::Fetch,
                    ds_id = ds.ds_id,
                    base = %base,
                    received = value.len(),
                    inserted,
                    "observations stored"
                );
                summary.answered += 1;
                summary.received += value.len();
                summary.inserted += inserted;
            }
            Fallback::Exhausted { misses } => {
                let reasons: Vec<String> = misses
                    .iter()
                    .map(|m| format!("{}: {}", m.base, m.error.as_deref().unwrap_or("not found")))
                    .collect();
                warn!(
                    component = %Component::Fetch,
                    ds_id = ds.ds_id,
                    reasons = %reasons.join("; "),
                    "no base answered, skipping datastream"
                );
                summary.skipped.push(SkippedDatastream { ds_id: ds.ds_id, misses });
            }
        }
    }

    summary.status = status_from_counts(summary.answered, summary.skipped.len());
    if summary.status == RunStatus::Success && summary.skipped_records > 0 {
        summary.status = RunStatus::Partial;
    }
    log_run_summary(Component::Fetch, "window fetch", summary.status, &summary.details());
    if summary.inserted > 0 {
        info!(component = %Component::Fetch, inserted = summary.inserted, "new observations stored");
    }
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Record parsing
// ---------------------------------------------------------------------------

/// One upstream observation record as a storable row.
pub fn parse_observation(ds: DatastreamRef, record: &Value) -> Result<Observation, RecordError> {
    let raw_time = record
        .get("phenomenonTime")
        .and_then(Value::as_str)
        .ok_or(RecordError::MissingField("phenomenonTime"))?;

    Ok(Observation {
        ds_id: ds.ds_id,
        thing_id: ds.thing_id,
        obs_time_utc: to_utc(raw_time)?,
        result: parse_result(record.get("result").unwrap_or(&Value::Null)),
        result_json: record.to_string(),
    })
}

/// Normalizes an ISO-8601 timestamp to UTC, second precision.
///
/// A value without an offset is taken to be UTC. For an interval
/// (`start/end`) the end instant is used.
pub fn to_utc(raw: &str) -> Result<DateTime<Utc>, RecordError> {
    let s = raw.trim();
    let s = match s.split_once('/') {
        Some((_, end)) => end.trim(),
        None => s,
    };

    let invalid = || RecordError::InvalidField {
        field: "phenomenonTime",
        value: raw.to_string(),
    };
    if s.is_empty() {
        return Err(invalid());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc).trunc_subsecs(0));
    }
    // Offsets without a colon, e.g. `+0800`.
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Ok(dt.with_timezone(&Utc).trunc_subsecs(0));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(naive.and_utc().trunc_subsecs(0));
        }
    }
    Err(invalid())
}

/// Numbers are kept; numeric strings are parsed; anything else is `None`.
pub fn parse_result(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
