//! Hourly CSV rollups.
//!
//! One file per metric for a local-time hour:
//! `<root>/<metric>/hourly/YYYY/MM/DD/<metric>_HH.csv` with the columns
//! `hour, sample_time, station_id, station_name, metric, value`. Timestamps
//! carry the local offset; a missing value is an empty field.
//!
//! With grid filling on, every station that reported a metric in the hour
//! gets exactly six rows, one per 10-minute slot (:00 to :50).

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, SecondsFormat, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::{info, warn};

use crate::db::{HourRow, Store};
use crate::error::PipelineError;
use crate::logging::{Component, log_run_summary};
use crate::model::{Metric, RunStatus};

pub const CSV_HEADER: [&str; 6] = ["hour", "sample_time", "station_id", "station_name", "metric", "value"];

/// Slots per hour when grid filling.
pub const GRID_SLOTS: usize = 6;
const SLOT_MINUTES: i64 = 10;

// ---------------------------------------------------------------------------
// Hour selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum HourSelection {
    /// The last fully elapsed local hour.
    LastComplete,
    /// The local hour in progress.
    Current,
    /// An explicit local hour start.
    At(NaiveDateTime),
}

/// Parses `YYYY-MM-DDTHH` (local wall-clock time).
pub fn parse_local_hour(s: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(&format!("{}:00", s.trim()), "%Y-%m-%dT%H:%M")
        .map_err(|e| format!("'{}' is not a YYYY-MM-DDTHH hour: {}", s, e))
}

/// Start of the selected local hour.
pub fn target_hour(now: DateTime<Utc>, tz: Tz, selection: &HourSelection) -> Result<DateTime<Tz>, PipelineError> {
    let local = now.with_timezone(&tz);
    let current = local
        - Duration::seconds(i64::from(local.minute()) * 60 + i64::from(local.second()))
        - Duration::nanoseconds(i64::from(local.nanosecond()));

    match selection {
        HourSelection::Current => Ok(current),
        HourSelection::LastComplete => Ok(current - Duration::hours(1)),
        HourSelection::At(naive) => {
            let naive = naive
                .with_minute(0)
                .and_then(|n| n.with_second(0))
                .and_then(|n| n.with_nanosecond(0))
                .unwrap_or(*naive);
            match tz.from_local_datetime(&naive) {
                LocalResult::Single(start) => Ok(start),
                LocalResult::Ambiguous(earliest, _) => Ok(earliest),
                LocalResult::None => Err(PipelineError::NonexistentLocalHour(
                    naive.format("%Y-%m-%dT%H:00").to_string(),
                    tz.name().to_string(),
                )),
            }
        }
    }
}

/// The six slot instants of an hour.
pub fn grid_slots(hour_start: DateTime<Tz>) -> Vec<DateTime<Tz>> {
    (0..GRID_SLOTS as i64)
        .map(|i| hour_start + Duration::minutes(SLOT_MINUTES * i))
        .collect()
}

fn local_iso(ts: DateTime<Tz>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// `<root>/<metric>/hourly/YYYY/MM/DD/<metric>_HH.csv`
pub fn output_path(root: &Path, metric: &str, hour_start: DateTime<Tz>) -> PathBuf {
    root.join(metric)
        .join("hourly")
        .join(hour_start.format("%Y").to_string())
        .join(hour_start.format("%m").to_string())
        .join(hour_start.format("%d").to_string())
        .join(format!("{}_{}.csv", metric, hour_start.format("%H")))
}

// ---------------------------------------------------------------------------
// Filtering
// ---------------------------------------------------------------------------

/// Allow-lists applied to loaded rows. Empty lists keep everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportFilter {
    /// Exact match on the station's `authority_type` (trimmed).
    pub allow_authorities: Vec<String>,
    /// Substring match on the datastream description.
    pub category_whitelist: Vec<String>,
}

impl ExportFilter {
    pub fn keeps(&self, row: &HourRow) -> bool {
        self.authority_allowed(row.station_props.as_deref()) && self.category_allowed(row.ds_description.as_deref())
    }

    fn authority_allowed(&self, props: Option<&str>) -> bool {
        if self.allow_authorities.is_empty() {
            return true;
        }
        let Ok(props) = serde_json::from_str::<serde_json::Value>(props.unwrap_or("{}")) else {
            return false;
        };
        let authority = props
            .get("authority_type")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        self.allow_authorities.iter().any(|a| a == authority)
    }

    fn category_allowed(&self, description: Option<&str>) -> bool {
        if self.category_whitelist.is_empty() {
            return true;
        }
        let description = description.unwrap_or("");
        self.category_whitelist.iter().any(|s| description.contains(s.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CsvRow {
    pub hour: String,
    pub sample_time: String,
    pub station_id: i64,
    pub station_name: String,
    pub metric: String,
    pub value: Option<f64>,
}

/// A stored row with its timestamp parsed.
struct Sample<'a> {
    row: &'a HourRow,
    at: DateTime<Utc>,
}

fn parse_samples<'a>(rows: &[&'a HourRow]) -> Vec<Sample<'a>> {
    rows.iter()
        .filter_map(|row| match DateTime::parse_from_rfc3339(&row.obs_time_utc) {
            Ok(at) => Some(Sample {
                row: *row,
                at: at.with_timezone(&Utc),
            }),
            Err(e) => {
                warn!(component = %Component::Export, ds_id = row.ds_id, time = %row.obs_time_utc, error = %e, "unparseable stored timestamp");
                None
            }
        })
        .collect()
}

/// The CSV rows for one metric, sorted by station then sample time.
pub fn metric_rows(rows: &[&HourRow], metric: &str, hour_start: DateTime<Tz>, fill_grid: bool) -> Vec<CsvRow> {
    let tz = hour_start.timezone();
    let hour = local_iso(hour_start);
    let mut samples = parse_samples(rows);
    samples.sort_by_key(|s| (s.row.station_id, s.at, s.row.ds_id));

    if !fill_grid {
        return samples
            .iter()
            .map(|s| CsvRow {
                hour: hour.clone(),
                sample_time: local_iso(s.at.with_timezone(&tz)),
                station_id: s.row.station_id,
                station_name: s.row.station_name.clone().unwrap_or_default(),
                metric: metric.to_string(),
                value: s.row.result,
            })
            .collect();
    }

    let mut stations: BTreeMap<i64, String> = BTreeMap::new();
    // (station, slot) -> value of the lowest ds_id landing exactly on it.
    let mut slot_values: BTreeMap<(i64, DateTime<Utc>), (i64, Option<f64>)> = BTreeMap::new();
    for s in &samples {
        stations
            .entry(s.row.station_id)
            .or_insert_with(|| s.row.station_name.clone().unwrap_or_default());
        slot_values
            .entry((s.row.station_id, s.at))
            .and_modify(|held| {
                if s.row.ds_id < held.0 {
                    *held = (s.row.ds_id, s.row.result);
                }
            })
            .or_insert((s.row.ds_id, s.row.result));
    }

    let slots = grid_slots(hour_start);
    let mut out = Vec::with_capacity(stations.len() * GRID_SLOTS);
    for (station_id, station_name) in &stations {
        for slot in &slots {
            let value = slot_values
                .get(&(*station_id, slot.with_timezone(&Utc)))
                .and_then(|(_, v)| *v);
            out.push(CsvRow {
                hour: hour.clone(),
                sample_time: local_iso(*slot),
                station_id: *station_id,
                station_name: station_name.clone(),
                metric: metric.to_string(),
                value,
            });
        }
    }
    out
}

/// Writes (or overwrites) one CSV file. The header is always written.
pub fn write_csv(path: &Path, rows: &[CsvRow]) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(path)?;
    writer.write_record(CSV_HEADER)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush().map_err(|e| PipelineError::io(path, e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub output_root: PathBuf,
    pub tz: Tz,
    pub fill_missing_grid: bool,
    pub filter: ExportFilter,
    /// Metrics written header-only when the hour has no data at all.
    pub placeholder_metrics: Vec<Metric>,
    pub selection: HourSelection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportedFile {
    pub metric: String,
    pub path: PathBuf,
    pub rows: usize,
    pub placeholder: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportSummary {
    pub status: RunStatus,
    /// Local hour start, ISO-8601 with offset.
    pub hour: String,
    pub observations: usize,
    pub filtered_out: usize,
    pub files: Vec<ExportedFile>,
}

impl ExportSummary {
    pub fn details(&self) -> String {
        format!(
            "hour {}: {} observations ({} filtered out), {} files written",
            self.hour,
            self.observations,
            self.filtered_out,
            self.files.len()
        )
    }
}

/// Exports one local hour. Re-running for the same hour rewrites the same
/// files.
pub fn export_hour(store: &Store, options: &ExportOptions, now: DateTime<Utc>) -> Result<ExportSummary, PipelineError> {
    let hour_start = target_hour(now, options.tz, &options.selection)?;
    let start_utc = hour_start.with_timezone(&Utc);
    let end_utc = start_utc + Duration::hours(1);

    let loaded = store.observations_between(start_utc, end_utc)?;
    let total = loaded.len();
    let rows: Vec<&HourRow> = loaded.iter().filter(|r| options.filter.keeps(r)).collect();

    let mut summary = ExportSummary {
        status: RunStatus::Success,
        hour: local_iso(hour_start),
        observations: rows.len(),
        filtered_out: total - rows.len(),
        files: Vec::new(),
    };

    let present: BTreeSet<&str> = rows.iter().map(|r| r.metric.as_str()).collect();
    if present.is_empty() {
        warn!(component = %Component::Export, hour = %summary.hour, "no observations for hour, writing placeholder files");
        summary.status = RunStatus::Partial;
        for metric in &options.placeholder_metrics {
            let path = output_path(&options.output_root, metric.as_str(), hour_start);
            write_csv(&path, &[])?;
            summary.files.push(ExportedFile {
                metric: metric.as_str().to_string(),
                path,
                rows: 0,
                placeholder: true,
            });
        }
    } else {
        for metric in present {
            let metric_input: Vec<&HourRow> = rows.iter().copied().filter(|r| r.metric == metric).collect();
            let csv_rows = metric_rows(&metric_input, metric, hour_start, options.fill_missing_grid);
            let path = output_path(&options.output_root, metric, hour_start);
            write_csv(&path, &csv_rows)?;
            info!(component = %Component::Export, metric, rows = csv_rows.len(), path = %path.display(), "written");
            summary.files.push(ExportedFile {
                metric: metric.to_string(),
                path,
                rows: csv_rows.len(),
                placeholder: false,
            });
        }
    }

    log_run_summary(Component::Export, "hourly export", summary.status, &summary.details());
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
