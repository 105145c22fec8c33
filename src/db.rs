//! Embedded SQLite store for the catalog and raw observations.
//!
//! Three tables:
//! - `stations`        : one row per Thing, replaced on every catalog sync
//! - `datastreams`     : one row per Datastream with its current metric
//! - `raw_observations`: append-only, primary key `(ds_id, obs_time_utc)`
//!
//! The store is a cache of re-fetchable data, so it runs in WAL mode with
//! `synchronous=NORMAL`. Schema creation is idempotent and older databases
//! get missing columns added in place.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::info;

use crate::model::{Datastream, DatastreamRef, Metric, Observation, Station, metric_column};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to create database directory '{0}'")]
    CreateDir(PathBuf, #[source] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode JSON column: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS stations (
  thing_id INTEGER PRIMARY KEY,
  thing_name TEXT,
  thing_properties TEXT
);

CREATE TABLE IF NOT EXISTS datastreams (
  ds_id INTEGER PRIMARY KEY,
  thing_id INTEGER,
  ds_name TEXT,
  ds_description TEXT,
  obsprop_name TEXT,
  metric TEXT,
  unit TEXT,
  FOREIGN KEY(thing_id) REFERENCES stations(thing_id)
);

CREATE TABLE IF NOT EXISTS raw_observations (
  ds_id INTEGER,
  thing_id INTEGER,
  obs_time_utc TEXT,
  result REAL,
  result_json TEXT,
  PRIMARY KEY (ds_id, obs_time_utc),
  FOREIGN KEY(ds_id) REFERENCES datastreams(ds_id),
  FOREIGN KEY(thing_id) REFERENCES stations(thing_id)
);

CREATE INDEX IF NOT EXISTS idx_raw_time ON raw_observations(obs_time_utc);
";

/// Columns added after the first schema version.
const DATASTREAM_MIGRATIONS: &[(&str, &str)] = &[
    ("ds_description", "TEXT"),
    ("obsprop_name", "TEXT"),
    ("metric", "TEXT"),
    ("unit", "TEXT"),
];

/// Canonical text form of an observation time: RFC 3339, second
/// precision, `+00:00`. Range scans compare this text lexicographically.
pub fn utc_key(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// One observation joined with its datastream and station, as loaded for
/// an hourly export.
#[derive(Debug, Clone, PartialEq)]
pub struct HourRow {
    pub ds_id: i64,
    pub station_id: i64,
    pub obs_time_utc: String,
    pub result: Option<f64>,
    pub station_name: Option<String>,
    pub station_props: Option<String>,
    pub metric: String,
    pub ds_description: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub stations: usize,
    pub datastreams: usize,
    pub classified: usize,
    pub observations: usize,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| DbError::CreateDir(parent.to_path_buf(), e))?;
        }

        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        let store = Self::configure(conn)?;
        info!(path = %path.display(), journal_mode = %mode, "opened store");
        Ok(store)
    }

    /// A private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Create missing tables / indexes and add missing columns.
    pub fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        let added = self.ensure_columns("datastreams", DATASTREAM_MIGRATIONS)?;
        if !added.is_empty() {
            info!(table = "datastreams", columns = ?added, "added missing columns");
        }
        Ok(())
    }

    /// Adds each `(column, type)` the table lacks; returns the added names.
    pub fn ensure_columns(&self, table: &str, columns: &[(&str, &str)]) -> Result<Vec<String>> {
        let existing = self.column_names(table)?;
        let mut added = Vec::new();
        for (name, sql_type) in columns {
            if !existing.iter().any(|c| c.eq_ignore_ascii_case(name)) {
                self.conn
                    .execute(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, name, sql_type), [])?;
                added.push(name.to_string());
            }
        }
        Ok(added)
    }

    pub fn column_names(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    // -----------------------------------------------------------------------
    // Catalog
    // -----------------------------------------------------------------------

    /// Insert or overwrite a station by `thing_id`.
    pub fn upsert_station(&self, station: &Station) -> Result<()> {
        let props = serde_json::to_string(&station.properties)?;
        self.conn.execute(
            "INSERT INTO stations(thing_id, thing_name, thing_properties) VALUES(?1, ?2, ?3)
             ON CONFLICT(thing_id) DO UPDATE SET
               thing_name = excluded.thing_name,
               thing_properties = excluded.thing_properties",
            params![station.thing_id, station.name, props],
        )?;
        Ok(())
    }

    /// Insert or overwrite a datastream by `ds_id`, including its metric.
    pub fn upsert_datastream(&self, ds: &Datastream) -> Result<()> {
        self.conn.execute(
            "INSERT INTO datastreams(ds_id, thing_id, ds_name, ds_description, obsprop_name, metric, unit)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(ds_id) DO UPDATE SET
               thing_id = excluded.thing_id,
               ds_name = excluded.ds_name,
               ds_description = excluded.ds_description,
               obsprop_name = excluded.obsprop_name,
               metric = excluded.metric,
               unit = excluded.unit",
            params![
                ds.ds_id,
                ds.thing_id,
                ds.name,
                ds.description,
                ds.obsprop_name,
                metric_column(ds.metric),
                ds.unit,
            ],
        )?;
        Ok(())
    }

    pub fn get_station(&self, thing_id: i64) -> Result<Option<Station>> {
        let row = self
            .conn
            .query_row(
                "SELECT thing_id, thing_name, thing_properties FROM stations WHERE thing_id = ?1",
                [thing_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((thing_id, name, props)) => Ok(Some(Station {
                thing_id,
                name: name.unwrap_or_default(),
                properties: match props {
                    Some(text) => serde_json::from_str(&text)?,
                    None => serde_json::Value::Null,
                },
            })),
        }
    }

    pub fn get_datastream(&self, ds_id: i64) -> Result<Option<Datastream>> {
        let ds = self
            .conn
            .query_row(
                "SELECT ds_id, thing_id, ds_name, ds_description, obsprop_name, metric, unit
                 FROM datastreams WHERE ds_id = ?1",
                [ds_id],
                |row| {
                    let metric: Option<String> = row.get(5)?;
                    Ok(Datastream {
                        ds_id: row.get(0)?,
                        thing_id: row.get(1)?,
                        name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        description: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                        obsprop_name: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                        metric: metric.and_then(|m| m.parse::<Metric>().ok()),
                        unit: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(ds)
    }

    /// Datastreams with a non-empty metric, by ascending id.
    pub fn classified_datastreams(&self) -> Result<Vec<DatastreamRef>> {
        let mut stmt = self.conn.prepare(
            "SELECT ds_id, thing_id FROM datastreams
             WHERE COALESCE(metric, '') != ''
             ORDER BY ds_id",
        )?;
        let refs = stmt
            .query_map([], |row| {
                Ok(DatastreamRef {
                    ds_id: row.get(0)?,
                    thing_id: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(refs)
    }

    // -----------------------------------------------------------------------
    // Observations
    // -----------------------------------------------------------------------

    /// Insert-or-ignore a batch in one transaction. Returns how many rows
    /// were new; duplicates of an existing `(ds_id, obs_time_utc)` leave the
    /// stored row untouched.
    pub fn insert_observations(&mut self, observations: &[Observation]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO raw_observations(ds_id, thing_id, obs_time_utc, result, result_json)
                 VALUES(?1, ?2, ?3, ?4, ?5)",
            )?;
            for obs in observations {
                inserted += stmt.execute(params![
                    obs.ds_id,
                    obs.thing_id,
                    utc_key(obs.obs_time_utc),
                    obs.result,
                    obs.result_json,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Number of stored rows for one `(ds_id, timestamp)` identity (0 or 1).
    pub fn observation_count_at(&self, ds_id: i64, ts: DateTime<Utc>) -> Result<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM raw_observations WHERE ds_id = ?1 AND obs_time_utc = ?2",
            params![ds_id, utc_key(ts)],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Stored result for one observation, if the row exists.
    pub fn observation_result(&self, ds_id: i64, ts: DateTime<Utc>) -> Result<Option<Option<f64>>> {
        let result = self
            .conn
            .query_row(
                "SELECT result FROM raw_observations WHERE ds_id = ?1 AND obs_time_utc = ?2",
                params![ds_id, utc_key(ts)],
                |row| row.get::<_, Option<f64>>(0),
            )
            .optional()?;
        Ok(result)
    }

    /// Classified observations with `start <= obs_time_utc < end`, joined
    /// with station and datastream metadata.
    pub fn observations_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<HourRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.ds_id,
                    COALESCE(r.thing_id, d.thing_id) AS station_id,
                    r.obs_time_utc,
                    r.result,
                    s.thing_name,
                    s.thing_properties,
                    d.metric,
                    d.ds_description
             FROM raw_observations r
             LEFT JOIN datastreams d ON d.ds_id = r.ds_id
             LEFT JOIN stations s ON s.thing_id = COALESCE(r.thing_id, d.thing_id)
             WHERE r.obs_time_utc >= ?1 AND r.obs_time_utc < ?2
               AND COALESCE(d.metric, '') != ''
               AND COALESCE(r.thing_id, d.thing_id) IS NOT NULL
             ORDER BY station_id, r.obs_time_utc, r.ds_id",
        )?;
        let rows = stmt
            .query_map(params![utc_key(start), utc_key(end)], |row| {
                Ok(HourRow {
                    ds_id: row.get(0)?,
                    station_id: row.get(1)?,
                    obs_time_utc: row.get(2)?,
                    result: row.get(3)?,
                    station_name: row.get(4)?,
                    station_props: row.get(5)?,
                    metric: row.get(6)?,
                    ds_description: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn counts(&self) -> Result<StoreCounts> {
        let count = |sql: &str| -> Result<usize> {
            let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };
        Ok(StoreCounts {
            stations: count("SELECT COUNT(*) FROM stations")?,
            datastreams: count("SELECT COUNT(*) FROM datastreams")?,
            classified: count("SELECT COUNT(*) FROM datastreams WHERE COALESCE(metric, '') != ''")?,
            observations: count("SELECT COUNT(*) FROM raw_observations")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
