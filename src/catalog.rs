//! Catalog synchronization: stations and datastreams.
//!
//! Bases are complementary here. Each one is walked in turn:
//! `Things` (every page), then `Things(id)/Datastreams` per station with
//! `ObservedProperty` and `Thing` expanded inline. Every datastream is
//! classified on every sync and upserted, so a changed rule set
//! reclassifies the whole catalog in one run.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::classify::{self, DatastreamMetadata};
use crate::db::{DbError, Store};
use crate::error::PipelineError;
use crate::ingest::{ObservationSource, Pages, Params, SourceChain, SourceOutcome};
use crate::logging::{Component, log_run_summary, log_source_failure};
use crate::model::{Datastream, RecordError, RunStatus, SourceError, Station};

/// Options for one catalog sync.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncOptions {
    /// Push the filters below down to the API as `$filter`.
    pub api_filter: bool,
    /// Description substrings (`substringof`).
    pub category_whitelist: Vec<String>,
    /// `Thing/properties/authority_type` values.
    pub authorities: Vec<String>,
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum BaseOutcome {
    Synced,
    /// `Things` answered 404/410; the base was skipped.
    Absent,
    /// The station walk failed; stations read before the failure are kept.
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BaseCounts {
    pub stations: usize,
    pub datastreams: usize,
    pub classified: usize,
    /// Records that could not be parsed.
    pub skipped_records: usize,
    /// Stations whose datastream walk failed.
    pub failed_stations: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BaseReport {
    pub base: String,
    pub outcome: BaseOutcome,
    pub counts: BaseCounts,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogSummary {
    pub status: RunStatus,
    pub bases: Vec<BaseReport>,
}

impl CatalogSummary {
    pub fn stations(&self) -> usize {
        self.bases.iter().map(|b| b.counts.stations).sum()
    }

    pub fn datastreams(&self) -> usize {
        self.bases.iter().map(|b| b.counts.datastreams).sum()
    }

    pub fn classified(&self) -> usize {
        self.bases.iter().map(|b| b.counts.classified).sum()
    }

    pub fn details(&self) -> String {
        let skipped: usize = self.bases.iter().map(|b| b.counts.skipped_records).sum();
        let failed_stations: usize = self.bases.iter().map(|b| b.counts.failed_stations).sum();
        let unavailable = self
            .bases
            .iter()
            .filter(|b| b.outcome != BaseOutcome::Synced)
            .count();
        format!(
            "{} stations, {} datastreams ({} classified), {} records skipped, {} station walks failed, {}/{} bases unavailable",
            self.stations(),
            self.datastreams(),
            self.classified(),
            skipped,
            failed_stations,
            unavailable,
            self.bases.len()
        )
    }
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Walks every base and upserts what it finds.
///
/// A base whose station collection is absent or fails is reported and the
/// next base is tried. Fails with [`PipelineError::NoStations`] when no base
/// produced a single station, and with [`PipelineError::Db`] on any store
/// error.
pub fn sync_catalog<S: ObservationSource>(
    chain: &SourceChain<S>,
    store: &Store,
    options: &SyncOptions,
) -> Result<CatalogSummary, PipelineError> {
    let filter = build_api_filter(options);
    if let Some(f) = &filter {
        info!(component = %Component::Catalog, filter = %f, "API filter enabled");
    }

    let mut per_base: Vec<BaseCounts> = Vec::with_capacity(chain.len());
    let outcomes = chain.each(|source| {
        let mut counts = BaseCounts::default();
        let result = sync_base(source, store, filter.as_deref(), &mut counts);
        per_base.push(counts);
        result
    });

    let mut bases = Vec::with_capacity(outcomes.len());
    for ((source, outcome), counts) in outcomes.into_iter().zip(per_base) {
        let base = source.base_url().to_string();
        let outcome = match outcome {
            SourceOutcome::Answered(Ok(())) => {
                info!(
                    component = %Component::Catalog,
                    base = %base,
                    stations = counts.stations,
                    datastreams = counts.datastreams,
                    classified = counts.classified,
                    "base synced"
                );
                BaseOutcome::Synced
            }
            SourceOutcome::Answered(Err(e)) => return Err(e.into()),
            SourceOutcome::Absent => {
                warn!(component = %Component::Catalog, base = %base, "station collection not found, skipping base");
                BaseOutcome::Absent
            }
            SourceOutcome::Failed(e) => {
                log_source_failure(Component::Catalog, &base, "station walk", &e);
                BaseOutcome::Failed(e.to_string())
            }
        };
        bases.push(BaseReport { base, outcome, counts });
    }

    let mut summary = CatalogSummary {
        status: RunStatus::Success,
        bases,
    };

    if summary.stations() == 0 {
        log_run_summary(Component::Catalog, "catalog sync", RunStatus::Failed, &summary.details());
        return Err(PipelineError::NoStations {
            bases: summary.bases.iter().map(|b| b.base.clone()).collect(),
        });
    }

    let degraded = summary.bases.iter().any(|b| {
        b.outcome != BaseOutcome::Synced || b.counts.skipped_records > 0 || b.counts.failed_stations > 0
    });
    if degraded {
        summary.status = RunStatus::Partial;
    }
    log_run_summary(Component::Catalog, "catalog sync", summary.status, &summary.details());
    Ok(summary)
}

/// Syncs one base. The outer error is the station walk failing (the base
/// is then skipped); the inner one is a store failure, which ends the sync.
fn sync_base<S: ObservationSource>(
    source: &S,
    store: &Store,
    filter: Option<&str>,
    counts: &mut BaseCounts,
) -> Result<Result<(), DbError>, SourceError> {
    let base = source.base_url();
    for record in Pages::strict(source, "Things", Vec::new(), source.page_size()) {
        let record = record?;
        let station = match parse_station(&record) {
            Ok(station) => station,
            Err(e) => {
                warn!(component = %Component::Catalog, base, error = %e, "skipping station record");
                counts.skipped_records += 1;
                continue;
            }
        };

        if let Err(e) = store.upsert_station(&station) {
            return Ok(Err(e));
        }
        counts.stations += 1;

        if let Err(e) = sync_station_datastreams(source, store, &station, filter, counts) {
            match e {
                StationError::Db(e) => return Ok(Err(e)),
                StationError::Source(e) => {
                    log_source_failure(Component::Catalog, base, &format!("datastream walk for thing {}", station.thing_id), &e);
                    counts.failed_stations += 1;
                }
            }
        }
    }
    Ok(Ok(()))
}

enum StationError {
    Source(SourceError),
    Db(DbError),
}

fn sync_station_datastreams<S: ObservationSource>(
    source: &S,
    store: &Store,
    station: &Station,
    filter: Option<&str>,
    counts: &mut BaseCounts,
) -> Result<(), StationError> {
    let path = format!("Things({})/Datastreams", station.thing_id);
    let mut params: Params = vec![("$expand".to_string(), "ObservedProperty,Thing".to_string())];
    if let Some(f) = filter {
        params.push(("$filter".to_string(), f.to_string()));
    }

    for record in Pages::new(source, &path, params, source.page_size()) {
        let mut record = record.map_err(StationError::Source)?;
        expand_observed_property(source, &mut record);

        let ds = match parse_datastream(&record, station) {
            Ok(ds) => ds,
            Err(e) => {
                warn!(
                    component = %Component::Catalog,
                    base = source.base_url(),
                    thing_id = station.thing_id,
                    error = %e,
                    "skipping datastream record"
                );
                counts.skipped_records += 1;
                continue;
            }
        };

        store.upsert_datastream(&ds).map_err(StationError::Db)?;
        counts.datastreams += 1;
        if ds.metric.is_some() {
            counts.classified += 1;
        }
        debug!(
            component = %Component::Catalog,
            ds_id = ds.ds_id,
            thing_id = ds.thing_id,
            metric = %crate::model::metric_column(ds.metric),
            "datastream upserted"
        );
    }
    Ok(())
}

/// Fetches `ObservedProperty` separately when the server ignored `$expand`.
fn expand_observed_property<S: ObservationSource>(source: &S, record: &mut Value) {
    if record.get("ObservedProperty").is_some_and(|v| v.is_object()) {
        return;
    }
    let Ok(ds_id) = entity_id(record) else {
        return;
    };
    match source.fetch_entity(&format!("Datastreams({})/ObservedProperty", ds_id)) {
        Ok(prop) => {
            if let Some(map) = record.as_object_mut() {
                map.insert("ObservedProperty".to_string(), prop);
            }
        }
        Err(e) => log_source_failure(Component::Catalog, source.base_url(), "observed property lookup", &e),
    }
}

// ---------------------------------------------------------------------------
// $filter push-down
// ---------------------------------------------------------------------------

/// OData `$filter` for the datastream walk, or `None` when disabled or
/// there is nothing to filter on.
pub fn build_api_filter(options: &SyncOptions) -> Option<String> {
    if !options.api_filter {
        return None;
    }

    let mut groups = Vec::new();
    if !options.category_whitelist.is_empty() {
        let terms: Vec<String> = options
            .category_whitelist
            .iter()
            .map(|s| format!("substringof('{}', description)", odata_quote(s)))
            .collect();
        groups.push(format!("({})", terms.join(" or ")));
    }
    if !options.authorities.is_empty() {
        let terms: Vec<String> = options
            .authorities
            .iter()
            .map(|a| format!("Thing/properties/authority_type eq '{}'", odata_quote(a)))
            .collect();
        groups.push(format!("({})", terms.join(" or ")));
    }

    (!groups.is_empty()).then(|| groups.join(" and "))
}

fn odata_quote(s: &str) -> String {
    s.replace('\'', "''")
}

// ---------------------------------------------------------------------------
// Record parsing
// ---------------------------------------------------------------------------

/// `@iot.id` as an integer; servers send either a number or a numeric string.
pub fn entity_id(record: &Value) -> Result<i64, RecordError> {
    match record.get("@iot.id") {
        None | Some(Value::Null) => Err(RecordError::MissingField("@iot.id")),
        Some(Value::Number(n)) => n.as_i64().ok_or_else(|| RecordError::InvalidField {
            field: "@iot.id",
            value: n.to_string(),
        }),
        Some(Value::String(s)) => s.trim().parse().map_err(|_| RecordError::InvalidField {
            field: "@iot.id",
            value: s.clone(),
        }),
        Some(other) => Err(RecordError::InvalidField {
            field: "@iot.id",
            value: other.to_string(),
        }),
    }
}

fn text<'a>(record: &'a Value, key: &str) -> &'a str {
    record.get(key).and_then(Value::as_str).unwrap_or("")
}

pub fn parse_station(record: &Value) -> Result<Station, RecordError> {
    Ok(Station {
        thing_id: entity_id(record)?,
        name: text(record, "name").to_string(),
        properties: record.get("properties").cloned().unwrap_or(Value::Null),
    })
}

/// Builds and classifies a datastream read under `station`.
pub fn parse_datastream(record: &Value, station: &Station) -> Result<Datastream, RecordError> {
    let ds_id = entity_id(record)?;
    let observed = record.get("ObservedProperty").unwrap_or(&Value::Null);
    let unit = record.get("unitOfMeasurement").unwrap_or(&Value::Null);
    let thing_name = record
        .get("Thing")
        .map(|t| text(t, "name"))
        .filter(|n| !n.is_empty())
        .unwrap_or(station.name.as_str());

    let meta = DatastreamMetadata {
        name: text(record, "name"),
        description: text(record, "description"),
        observed_property: text(observed, "name"),
        unit_name: text(unit, "name"),
        unit_symbol: text(unit, "symbol"),
        station_name: thing_name,
    };

    Ok(Datastream {
        ds_id,
        thing_id: station.thing_id,
        name: meta.name.to_string(),
        description: meta.description.to_string(),
        obsprop_name: meta.observed_property.to_string(),
        metric: classify::classify(&meta),
        unit: meta.unit_name.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Metric;
    use serde_json::json;

    fn station() -> Station {
        Station {
            thing_id: 7,
            name: "Station Seven".into(),
            properties: Value::Null,
        }
    }

    #[test]
    fn test_api_filter_disabled_or_empty_yields_none() {
        assert_eq!(build_api_filter(&SyncOptions::default()), None);

        let options = SyncOptions {
            api_filter: false,
            category_whitelist: vec!["雨量感測器".into()],
            authorities: vec![],
        };
        assert_eq!(build_api_filter(&options), None);

        let options = SyncOptions {
            api_filter: true,
            ..Default::default()
        };
        assert_eq!(build_api_filter(&options), None);
    }

    #[test]
    fn test_api_filter_joins_groups() {
        let options = SyncOptions {
            api_filter: true,
            category_whitelist: vec!["雨量感測器".into(), "河川水位站".into()],
            authorities: vec!["水利署".into()],
        };
        assert_eq!(
            build_api_filter(&options).unwrap(),
            "(substringof('雨量感測器', description) or substringof('河川水位站', description)) \
             and (Thing/properties/authority_type eq '水利署')"
        );
    }

    #[test]
    fn test_api_filter_escapes_quotes() {
        let options = SyncOptions {
            api_filter: true,
            category_whitelist: vec![],
            authorities: vec!["O'Brien County".into()],
        };
        assert_eq!(
            build_api_filter(&options).unwrap(),
            "(Thing/properties/authority_type eq 'O''Brien County')"
        );
    }

    #[test]
    fn test_entity_id_accepts_numbers_and_numeric_strings() {
        assert_eq!(entity_id(&json!({ "@iot.id": 12 })), Ok(12));
        assert_eq!(entity_id(&json!({ "@iot.id": " 34 " })), Ok(34));
        assert_eq!(entity_id(&json!({})), Err(RecordError::MissingField("@iot.id")));
        assert!(matches!(
            entity_id(&json!({ "@iot.id": "abc" })),
            Err(RecordError::InvalidField { .. })
        ));
        assert!(entity_id(&json!({ "@iot.id": 1.5 })).is_err());
    }

    #[test]
    fn test_parse_station_keeps_properties_blob() {
        let station = parse_station(&json!({
            "@iot.id": 3,
            "name": "Tamsui River",
            "properties": { "authority_type": "水利署", "city": "Taipei" }
        }))
        .unwrap();
        assert_eq!(station.thing_id, 3);
        assert_eq!(station.name, "Tamsui River");
        assert_eq!(station.properties["city"], "Taipei");

        let bare = parse_station(&json!({ "@iot.id": 4 })).unwrap();
        assert_eq!(bare.name, "");
        assert!(bare.properties.is_null());
    }

    #[test]
    fn test_parse_datastream_classifies_from_expanded_metadata() {
        let record = json!({
            "@iot.id": 70,
            "name": "RAIN-10M",
            "description": "Datastream_Category_type=雨量感測器",
            "unitOfMeasurement": { "name": "millimeter", "symbol": "mm" },
            "ObservedProperty": { "name": "rainfall" },
            "Thing": { "name": "Station Seven" }
        });
        let ds = parse_datastream(&record, &station()).unwrap();
        assert_eq!(ds.ds_id, 70);
        assert_eq!(ds.thing_id, 7);
        assert_eq!(ds.metric, Some(Metric::Rainfall));
        assert_eq!(ds.unit, "millimeter");
        assert_eq!(ds.obsprop_name, "rainfall");
    }

    #[test]
    fn test_parse_datastream_without_expansion_is_unclassified_when_nothing_matches() {
        let record = json!({ "@iot.id": 71, "name": "Battery voltage" });
        let ds = parse_datastream(&record, &station()).unwrap();
        assert_eq!(ds.metric, None);
        assert_eq!(ds.unit, "");
    }

    #[test]
    fn test_parse_datastream_requires_id() {
        let err = parse_datastream(&json!({ "name": "x" }), &station()).unwrap_err();
        assert_eq!(err, RecordError::MissingField("@iot.id"));
    }

    #[test]
    fn test_summary_totals() {
        let summary = CatalogSummary {
            status: RunStatus::Partial,
            bases: vec![
                BaseReport {
                    base: "a".into(),
                    outcome: BaseOutcome::Synced,
                    counts: BaseCounts { stations: 3, datastreams: 2, classified: 1, ..Default::default() },
                },
                BaseReport {
                    base: "b".into(),
                    outcome: BaseOutcome::Absent,
                    counts: BaseCounts::default(),
                },
            ],
        };
        assert_eq!(summary.stations(), 3);
        assert_eq!(summary.datastreams(), 2);
        assert_eq!(summary.classified(), 1);
        assert!(summary.details().contains("1/2 bases unavailable"));
    }
}
