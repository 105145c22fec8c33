//! Source Verification Module
//!
//! Probes each configured SensorThings base to see whether it is reachable
//! and whether its datastreams classify into metrics the pipeline exports.
//!
//! Use this before adding a base URL to the configuration.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{parse_datastream, parse_station};
use crate::ingest::{ObservationSource, SourceChain};
use crate::logging::{Component, log_source_failure};
use crate::model::Station;

// ============================================================================
// Verification Results
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub timestamp: String,
    pub sources: Vec<SourceVerification>,
    pub summary: VerificationSummary,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub total: usize,
    pub working: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceVerification {
    pub base_url: String,
    pub status: VerificationStatus,
    pub reachable: bool,
    /// Datastreams read in the sample page.
    pub sampled: usize,
    /// `@iot.count` of the collection, when reported.
    pub reported_total: Option<usize>,
    pub metric_counts: BTreeMap<String, usize>,
    pub unclassified: usize,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum VerificationStatus {
    /// Reachable and at least one sampled datastream classified.
    Success,
    /// Reachable, but nothing in the sample classified.
    PartialSuccess,
    Failed,
}

// ============================================================================
// Probing
// ============================================================================

/// Reads the first `sample` datastreams of a base and classifies them.
pub fn verify_source<S: ObservationSource>(source: &S, sample: usize) -> SourceVerification {
    let mut result = SourceVerification {
        base_url: source.base_url().to_string(),
        status: VerificationStatus::Failed,
        reachable: false,
        sampled: 0,
        reported_total: None,
        metric_counts: BTreeMap::new(),
        unclassified: 0,
        error_message: None,
    };

    let params = vec![("$expand".to_string(), "ObservedProperty,Thing".to_string())];
    let page = match source.fetch_page("Datastreams", &params, sample.max(1), 0) {
        Ok(page) => page,
        Err(e) => {
            log_source_failure(Component::Http, source.base_url(), "verification probe", &e);
            result.error_message = Some(e.to_string());
            return result;
        }
    };

    result.reachable = true;
    result.reported_total = page.total;
    for record in &page.values {
        let station = record
            .get("Thing")
            .and_then(|thing| parse_station(thing).ok())
            .unwrap_or_else(|| Station {
                thing_id: 0,
                name: String::new(),
                properties: Value::Null,
            });
        let Ok(ds) = parse_datastream(record, &station) else {
            continue;
        };
        result.sampled += 1;
        match ds.metric {
            Some(metric) => *result.metric_counts.entry(metric.as_str().to_string()).or_insert(0) += 1,
            None => result.unclassified += 1,
        }
    }

    result.status = if result.metric_counts.is_empty() {
        VerificationStatus::PartialSuccess
    } else {
        VerificationStatus::Success
    };
    result
}

/// Probes every base in the chain.
pub fn run_verification<S: ObservationSource>(
    chain: &SourceChain<S>,
    sample: usize,
    now: DateTime<Utc>,
) -> VerificationReport {
    let mut report = VerificationReport {
        timestamp: now.to_rfc3339(),
        sources: Vec::new(),
        summary: VerificationSummary {
            total: chain.len(),
            ..Default::default()
        },
    };

    for source in chain.sources() {
        let result = verify_source(source, sample);
        match result.status {
            VerificationStatus::Success | VerificationStatus::PartialSuccess => report.summary.working += 1,
            VerificationStatus::Failed => report.summary.failed += 1,
        }
        report.sources.push(result);
    }
    report
}

pub fn print_summary(report: &VerificationReport) {
    println!("===============================================================");
    println!("SOURCE VERIFICATION ({})", report.timestamp);
    println!("===============================================================");
    for source in &report.sources {
        match source.status {
            VerificationStatus::Success => {
                let metrics: Vec<String> = source
                    .metric_counts
                    .iter()
                    .map(|(metric, n)| format!("{}={}", metric, n))
                    .collect();
                println!(
                    "  OK       {} ({} sampled, {} unclassified; {})",
                    source.base_url,
                    source.sampled,
                    source.unclassified,
                    metrics.join(", ")
                );
            }
            VerificationStatus::PartialSuccess => {
                println!(
                    "  PARTIAL  {} (reachable, none of {} sampled datastreams classified)",
                    source.base_url, source.sampled
                );
            }
            VerificationStatus::Failed => {
                println!(
                    "  FAILED   {}: {}",
                    source.base_url,
                    source.error_message.as_deref().unwrap_or("Unknown")
                );
            }
        }
    }
    println!();
    println!(
        "Bases: {}/{} working ({} failed)",
        report.summary.working, report.summary.total, report.summary.failed
    );
    println!("===============================================================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::Page;
    use crate::model::SourceError;
    use serde_json::json;

    struct CannedSource {
        base: String,
        page: Result<Vec<Value>, u16>,
    }

    impl ObservationSource for CannedSource {
        fn base_url(&self) -> &str {
            &self.base
        }

        fn fetch_page(&self, path: &str, _params: &[(String, String)], top: usize, _skip: usize) -> Result<Page, SourceError> {
            assert_eq!(path, "Datastreams");
            match &self.page {
                Ok(values) => Ok(Page {
                    values: values.iter().take(top).cloned().collect(),
                    total: Some(values.len()),
                }),
                Err(404) => Err(SourceError::Absent { url: self.base.clone(), status: 404 }),
                Err(status) => Err(SourceError::HttpStatus { url: self.base.clone(), status: *status }),
            }
        }

        fn fetch_entity(&self, path: &str) -> Result<Value, SourceError> {
            Err(SourceError::Absent { url: path.to_string(), status: 404 })
        }
    }

    fn rain_ds(id: i64) -> Value {
        json!({
            "@iot.id": id,
            "name": "rain gauge",
            "description": "Datastream_Category_type=雨量感測器",
            "Thing": { "@iot.id": 1, "name": "Station One" }
        })
    }

    #[test]
    fn test_classified_sample_is_success() {
        let source = CannedSource {
            base: "a".into(),
            page: Ok(vec![rain_ds(1), rain_ds(2), json!({ "@iot.id": 3, "name": "battery" })]),
        };
        let result = verify_source(&source, 10);
        assert_eq!(result.status, VerificationStatus::Success);
        assert_eq!(result.sampled, 3);
        assert_eq!(result.reported_total, Some(3));
        assert_eq!(result.metric_counts.get("rainfall"), Some(&2));
        assert_eq!(result.unclassified, 1);
    }

    #[test]
    fn test_unclassified_sample_is_partial() {
        let source = CannedSource {
            base: "a".into(),
            page: Ok(vec![json!({ "@iot.id": 3, "name": "battery" })]),
        };
        assert_eq!(verify_source(&source, 10).status, VerificationStatus::PartialSuccess);
    }

    #[test]
    fn test_unreachable_source_fails() {
        let chain = SourceChain::new(vec![
            CannedSource { base: "gone".into(), page: Err(404) },
            CannedSource { base: "broken".into(), page: Err(500) },
            CannedSource { base: "ok".into(), page: Ok(vec![rain_ds(1)]) },
        ]);
        let report = run_verification(&chain, 5, Utc::now());
        assert_eq!(report.summary.total, 3);
        assert_eq!(report.summary.working, 1);
        assert_eq!(report.summary.failed, 2);
        assert!(!report.sources[0].reachable);
        assert!(report.sources[1].error_message.as_deref().unwrap().contains("500"));

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"PartialSuccess\"") || json.contains("\"Success\""));
    }
}
