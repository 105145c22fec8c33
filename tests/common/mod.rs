//! Shared fixtures for integration tests: an in-memory SensorThings source.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;

use serde_json::{Value, json};

use sta_hydro::ingest::{ObservationSource, Page};
use sta_hydro::model::SourceError;

/// Serves collections from memory with `$top`/`$skip` paging and an
/// `@iot.count` total. A path mapped to a status answers that status on
/// every request. `$filter` is recorded but not applied.
pub struct FakeSource {
    base: String,
    page_size: usize,
    collections: HashMap<String, Vec<Value>>,
    statuses: HashMap<String, u16>,
    entities: HashMap<String, Value>,
    pub requests: RefCell<Vec<(String, Vec<(String, String)>)>>,
}

impl FakeSource {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.to_string(),
            page_size: 1000,
            collections: HashMap::new(),
            statuses: HashMap::new(),
            entities: HashMap::new(),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_collection(mut self, path: &str, values: Vec<Value>) -> Self {
        self.collections.insert(path.to_string(), values);
        self
    }

    pub fn with_status(mut self, path: &str, status: u16) -> Self {
        self.statuses.insert(path.to_string(), status);
        self
    }

    pub fn with_entity(mut self, path: &str, value: Value) -> Self {
        self.entities.insert(path.to_string(), value);
        self
    }

    /// Number of requests (pages and entities) made for `path`.
    pub fn requests_for(&self, path: &str) -> usize {
        self.requests.borrow().iter().filter(|(p, _)| p == path).count()
    }

    fn error_for(&self, path: &str) -> Option<SourceError> {
        let url = format!("{}/{}", self.base, path);
        self.statuses.get(path).map(|&status| match status {
            404 | 410 => SourceError::Absent { url, status },
            _ => SourceError::HttpStatus { url, status },
        })
    }
}

impl ObservationSource for FakeSource {
    fn base_url(&self) -> &str {
        &self.base
    }

    fn fetch_page(
        &self,
        path: &str,
        params: &[(String, String)],
        top: usize,
        skip: usize,
    ) -> Result<Page, SourceError> {
        self.requests
            .borrow_mut()
            .push((path.to_string(), params.to_vec()));
        if let Some(err) = self.error_for(path) {
            return Err(err);
        }
        let all = self.collections.get(path).cloned().unwrap_or_default();
        Ok(Page {
            total: Some(all.len()),
            values: all.into_iter().skip(skip).take(top).collect(),
        })
    }

    fn fetch_entity(&self, path: &str) -> Result<Value, SourceError> {
        self.requests.borrow_mut().push((path.to_string(), Vec::new()));
        if let Some(err) = self.error_for(path) {
            return Err(err);
        }
        self.entities.get(path).cloned().ok_or(SourceError::Absent {
            url: format!("{}/{}", self.base, path),
            status: 404,
        })
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

// ---------------------------------------------------------------------------
// Record builders
// ---------------------------------------------------------------------------

pub fn thing(id: i64, name: &str, authority: &str) -> Value {
    json!({
        "@iot.id": id,
        "name": name,
        "properties": { "authority_type": authority }
    })
}

pub fn rain_datastream(id: i64, thing_id: i64) -> Value {
    json!({
        "@iot.id": id,
        "name": format!("RAIN-{}", id),
        "description": "Datastream_Category_type=雨量感測器",
        "unitOfMeasurement": { "name": "millimeter", "symbol": "mm" },
        "ObservedProperty": { "name": "rainfall" },
        "Thing": { "@iot.id": thing_id, "name": format!("Station {}", thing_id) }
    })
}

pub fn battery_datastream(id: i64, thing_id: i64) -> Value {
    json!({
        "@iot.id": id,
        "name": "Battery voltage",
        "description": "power supply",
        "unitOfMeasurement": { "name": "volt", "symbol": "V" },
        "ObservedProperty": { "name": "voltage" },
        "Thing": { "@iot.id": thing_id, "name": format!("Station {}", thing_id) }
    })
}

pub fn observation(id: i64, time: &str, result: Value) -> Value {
    json!({
        "@iot.id": id,
        "phenomenonTime": time,
        "result": result
    })
}
