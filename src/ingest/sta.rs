//! SensorThings API (OGC STA v1.x) source adapter.
//!
//! Each configured base URL is one deployment, e.g.
//! `https://sta.colife.org.tw/STA_Rain/v1.0`. Collections are paged with
//! `$top`/`$skip` and wrapped in `{"@iot.count": n, "value": [...]}`.
//!
//! API reference: https://docs.ogc.org/is/18-088/18-088.html

use serde_json::Value;

use crate::ingest::http::HttpClient;
use crate::ingest::{ObservationSource, Page};
use crate::model::SourceError;

/// One SensorThings deployment reached over HTTP.
#[derive(Debug, Clone)]
pub struct StaSource {
    base_url: String,
    http: HttpClient,
    page_size: usize,
}

impl StaSource {
    pub fn new(base_url: &str, http: HttpClient, page_size: usize) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            page_size: page_size.max(1),
        }
    }

    /// Absolute URL of a path relative to this base.
    pub fn url_for(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }
}

impl ObservationSource for StaSource {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn fetch_page(
        &self,
        path: &str,
        params: &[(String, String)],
        top: usize,
        skip: usize,
    ) -> Result<Page, SourceError> {
        let url = self.url_for(path);
        let mut query: Vec<(String, String)> = params.to_vec();
        query.push(("$top".to_string(), top.to_string()));
        query.push(("$skip".to_string(), skip.to_string()));
        if skip == 0 {
            query.push(("$count".to_string(), "true".to_string()));
        }

        let body = self.http.get_json(&url, &query)?;
        parse_page(&url, body)
    }

    fn fetch_entity(&self, path: &str) -> Result<Value, SourceError> {
        let url = self.url_for(path);
        let body = self.http.get_json(&url, &[])?;
        if body.is_object() {
            Ok(body)
        } else {
            Err(SourceError::Parse {
                url,
                message: "expected a JSON object".to_string(),
            })
        }
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

/// `base` + `/` + `path`, tolerating stray slashes on either side.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Decodes a collection response body.
pub fn parse_page(url: &str, body: Value) -> Result<Page, SourceError> {
    let Value::Object(mut map) = body else {
        return Err(SourceError::Parse {
            url: url.to_string(),
            message: "collection response is not a JSON object".to_string(),
        });
    };

    let total = map
        .get("@iot.count")
        .and_then(Value::as_u64)
        .map(|n| n as usize);

    let values = match map.remove("value") {
        Some(Value::Array(values)) => values,
        None | Some(Value::Null) => Vec::new(),
        Some(other) => {
            return Err(SourceError::Parse {
                url: url.to_string(),
                message: format!("'value' is not an array: {}", other),
            });
        }
    };

    Ok(Page { values, total })
}

// ============================================================================
// Tests
// ============================================================================
