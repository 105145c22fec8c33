//! Upstream data access.
//!
//! Submodules:
//! - `http`: blocking HTTP client with per-request retry.
//! - `sta` : SensorThings API adapter implementing [`ObservationSource`].
//!
//! This module holds the pieces shared by the catalog sync and the window
//! fetch: the [`ObservationSource`] capability trait, the [`Pages`] reader
//! that walks an offset-paged collection, and [`SourceChain`], the single
//! place that decides how several configured bases are iterated.

pub mod http;
pub mod sta;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tracing::debug;

use crate::model::SourceError;

/// Query parameters as sent on the wire.
pub type Params = Vec<(String, String)>;

// ---------------------------------------------------------------------------
// Capability interface
// ---------------------------------------------------------------------------

/// One page of a collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub values: Vec<Value>,
    /// Collection size when the source reports it (`@iot.count`).
    pub total: Option<usize>,
}

/// What the pipeline needs from one API deployment.
///
/// `path` arguments are relative to the source's base URL, e.g. `Things` or
/// `Things(12)/Datastreams`.
pub trait ObservationSource {
    /// Base URL, used to label diagnostics.
    fn base_url(&self) -> &str;

    /// Fetches one page (`$top = top`, `$skip = skip`) of a collection.
    fn fetch_page(
        &self,
        path: &str,
        params: &[(String, String)],
        top: usize,
        skip: usize,
    ) -> Result<Page, SourceError>;

    /// Fetches a single entity, e.g. `Datastreams(7)/ObservedProperty`.
    fn fetch_entity(&self, path: &str) -> Result<Value, SourceError>;

    /// Page size used for collection walks.
    fn page_size(&self) -> usize {
        1000
    }

    /// All observations of a datastream with `phenomenonTime >= since`,
    /// oldest first. A 404/410 is returned as `SourceError::Absent` so the
    /// caller can move on to the next base.
    fn fetch_observations(
        &self,
        ds_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<Value>, SourceError> {
        let path = format!("Datastreams({})/Observations", ds_id);
        let params = observation_window_params(since);
        Pages::strict(self, &path, params, self.page_size()).collect()
    }
}

/// `$filter` / `$orderby` for an observation window starting at `since`.
pub fn observation_window_params(since: DateTime<Utc>) -> Params {
    vec![
        (
            "$filter".to_string(),
            format!(
                "phenomenonTime ge {}",
                since.to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
        ),
        ("$orderby".to_string(), "phenomenonTime asc".to_string()),
    ]
}

// ---------------------------------------------------------------------------
// Paginated reader
// ---------------------------------------------------------------------------

/// Lazy walk over an offset-paged collection.
///
/// The walk ends on an empty page, a short page, or once the reported total
/// has been read. A 404/410 ends the walk too: in the default (tolerant)
/// mode it yields nothing further and [`Pages::source_absent`] reports
/// whether it happened on the first page; in strict mode the `Absent` error
/// is yielded. Other errors are yielded once and end the walk.
pub struct Pages<'a, S: ObservationSource + ?Sized> {
    source: &'a S,
    path: String,
    params: Params,
    page_size: usize,
    strict: bool,
    skip: usize,
    total: Option<usize>,
    buffer: std::vec::IntoIter<Value>,
    requests: usize,
    absent: bool,
    done: bool,
}

impl<'a, S: ObservationSource + ?Sized> Pages<'a, S> {
    /// A walk that treats 404/410 as "no such collection here".
    pub fn new(source: &'a S, path: &str, params: Params, page_size: usize) -> Self {
        Self {
            source,
            path: path.to_string(),
            params,
            page_size: page_size.max(1),
            strict: false,
            skip: 0,
            total: None,
            buffer: Vec::new().into_iter(),
            requests: 0,
            absent: false,
            done: false,
        }
    }

    /// A walk that surfaces 404/410 on the first page as an error.
    pub fn strict(source: &'a S, path: &str, params: Params, page_size: usize) -> Self {
        Self {
            strict: true,
            ..Self::new(source, path, params, page_size)
        }
    }

    /// Number of page requests issued so far.
    pub fn requests(&self) -> usize {
        self.requests
    }

    /// True when the first page came back 404/410.
    pub fn source_absent(&self) -> bool {
        self.absent
    }

    fn next_page(&mut self) -> Result<(), SourceError> {
        let page = self
            .source
            .fetch_page(&self.path, &self.params, self.page_size, self.skip);
        self.requests += 1;

        let page = match page {
            Ok(page) => page,
            Err(e) if e.is_absent() => {
                self.done = true;
                if self.requests == 1 {
                    self.absent = true;
                    if self.strict {
                        return Err(e);
                    }
                }
                debug!(path = %self.path, skip = self.skip, "collection absent, ending walk");
                return Ok(());
            }
            Err(e) => {
                self.done = true;
                return Err(e);
            }
        };

        if self.total.is_none() {
            self.total = page.total;
        }
        let received = page.values.len();
        self.skip += received;

        let reached_total = self.total.is_some_and(|total| self.skip >= total);
        if received == 0 || received < self.page_size || reached_total {
            self.done = true;
        }
        self.buffer = page.values.into_iter();
        Ok(())
    }
}

impl<S: ObservationSource + ?Sized> Iterator for Pages<'_, S> {
    type Item = Result<Value, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(value) = self.buffer.next() {
                return Some(Ok(value));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.next_page() {
                return Some(Err(e));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Source fallback
// ---------------------------------------------------------------------------

/// How one source answered a request.
#[derive(Debug)]
pub enum SourceOutcome<T> {
    Answered(T),
    /// 404/410: the source does not hold this resource.
    Absent,
    Failed(SourceError),
}

impl<T> SourceOutcome<T> {
    pub fn from_result(result: Result<T, SourceError>) -> Self {
        match result {
            Ok(value) => SourceOutcome::Answered(value),
            Err(e) if e.is_absent() => SourceOutcome::Absent,
            Err(e) => SourceOutcome::Failed(e),
        }
    }
}

/// Why a base did not provide an answer.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMiss {
    pub base: String,
    /// `None` for 404/410, otherwise the error text.
    pub error: Option<String>,
}

/// Result of trying bases as alternatives for the same resource.
#[derive(Debug)]
pub enum Fallback<T> {
    Found { base: String, value: T, misses: Vec<SourceMiss> },
    Exhausted { misses: Vec<SourceMiss> },
}

/// The configured bases, in priority order.
pub struct SourceChain<S> {
    sources: Vec<S>,
}

impl<S: ObservationSource> SourceChain<S> {
    pub fn new(sources: Vec<S>) -> Self {
        Self { sources }
    }

    pub fn sources(&self) -> &[S] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Runs `op` against every base (complementary sources) and returns each
    /// base's outcome in order.
    pub fn each<T>(
        &self,
        mut op: impl FnMut(&S) -> Result<T, SourceError>,
    ) -> Vec<(&S, SourceOutcome<T>)> {
        self.sources
            .iter()
            .map(|source| (source, SourceOutcome::from_result(op(source))))
            .collect()
    }

    /// Tries bases in order (alternative sources) and stops at the first
    /// one that answers. Responses are never merged.
    pub fn first_answer<T>(&self, mut op: impl FnMut(&S) -> Result<T, SourceError>) -> Fallback<T> {
        let mut misses = Vec::new();
        for source in &self.sources {
            match SourceOutcome::from_result(op(source)) {
                SourceOutcome::Answered(value) => {
                    return Fallback::Found {
                        base: source.base_url().to_string(),
                        value,
                        misses,
                    };
                }
                SourceOutcome::Absent => misses.push(SourceMiss {
                    base: source.base_url().to_string(),
                    error: None,
                }),
                SourceOutcome::Failed(e) => misses.push(SourceMiss {
                    base: source.base_url().to_string(),
                    error: Some(e.to_string()),
                }),
            }
        }
        Fallback::Exhausted { misses }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    /// In-memory source: `collections` maps a path to its full record list,
    /// `errors` maps a path to an HTTP status returned for every request.
    struct FakeSource {
        base: String,
        collections: HashMap<String, Vec<Value>>,
        errors: HashMap<String, u16>,
        report_total: bool,
        requests: Cell<usize>,
        seen_skips: RefCell<Vec<usize>>,
    }

    impl FakeSource {
        fn new(base: &str) -> Self {
            Self {
                base: base.to_string(),
                collections: HashMap::new(),
                errors: HashMap::new(),
                report_total: true,
                requests: Cell::new(0),
                seen_skips: RefCell::new(Vec::new()),
            }
        }

        fn with_records(mut self, path: &str, n: usize) -> Self {
            let values = (0..n).map(|i| json!({ "@iot.id": i })).collect();
            self.collections.insert(path.to_string(), values);
            self
        }

        fn with_status(mut self, path: &str, status: u16) -> Self {
            self.errors.insert(path.to_string(), status);
            self
        }
    }

    impl ObservationSource for FakeSource {
        fn base_url(&self) -> &str {
            &self.base
        }

        fn fetch_page(
            &self,
            path: &str,
            _params: &[(String, String)],
            top: usize,
            skip: usize,
        ) -> Result<Page, SourceError> {
            self.requests.set(self.requests.get() + 1);
            self.seen_skips.borrow_mut().push(skip);
            let url = format!("{}/{}", self.base, path);
            if let Some(&status) = self.errors.get(path) {
                return Err(crate::ingest::http::check_status(
                    &url,
                    reqwest::StatusCode::from_u16(status).unwrap(),
                )
                .unwrap_err());
            }
            let all = self.collections.get(path).cloned().unwrap_or_default();
            let total = all.len();
            Ok(Page {
                values: all.into_iter().skip(skip).take(top).collect(),
                total: self.report_total.then_some(total),
            })
        }

        fn fetch_entity(&self, path: &str) -> Result<Value, SourceError> {
            Err(SourceError::Absent {
                url: format!("{}/{}", self.base, path),
                status: 404,
            })
        }
    }

    fn walk(source: &FakeSource, page_size: usize) -> (usize, usize) {
        let mut pages = Pages::new(source, "Things", Vec::new(), page_size);
        let count = pages.by_ref().filter(|r| r.is_ok()).count();
        (count, pages.requests())
    }

    #[test]
    fn test_pagination_yields_all_records_in_ceil_n_over_p_requests() {
        for n in 1..=25 {
            for p in 1..=7 {
                let source = FakeSource::new("a").with_records("Things", n);
                let (count, requests) = walk(&source, p);
                assert_eq!(count, n, "N={} P={}", n, p);
                assert_eq!(requests, n.div_ceil(p), "N={} P={}", n, p);
            }
        }
    }

    #[test]
    fn test_empty_collection_costs_one_request() {
        let source = FakeSource::new("a").with_records("Things", 0);
        assert_eq!(walk(&source, 10), (0, 1));
    }

    #[test]
    fn test_without_total_a_short_page_ends_the_walk() {
        let mut source = FakeSource::new("a").with_records("Things", 25);
        source.report_total = false;
        assert_eq!(walk(&source, 10), (25, 3));

        // Exact multiple: one extra request to see the empty page.
        let mut source = FakeSource::new("a").with_records("Things", 20);
        source.report_total = false;
        assert_eq!(walk(&source, 10), (20, 3));
    }

    #[test]
    fn test_skip_advances_by_page_size() {
        let source = FakeSource::new("a").with_records("Things", 7);
        let _ = walk(&source, 3);
        assert_eq!(*source.seen_skips.borrow(), vec![0, 3, 6]);
    }

    #[test]
    fn test_absent_collection_yields_empty_sequence() {
        let source = FakeSource::new("a").with_status("Things", 404);
        let mut pages = Pages::new(&source, "Things", Vec::new(), 10);
        assert!(pages.next().is_none());
        assert!(pages.source_absent());
        assert_eq!(pages.requests(), 1);
    }

    #[test]
    fn test_strict_walk_surfaces_absent() {
        let source = FakeSource::new("a").with_status("Things", 410);
        let mut pages = Pages::strict(&source, "Things", Vec::new(), 10);
        let first = pages.next().expect("strict walk should yield the error");
        assert!(first.unwrap_err().is_absent());
        assert!(pages.next().is_none());
    }

    #[test]
    fn test_other_http_errors_propagate_once() {
        let source = FakeSource::new("a").with_status("Things", 400);
        let mut pages = Pages::new(&source, "Things", Vec::new(), 10);
        assert!(matches!(
            pages.next(),
            Some(Err(SourceError::HttpStatus { status: 400, .. }))
        ));
        assert!(pages.next().is_none());
        assert!(!pages.source_absent());
    }

    #[test]
    fn test_first_answer_stops_at_first_success() {
        let chain = SourceChain::new(vec![
            FakeSource::new("a").with_status("Datastreams(1)/Observations", 404),
            FakeSource::new("b").with_records("Datastreams(1)/Observations", 3),
            FakeSource::new("c").with_records("Datastreams(1)/Observations", 5),
        ]);
        let since = Utc::now();
        match chain.first_answer(|s| s.fetch_observations(1, since)) {
            Fallback::Found { base, value, misses } => {
                assert_eq!(base, "b");
                assert_eq!(value.len(), 3);
                assert_eq!(misses, vec![SourceMiss { base: "a".into(), error: None }]);
            }
            Fallback::Exhausted { .. } => panic!("base b should have answered"),
        }
        assert_eq!(chain.sources()[2].requests.get(), 0, "c must not be queried");
    }

    #[test]
    fn test_first_answer_accepts_empty_success() {
        let chain = SourceChain::new(vec![
            FakeSource::new("a").with_records("Datastreams(1)/Observations", 0),
            FakeSource::new("b").with_records("Datastreams(1)/Observations", 4),
        ]);
        match chain.first_answer(|s| s.fetch_observations(1, Utc::now())) {
            Fallback::Found { base, value, .. } => {
                assert_eq!(base, "a");
                assert!(value.is_empty());
            }
            Fallback::Exhausted { .. } => panic!("empty 200 is an answer"),
        }
    }

    #[test]
    fn test_first_answer_exhausted_reports_every_base() {
        let chain = SourceChain::new(vec![
            FakeSource::new("a").with_status("Datastreams(1)/Observations", 404),
            FakeSource::new("b").with_status("Datastreams(1)/Observations", 400),
        ]);
        match chain.first_answer(|s| s.fetch_observations(1, Utc::now())) {
            Fallback::Exhausted { misses } => {
                assert_eq!(misses.len(), 2);
                assert!(misses[0].error.is_none());
                assert!(misses[1].error.as_deref().unwrap().contains("400"));
            }
            Fallback::Found { .. } => panic!("no base should have answered"),
        }
    }

    #[test]
    fn test_window_params_use_utc_zulu_time() {
        use chrono::TimeZone;
        let since = Utc.with_ymd_and_hms(2025, 6, 1, 2, 50, 0).unwrap();
        let params = observation_window_params(since);
        assert_eq!(params[0].1, "phenomenonTime ge 2025-06-01T02:50:00Z");
        assert_eq!(params[1].1, "phenomenonTime asc");
    }
}
