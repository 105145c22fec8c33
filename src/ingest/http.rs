//! Blocking HTTP client for SensorThings endpoints.
//!
//! Every page and entity request in the crate goes through
//! [`HttpClient::get_json`], which applies the retry policy to that single
//! request:
//! - transport errors, 5xx and 429 are retried with exponential backoff
//! - 404 / 410 map to [`SourceError::Absent`] and are returned immediately
//! - other 4xx and unparseable bodies fail without retrying

use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use tracing::{debug, warn};

use crate::model::SourceError;

// ============================================================================
// Retry policy
// ============================================================================

/// Exponential backoff applied per request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt (doubles each retry).
    pub initial_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.initial_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    pub fn run<T>(
        &self,
        mut op: impl FnMut() -> Result<T, SourceError>,
    ) -> Result<T, SourceError> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        url = %e.url(),
                        error = %e,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "request failed, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Settings for building an [`HttpClient`].
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            retry: RetryPolicy::default(),
        }
    }
}

/// Thin wrapper over `reqwest::blocking::Client` with retry.
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    retry: RetryPolicy,
}

impl HttpClient {
    pub fn new(settings: &HttpSettings) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(settings.timeout.min(Duration::from_secs(10)))
            .build()
            .map_err(|source| SourceError::Request {
                url: String::from("<client builder>"),
                source,
            })?;

        Ok(Self {
            client,
            retry: settings.retry.clone(),
        })
    }

    /// GET `url` with the given query parameters and decode the JSON body.
    pub fn get_json(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<serde_json::Value, SourceError> {
        self.retry.run(|| self.get_json_once(url, params))
    }

    fn get_json_once(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<serde_json::Value, SourceError> {
        debug!(url, ?params, "GET");

        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .query(params)
            .send()
            .map_err(|source| SourceError::Request {
                url: url.to_string(),
                source,
            })?;

        check_status(url, response.status())?;

        let body = response.text().map_err(|source| SourceError::Request {
            url: url.to_string(),
            source,
        })?;

        serde_json::from_str(&body).map_err(|e| SourceError::Parse {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

/// Maps a response status to the crate's error taxonomy.
pub fn check_status(url: &str, status: StatusCode) -> Result<(), SourceError> {
    if status.is_success() {
        return Ok(());
    }
    let code = status.as_u16();
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        Err(SourceError::Absent {
            url: url.to_string(),
            status: code,
        })
    } else {
        Err(SourceError::HttpStatus {
            url: url.to_string(),
            status: code,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn instant_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn server_error() -> SourceError {
        SourceError::HttpStatus {
            url: "http://example.test/Things".into(),
            status: 502,
        }
    }

    #[test]
    fn test_backoff_doubles_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(4), Duration::from_millis(800));
        assert_eq!(policy.delay_after(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_transient_error_is_retried_until_success() {
        let calls = Cell::new(0);
        let result = instant_policy(5).run(|| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 { Err(server_error()) } else { Ok(42) }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_transient_error_gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), _> = instant_policy(4).run(|| {
            calls.set(calls.get() + 1);
            Err(server_error())
        });
        assert!(matches!(result, Err(SourceError::HttpStatus { status: 502, .. })));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn test_absent_is_never_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = instant_policy(5).run(|| {
            calls.set(calls.get() + 1);
            Err(SourceError::Absent {
                url: "http://example.test/Things".into(),
                status: 404,
            })
        });
        assert!(result.unwrap_err().is_absent());
        assert_eq!(calls.get(), 1, "404 must short-circuit without retry");
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let calls = Cell::new(0);
        let _ = instant_policy(0).run(|| {
            calls.set(calls.get() + 1);
            Ok::<_, SourceError>(())
        });
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_status_mapping() {
        assert!(check_status("u", StatusCode::OK).is_ok());
        assert!(check_status("u", StatusCode::NOT_FOUND).unwrap_err().is_absent());
        assert!(check_status("u", StatusCode::GONE).unwrap_err().is_absent());

        let err = check_status("u", StatusCode::SERVICE_UNAVAILABLE).unwrap_err();
        assert!(err.is_transient());
        let err = check_status("u", StatusCode::BAD_REQUEST).unwrap_err();
        assert!(!err.is_transient() && !err.is_absent());
    }
}
