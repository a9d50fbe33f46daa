//! Gateway configuration.

use std::time::Duration;

use serde::Deserialize;

/// Options recognized by [`HttpCache`](super::HttpCache).
///
/// Every field has a default, and unknown keys are ignored, so a partial JSON
/// object is a valid configuration:
///
/// ```
/// use rttp_gateway::cache::CacheOptions;
///
/// let options = CacheOptions::from_json(r#"{"debug": true, "default_ttl": 30, "x": 1}"#).unwrap();
/// assert!(options.debug);
/// assert_eq!(options.default_ttl, 30);
/// assert_eq!(options.stale_if_error, 60);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Adds the per-request trace as an `X-Rttp-Cache` response header and
    /// lets store failures propagate instead of failing open.
    pub debug: bool,

    /// Freshness lifetime, in seconds, given to responses that carry no
    /// explicit freshness information. `0` disables the fallback.
    pub default_ttl: i64,

    /// Request headers whose presence makes a response private unless the
    /// origin explicitly marked it public.
    pub private_headers: Vec<String>,

    /// Lets a client force a refetch with `Cache-Control: no-cache`.
    pub allow_reload: bool,

    /// Lets a client force revalidation with `Cache-Control: max-age=N`.
    pub allow_revalidate: bool,

    /// Seconds a stale entry may be served while another request revalidates
    /// it. Overridden per response by the `stale-while-revalidate` directive.
    pub stale_while_revalidate: i64,

    /// Seconds a stale entry may be served when the origin fails. Overridden
    /// per response by the `stale-if-error` directive.
    pub stale_if_error: i64,

    /// Upper bound, in milliseconds, on waiting for another request's
    /// revalidation before answering 503.
    pub lock_timeout_ms: u64,

    /// A waiter that sees the lock released within this many milliseconds
    /// re-reads the store instead of answering 503.
    pub lock_refresh_ms: u64,

    /// `Retry-After` value, in seconds, on the 503 sent after a lock timeout.
    pub retry_after: u64,

    /// Maximum nesting of inclusion sub-requests.
    pub max_depth: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            debug: false,
            default_ttl: 0,
            private_headers: vec!["Authorization".to_owned(), "Cookie".to_owned()],
            allow_reload: false,
            allow_revalidate: false,
            stale_while_revalidate: 2,
            stale_if_error: 60,
            lock_timeout_ms: 5_000,
            lock_refresh_ms: 2_000,
            retry_after: 10,
            max_depth: 8,
        }
    }
}

impl CacheOptions {
    /// Parses options from a JSON object.
    ///
    /// # Errors
    ///
    /// Returns the [`serde_json::Error`] for malformed JSON or mistyped values.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub(crate) fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub(crate) fn lock_refresh(&self) -> Duration {
        Duration::from_millis(self.lock_refresh_ms)
    }
}
