//! HTTP/1.1 response builder and freshness model.
//!
//! Provides a fluent builder API for constructing HTTP responses, serializing
//! them for transmission over TCP, and the expiration arithmetic of RFC 9111
//! §4.2 (age, freshness lifetime, TTL) that the cache gateway relies on.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use bytes::{BufMut, Bytes, BytesMut};

use super::{CacheControl, Headers, Request, StatusCode};

/// Headers that must not accompany a `304 Not Modified` (RFC 9110 §15.4.5).
const NOT_MODIFIED_STRIPPED: [&str; 7] = [
    "Allow",
    "Content-Encoding",
    "Content-Language",
    "Content-Length",
    "Content-MD5",
    "Content-Type",
    "Last-Modified",
];

/// A response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Bytes held in memory.
    Full(Bytes),
    /// A blob on disk that is read when the response is materialized.
    File(PathBuf),
}

impl Body {
    /// Returns the in-memory bytes, or `None` for a file-backed body.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Full(bytes) => Some(bytes),
            Self::File(_) => None,
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::Full(Bytes::new())
    }
}

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use rttp_gateway::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::default(),
            keep_alive: true,
        }
    }

    /// Reassembles a response from stored parts.
    pub fn from_parts(status: StatusCode, headers: Headers, body: Body) -> Self {
        Self {
            status,
            headers,
            body,
            keep_alive: true,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place. Intended for middleware pipelines that receive
    /// a `Response` from downstream and need to decorate it without consuming it.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets the response body from a string.
    ///
    /// The `Content-Length` header is written automatically by [`into_bytes`](Self::into_bytes).
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Full(Bytes::from(body.into()));
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Full(body.into());
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the response headers for in-place modification.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the payload, which may still point at a stored blob.
    pub fn payload(&self) -> &Body {
        &self.body
    }

    pub fn set_payload(&mut self, body: Body) {
        self.body = body;
    }

    /// Returns the in-memory body bytes, or `None` if the body is file-backed.
    pub fn content(&self) -> Option<&Bytes> {
        self.body.as_bytes()
    }

    /// Replaces the body with in-memory bytes.
    pub fn set_content(&mut self, content: impl Into<Bytes>) {
        self.body = Body::Full(content.into());
    }

    // ── Validators and directives ────────────────────────────────────────────

    /// Returns the response's `Cache-Control` directives.
    pub fn cache_control(&self) -> CacheControl {
        CacheControl::from_headers(&self.headers)
    }

    /// Writes `cc` back as the single `Cache-Control` header, removing it when empty.
    pub fn set_cache_control(&mut self, cc: &CacheControl) {
        if cc.is_empty() {
            self.headers.remove("cache-control");
        } else {
            self.headers.set("Cache-Control", cc.to_string());
        }
    }

    pub fn etag(&self) -> Option<&str> {
        self.headers.get("etag")
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.headers.get("last-modified")
    }

    /// Returns `true` if the response carries a validator usable in a
    /// conditional request (`ETag` or `Last-Modified`).
    pub fn is_validateable(&self) -> bool {
        self.headers.contains("etag") || self.headers.contains("last-modified")
    }

    /// Returns `true` if caches must not serve this response stale without
    /// revalidating first.
    pub fn must_revalidate(&self) -> bool {
        let cc = self.cache_control();
        cc.must_revalidate() || cc.proxy_revalidate()
    }

    /// Marks the response private (or public when `private` is `false`).
    pub fn set_private(&mut self, private: bool) {
        let mut cc = self.cache_control();
        if private {
            cc.remove("public");
            cc.set("private", None::<String>);
        } else {
            cc.remove("private");
            cc.set("public", None::<String>);
        }
        self.set_cache_control(&cc);
    }

    // ── Freshness (RFC 9111 §4.2) ────────────────────────────────────────────

    /// Returns the `Date` header as a timestamp, if present and well-formed.
    pub fn date(&self) -> Option<SystemTime> {
        parse_date(self.headers.get("date")?)
    }

    /// Stamps a `Date` header when the response has none.
    pub fn ensure_date(&mut self, now: SystemTime) {
        if self.date().is_none() {
            self.headers.set("Date", httpdate::fmt_http_date(now));
        }
    }

    pub fn expires(&self) -> Option<SystemTime> {
        parse_date(self.headers.get("expires")?)
    }

    /// Returns the age in seconds: the `Age` header when present, otherwise
    /// the time elapsed since `Date` (never negative).
    pub fn age(&self, now: SystemTime) -> i64 {
        if let Some(age) = self
            .headers
            .get("age")
            .and_then(|v| v.trim().parse::<i64>().ok())
        {
            return age.max(0);
        }
        self.date()
            .map(|date| seconds_between(now, date).max(0))
            .unwrap_or(0)
    }

    /// Returns the freshness lifetime in seconds: `s-maxage`, then `max-age`,
    /// then `Expires − Date`.
    pub fn max_age(&self) -> Option<i64> {
        let cc = self.cache_control();
        if let Some(age) = cc.shared_max_age() {
            return Some(age);
        }
        if let Some(age) = cc.max_age() {
            return Some(age);
        }
        let expires = self.expires()?;
        Some(seconds_between(expires, self.date()?))
    }

    /// Returns the remaining freshness in seconds, or `None` when the response
    /// carries no freshness information at all.
    pub fn ttl(&self, now: SystemTime) -> Option<i64> {
        Some(self.max_age()?.saturating_sub(self.age(now)))
    }

    /// A response is fresh while its TTL is strictly positive.
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        self.ttl(now).is_some_and(|ttl| ttl > 0)
    }

    /// Returns `true` if a shared cache may store this response.
    pub fn is_cacheable(&self, now: SystemTime) -> bool {
        if !self.status.is_cacheable() {
            return false;
        }
        let cc = self.cache_control();
        if cc.is_no_store() || cc.is_private() {
            return false;
        }
        self.is_validateable() || self.is_fresh(now)
    }

    /// Makes a fresh response stale by setting `Age` to its freshness lifetime.
    /// Stale responses are left untouched.
    pub fn expire(&mut self, now: SystemTime) {
        if self.is_fresh(now) {
            if let Some(max_age) = self.max_age() {
                self.headers.set("Age", max_age.to_string());
            }
        }
    }

    /// Sets the shared-cache TTL (`s-maxage`) to `seconds` from now.
    pub fn set_ttl(&mut self, seconds: i64, now: SystemTime) {
        let lifetime = self.age(now).saturating_add(seconds);
        let mut cc = self.cache_control();
        cc.set("s-maxage", Some(lifetime.to_string()));
        self.set_cache_control(&cc);
    }

    /// Sets the client TTL (`max-age`) to `seconds` from now.
    pub fn set_client_ttl(&mut self, seconds: i64, now: SystemTime) {
        let lifetime = self.age(now).saturating_add(seconds);
        let mut cc = self.cache_control();
        cc.set("max-age", Some(lifetime.to_string()));
        self.set_cache_control(&cc);
    }

    // ── Conditional requests ─────────────────────────────────────────────────

    /// Turns the response into a bodiless `304 Not Modified`.
    pub fn set_not_modified(&mut self) {
        self.status = StatusCode::NotModified;
        self.body = Body::default();
        for name in NOT_MODIFIED_STRIPPED {
            self.headers.remove(name);
        }
    }

    /// Checks the request's `If-None-Match` / `If-Modified-Since` against this
    /// response and downgrades it to 304 when they match.
    ///
    /// Returns `true` if the response was downgraded.
    pub fn is_not_modified(&mut self, request: &Request) -> bool {
        let if_modified_since = request.headers().get("if-modified-since");
        let etags = request.etags();

        let not_modified = if !etags.is_empty() {
            let tag_matches = etags
                .iter()
                .any(|tag| tag == "*" || Some(tag.as_str()) == self.etag());
            tag_matches && if_modified_since.is_none_or(|since| Some(since) == self.last_modified())
        } else if let Some(since) = if_modified_since {
            Some(since) == self.last_modified()
        } else {
            false
        };

        if not_modified {
            self.set_not_modified();
        }
        not_modified
    }

    // ── Wire format ──────────────────────────────────────────────────────────

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Automatically adds:
    /// - `Content-Type: text/plain; charset=utf-8` if the body is non-empty and no
    ///   `Content-Type` header was set.
    /// - `Content-Length: <n>` (always written, replacing any stored value).
    /// - `Connection: keep-alive` or `Connection: close`.
    ///
    /// A file-backed body must be materialized first; it serializes as empty.
    pub fn into_bytes(mut self) -> BytesMut {
        let body = match self.body {
            Body::Full(bytes) => bytes,
            Body::File(_) => Bytes::new(),
        };
        let content_length = body.len();

        if !body.is_empty() && !self.headers.contains("content-type") {
            self.headers
                .insert("Content-Type", "text/plain; charset=utf-8");
        }

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("Connection", connection);

        let estimated_size = 128 + self.headers.len() * 64 + content_length;
        let mut buf = BytesMut::with_capacity(estimated_size);

        // Status line
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        // Headers
        for (name, value) in self.headers.iter() {
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        // Content-Length is always the last header before the blank line
        buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());

        // Header/body separator
        buf.put(&b"\r\n"[..]);

        // Body
        if !body.is_empty() {
            buf.put(body);
        }

        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

fn parse_date(value: &str) -> Option<SystemTime> {
    httpdate::parse_http_date(value.trim()).ok()
}

// Signed whole seconds from `earlier` to `later`.
fn seconds_between(later: SystemTime, earlier: SystemTime) -> i64 {
    match later.duration_since(earlier) {
        Ok(elapsed) => secs(elapsed),
        Err(err) => -secs(err.duration()),
    }
}

fn secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}
