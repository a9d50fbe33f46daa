//! The caching gateway: decides, per request, whether to answer from the
//! store, revalidate with the origin, or forward.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::{Duration, Instant, SystemTime};

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, warn};

use super::error::{CacheError, StoreError};
use super::esi::{self, BODY_EVAL, Esi, Inclusion, Segment};
use super::options::CacheOptions;
use super::origin::Origin;
use super::store::{CONTENT_DIGEST, Lock, Store};
use super::trace::Trace;
use crate::http::{Body, Method, Request, Response, StatusCode};

/// Response header carrying the rendered [`Trace`] when `debug` is on.
pub const TRACE_HEADER: &str = "X-Rttp-Cache";

/// Headers of a 304 that replace those of the entry it validates.
const VALIDATION_HEADERS: [&str; 5] = ["Date", "Expires", "Cache-Control", "ETag", "Last-Modified"];

/// Step by which the lock-wait sleep grows on every poll.
const LOCK_POLL_STEP: Duration = Duration::from_millis(50);

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// State shared by one top-level request and every sub-request it causes.
struct Scope {
    trace: Trace,
    host: Option<String>,
    scheme: String,
    cookies: Vec<String>,
}

impl Scope {
    fn new(master: &Request) -> Self {
        Self {
            trace: Trace::new(),
            host: master.host().map(str::to_owned),
            scheme: master.scheme().to_owned(),
            cookies: master.headers().get_all("cookie").map(str::to_owned).collect(),
        }
    }

    fn record(&mut self, request: &Request, event: &'static str) {
        debug!(request = %Trace::key(request), event, "cache event");
        self.trace.record(request, event);
    }
}

// Outcome of checking a stored entry against the request.
enum Freshness {
    Fresh,
    /// Another request revalidated the entry while this one waited.
    Refreshed(Response),
    /// The wait for another request's revalidation timed out.
    Unavailable(Response),
    Stale { locked: bool },
}

/// An HTTP caching gateway in front of an [`Origin`].
///
/// Safe requests (`GET`, `HEAD`) are answered from the [`Store`] while fresh,
/// revalidated with a conditional request once stale, and fetched on a miss.
/// Every other method is forwarded and, on success, expires what is stored
/// for its URI. With an [`Esi`] processor attached, bodies that ask for it are
/// assembled from separately cached fragments.
///
/// # Examples
///
/// ```rust,no_run
/// use rttp_gateway::cache::{CacheOptions, HttpCache, Store};
/// use rttp_gateway::http::{Method, Request, Response, StatusCode};
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let store = Store::open("/tmp/rttp-cache").await?;
/// let cache = HttpCache::new(
///     |_req: Request| async {
///         Response::new(StatusCode::Ok)
///             .header("Cache-Control", "public, max-age=60")
///             .body("hello")
///     },
///     store,
///     CacheOptions::default(),
/// );
///
/// let response = cache.handle(Request::new(Method::Get, "/")?).await?;
/// assert_eq!(response.status(), StatusCode::Ok);
/// # Ok(())
/// # }
/// ```
pub struct HttpCache<O> {
    origin: O,
    store: Store,
    esi: Option<Esi>,
    options: CacheOptions,
}

impl<O: Origin> HttpCache<O> {
    pub fn new(origin: O, store: Store, options: CacheOptions) -> Self {
        Self {
            origin,
            store,
            esi: None,
            options,
        }
    }

    /// Enables ESI processing of origin responses.
    #[must_use]
    pub fn with_esi(mut self, esi: Esi) -> Self {
        self.esi = Some(esi);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn esi(&self) -> Option<&Esi> {
        self.esi.as_ref()
    }

    /// Handles a top-level request.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheError`] when a fragment inclusion fails without
    /// `onerror="continue"`, or, with `debug` on, when the store cannot be read.
    pub async fn handle(&self, request: Request) -> Result<Response, CacheError> {
        self.handle_traced(request).await.map(|(response, _)| response)
    }

    /// Like [`handle`](Self::handle), also returning the decisions taken.
    ///
    /// # Errors
    ///
    /// See [`handle`](Self::handle).
    pub async fn handle_traced(&self, request: Request) -> Result<(Response, Trace), CacheError> {
        let mut scope = Scope::new(&request);
        let mut response = self.dispatch(request, &mut scope, 0).await?;
        if self.options.debug {
            response
                .headers_mut()
                .set(TRACE_HEADER, scope.trace.to_string());
        }
        debug!(trace = %scope.trace, status = response.status().as_u16(), "request handled");
        Ok((response, scope.trace))
    }

    /// Handles a request, rendering failures as a 500 so the gateway can be
    /// handed straight to [`Server::run`](crate::server::Server::run).
    pub async fn respond(&self, request: Request) -> Response {
        let method = request.method().clone();
        let path = request.path().to_owned();
        match self.handle(request).await {
            Ok(response) => response,
            Err(err) => {
                error!(method = %method, path = %path, error = %err, "cache gateway failed");
                Response::new(StatusCode::InternalServerError).body("500 Internal Server Error")
            }
        }
    }

    // ── Request classification ───────────────────────────────────────────────

    fn dispatch<'a>(
        &'a self,
        request: Request,
        scope: &'a mut Scope,
        depth: usize,
    ) -> BoxFuture<'a, Result<Response, CacheError>> {
        Box::pin(async move {
            scope.trace.begin(&request);

            let mut response = if !request.method().is_cache_lookup() {
                self.invalidate(&request, scope).await?
            } else if request.headers().contains("expect") {
                self.pass(&request, scope).await?
            } else {
                self.lookup(&request, scope).await?
            };

            response.is_not_modified(&request);

            if *request.method() == Method::Head {
                response.headers_mut().remove(CONTENT_DIGEST);
                response.headers_mut().remove(BODY_EVAL);
                response.set_payload(Body::default());
            } else {
                self.materialize(&mut response, scope, depth).await?;
            }
            Ok(response)
        })
    }

    async fn pass(&self, request: &Request, scope: &mut Scope) -> Result<Response, CacheError> {
        scope.record(request, "pass");
        self.forward(request.clone(), request, None, scope).await
    }

    async fn invalidate(&self, request: &Request, scope: &mut Scope) -> Result<Response, CacheError> {
        let response = self.pass(request, scope).await?;
        if !(response.status().is_success() || response.status().is_redirection()) {
            return Ok(response);
        }

        let now = SystemTime::now();
        let mut result = self.store.invalidate(request, now).await.map(drop);
        for target in redirect_targets(request, &response) {
            if result.is_err() {
                break;
            }
            result = self.store.invalidate(&target, now).await.map(drop);
        }

        match result {
            Ok(()) => scope.record(request, "invalidate"),
            Err(err) => {
                scope.record(request, "invalidate-failed");
                if self.options.debug {
                    return Err(err.into());
                }
                warn!(path = %request.path(), error = %err, "failed to invalidate stored entries");
            }
        }
        Ok(response)
    }

    // ── Lookup and freshness ─────────────────────────────────────────────────

    async fn lookup(&self, request: &Request, scope: &mut Scope) -> Result<Response, CacheError> {
        if self.options.allow_reload && request.is_no_cache() {
            scope.record(request, "reload");
            return self.fetch(request, scope).await;
        }

        let entry = match self.store.lookup(request).await {
            Ok(entry) => entry,
            Err(err) => {
                scope.record(request, "lookup-failed");
                if self.options.debug {
                    return Err(err.into());
                }
                warn!(path = %request.path(), error = %err, "cache lookup failed, passing through");
                return self.pass(request, scope).await;
            }
        };

        let Some(entry) = entry else {
            scope.record(request, "miss");
            return self.fetch(request, scope).await;
        };

        match self.freshness(request, &entry, scope).await {
            Freshness::Fresh => Ok(self.serve_fresh(request, entry, scope)),
            Freshness::Refreshed(current) => Ok(self.serve_fresh(request, current, scope)),
            Freshness::Unavailable(response) => Ok(response),
            Freshness::Stale { locked } => {
                scope.record(request, "stale");
                self.validate(request, entry, locked, scope).await
            }
        }
    }

    fn serve_fresh(&self, request: &Request, mut entry: Response, scope: &mut Scope) -> Response {
        scope.record(request, "fresh");
        let age = entry.age(SystemTime::now());
        entry.headers_mut().set("Age", age.to_string());
        entry
    }

    async fn freshness(&self, request: &Request, entry: &Response, scope: &mut Scope) -> Freshness {
        let now = SystemTime::now();
        if !entry.is_fresh(now) {
            return self.lock(request, entry, scope).await;
        }

        if self.options.allow_revalidate {
            if let Some(max_age) = request.cache_control().max_age() {
                if max_age <= 0 || max_age < entry.age(now) {
                    return Freshness::Stale { locked: false };
                }
            }
        }
        Freshness::Fresh
    }

    // Decides what a request holding a stale entry does: revalidate itself,
    // serve stale while someone else revalidates, or wait for them.
    async fn lock(&self, request: &Request, entry: &Response, scope: &mut Scope) -> Freshness {
        let marker = match self.store.lock(request).await {
            Ok(Lock::Acquired) => return Freshness::Stale { locked: true },
            Ok(Lock::Pending(marker)) => marker,
            Err(err) => {
                warn!(path = %request.path(), error = %err, "could not take revalidation lock");
                return Freshness::Stale { locked: false };
            }
        };

        let grace = entry
            .cache_control()
            .stale_while_revalidate()
            .unwrap_or(self.options.stale_while_revalidate);
        let ttl = entry.ttl(SystemTime::now()).unwrap_or(0);
        if ttl.saturating_abs() < grace {
            scope.record(request, "stale-while-revalidate");
            return Freshness::Fresh;
        }

        let (released, waited) = self.wait_for_release(&marker).await;
        if released && waited < self.options.lock_refresh() {
            match self.store.lookup(request).await {
                Ok(Some(current)) => return Freshness::Refreshed(current),
                Ok(None) => return Freshness::Stale { locked: false },
                Err(err) => {
                    warn!(path = %request.path(), error = %err, "lookup after lock release failed");
                    return Freshness::Stale { locked: false };
                }
            }
        }

        scope.record(request, "lock-timeout");
        warn!(
            path = %request.path(),
            waited_ms = waited.as_millis() as u64,
            "gave up waiting for revalidation"
        );
        Freshness::Unavailable(
            Response::new(StatusCode::ServiceUnavailable)
                .header("Retry-After", self.options.retry_after.to_string())
                .body("503 Service Unavailable"),
        )
    }

    // Polls with linearly growing sleeps until the marker disappears or the
    // lock timeout is reached.
    async fn wait_for_release(&self, marker: &Path) -> (bool, Duration) {
        let timeout = self.options.lock_timeout();
        let started = Instant::now();
        let mut step = Duration::ZERO;
        loop {
            if !tokio::fs::try_exists(marker).await.unwrap_or(false) {
                return (true, started.elapsed());
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return (false, elapsed);
            }
            step += LOCK_POLL_STEP;
            tokio::time::sleep(step.min(timeout - elapsed)).await;
        }
    }

    // ── Origin round trips ───────────────────────────────────────────────────

    async fn validate(
        &self,
        request: &Request,
        entry: Response,
        locked: bool,
        scope: &mut Scope,
    ) -> Result<Response, CacheError> {
        let result = self.revalidate(request, entry, scope).await;
        if locked {
            if let Err(err) = self.store.unlock(request).await {
                warn!(path = %request.path(), error = %err, "failed to release revalidation lock");
            }
        }
        result
    }

    async fn revalidate(
        &self,
        request: &Request,
        entry: Response,
        scope: &mut Scope,
    ) -> Result<Response, CacheError> {
        let mut sub = request.clone();
        sub.set_method(Method::Get);

        match entry.last_modified() {
            Some(stamp) => sub.headers_mut().set("If-Modified-Since", stamp),
            None => {
                sub.headers_mut().remove("if-modified-since");
            }
        }

        let cached_etags: Vec<String> = entry.etag().map(str::to_owned).into_iter().collect();
        let request_etags = request.etags();
        let mut etags = cached_etags.clone();
        for tag in &request_etags {
            if !etags.contains(tag) {
                etags.push(tag.clone());
            }
        }
        if etags.is_empty() {
            sub.headers_mut().remove("if-none-match");
        } else {
            sub.headers_mut().set("If-None-Match", etags.join(", "));
        }

        let mut response = self.forward(sub, request, Some(&entry), scope).await?;

        if response.status() == StatusCode::NotModified {
            scope.record(request, "valid");

            // The client holds a representation this cache does not.
            let clients_own = response.etag().is_some_and(|tag| {
                request_etags.iter().any(|t| t == tag) && !cached_etags.iter().any(|t| t == tag)
            });
            if clients_own {
                return Ok(response);
            }

            let mut merged = entry;
            merged.headers_mut().remove("date");
            merged.headers_mut().remove("age");
            for name in VALIDATION_HEADERS {
                if let Some(value) = response.headers().get_joined(name) {
                    merged.headers_mut().set(name, value);
                }
            }
            response = merged;
        } else {
            scope.record(request, "invalid");
        }

        if response.is_cacheable(SystemTime::now()) {
            self.store_response(request, &mut response, scope).await;
        }
        Ok(response)
    }

    async fn fetch(&self, request: &Request, scope: &mut Scope) -> Result<Response, CacheError> {
        let mut sub = request.clone();
        sub.set_method(Method::Get);
        sub.headers_mut().remove("if-modified-since");
        sub.headers_mut().remove("if-none-match");

        let mut response = self.forward(sub, request, None, scope).await?;
        let now = SystemTime::now();

        let cc = response.cache_control();
        if self.is_private_request(request) && !cc.is_public() {
            response.set_private(true);
        } else if self.options.default_ttl > 0 && response.ttl(now).is_none() && !cc.must_revalidate() {
            response.set_ttl(self.options.default_ttl, now);
        }

        if response.is_cacheable(now) {
            self.store_response(request, &mut response, scope).await;
        }
        Ok(response)
    }

    // Sends one request to the origin. `caller` is the request the events are
    // recorded against; `entry` is the stale entry that may stand in for an
    // origin failure.
    async fn forward(
        &self,
        mut sub: Request,
        caller: &Request,
        entry: Option<&Response>,
        scope: &mut Scope,
    ) -> Result<Response, CacheError> {
        if let Some(esi) = &self.esi {
            esi.add_surrogate_capability(&mut sub);
        }

        let mut response = match self.origin.call(sub).await {
            Ok(response) => response,
            Err(err) => {
                warn!(path = %caller.path(), error = %err, "origin request failed");
                Response::new(StatusCode::BadGateway).body("502 Bad Gateway")
            }
        };
        // Only the gateway may set its internal headers.
        response.headers_mut().remove(CONTENT_DIGEST);
        response.headers_mut().remove(BODY_EVAL);
        let now = SystemTime::now();
        response.ensure_date(now);

        if let Some(entry) = entry {
            if response.status().is_origin_failure() {
                let grace = entry
                    .cache_control()
                    .stale_if_error()
                    .unwrap_or(self.options.stale_if_error);
                if entry.ttl(now).unwrap_or(0).saturating_abs() < grace {
                    scope.record(caller, "stale-if-error");
                    return Ok(entry.clone());
                }
            }
        }

        if let Some(esi) = &self.esi {
            if esi.needs_processing(&response) {
                esi.process(&mut response)?;
            }
        }
        Ok(response)
    }

    async fn store_response(&self, request: &Request, response: &mut Response, scope: &mut Scope) {
        match self.store.write(request, response).await {
            Ok(key) => {
                scope.record(request, "store");
                debug!(path = %request.path(), key = %key, "stored response");
                let age = response.age(SystemTime::now());
                response.headers_mut().set("Age", age.to_string());
            }
            Err(err) => {
                scope.record(request, "store-failed");
                warn!(path = %request.path(), error = %err, "failed to store response");
            }
        }
    }

    fn is_private_request(&self, request: &Request) -> bool {
        self.options.private_headers.iter().any(|name| {
            if name.eq_ignore_ascii_case("cookie") {
                !request.cookies().is_empty()
            } else {
                request.headers().contains(name)
            }
        })
    }

    // ── Body materialization ─────────────────────────────────────────────────

    // Loads a stored body, expands deferred inclusions and removes the
    // internal headers before the response leaves the gateway.
    async fn materialize(
        &self,
        response: &mut Response,
        scope: &mut Scope,
        depth: usize,
    ) -> Result<(), CacheError> {
        response.headers_mut().remove(CONTENT_DIGEST);
        let evaluate = response.headers_mut().remove(BODY_EVAL);
        if response.status() == StatusCode::NotModified {
            return Ok(());
        }

        let content = match response.payload() {
            Body::File(path) => tokio::fs::read(path)
                .await
                .map(Bytes::from)
                .map_err(|e| StoreError::io(path, e))?,
            Body::Full(bytes) if evaluate => bytes.clone(),
            Body::Full(_) => return Ok(()),
        };

        let content = if evaluate {
            self.expand(content, scope, depth).await?
        } else {
            content
        };

        if !response.headers().contains("transfer-encoding") {
            response
                .headers_mut()
                .set("Content-Length", content.len().to_string());
        }
        response.set_content(content);
        Ok(())
    }

    async fn expand(
        &self,
        content: Bytes,
        scope: &mut Scope,
        depth: usize,
    ) -> Result<Bytes, CacheError> {
        let Ok(text) = std::str::from_utf8(&content) else {
            return Ok(content);
        };

        let mut out = BytesMut::with_capacity(content.len());
        for segment in esi::segments(text) {
            match segment {
                Segment::Text(text) => out.extend_from_slice(text.as_bytes()),
                Segment::Include(inclusion) => {
                    let fragment = self.include(&inclusion, scope, depth).await?;
                    out.extend_from_slice(&fragment);
                }
            }
        }
        Ok(out.freeze())
    }

    async fn include(
        &self,
        inclusion: &Inclusion,
        scope: &mut Scope,
        depth: usize,
    ) -> Result<Bytes, CacheError> {
        let mut failure = match self.fragment(&inclusion.src, scope, depth).await {
            Ok(body) => return Ok(body),
            Err(err) => err,
        };

        if let Some(alt) = &inclusion.alt {
            match self.fragment(alt, scope, depth).await {
                Ok(body) => return Ok(body),
                Err(err) => failure = err,
            }
        }

        if inclusion.ignore_errors {
            debug!(src = %inclusion.src, error = %failure, "ignoring failed inclusion");
            return Ok(Bytes::new());
        }
        Err(failure)
    }

    // Renders one fragment through the gateway as a GET sub-request that
    // carries the top-level request's host and cookies.
    async fn fragment(&self, uri: &str, scope: &mut Scope, depth: usize) -> Result<Bytes, CacheError> {
        if depth >= self.options.max_depth {
            return Err(CacheError::DepthExceeded {
                uri: uri.to_owned(),
                max: self.options.max_depth,
            });
        }

        let mut sub = Request::new(Method::Get, uri).map_err(|e| CacheError::Inclusion {
            uri: uri.to_owned(),
            reason: e.to_string(),
        })?;
        if sub.host().is_none() {
            sub.set_scheme(scope.scheme.clone());
            if let Some(host) = &scope.host {
                sub.headers_mut().set("Host", host.clone());
            }
        }
        for cookie in &scope.cookies {
            sub.headers_mut().insert("Cookie", cookie.clone());
        }

        let response = self.dispatch(sub, scope, depth + 1).await?;
        if response.status() != StatusCode::Ok {
            return Err(CacheError::Inclusion {
                uri: uri.to_owned(),
                reason: format!("status code is {}", response.status().as_u16()),
            });
        }
        Ok(response.content().cloned().unwrap_or_default())
    }
}

// Same-authority `Location` / `Content-Location` targets of a response.
fn redirect_targets(request: &Request, response: &Response) -> Vec<Request> {
    let Ok(base) = url::Url::parse(&request.uri()) else {
        return Vec::new();
    };
    ["location", "content-location"]
        .into_iter()
        .filter_map(|name| response.headers().get(name))
        .filter_map(|value| base.join(value).ok())
        .filter(|target| {
            target.scheme() == base.scheme()
                && target.host_str() == base.host_str()
                && target.port_or_known_default() == base.port_or_known_default()
        })
        .filter_map(|target| {
            let mut target_request = Request::new(Method::Get, target.as_str()).ok()?;
            if let Some(host) = request.host() {
                target_request.headers_mut().set("Host", host);
            }
            Some(target_request)
        })
        .collect()
}
