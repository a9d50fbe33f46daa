//! The application behind the gateway.
//!
//! Anything that turns a [`Request`] into a [`Response`] asynchronously can sit
//! behind [`HttpCache`](super::HttpCache): a plain async closure for in-process
//! applications and tests, or [`UpstreamOrigin`] to proxy a remote HTTP/1.1
//! server.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::http::{Body, Headers, Method, Request, Response, StatusCode};

/// Failures talking to the origin. The gateway answers them with a 502.
#[derive(Debug, Error)]
pub enum OriginError {
    #[error("failed to connect to upstream {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("upstream I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("upstream {addr} did not answer within {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("malformed upstream response: {0}")]
    Parse(#[from] httparse::Error),

    #[error("invalid chunked encoding in upstream response")]
    InvalidChunk,

    #[error("upstream closed the connection before the response was complete")]
    Incomplete,

    #[error("upstream answered with unsupported status {0}")]
    UnknownStatus(u16),

    #[error("upstream response body exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// Boxed future returned by [`Origin::call`].
pub type OriginFuture = Pin<Box<dyn Future<Output = Result<Response, OriginError>> + Send>>;

/// The backend the gateway forwards to.
///
/// Any `Fn(Request) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait through the blanket impl
/// below, so an async closure can be handed straight to
/// [`HttpCache::new`](super::HttpCache::new).
pub trait Origin: Send + Sync + 'static {
    /// Sends `request` to the origin, boxing the returned future.
    fn call(&self, request: Request) -> OriginFuture;
}

impl<T, F> Origin for T
where
    T: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, request: Request) -> OriginFuture {
        let response = (self)(request);
        Box::pin(async move { Ok(response.await) })
    }
}

/// Maximum number of headers accepted in an upstream response.
const MAX_HEADERS: usize = 64;

/// Initial read buffer capacity per upstream exchange.
const INITIAL_BUF_SIZE: usize = 8192;

/// Default cap on a buffered upstream body (64 MiB).
const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

// Connection-level headers that describe the upstream hop only.
const HOP_BY_HOP: [&str; 3] = ["connection", "keep-alive", "transfer-encoding"];

/// Forwards requests to a fixed HTTP/1.1 upstream, one connection per request.
///
/// Bodies framed by `Content-Length`, `Transfer-Encoding: chunked` or
/// connection close are all supported; chunked bodies are decoded before the
/// response is handed to the gateway.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use rttp_gateway::cache::{CacheOptions, HttpCache, Store, UpstreamOrigin};
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let origin = UpstreamOrigin::new("127.0.0.1:3000").timeout(Duration::from_secs(10));
/// let store = Store::open("/var/cache/rttp").await?;
/// let cache = HttpCache::new(origin, store, CacheOptions::default());
/// # let _ = cache;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct UpstreamOrigin {
    addr: String,
    timeout: Duration,
    max_body_size: usize,
}

impl UpstreamOrigin {
    /// Creates a client for `addr` (`host:port`) with a 30 second timeout.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Duration::from_secs(30),
            max_body_size: MAX_BODY_SIZE,
        }
    }

    /// Sets the upper bound on one complete exchange with the upstream.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the largest body the client buffers before giving up with
    /// [`OriginError::TooLarge`].
    #[must_use]
    pub fn max_body_size(mut self, limit: usize) -> Self {
        self.max_body_size = limit;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Origin for UpstreamOrigin {
    fn call(&self, request: Request) -> OriginFuture {
        let addr = self.addr.clone();
        let timeout = self.timeout;
        let limit = self.max_body_size;
        Box::pin(async move {
            match tokio::time::timeout(timeout, exchange(&addr, request, limit)).await {
                Ok(result) => result,
                Err(_) => Err(OriginError::Timeout { addr, timeout }),
            }
        })
    }
}

async fn exchange(addr: &str, mut request: Request, limit: usize) -> Result<Response, OriginError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|source| OriginError::Connect {
            addr: addr.to_owned(),
            source,
        })?;

    request.headers_mut().set("Connection", "close");
    debug!(upstream = %addr, method = %request.method(), target = %request.target(), "forwarding to upstream");
    stream.write_all(&request.to_bytes()).await?;
    stream.flush().await?;

    let bodiless_request = *request.method() == Method::Head;
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    let head = loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(OriginError::Incomplete);
        }
        if let Some(head) = parse_head(&buf)? {
            break head;
        }
    };

    let _ = buf.split_to(head.offset);
    let has_body = !bodiless_request && !matches!(head.code, 100..=199 | 204 | 304);
    let chunked = head
        .headers
        .get_all("transfer-encoding")
        .any(|v| v.to_ascii_lowercase().contains("chunked"));
    let content_length = head
        .headers
        .get("content-length")
        .and_then(|v| v.trim().parse::<usize>().ok());
    if has_body && content_length.is_some_and(|length| length > limit) {
        return Err(OriginError::TooLarge { limit });
    }

    let body = if !has_body {
        Bytes::new()
    } else if chunked {
        loop {
            if let Some(body) = decode_chunked(&buf)? {
                break body;
            }
            if read_body(&mut stream, &mut buf, limit).await? == 0 {
                return Err(OriginError::Incomplete);
            }
        }
    } else if let Some(length) = content_length {
        while buf.len() < length {
            if read_body(&mut stream, &mut buf, limit).await? == 0 {
                return Err(OriginError::Incomplete);
            }
        }
        buf.split_to(length).freeze()
    } else {
        while read_body(&mut stream, &mut buf, limit).await? != 0 {}
        buf.split().freeze()
    };

    let status = StatusCode::from_u16(head.code).ok_or(OriginError::UnknownStatus(head.code))?;
    let mut headers = head.headers;
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    if chunked {
        headers.set("Content-Length", body.len().to_string());
    }
    debug!(upstream = %addr, status = head.code, bytes = body.len(), "upstream responded");
    Ok(Response::from_parts(status, headers, Body::Full(body)))
}

// Reads more body bytes, failing once the buffer outgrows `limit`.
async fn read_body(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    limit: usize,
) -> Result<usize, OriginError> {
    let read = stream.read_buf(buf).await?;
    if buf.len() > limit {
        return Err(OriginError::TooLarge { limit });
    }
    Ok(read)
}

struct Head {
    code: u16,
    headers: Headers,
    offset: usize,
}

fn parse_head(buf: &[u8]) -> Result<Option<Head>, OriginError> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut raw = httparse::Response::new(&mut raw_headers);
    let offset = match raw.parse(buf)? {
        httparse::Status::Complete(offset) => offset,
        httparse::Status::Partial => return Ok(None),
    };
    let code = raw.code.ok_or(OriginError::Incomplete)?;

    let mut headers = Headers::with_capacity(raw.headers.len());
    for header in raw.headers.iter() {
        if let Ok(value) = std::str::from_utf8(header.value) {
            headers.insert(header.name, value);
        }
    }
    Ok(Some(Head {
        code,
        headers,
        offset,
    }))
}

// Returns `None` until the terminating zero-size chunk has arrived.
fn decode_chunked(mut buf: &[u8]) -> Result<Option<Bytes>, OriginError> {
    let mut body = BytesMut::new();
    loop {
        let (offset, size) = match httparse::parse_chunk_size(buf) {
            Ok(httparse::Status::Complete(pair)) => pair,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(_) => return Err(OriginError::InvalidChunk),
        };
        let size = usize::try_from(size).map_err(|_| OriginError::InvalidChunk)?;
        buf = &buf[offset..];
        if size == 0 {
            // Trailers are not forwarded.
            return Ok(Some(body.freeze()));
        }
        let framed = size.checked_add(2).ok_or(OriginError::InvalidChunk)?;
        if buf.len() < framed {
            return Ok(None);
        }
        body.extend_from_slice(&buf[..size]);
        buf = &buf[framed..];
    }
}
