//! HTTP/1.1 request parsing using the [`httparse`] crate, plus the derived
//! views a cache needs: normalized URI, cookies, validators and directives.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{CacheControl, Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete — more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("request body exceeds maximum allowed size of {max_bytes} bytes")]
    BodyTooLarge { max_bytes: usize },

    #[error("invalid request target {target:?}: {source}")]
    InvalidTarget {
        target: String,
        #[source]
        source: url::ParseError,
    },
}

/// A fully parsed HTTP/1.1 request.
///
/// Created by [`Request::parse`] from a raw byte buffer, or by [`Request::new`]
/// for synthetic sub-requests. The body is stored as a [`Bytes`] buffer.
///
/// # Examples
///
/// ```
/// use rttp_gateway::http::request::Request;
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.query_param("name"), Some("world"));
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// assert_eq!(request.uri(), "http://localhost/hello?name=world");
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    scheme: String,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    body: Bytes,
    params: HashMap<String, String>,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Parse a raw HTTP/1.1 request from a byte slice.
    ///
    /// Returns the parsed `Request` and the byte offset at which the body begins
    /// in `buf` (i.e. immediately after the `\r\n\r\n` header terminator).
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`] — more data is needed to complete the request headers.
    /// - [`RequestError::Parse`] — the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`] — a required field (method, path, version) is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method = Method::from(
            raw_req
                .method
                .ok_or(RequestError::MissingField { field: "method" })?,
        );

        let raw_path = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;
        let (path, query) = split_target(raw_path);

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let params = query.as_deref().map(parse_query_string).unwrap_or_default();
        let body = Bytes::copy_from_slice(&buf[body_offset..]);

        Ok((
            Self {
                method,
                scheme: "http".to_owned(),
                path,
                version,
                headers: header_map,
                query,
                body,
                params,
            },
            body_offset,
        ))
    }

    /// Builds a request for `target`, which is either an origin-form path
    /// (`/a?b=c`) or an absolute URI (`https://example.com/a`).
    ///
    /// An absolute URI sets the scheme and the `Host` header.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidTarget`] if an absolute URI does not parse.
    pub fn new(method: Method, target: &str) -> Result<Self, RequestError> {
        let mut headers = Headers::new();
        let (scheme, path, query) = if target.starts_with('/') {
            let (path, query) = split_target(target);
            ("http".to_owned(), path, query)
        } else {
            let url = url::Url::parse(target).map_err(|source| RequestError::InvalidTarget {
                target: target.to_owned(),
                source,
            })?;
            if let Some(host) = url.host_str() {
                match url.port() {
                    Some(port) => headers.insert("Host", format!("{host}:{port}")),
                    None => headers.insert("Host", host),
                }
            }
            (
                url.scheme().to_owned(),
                url.path().to_owned(),
                url.query().map(str::to_owned),
            )
        };

        let params = query.as_deref().map(parse_query_string).unwrap_or_default();
        Ok(Self {
            method,
            scheme,
            path,
            version: 1,
            headers,
            query,
            body: Bytes::new(),
            params,
        })
    }

    /// Appends a header and returns the request, for building sub-requests.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Changes the HTTP method, e.g. to turn a HEAD into a GET sub-request.
    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    /// Returns the URI scheme (`http` unless built from an absolute URI).
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Overrides the URI scheme, e.g. when TLS is terminated in front of the server.
    pub fn set_scheme(&mut self, scheme: impl Into<String>) {
        self.scheme = scheme.into();
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the request headers for in-place modification.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns a parsed query parameter value by key.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1, // HTTP/1.1 default: keep-alive
        }
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.parse().ok()
    }

    /// Returns the `Host` header, if present.
    pub fn host(&self) -> Option<&str> {
        self.headers.get("host")
    }

    /// Returns the query string with its `&`-separated pairs sorted, so that
    /// `?b=2&a=1` and `?a=1&b=2` name the same resource.
    pub fn normalized_query(&self) -> Option<String> {
        let query = self.query.as_deref()?;
        let mut pairs: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
        if pairs.is_empty() {
            return None;
        }
        pairs.sort_unstable();
        Some(pairs.join("&"))
    }

    /// Returns the absolute, normalized URI: scheme, host, path and sorted query.
    pub fn uri(&self) -> String {
        let host = self.host().unwrap_or("localhost");
        match self.normalized_query() {
            Some(query) => format!("{}://{}{}?{}", self.scheme, host, self.path, query),
            None => format!("{}://{}{}", self.scheme, host, self.path),
        }
    }

    /// Returns the path plus raw query, as written on the request line.
    pub fn target(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    /// Parses every `Cookie` header into a name → value map.
    pub fn cookies(&self) -> HashMap<String, String> {
        self.headers
            .get_all("cookie")
            .flat_map(|line| line.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some((name.to_owned(), value.trim().to_owned()))
            })
            .collect()
    }

    /// Returns the request's `Cache-Control` directives.
    pub fn cache_control(&self) -> CacheControl {
        CacheControl::from_headers(&self.headers)
    }

    /// Returns `true` if the client asked to bypass stored responses
    /// (`Cache-Control: no-cache` or the HTTP/1.0 `Pragma: no-cache`).
    pub fn is_no_cache(&self) -> bool {
        self.cache_control().is_no_cache()
            || self
                .headers
                .get_all("pragma")
                .any(|v| v.trim().eq_ignore_ascii_case("no-cache"))
    }

    /// Returns the entity tags listed in `If-None-Match`, quotes preserved.
    pub fn etags(&self) -> Vec<String> {
        self.headers
            .get_all("if-none-match")
            .flat_map(|line| line.split(','))
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Serializes the request in HTTP/1.1 wire format for an upstream hop.
    ///
    /// Adds `Content-Length` when the body is non-empty and none was set.
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 64 + self.body.len());
        buf.put(format!("{} {} HTTP/1.1\r\n", self.method, self.target()).as_bytes());
        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }
        if !self.body.is_empty() && !self.headers.contains("content-length") {
            buf.put(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        buf.put(&b"\r\n"[..]);
        buf.put(self.body.as_ref());
        buf
    }
}

fn split_target(target: &str) -> (String, Option<String>) {
    match target.find('?') {
        Some(pos) => (target[..pos].to_owned(), Some(target[pos + 1..].to_owned())),
        None => (target.to_owned(), None),
    }
}

/// Parses a URL query string (`key=value&key2=value2`) into a `HashMap`.
///
/// Keys and values have `+` decoded as a space. Full percent-decoding is
/// intentionally omitted here.
fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.replace('+', " ");
            let value = parts.next().unwrap_or("").replace('+', " ");
            Some((key, value))
        })
        .collect()
}
