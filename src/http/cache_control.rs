//! `Cache-Control` directive parsing and rendering (RFC 9111 §5.2).
//!
//! Directive names are case-insensitive and stored lowercased. Values keep
//! their original spelling with surrounding quotes removed.

use std::fmt;

use super::Headers;

/// An ordered set of `Cache-Control` directives.
///
/// # Examples
///
/// ```
/// use rttp_gateway::http::CacheControl;
///
/// let mut cc = CacheControl::parse("public, max-age=60, stale-if-error=300");
/// assert!(cc.is_public());
/// assert_eq!(cc.max_age(), Some(60));
/// assert_eq!(cc.stale_if_error(), Some(300));
///
/// cc.set("s-maxage", Some("120"));
/// assert_eq!(cc.to_string(), "public, max-age=60, stale-if-error=300, s-maxage=120");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    directives: Vec<(String, Option<String>)>,
}

impl CacheControl {
    /// Creates an empty directive set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a single header value. Malformed fragments are skipped.
    pub fn parse(value: &str) -> Self {
        let mut cc = Self::new();
        for item in split_directives(value) {
            let (name, value) = match item.split_once('=') {
                Some((name, value)) => {
                    let value = value.trim();
                    let value = value
                        .strip_prefix('"')
                        .and_then(|v| v.strip_suffix('"'))
                        .unwrap_or(value);
                    (name.trim(), Some(value.to_owned()))
                }
                None => (item.trim(), None),
            };
            if name.is_empty() {
                continue;
            }
            cc.set(name, value);
        }
        cc
    }

    /// Parses every `Cache-Control` field in `headers` as one list.
    pub fn from_headers(headers: &Headers) -> Self {
        headers
            .get_joined("cache-control")
            .map(|value| Self::parse(&value))
            .unwrap_or_default()
    }

    /// Returns `true` if the directive is present (with or without a value).
    pub fn has(&self, name: &str) -> bool {
        self.directives
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Returns the value of a directive, if it has one.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.directives
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    /// Adds or replaces a directive.
    pub fn set(&mut self, name: &str, value: Option<impl Into<String>>) {
        let name = name.to_ascii_lowercase();
        let value = value.map(Into::into);
        match self.directives.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.directives.push((name, value)),
        }
    }

    /// Removes a directive. Returns `true` if it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.directives.len();
        self.directives.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.directives.len() < before
    }

    /// Returns `true` if no directive is set.
    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    // Delta-seconds: negative values count as 0, oversized ones saturate.
    fn seconds(&self, name: &str) -> Option<i64> {
        let value = self.get(name)?.trim();
        let (negative, digits) = match value.strip_prefix('-') {
            Some(digits) => (true, digits),
            None => (false, value),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if negative {
            return Some(0);
        }
        Some(digits.parse().unwrap_or(i64::MAX))
    }

    /// `max-age`, in seconds.
    pub fn max_age(&self) -> Option<i64> {
        self.seconds("max-age")
    }

    /// `s-maxage`, in seconds.
    pub fn shared_max_age(&self) -> Option<i64> {
        self.seconds("s-maxage")
    }

    /// `stale-while-revalidate` (RFC 5861), in seconds.
    pub fn stale_while_revalidate(&self) -> Option<i64> {
        self.seconds("stale-while-revalidate")
    }

    /// `stale-if-error` (RFC 5861), in seconds.
    pub fn stale_if_error(&self) -> Option<i64> {
        self.seconds("stale-if-error")
    }

    pub fn is_public(&self) -> bool {
        self.has("public")
    }

    pub fn is_private(&self) -> bool {
        self.has("private")
    }

    pub fn is_no_store(&self) -> bool {
        self.has("no-store")
    }

    pub fn is_no_cache(&self) -> bool {
        self.has("no-cache")
    }

    pub fn must_revalidate(&self) -> bool {
        self.has("must-revalidate")
    }

    pub fn proxy_revalidate(&self) -> bool {
        self.has("proxy-revalidate")
    }
}

impl fmt::Display for CacheControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.directives.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match value {
                Some(v) if needs_quotes(v) => write!(f, "{name}=\"{v}\"")?,
                Some(v) => write!(f, "{name}={v}")?,
                None => f.write_str(name)?,
            }
        }
        Ok(())
    }
}

// Splits on commas that are not inside a quoted string.
fn split_directives(value: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                items.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(&value[start..]);
    items
}

fn needs_quotes(value: &str) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ',' | '=' | ';' | '"'))
}
