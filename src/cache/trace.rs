//! Per-request record of cache decisions.

use std::fmt;

use crate::http::Request;

/// Events the gateway records while handling one top-level request, grouped
/// by `"METHOD path"` in the order the sub-requests were first seen.
///
/// A `Trace` lives exactly as long as one top-level request: it is created by
/// [`HttpCache::handle`](super::HttpCache::handle) and threaded down through
/// every sub-request that request causes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Trace {
    entries: Vec<(String, Vec<&'static str>)>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn key(request: &Request) -> String {
        format!("{} {}", request.method(), request.path())
    }

    /// Opens (or reopens) the event list for `request`.
    pub(crate) fn begin(&mut self, request: &Request) {
        let key = Self::key(request);
        if !self.entries.iter().any(|(k, _)| *k == key) {
            self.entries.push((key, Vec::new()));
        }
    }

    pub(crate) fn record(&mut self, request: &Request, event: &'static str) {
        let key = Self::key(request);
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, events)) => events.push(event),
            None => self.entries.push((key, vec![event])),
        }
    }

    /// Returns the events recorded for `"METHOD path"`.
    pub fn events(&self, key: &str) -> &[&'static str] {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, events)| events.as_slice())
            .unwrap_or_default()
    }

    /// Returns `true` if `event` was recorded for any request.
    pub fn contains(&self, event: &str) -> bool {
        self.entries
            .iter()
            .any(|(_, events)| events.iter().any(|e| *e == event))
    }
}

/// Renders `GET /a: miss, store; GET /frag: fresh`.
impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, events)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{key}: {}", events.join(", "))?;
        }
        Ok(())
    }
}
