//! Edge Side Includes: the subset of ESI 1.0 a surrogate needs to assemble
//! pages from separately cached fragments.
//!
//! Processing happens in two phases. When a response arrives from the origin,
//! [`Esi::process`] rewrites every `<esi:include …/>` tag into a deferred
//! marker and strips `<esi:comment/>` and `<esi:remove>` blocks; the rewritten
//! body is what gets stored. When a response is served, the gateway splits the
//! body with [`segments`] and replaces each marker with the body of a
//! sub-request for the fragment.

use std::sync::LazyLock;

use regex::Regex;

use super::error::CacheError;
use crate::http::{Request, Response};

/// Token advertised in `Surrogate-Capability` on requests sent to the origin.
pub const CAPABILITY: &str = r#"rttp="ESI/1.0""#;

/// Internal header marking a stored body that contains deferred markers.
pub const BODY_EVAL: &str = "X-Body-Eval";

const ESI_TOKEN: &str = "ESI/1.0";

/// Opening of a deferred marker. Origin text containing it is defused before
/// include tags are rewritten, so only this processor can emit markers.
const MARKER_OPEN: &str = "<!--esi:deferred";
const MARKER_DEFUSED: &str = "<!-- esi:deferred";

static INCLUDE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<esi:include\s+(.+?)\s*/>").expect("include pattern"));
static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|\s)(src|onerror|alt)="([^"]*?)""#).expect("attribute pattern")
});
static COMMENT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<esi:comment[^>]*/>").expect("comment pattern"));
static REMOVE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<esi:remove>.*?</esi:remove>").expect("remove pattern"));
static DEFERRED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<!--esi:deferred\s+(.*?)-->").expect("marker pattern"));
static CONTENT_ESI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"content="[^"]*ESI/1\.0[^"]*""#).expect("control pattern"));

/// One fragment to include: where to fetch it, a fallback, and whether a
/// failure may be replaced by an empty string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inclusion {
    pub src: String,
    pub alt: Option<String>,
    pub ignore_errors: bool,
}

impl Inclusion {
    fn from_attributes(attributes: &str) -> Option<Self> {
        let mut src = None;
        let mut alt = None;
        let mut ignore_errors = false;
        for caps in ATTRIBUTE.captures_iter(attributes) {
            let (Some(name), Some(value)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let value = value.as_str();
            match name.as_str() {
                "src" => src = Some(value.to_owned()),
                "alt" if !value.is_empty() => alt = Some(value.to_owned()),
                "onerror" => ignore_errors = value == "continue",
                _ => {}
            }
        }
        Some(Self {
            src: src?,
            alt,
            ignore_errors,
        })
    }

    fn marker(&self) -> String {
        let mut marker = format!("{MARKER_OPEN} src=\"{}\"", self.src);
        if let Some(alt) = &self.alt {
            marker.push_str(&format!(" alt=\"{alt}\""));
        }
        if self.ignore_errors {
            marker.push_str(" onerror=\"continue\"");
        }
        marker.push_str("-->");
        marker
    }
}

/// A piece of a processed body: literal text or a fragment to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    Include(Inclusion),
}

/// Splits a processed body into literal text and deferred inclusions.
pub fn segments(content: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut last = 0;
    for caps in DEFERRED.captures_iter(content) {
        let (Some(whole), Some(attributes)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let Some(inclusion) = Inclusion::from_attributes(attributes.as_str()) else {
            continue;
        };
        if whole.start() > last {
            out.push(Segment::Text(&content[last..whole.start()]));
        }
        out.push(Segment::Include(inclusion));
        last = whole.end();
    }
    if last < content.len() {
        out.push(Segment::Text(&content[last..]));
    }
    out
}

/// The ESI processor.
///
/// # Examples
///
/// ```
/// use rttp_gateway::cache::Esi;
/// use rttp_gateway::http::{Response, StatusCode};
///
/// let esi = Esi::default();
/// let mut response = Response::new(StatusCode::Ok)
///     .header("Surrogate-Control", r#"content="ESI/1.0""#)
///     .body(r#"<p><esi:include src="/nav" onerror="continue" /></p>"#);
///
/// assert!(esi.needs_processing(&response));
/// esi.process(&mut response).unwrap();
/// assert!(!response.headers().contains("surrogate-control"));
/// assert_eq!(response.headers().get("x-body-eval"), Some("ESI"));
/// ```
#[derive(Debug, Clone)]
pub struct Esi {
    content_types: Vec<String>,
}

impl Default for Esi {
    fn default() -> Self {
        Self::new(["text/html", "text/xml", "application/xml"])
    }
}

impl Esi {
    /// Creates a processor that only rewrites bodies of the given media types.
    pub fn new<I, S>(content_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            content_types: content_types
                .into_iter()
                .map(|t| t.into().to_ascii_lowercase())
                .collect(),
        }
    }

    /// Returns `true` if an upstream surrogate already advertised ESI support.
    pub fn has_surrogate_capability(&self, request: &Request) -> bool {
        request
            .headers()
            .get_all("surrogate-capability")
            .any(|v| v.contains(ESI_TOKEN))
    }

    /// Advertises ESI support to the origin.
    pub fn add_surrogate_capability(&self, request: &mut Request) {
        let current = request.headers().get_joined("surrogate-capability");
        let value = match current {
            Some(current) if current.contains(CAPABILITY) => return,
            Some(current) => format!("{current}, {CAPABILITY}"),
            None => CAPABILITY.to_owned(),
        };
        request.headers_mut().set("Surrogate-Capability", value);
    }

    /// Origin side: asks the surrogate to process the body if it contains
    /// include tags.
    pub fn add_surrogate_control(&self, response: &mut Response) {
        let has_tags = response
            .content()
            .is_some_and(|body| String::from_utf8_lossy(body).contains("<esi:include"));
        if has_tags {
            response
                .headers_mut()
                .set("Surrogate-Control", format!("content=\"{ESI_TOKEN}\""));
        }
    }

    /// Origin side: renders an include tag, optionally preceded by a comment.
    pub fn render_tag(
        &self,
        src: &str,
        alt: Option<&str>,
        ignore_errors: bool,
        comment: Option<&str>,
    ) -> String {
        let mut tag = String::new();
        if let Some(comment) = comment {
            tag.push_str(&format!("<esi:comment text=\"{comment}\" />\n"));
        }
        tag.push_str(&format!("<esi:include src=\"{src}\""));
        if let Some(alt) = alt {
            tag.push_str(&format!(" alt=\"{alt}\""));
        }
        if ignore_errors {
            tag.push_str(" onerror=\"continue\"");
        }
        tag.push_str(" />");
        tag
    }

    /// Returns `true` if the origin asked for ESI processing of this response.
    pub fn needs_processing(&self, response: &Response) -> bool {
        response
            .headers()
            .get_all("surrogate-control")
            .any(|v| CONTENT_ESI.is_match(v))
    }

    /// Rewrites include tags into deferred markers and strips ESI comments
    /// and `<esi:remove>` blocks.
    ///
    /// Bodies of other media types, file-backed bodies and non UTF-8 bodies
    /// are left untouched. Returns `true` if the body was rewritten.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::MissingSource`] for an include tag without `src`.
    pub fn process(&self, response: &mut Response) -> Result<bool, CacheError> {
        let media_type = response
            .headers()
            .get("content-type")
            .filter(|t| !t.trim().is_empty())
            .unwrap_or("text/html")
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if !self.content_types.contains(&media_type) {
            return Ok(false);
        }

        let Some(content) = response
            .content()
            .and_then(|body| std::str::from_utf8(body).ok())
        else {
            return Ok(false);
        };
        let content = content.replace(MARKER_OPEN, MARKER_DEFUSED);
        let content = content.as_str();

        let mut rewritten = String::with_capacity(content.len());
        let mut last = 0;
        for caps in INCLUDE_TAG.captures_iter(content) {
            let (Some(whole), Some(attributes)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let inclusion = Inclusion::from_attributes(attributes.as_str()).ok_or_else(|| {
                CacheError::MissingSource {
                    tag: whole.as_str().to_owned(),
                }
            })?;
            rewritten.push_str(&content[last..whole.start()]);
            rewritten.push_str(&inclusion.marker());
            last = whole.end();
        }
        rewritten.push_str(&content[last..]);

        let rewritten = COMMENT_TAG.replace_all(&rewritten, "");
        let rewritten = REMOVE_BLOCK.replace_all(&rewritten, "").into_owned();

        response.set_content(rewritten);
        response.headers_mut().set(BODY_EVAL, "ESI");
        strip_esi_token(response);
        Ok(true)
    }
}

// Drops ESI/1.0 from `content="…"`, removing directives (and the header)
// that end up empty.
fn strip_esi_token(response: &mut Response) {
    let Some(control) = response.headers().get_joined("surrogate-control") else {
        return;
    };
    let kept: Vec<String> = control
        .split(',')
        .map(str::trim)
        .filter_map(|directive| {
            let Some(list) = directive
                .strip_prefix("content=\"")
                .and_then(|rest| rest.strip_suffix('"'))
            else {
                return Some(directive.to_owned()).filter(|d| !d.is_empty());
            };
            let tokens: Vec<&str> = list.split_whitespace().filter(|t| *t != ESI_TOKEN).collect();
            if tokens.is_empty() {
                None
            } else {
                Some(format!("content=\"{}\"", tokens.join(" ")))
            }
        })
        .collect();

    if kept.is_empty() {
        response.headers_mut().remove("surrogate-control");
    } else {
        response.headers_mut().set("Surrogate-Control", kept.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Method, StatusCode};

    fn esi_response(body: &str) -> Response {
        Response::new(StatusCode::Ok)
            .header("Content-Type", "text/html; charset=utf-8")
            .header("Surrogate-Control", r#"content="ESI/1.0""#)
            .body(body.to_owned())
    }

    fn text(response: &Response) -> String {
        String::from_utf8(response.content().unwrap().to_vec()).unwrap()
    }

    #[test]
    fn include_tags_become_markers() {
        let esi = Esi::default();
        let mut response = esi_response(
            r#"<h1>x</h1><esi:include src="/frag" alt="/fallback" onerror="continue" /><p>y</p>"#,
        );
        assert!(esi.process(&mut response).unwrap());

        let body = text(&response);
        assert!(!body.contains("<esi:include"));
        let parts = segments(&body);
        assert_eq!(
            parts,
            vec![
                Segment::Text("<h1>x</h1>"),
                Segment::Include(Inclusion {
                    src: "/frag".to_owned(),
                    alt: Some("/fallback".to_owned()),
                    ignore_errors: true,
                }),
                Segment::Text("<p>y</p>"),
            ]
        );
    }

    #[test]
    fn markers_already_in_the_body_are_defused() {
        let esi = Esi::default();
        let mut response = esi_response(
            r#"<p><!--esi:deferred src="/secret"--></p><esi:include src="/frag" />"#,
        );
        esi.process(&mut response).unwrap();

        let body = text(&response);
        let includes: Vec<_> = segments(&body)
            .into_iter()
            .filter_map(|segment| match segment {
                Segment::Include(inclusion) => Some(inclusion.src),
                Segment::Text(_) => None,
            })
            .collect();
        assert_eq!(includes, ["/frag"]);
        assert!(body.starts_with(r#"<p><!-- esi:deferred src="/secret"--></p>"#));
    }

    #[test]
    fn prefixed_attributes_are_not_read() {
        let esi = Esi::default();
        let mut response =
            esi_response(r#"<esi:include data-src="/evil" src="/real" xalt="/other" />"#);
        esi.process(&mut response).unwrap();
        assert_eq!(
            segments(&text(&response)),
            vec![Segment::Include(Inclusion {
                src: "/real".to_owned(),
                alt: None,
                ignore_errors: false,
            })]
        );

        let mut response = esi_response(r#"<esi:include data-src="/evil" />"#);
        assert!(matches!(
            esi.process(&mut response),
            Err(CacheError::MissingSource { .. })
        ));
    }

    #[test]
    fn include_without_src_is_an_error() {
        let esi = Esi::default();
        let mut response = esi_response(r#"<esi:include alt="/x" />"#);
        let err = esi.process(&mut response).unwrap_err();
        assert!(matches!(err, CacheError::MissingSource { .. }));
    }

    #[test]
    fn comments_and_remove_blocks_are_stripped() {
        let esi = Esi::default();
        let mut response = esi_response(
            "a<esi:comment text=\"note\" />b<esi:remove>\n<a href=\"/x\">x</a>\n</esi:remove>c",
        );
        esi.process(&mut response).unwrap();
        assert_eq!(text(&response), "abc");
    }

    #[test]
    fn other_media_types_are_untouched() {
        let esi = Esi::default();
        let mut response = Response::new(StatusCode::Ok)
            .header("Content-Type", "application/json")
            .header("Surrogate-Control", r#"content="ESI/1.0""#)
            .body(r#"{"tag":"<esi:include src=\"/x\" />"}"#);
        assert!(!esi.process(&mut response).unwrap());
        assert!(!response.headers().contains(BODY_EVAL));
        assert!(response.headers().contains("surrogate-control"));
    }

    #[test]
    fn missing_content_type_counts_as_html() {
        let esi = Esi::default();
        let mut response = Response::new(StatusCode::Ok).body(r#"<esi:include src="/a" />"#);
        assert!(esi.process(&mut response).unwrap());
        assert_eq!(segments(&text(&response)).len(), 1);
    }

    #[test]
    fn surrogate_control_keeps_other_directives() {
        let esi = Esi::default();
        let mut response = esi_response("plain").header("x", "y");
        response
            .headers_mut()
            .set("Surrogate-Control", r#"max-age=10, content="ESI/1.0 ESI-INLINE/1.0""#);
        esi.process(&mut response).unwrap();
        assert_eq!(
            response.headers().get("surrogate-control"),
            Some(r#"max-age=10, content="ESI-INLINE/1.0""#)
        );
    }

    #[test]
    fn needs_processing_reads_surrogate_control() {
        let esi = Esi::default();
        assert!(esi.needs_processing(&esi_response("")));
        let plain = Response::new(StatusCode::Ok).header("Surrogate-Control", "max-age=5");
        assert!(!esi.needs_processing(&plain));
        assert!(!esi.needs_processing(&Response::new(StatusCode::Ok)));
    }

    #[test]
    fn surrogate_capability_is_added_once() {
        let esi = Esi::default();
        let mut request = Request::new(Method::Get, "/")
            .unwrap()
            .header("Surrogate-Capability", r#"edge="Foo/1.0""#);
        assert!(!esi.has_surrogate_capability(&request));

        esi.add_surrogate_capability(&mut request);
        esi.add_surrogate_capability(&mut request);
        assert!(esi.has_surrogate_capability(&request));
        assert_eq!(
            request.headers().get("surrogate-capability"),
            Some(r#"edge="Foo/1.0", rttp="ESI/1.0""#)
        );
    }

    #[test]
    fn origin_helpers_render_tags() {
        let esi = Esi::default();
        assert_eq!(
            esi.render_tag("/a", Some("/b"), true, Some("nav")),
            "<esi:comment text=\"nav\" />\n<esi:include src=\"/a\" alt=\"/b\" onerror=\"continue\" />"
        );
        assert_eq!(esi.render_tag("/a", None, false, None), "<esi:include src=\"/a\" />");

        let mut response =
            Response::new(StatusCode::Ok).body(esi.render_tag("/a", None, false, None));
        esi.add_surrogate_control(&mut response);
        assert!(esi.needs_processing(&response));
    }

    #[test]
    fn segments_without_markers_is_one_text_piece() {
        assert_eq!(segments("hello"), vec![Segment::Text("hello")]);
        assert!(segments("").is_empty());
    }
}
